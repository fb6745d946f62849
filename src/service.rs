//! Image service: the orchestrator behind every tile, frame, mosaic and
//! defect-crop request, plus the admin surface for the disk cache.
//!
//! Reads fall through memory, then disk, then compute; both cache layers are
//! strictly best-effort and a failure in either leaves the request on the
//! compute path. Admin mutations (precache, delete, rebuild) run on a single
//! task thread so they never race each other on the cache tree.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use image::DynamicImage;
use parking_lot::{Condvar, Mutex, RwLock};
use rayon::prelude::*;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::disk_cache::DiskImageCache;
use crate::error::{TileError, TileResult};
use crate::mosaic::{
    self, assemble_tile, clamp_box, decode_image, encode_image, expand_box, resize_to,
    MosaicLayout, Orientation, OutputFormat, PixelBox,
};
use crate::prefetch::{
    DefectHintRequest, PrefetchExecutor, PrefetchManager, TileRequest, PRIORITY_ADJACENT,
    PRIORITY_DEFECT_HINT,
};
use crate::status::StatusSink;
use crate::stores::{DefectRecord, DefectStore, FrameStore, Surface};
use crate::ttl_cache::{ShardedTtlCache, TieredTileCache, TtlLruCache};

const SERVICE_NAME: &str = "tile-cache";

/// One tile request.
#[derive(Debug, Clone)]
pub struct TileParams {
    pub surface: Surface,
    pub seq_no: i64,
    pub view: Option<String>,
    pub level: u32,
    pub orientation: Orientation,
    pub tile_x: u32,
    pub tile_y: u32,
    pub format: OutputFormat,
    /// Identifies the requesting viewer session; presence enables prefetch
    /// scheduling around this tile.
    pub viewer_id: Option<String>,
    /// Marks the request as defect-driven, raising its neighborhood to the
    /// most urgent prefetch priority.
    pub defect_hint: bool,
}

#[derive(Debug, Clone)]
pub struct DefectCropParams {
    pub surface: Surface,
    pub defect_id: i64,
    pub expand: Option<u32>,
    pub use_cache: bool,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub format: OutputFormat,
}

#[derive(Debug, Clone)]
pub struct MosaicParams {
    pub surface: Surface,
    pub seq_no: i64,
    pub view: Option<String>,
    pub orientation: Orientation,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Take at most this many frames after `skip`.
    pub limit: Option<usize>,
    pub skip: usize,
    /// Keep every Nth frame of the selection; 0 and 1 both mean every frame.
    pub stride: usize,
    pub format: OutputFormat,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheTask {
    Precache {
        surface: Surface,
        seq_no: i64,
        /// How many of the coarsest levels to build; `None` builds all.
        levels: Option<u32>,
    },
    Delete {
        surface: Surface,
        seq_nos: Vec<i64>,
    },
    Rebuild {
        surface: Surface,
        seq_nos: Vec<i64>,
        /// Rebuild even when the on-disk record already matches the live
        /// parameters.
        force: bool,
    },
}

impl CacheTask {
    fn describe(&self) -> String {
        match self {
            Self::Precache { surface, seq_no, .. } => format!("precache {surface}/{seq_no}"),
            Self::Delete { surface, seq_nos } => {
                format!("delete {surface} ({} sequences)", seq_nos.len())
            }
            Self::Rebuild { surface, seq_nos, .. } => {
                format!("rebuild {surface} ({} sequences)", seq_nos.len())
            }
        }
    }
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct TileKey {
    surface: Surface,
    seq_no: i64,
    view: String,
    level: u32,
    orientation: Orientation,
    tile_x: u32,
    tile_y: u32,
    format: OutputFormat,
}

type FrameKey = (Surface, i64, String, u32);

/// In-memory tile layer, chosen at construction.
enum TileMemory {
    Sharded(ShardedTtlCache<TileKey>),
    Tiered(TieredTileCache<TileKey>),
}

impl TileMemory {
    fn get(&self, key: &TileKey) -> Option<Bytes> {
        match self {
            Self::Sharded(c) => c.get(key),
            Self::Tiered(c) => c.get(key),
        }
    }

    fn put(&self, key: TileKey, value: Bytes) {
        match self {
            Self::Sharded(c) => c.put(key, value),
            Self::Tiered(c) => c.put(key, value),
        }
    }

    fn clear(&self) {
        match self {
            Self::Sharded(c) => c.clear(),
            Self::Tiered(c) => c.clear(),
        }
    }

    fn stats_json(&self) -> serde_json::Value {
        fn one(s: crate::ttl_cache::CacheStats) -> serde_json::Value {
            json!({
                "hits": s.hits,
                "misses": s.misses,
                "evictions": s.evictions,
                "items": s.items,
            })
        }
        match self {
            Self::Sharded(c) => one(c.stats()),
            Self::Tiered(c) => {
                let (hot, warm, cold) = c.stats();
                json!({"hot": one(hot), "warm": one(warm), "cold": one(cold)})
            }
        }
    }
}

struct CacheRoots {
    top: PathBuf,
    bottom: PathBuf,
}

impl CacheRoots {
    fn get(&self, surface: Surface) -> &Path {
        match surface {
            Surface::Top => &self.top,
            Surface::Bottom => &self.bottom,
        }
    }

    fn set(&mut self, surface: Surface, root: PathBuf) {
        match surface {
            Surface::Top => self.top = root,
            Surface::Bottom => self.bottom = root,
        }
    }
}

struct TaskState {
    queue: VecDeque<CacheTask>,
    current: Option<String>,
    // Progress of the running (or last finished) task, served verbatim by
    // `cache_status`.
    state: String,
    message: String,
    surface: Option<Surface>,
    seq_no: Option<i64>,
    done: usize,
    total: usize,
}

pub struct ImageService {
    config: EngineConfig,
    frames: Arc<dyn FrameStore>,
    defects: Arc<dyn DefectStore>,
    status: Arc<dyn StatusSink>,
    disk: DiskImageCache,
    cache_roots: RwLock<CacheRoots>,

    tile_cache: TileMemory,
    frame_cache: TtlLruCache<FrameKey, Arc<DynamicImage>>,
    mosaic_cache: TtlLruCache<String, Bytes>,
    defect_cache: TtlLruCache<String, Bytes>,

    prefetch: Mutex<Option<Arc<PrefetchManager>>>,

    tasks: Mutex<TaskState>,
    task_cond: Condvar,
    paused: Mutex<bool>,
    pause_cond: Condvar,
    abort_current: AtomicBool,
    stopped: AtomicBool,
    stop_cond: Condvar,
    stop_mutex: Mutex<()>,

    precache_pool: rayon::ThreadPool,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl ImageService {
    pub fn new(
        config: EngineConfig,
        frames: Arc<dyn FrameStore>,
        defects: Arc<dyn DefectStore>,
        status: Arc<dyn StatusSink>,
    ) -> TileResult<Self> {
        let disk = DiskImageCache::new(&config.cache, &config.images);
        let cache = &config.cache;
        let tile_cache = if cache.tiered_tile_cache {
            TileMemory::Tiered(TieredTileCache::new())
        } else {
            TileMemory::Sharded(ShardedTtlCache::new(
                cache.max_tiles,
                cache.ttl_seconds,
                cache.tile_segments,
                cache.tile_compression,
            )?)
        };
        let frame_cache = TtlLruCache::new(cache.max_frames, cache.ttl_seconds)?;
        let mosaic_cache = TtlLruCache::new(cache.max_mosaics, cache.ttl_seconds)?;
        let defect_cache = TtlLruCache::new(cache.max_defect_crops, cache.ttl_seconds)?;
        let precache_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(cache.disk_precache_workers.max(1))
            .thread_name(|i| format!("tile-precache-{i}"))
            .build()
            .map_err(|e| TileError::Io(std::io::Error::other(e)))?;
        let cache_roots = CacheRoots {
            top: config
                .images
                .disk_cache_top_root
                .clone()
                .unwrap_or_else(|| config.images.top_root.clone()),
            bottom: config
                .images
                .disk_cache_bottom_root
                .clone()
                .unwrap_or_else(|| config.images.bottom_root.clone()),
        };
        Ok(Self {
            config,
            frames,
            defects,
            status,
            disk,
            cache_roots: RwLock::new(cache_roots),
            tile_cache,
            frame_cache,
            mosaic_cache,
            defect_cache,
            prefetch: Mutex::new(None),
            tasks: Mutex::new(TaskState {
                queue: VecDeque::new(),
                current: None,
                state: "idle".to_string(),
                message: String::new(),
                surface: None,
                seq_no: None,
                done: 0,
                total: 0,
            }),
            task_cond: Condvar::new(),
            paused: Mutex::new(false),
            pause_cond: Condvar::new(),
            abort_current: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            stop_cond: Condvar::new(),
            stop_mutex: Mutex::new(()),
            precache_pool,
            background: Mutex::new(Vec::new()),
        })
    }

    /// Wire in the prefetch queue. Done after construction because the
    /// service is also the queue's executor.
    pub fn attach_prefetch(&self, manager: Arc<PrefetchManager>) {
        *self.prefetch.lock() = Some(manager);
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn view_name(&self, view: &Option<String>) -> String {
        view.clone()
            .unwrap_or_else(|| self.config.images.default_view.clone())
    }

    fn cache_root(&self, surface: Surface) -> PathBuf {
        self.cache_roots.read().get(surface).to_path_buf()
    }

    fn layout(
        &self,
        frame_count: u32,
        orientation: Orientation,
    ) -> MosaicLayout {
        MosaicLayout::new(
            self.config.images.frame_width,
            self.config.images.frame_height,
            frame_count,
            orientation,
        )
    }

    // ---- primary read path ----

    pub fn get_tile(&self, params: &TileParams) -> TileResult<Bytes> {
        self.get_tile_impl(params, true)
    }

    fn get_tile_impl(&self, p: &TileParams, trigger_prefetch: bool) -> TileResult<Bytes> {
        let max_level = self.disk.max_level();
        if p.level > max_level {
            return Err(TileError::BadRequest(format!(
                "level {} exceeds max level {max_level}",
                p.level
            )));
        }        let view = self.view_name(&p.view);
        let frame_paths = self.frames.list_frame_paths(p.surface, p.seq_no, &view)?;
        let layout = self.layout(frame_paths.len() as u32, p.orientation);
        let tile_size = self.config.images.tile_size();
        let rect = layout
            .tile_rect(tile_size, p.level, p.tile_x, p.tile_y)
            .ok_or_else(|| {
                TileError::NotFound(format!(
                    "tile ({}, {}) at level {} outside mosaic for sequence {}",
                    p.tile_x, p.tile_y, p.level, p.seq_no
                ))
            })?;

        let key = TileKey {
            surface: p.surface,
            seq_no: p.seq_no,
            view: view.clone(),
            level: p.level,
            orientation: p.orientation,
            tile_x: p.tile_x,
            tile_y: p.tile_y,
            format: p.format,
        };
        if let Some(hit) = self.tile_cache.get(&key) {
            if trigger_prefetch {
                self.schedule_prefetch(p, &view, frame_paths.len() as u32);
            }
            return Ok(hit);
        }

        let root = self.cache_root(p.surface);
        // Disk tiles are only trusted up to the level the metadata record
        // says was built; anything deeper is recomputed.
        let disk_fresh = self
            .disk
            .read_meta(&root, p.seq_no, Some(&view))
            .is_some_and(|meta| meta.tile.max_level >= p.level);
        if disk_fresh && p.format == OutputFormat::Jpeg {
            if let Some(bytes) = self.disk.read_tile(
                &root,
                p.seq_no,
                Some(&view),
                p.level,
                p.orientation,
                p.tile_x,
                p.tile_y,
            ) {
                self.tile_cache.put(key, bytes.clone());
                if trigger_prefetch {
                    self.schedule_prefetch(p, &view, frame_paths.len() as u32);
                }
                return Ok(bytes);
            }
        }

        let canvas = assemble_tile(&layout, rect, p.level, |index| {
            self.load_frame(p.surface, p.seq_no, &view, &frame_paths, index)
        })?;
        let bytes = encode_image(&canvas, p.format)?;
        if p.format == OutputFormat::Jpeg {
            self.disk.write_tile(
                &root,
                p.seq_no,
                Some(&view),
                p.level,
                p.orientation,
                p.tile_x,
                p.tile_y,
                &bytes,
            );
        }
        self.tile_cache.put(key, bytes.clone());
        if trigger_prefetch {
            self.schedule_prefetch(p, &view, frame_paths.len() as u32);
        }
        Ok(bytes)
    }

    pub fn get_frame(
        &self,
        surface: Surface,
        seq_no: i64,
        view: Option<String>,
        index: u32,
        width: Option<u32>,
        height: Option<u32>,
        format: OutputFormat,
    ) -> TileResult<Bytes> {        let view = self.view_name(&view);
        let paths = self.frames.list_frame_paths(surface, seq_no, &view)?;
        let frame = self.load_frame(surface, seq_no, &view, &paths, index)?;
        let out = resize_to(&frame.to_rgb8(), width, height);
        encode_image(&out, format)
    }

    /// Crop a defect's neighborhood out of its frame. Returns the encoded
    /// crop together with the defect record it was cut from, so callers can
    /// surface coordinates and camera alongside the pixels.
    pub fn crop_defect(&self, p: &DefectCropParams) -> TileResult<(Bytes, DefectRecord)> {        let record = self.defects.find_defect(p.surface, p.defect_id).ok_or_else(|| {
            TileError::NotFound(format!("defect {} on {}", p.defect_id, p.surface))
        })?;
        let expand = p.expand.unwrap_or(self.config.cache.defect_expand);
        let clamped = clamp_box(
            expand_box(record.bbox, expand),
            self.config.images.frame_width,
            self.config.images.frame_height,
        );
        let derived_key = format!(
            "{}_{}_{}_{}_{}_{}_{}",
            record.seq_no,
            p.surface,
            clamped.left,
            clamped.top,
            clamped.width(),
            clamped.height(),
            expand
        );
        // Only the canonical rendition (native size, JPEG) is cacheable;
        // resized or re-encoded variants are always computed.
        let cacheable = p.use_cache
            && self.config.cache.defect_cache_enabled
            && p.width.is_none()
            && p.height.is_none()
            && p.format == OutputFormat::Jpeg;
        let root = self.cache_root(p.surface);
        // Hint regardless of where the crop is served from; a viewer landing
        // on a cached crop still zooms into the surrounding tiles next.
        self.hint_defect_tiles(p.surface, &record);
        if cacheable {
            if let Some(hit) = self.defect_cache.get(&derived_key) {
                return Ok((hit, record));
            }
            if let Some(bytes) = self.disk.read_defect(&root, record.seq_no, None, &derived_key) {
                self.defect_cache.put(derived_key.clone(), bytes.clone());
                return Ok((bytes, record));
            }
        }
        let view = self.view_name(&None);
        let paths = self.frames.list_frame_paths(p.surface, record.seq_no, &view)?;
        let frame = self.load_frame(p.surface, record.seq_no, &view, &paths, record.image_index)?;
        let crop = image::imageops::crop_imm(
            &frame.to_rgb8(),
            clamped.left as u32,
            clamped.top as u32,
            clamped.width() as u32,
            clamped.height() as u32,
        )
        .to_image();
        let out = resize_to(&crop, p.width, p.height);
        let bytes = encode_image(&out, p.format)?;
        if cacheable {
            self.disk
                .write_defect(&root, record.seq_no, None, &derived_key, &bytes);
            self.defect_cache.put(derived_key, bytes.clone());
        }
        Ok((bytes, record))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn crop_custom(
        &self,
        surface: Surface,
        seq_no: i64,
        view: Option<String>,
        image_index: u32,
        bbox: PixelBox,
        expand: u32,
        width: Option<u32>,
        height: Option<u32>,
        format: OutputFormat,
    ) -> TileResult<Bytes> {        let view = self.view_name(&view);
        let paths = self.frames.list_frame_paths(surface, seq_no, &view)?;
        let frame = self.load_frame(surface, seq_no, &view, &paths, image_index)?;
        let clamped = clamp_box(
            expand_box(bbox, expand),
            self.config.images.frame_width,
            self.config.images.frame_height,
        );
        let crop = image::imageops::crop_imm(
            &frame.to_rgb8(),
            clamped.left as u32,
            clamped.top as u32,
            clamped.width() as u32,
            clamped.height() as u32,
        )
        .to_image();
        let out = resize_to(&crop, width, height);
        encode_image(&out, format)
    }

    pub fn get_mosaic(&self, p: &MosaicParams) -> TileResult<Bytes> {        let view = self.view_name(&p.view);
        let cache_key = format!(
            "{}_{}_{}_{}_{:?}_{:?}_{:?}_{}_{}_{:?}",
            p.surface,
            p.seq_no,
            view,
            p.orientation,
            p.width,
            p.height,
            p.limit,
            p.skip,
            p.stride,
            p.format
        );
        if let Some(hit) = self.mosaic_cache.get(&cache_key) {
            return Ok(hit);
        }
        let paths = self.frames.list_frame_paths(p.surface, p.seq_no, &view)?;
        let selected: Vec<_> = paths
            .iter()
            .skip(p.skip)
            .step_by(p.stride.max(1))
            .take(p.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        if selected.is_empty() {
            return Err(TileError::NotFound(format!(
                "no frames selected for sequence {} (skip {})",
                p.seq_no, p.skip
            )));
        }
        let layout = self.layout(selected.len() as u32, p.orientation);
        let (mosaic_w, mosaic_h) = layout.mosaic_size();
        // Scale factor that fits the requested bounds; frames are scaled
        // individually before stacking so the full-size mosaic is never
        // materialized.
        let scale = {
            let sw = p.width.map(|w| w as f64 / mosaic_w as f64).unwrap_or(1.0);
            let sh = p.height.map(|h| h as f64 / mosaic_h as f64).unwrap_or(1.0);
            sw.min(sh).min(1.0)
        };
        let stripe_w = ((layout.stripe_width as f64 * scale).round() as u32).max(1);
        let stripe_h = ((layout.stripe_height as f64 * scale).round() as u32).max(1);
        let (out_w, out_h) = match p.orientation {
            Orientation::Vertical => (stripe_w, stripe_h * selected.len() as u32),
            Orientation::Horizontal => (stripe_w * selected.len() as u32, stripe_h),
        };
        let mut canvas = image::RgbImage::new(out_w, out_h);
        for (i, path) in selected.iter().enumerate() {
            let raw = self.frames.read_frame_bytes(path)?;
            let decoded = decode_image(&raw)?;
            let oriented = match p.orientation {
                Orientation::Vertical => decoded.to_rgb8(),
                Orientation::Horizontal => decoded.rotate90().to_rgb8(),
            };
            let scaled = resize_to(&oriented, Some(stripe_w), Some(stripe_h));
            let (ox, oy) = match p.orientation {
                Orientation::Vertical => (0, i as u32 * stripe_h),
                Orientation::Horizontal => (i as u32 * stripe_w, 0),
            };
            let _ = image::GenericImage::copy_from(&mut canvas, &scaled, ox, oy);
        }
        let bytes = encode_image(&canvas, p.format)?;
        self.mosaic_cache.put(cache_key, bytes.clone());
        Ok(bytes)
    }

    fn load_frame(
        &self,
        surface: Surface,
        seq_no: i64,
        view: &str,
        paths: &[PathBuf],
        index: u32,
    ) -> TileResult<Arc<DynamicImage>> {
        let key: FrameKey = (surface, seq_no, view.to_string(), index);
        if let Some(frame) = self.frame_cache.get(&key) {
            return Ok(frame);
        }
        let path = paths.get(index as usize).ok_or_else(|| {
            TileError::NotFound(format!("frame {index} of sequence {seq_no}"))
        })?;
        let raw = self.frames.read_frame_bytes(path)?;
        let frame = Arc::new(decode_image(&raw)?);
        self.frame_cache.put(key, Arc::clone(&frame));
        Ok(frame)
    }

    // ---- prefetch scheduling ----

    fn schedule_prefetch(&self, p: &TileParams, view: &str, frame_count: u32) {
        if p.viewer_id.is_none() || !self.config.prefetch.enabled {
            return;
        }
        let Some(manager) = self.prefetch.lock().clone() else {
            return;
        };
        let viewer = p.viewer_id.clone();
        let viewer_name = viewer.as_deref().unwrap_or_default();
        manager.notify_seq_request(
            viewer_name,
            p.seq_no,
            self.config.prefetch.clear_pending_on_seq_change,
        );

        // Scheduling uses the vertical grid regardless of the served
        // orientation; warmed tiles are stored vertical and re-oriented
        // renditions share the pixels underneath.
        let layout = self.layout(frame_count, Orientation::Vertical);
        let tile_size = self.config.images.tile_size();
        let (cols, rows) = layout.tile_grid(tile_size, p.level);
        let priority = if p.defect_hint {
            PRIORITY_DEFECT_HINT
        } else {
            PRIORITY_ADJACENT
        };
        let make = |level: u32, x: u32, y: u32| TileRequest {
            viewer_id: viewer.clone(),
            surface: p.surface,
            seq_no: p.seq_no,
            view: view.to_string(),
            level,
            tile_x: x,
            tile_y: y,
        };

        let order = &self.config.prefetch.adjacent_tile_order;
        for direction in order.iter().take(self.config.prefetch.adjacent_tile_count) {
            let neighbor = match direction.as_str() {
                "right" if p.tile_x + 1 < cols => Some((p.tile_x + 1, p.tile_y)),
                "left" if p.tile_x > 0 => Some((p.tile_x - 1, p.tile_y)),
                "down" if p.tile_y + 1 < rows => Some((p.tile_x, p.tile_y + 1)),
                "up" if p.tile_y > 0 => Some((p.tile_x, p.tile_y - 1)),
                _ => None,
            };
            if let Some((x, y)) = neighbor {
                manager.enqueue_tile(make(p.level, x, y), priority);
            }
        }

        if self.config.prefetch.cross_level_enabled {
            if p.level < self.disk.max_level() {
                manager.enqueue_tile(make(p.level + 1, p.tile_x / 2, p.tile_y / 2), priority);
            }
            if p.level > 0 {
                let (child_cols, child_rows) = layout.tile_grid(tile_size, p.level - 1);
                for dy in 0..2 {
                    for dx in 0..2 {
                        let (x, y) = (p.tile_x * 2 + dx, p.tile_y * 2 + dy);
                        if x < child_cols && y < child_rows {
                            manager.enqueue_tile(make(p.level - 1, x, y), priority);
                        }
                    }
                }
            }
        }

        manager.maybe_enqueue_adjacent_warm(p.surface, p.seq_no, view);
    }

    /// Hint the tiles covering a just-served defect; the queue expands the
    /// hint into one covering tile per pyramid level at top priority.
    fn hint_defect_tiles(&self, surface: Surface, record: &DefectRecord) {
        if !self.config.prefetch.enabled {
            return;
        }
        let Some(manager) = self.prefetch.lock().clone() else {
            return;
        };
        let center_x = ((record.bbox.left + record.bbox.right) / 2).max(0) as u64;
        let center_y = record.image_index as u64 * self.config.images.frame_height as u64
            + ((record.bbox.top + record.bbox.bottom) / 2).max(0) as u64;
        manager.enqueue_defect_hint(DefectHintRequest {
            surface,
            seq_no: record.seq_no,
            view: self.config.images.default_view.clone(),
            center_x,
            center_y,
        });
    }

    // ---- admin surface ----

    pub fn cache_status(&self) -> serde_json::Value {
        let tasks = self.tasks.lock();
        let roots = self.cache_roots.read();
        json!({
            "state": tasks.state,
            "message": tasks.message,
            "surface": tasks.surface.map(|s| s.to_string()),
            "seq_no": tasks.seq_no,
            "done": tasks.done,
            "total": tasks.total,
            "paused": *self.paused.lock(),
            "current_task": tasks.current,
            "queued_tasks": tasks.queue.len(),
            "defect_expand": self.disk.defect_expand(),
            "tile_cache": self.tile_cache.stats_json(),
            "frame_cache_items": self.frame_cache.len(),
            "mosaic_cache_items": self.mosaic_cache.len(),
            "defect_cache_items": self.defect_cache.len(),
            "prefetch_pending": self.prefetch.lock().as_ref().map(|m| m.pending_len()),
            "disk_cache_enabled": self.disk.enabled(),
            "cache_roots": {
                "top": roots.top.display().to_string(),
                "bottom": roots.bottom.display().to_string(),
            },
        })
    }

    pub fn pause(&self) {
        *self.paused.lock() = true;
        self.push_status("paused", "cache serving paused", json!({}));
    }

    pub fn resume(&self) {
        *self.paused.lock() = false;
        self.pause_cond.notify_all();
        self.push_status("running", "cache serving resumed", json!({}));
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.lock()
    }

    fn wait_if_paused(&self) {
        let mut paused = self.paused.lock();
        while *paused && !self.stopped.load(Ordering::Relaxed) {
            self.pause_cond.wait(&mut paused);
        }
    }

    /// Queue a precache for `seq_no`. Duplicate pending precaches for the
    /// same sequence are collapsed.
    pub fn precache_seq(&self, surface: Surface, seq_no: i64, levels: Option<u32>) {
        let task = CacheTask::Precache {
            surface,
            seq_no,
            levels,
        };
        let mut state = self.tasks.lock();
        let duplicate = state.queue.iter().any(|t| {
            matches!(t, CacheTask::Precache { surface: s, seq_no: n, .. } if *s == surface && *n == seq_no)
        }) || state.current.as_deref() == Some(task.describe().as_str());
        if duplicate {
            return;
        }
        state.queue.push_back(task);
        drop(state);
        self.task_cond.notify_one();
    }

    /// Queue a cache delete. Destructive admin tasks are last-wins: pending
    /// work is dropped and a running task is asked to abort.
    pub fn enqueue_cache_delete(&self, surface: Surface, seq_nos: Vec<i64>) {
        self.enqueue_exclusive(CacheTask::Delete { surface, seq_nos });
    }

    pub fn enqueue_cache_rebuild(&self, surface: Surface, seq_nos: Vec<i64>, force: bool) {
        self.enqueue_exclusive(CacheTask::Rebuild {
            surface,
            seq_nos,
            force,
        });
    }

    fn enqueue_exclusive(&self, task: CacheTask) {
        let mut state = self.tasks.lock();
        state.queue.clear();
        self.abort_current.store(true, Ordering::Relaxed);
        state.queue.push_back(task);
        drop(state);
        self.task_cond.notify_one();
    }

    /// Move one surface's cache root. Entries that fail to move are left
    /// behind and logged; the root switches regardless so new writes land in
    /// the new location.
    pub fn migrate_cache_root(&self, surface: Surface, new_root: PathBuf) -> TileResult<usize> {
        let old_root = self.cache_root(surface);
        if old_root == new_root {
            return Ok(0);
        }
        fs::create_dir_all(&new_root)?;
        let mut moved = 0usize;
        if old_root.exists() {
            for entry in fs::read_dir(&old_root)? {
                let entry = entry?;
                let target = new_root.join(entry.file_name());
                match fs::rename(entry.path(), &target) {
                    Ok(()) => moved += 1,
                    Err(err) => {
                        warn!(
                            from = %entry.path().display(),
                            to = %target.display(),
                            error = %err,
                            "cache migrate: entry left behind"
                        );
                    }
                }
            }
        }
        self.cache_roots.write().set(surface, new_root.clone());
        info!(surface = %surface, root = %new_root.display(), moved, "cache root migrated");
        self.push_status(
            "migrated",
            "cache root migrated",
            json!({"surface": surface.to_string(), "root": new_root.display().to_string(), "moved": moved}),
        );
        Ok(moved)
    }

    pub fn clear_memory_caches(&self) {
        self.tile_cache.clear();
        self.frame_cache.clear();
        self.mosaic_cache.clear();
        self.defect_cache.clear();
    }

    // ---- background machinery ----

    /// Spawn the task runner plus the periodic scan and cleanup threads.
    pub fn start_background(self: &Arc<Self>) {
        let mut handles = self.background.lock();
        if !handles.is_empty() {
            return;
        }
        let spawn = |name: &str, f: Box<dyn FnOnce() + Send>| {
            std::thread::Builder::new()
                .name(name.to_string())
                .spawn(f)
                .expect("spawn background thread")
        };
        let svc = Arc::clone(self);
        handles.push(spawn("cache-task", Box::new(move || svc.task_loop())));
        let svc = Arc::clone(self);
        handles.push(spawn("cache-cleanup", Box::new(move || svc.cleanup_loop())));
        let svc = Arc::clone(self);
        handles.push(spawn("cache-scan", Box::new(move || svc.scan_loop())));
    }

    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::Relaxed);
        self.abort_current.store(true, Ordering::Relaxed);
        self.task_cond.notify_all();
        self.pause_cond.notify_all();
        self.stop_cond.notify_all();
        let handles = std::mem::take(&mut *self.background.lock());
        for handle in handles {
            let _ = handle.join();
        }
    }

    fn task_loop(&self) {
        loop {
            let task = {
                let mut state = self.tasks.lock();
                loop {
                    if self.stopped.load(Ordering::Relaxed) {
                        return;
                    }
                    if let Some(task) = state.queue.pop_front() {
                        state.current = Some(task.describe());
                        let (kind, surface, first_seq, total) = match &task {
                            CacheTask::Precache { surface, seq_no, .. } => {
                                ("precache", *surface, Some(*seq_no), 1)
                            }
                            CacheTask::Delete { surface, seq_nos } => {
                                ("delete", *surface, seq_nos.first().copied(), seq_nos.len())
                            }
                            CacheTask::Rebuild { surface, seq_nos, .. } => {
                                ("rebuild", *surface, seq_nos.first().copied(), seq_nos.len())
                            }
                        };
                        state.state = kind.to_string();
                        state.message = task.describe();
                        state.surface = Some(surface);
                        state.seq_no = first_seq;
                        state.done = 0;
                        state.total = total;
                        break task;
                    }
                    self.task_cond.wait(&mut state);
                }
            };
            self.abort_current.store(false, Ordering::Relaxed);
            let label = task.describe();
            let outcome = self.run_task(task);
            {
                let mut state = self.tasks.lock();
                state.current = None;
                state.state = match &outcome {
                    Ok(()) => "idle".to_string(),
                    Err(TileError::Aborted) => "aborted".to_string(),
                    Err(_) => "error".to_string(),
                };
            }
            match outcome {
                Ok(()) => debug!(task = %label, "cache task finished"),
                Err(TileError::Aborted) => {
                    info!(task = %label, "cache task aborted");
                    self.push_status("aborted", &format!("{label} aborted"), json!({}));
                }
                Err(err) => {
                    warn!(task = %label, error = %err, "cache task failed");
                    self.push_status("error", &format!("{label} failed: {err}"), json!({}));
                }
            }
        }
    }

    fn advance_task_progress(&self, seq_no: i64, done: usize, message: &str) {
        let mut state = self.tasks.lock();
        state.seq_no = Some(seq_no);
        state.done = done;
        state.message = message.to_string();
    }

    fn run_task(&self, task: CacheTask) -> TileResult<()> {
        match task {
            CacheTask::Precache {
                surface,
                seq_no,
                levels,
            } => {
                let built = self.run_precache(surface, seq_no, levels)?;
                self.advance_task_progress(seq_no, 1, &format!("sequence {seq_no} precached"));
                self.push_status(
                    "precached",
                    &format!("sequence {seq_no} precached"),
                    json!({"surface": surface.to_string(), "seq_no": seq_no, "tiles": built}),
                );
                Ok(())
            }
            CacheTask::Delete { surface, seq_nos } => {
                let total = seq_nos.len();
                for (done, seq_no) in seq_nos.into_iter().enumerate() {
                    self.wait_if_paused();
                    if self.abort_current.load(Ordering::Relaxed) {
                        return Err(TileError::Aborted);
                    }
                    self.run_delete(surface, seq_no);
                    self.advance_task_progress(
                        seq_no,
                        done + 1,
                        &format!("sequence {seq_no} cache deleted"),
                    );
                    self.push_status(
                        "deleting",
                        &format!("sequence {seq_no} cache deleted"),
                        json!({
                            "surface": surface.to_string(),
                            "current_seq": seq_no,
                            "done": done + 1,
                            "total": total,
                        }),
                    );
                }
                self.push_status(
                    "deleted",
                    &format!("{total} sequence caches deleted"),
                    json!({"surface": surface.to_string(), "total": total}),
                );
                Ok(())
            }
            CacheTask::Rebuild {
                surface,
                seq_nos,
                force,
            } => {
                let view = self.config.images.default_view.clone();
                let root = self.cache_root(surface);
                let total = seq_nos.len();
                let mut rebuilt = 0usize;
                for (done, seq_no) in seq_nos.into_iter().enumerate() {
                    self.wait_if_paused();
                    if self.abort_current.load(Ordering::Relaxed) {
                        return Err(TileError::Aborted);
                    }
                    // Without force, sequences whose record already matches
                    // the live parameters are left alone.
                    if !force {
                        let fresh = self
                            .disk
                            .read_meta(&root, seq_no, Some(&view))
                            .is_some_and(|meta| !self.disk.is_stale(&meta));
                        if fresh {
                            self.advance_task_progress(
                                seq_no,
                                done + 1,
                                &format!("sequence {seq_no} cache still current"),
                            );
                            continue;
                        }
                    }
                    self.run_delete(surface, seq_no);
                    let built = self.run_precache(surface, seq_no, None)?;
                    rebuilt += 1;
                    self.advance_task_progress(
                        seq_no,
                        done + 1,
                        &format!("sequence {seq_no} cache rebuilt"),
                    );
                    self.push_status(
                        "rebuilding",
                        &format!("sequence {seq_no} cache rebuilt"),
                        json!({
                            "surface": surface.to_string(),
                            "current_seq": seq_no,
                            "done": done + 1,
                            "total": total,
                            "tiles": built,
                        }),
                    );
                }
                self.push_status(
                    "rebuilt",
                    &format!("{rebuilt} of {total} sequence caches rebuilt"),
                    json!({"surface": surface.to_string(), "rebuilt": rebuilt, "total": total}),
                );
                Ok(())
            }
        }
    }

    fn run_delete(&self, surface: Surface, seq_no: i64) {
        let root = self.cache_root(surface);
        let dir = self.disk.cache_dir(&root, seq_no, None);
        if let Err(err) = fs::remove_dir_all(&dir) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(dir = %dir.display(), error = %err, "cache delete incomplete");
            }
        }
        self.clear_memory_caches();
    }

    /// Build disk tiles for a sequence. `levels` selects the N coarsest
    /// levels; `None` builds the full pyramid. Returns the tile count
    /// written.
    pub(crate) fn run_precache(
        &self,
        surface: Surface,
        seq_no: i64,
        levels: Option<u32>,
    ) -> TileResult<usize> {
        if !self.disk.enabled() {
            return Ok(0);
        }
        let view = self.config.images.default_view.clone();
        let frame_paths = self.frames.list_frame_paths(surface, seq_no, &view)?;
        let layout = self.layout(frame_paths.len() as u32, Orientation::Vertical);
        let tile_size = self.config.images.tile_size();
        let max_level = self.disk.max_level();
        let level_list: Vec<u32> = {
            let coarse_first: Vec<u32> = (0..=max_level).rev().collect();
            match levels {
                None => coarse_first,
                Some(n) => coarse_first.into_iter().take(n as usize).collect(),
            }
        };
        let root = self.cache_root(surface);
        let mut built = 0usize;
        for level in level_list {
            let (cols, rows) = layout.tile_grid(tile_size, level);
            let coords: Vec<(u32, u32)> = (0..rows)
                .flat_map(|y| (0..cols).map(move |x| (x, y)))
                .collect();
            let results: Vec<TileResult<bool>> = self.precache_pool.install(|| {
                coords
                    .par_iter()
                    .map(|&(x, y)| {
                        if self.abort_current.load(Ordering::Relaxed)
                            || self.stopped.load(Ordering::Relaxed)
                        {
                            return Err(TileError::Aborted);
                        }
                        self.wait_if_paused();
                        self.build_disk_tile(surface, seq_no, &view, &root, &layout, level, x, y)
                    })
                    .collect()
            });
            for result in results {
                match result {
                    Ok(true) => built += 1,
                    Ok(false) => {}
                    Err(TileError::Aborted) => return Err(TileError::Aborted),
                    Err(err) => {
                        debug!(seq_no, level, error = %err, "precache tile skipped")
                    }
                }
            }
        }
        self.disk.write_meta(&root, seq_no, Some(&view));
        self.disk.cleanup_seq(&root, seq_no, Some(&view));
        Ok(built)
    }

    #[allow(clippy::too_many_arguments)]
    fn build_disk_tile(
        &self,
        surface: Surface,
        seq_no: i64,
        view: &str,
        root: &Path,
        layout: &MosaicLayout,
        level: u32,
        tile_x: u32,
        tile_y: u32,
    ) -> TileResult<bool> {
        let tile_size = self.config.images.tile_size();
        if self
            .disk
            .read_tile(root, seq_no, Some(view), level, Orientation::Vertical, tile_x, tile_y)
            .is_some()
        {
            return Ok(false);
        }
        let Some(rect) = layout.tile_rect(tile_size, level, tile_x, tile_y) else {
            return Ok(false);
        };
        let frame_paths = self.frames.list_frame_paths(surface, seq_no, view)?;
        let canvas = assemble_tile(layout, rect, level, |index| {
            self.load_frame(surface, seq_no, view, &frame_paths, index)
        })?;
        let bytes = encode_image(&canvas, OutputFormat::Jpeg)?;
        self.disk.write_tile(
            root,
            seq_no,
            Some(view),
            level,
            Orientation::Vertical,
            tile_x,
            tile_y,
            &bytes,
        );
        Ok(true)
    }

    fn cleanup_loop(&self) {
        let interval = Duration::from_secs(
            self.config.cache.disk_cache_cleanup_interval_seconds.max(1),
        );
        while !self.sleep_or_stop(interval) {
            if !self.disk.enabled() {
                continue;
            }
            for surface in [Surface::Top, Surface::Bottom] {
                let root = self.cache_root(surface);
                for seq_no in self
                    .frames
                    .list_seq_numbers(surface)
                    .into_iter()
                    .take(self.config.cache.disk_cache_scan_limit)
                {
                    self.disk.cleanup_seq(&root, seq_no, None);
                }
            }
        }
    }

    /// Periodically precache the newest closed sequences whose disk cache is
    /// missing or was written with weaker parameters.
    fn scan_loop(&self) {
        let interval =
            Duration::from_secs(self.config.cache.disk_cache_scan_interval_seconds.max(1));
        while !self.sleep_or_stop(interval) {
            self.scan_once();
        }
    }

    /// One pass over the newest sequences: queue a precache for every closed
    /// sequence whose disk cache is missing or stale. Open sequences are
    /// still growing and are left alone.
    fn scan_once(&self) {
        if !self.disk.enabled() || !self.config.cache.disk_precache_enabled {
            return;
        }
        let view = self.config.images.default_view.clone();
        let levels = Some(self.config.cache.disk_precache_levels);
        for surface in [Surface::Top, Surface::Bottom] {
            let root = self.cache_root(surface);
            for seq_no in self
                .frames
                .list_seq_numbers(surface)
                .into_iter()
                .take(self.config.cache.disk_cache_scan_limit)
            {
                if !self.frames.is_seq_closed(surface, seq_no, &view) {
                    continue;
                }
                let needs_build = match self.disk.read_meta(&root, seq_no, Some(&view)) {
                    None => true,
                    Some(meta) => self.disk.is_stale(&meta),
                };
                if needs_build {
                    self.precache_seq(surface, seq_no, levels);
                }
            }
        }
    }

    /// Sleep for `interval`, waking early on shutdown. Returns true when the
    /// service has stopped.
    fn sleep_or_stop(&self, interval: Duration) -> bool {
        let mut guard = self.stop_mutex.lock();
        if self.stopped.load(Ordering::Relaxed) {
            return true;
        }
        self.stop_cond.wait_for(&mut guard, interval);
        self.stopped.load(Ordering::Relaxed)
    }

    fn push_status(&self, state: &str, message: &str, data: serde_json::Value) {
        let level = match state {
            "error" => "error",
            "aborted" => "warn",
            _ => "info",
        };
        if let Err(err) = self.status.append_log(SERVICE_NAME, level, message, &data) {
            debug!(error = %err, "status log dropped");
        }
        if let Err(err) = self.status.update_service(SERVICE_NAME, state, message, data) {
            debug!(error = %err, "status push dropped");
        }
    }
}

impl PrefetchExecutor for ImageService {
    fn warm_tile(&self, request: &TileRequest) -> TileResult<()> {
        let params = TileParams {
            surface: request.surface,
            seq_no: request.seq_no,
            view: Some(request.view.clone()),
            level: request.level,
            orientation: Orientation::Vertical,
            tile_x: request.tile_x,
            tile_y: request.tile_y,
            format: OutputFormat::Jpeg,
            viewer_id: None,
            defect_hint: false,
        };
        // Prefetch execution never schedules more prefetch.
        self.get_tile_impl(&params, false).map(|_| ())
    }

    fn first_tile_coords(
        &self,
        surface: Surface,
        seq_no: i64,
        view: &str,
        level: u32,
        count: u32,
    ) -> TileResult<Vec<(u32, u32)>> {
        let frame_paths = self.frames.list_frame_paths(surface, seq_no, view)?;
        let layout = self.layout(frame_paths.len() as u32, Orientation::Vertical);
        Ok(mosaic::first_tile_coords(
            &layout,
            self.config.images.tile_size(),
            level,
            count as usize,
        ))
    }

    fn covering_tiles(&self, center_x: u64, center_y: u64) -> Vec<(u32, u32, u32)> {
        let tile_size = self.config.images.tile_size();
        (0..=self.disk.max_level())
            .map(|level| {
                let span = (tile_size as u64) << level;
                (level, (center_x / span) as u32, (center_y / span) as u32)
            })
            .collect()
    }
}

impl Drop for ImageService {
    fn drop(&mut self) {
        self.stopped.store(true, Ordering::Relaxed);
        self.abort_current.store(true, Ordering::Relaxed);
        self.task_cond.notify_all();
        self.pause_cond.notify_all();
        self.stop_cond.notify_all();
    }
}
