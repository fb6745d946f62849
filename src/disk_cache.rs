//! Persistent, file-based cache for tiles and defect crops.
//!
//! Layout under a surface cache root:
//!   {root}/{seq}/cache/{view}/cache.json
//!   {root}/{seq}/cache/{view}/tile/{level}/{orientation}_{x}_{y}.{ext}
//!   {root}/{seq}/cache/{view}/defect/{derived_key}.{ext}
//!
//! Reads degrade to absent on any filesystem error; writes are atomic
//! (temp file + rename) and swallowed on failure. A caching layer must never
//! fail the primary request path.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::config::{CacheSettings, ImageSettings};
use crate::mosaic::Orientation;

/// Tile section of the per-sequence metadata record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TileMeta {
    pub tile_size: u32,
    pub max_level: u32,
    pub format: String,
}

/// Defect section of the per-sequence metadata record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefectMeta {
    pub format: String,
    pub expand: u32,
    pub enabled: bool,
}

/// One `cache.json` record: the tiling parameters in effect when the
/// sequence's cache was written. Used to detect staleness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskCacheMeta {
    pub created_at: String,
    pub view: String,
    pub tile: TileMeta,
    pub defects: DefectMeta,
}

/// File-level cache for tiles and defect crops.
pub struct DiskImageCache {
    enabled: bool,
    read_only: bool,
    flat_layout: bool,
    max_tiles: usize,
    max_defects: usize,
    defect_expand: u32,
    tile_size: u32,
    frame_width: u32,
    frame_height: u32,
    view_name: String,
    ext: String,
    // Serializes the physical temp-file + rename sequence. Reads take no
    // lock: completed files are immutable until evicted.
    write_lock: Mutex<()>,
}

impl DiskImageCache {
    pub fn new(cache: &CacheSettings, images: &ImageSettings) -> Self {
        Self {
            enabled: cache.disk_cache_enabled,
            read_only: cache.disk_cache_read_only,
            flat_layout: cache.disk_cache_flat_layout,
            max_tiles: cache.disk_cache_max_tiles,
            max_defects: cache.disk_cache_max_defects,
            defect_expand: cache.defect_expand,
            tile_size: images.tile_size(),
            frame_width: images.frame_width,
            frame_height: images.frame_height,
            view_name: images.default_view.clone(),
            ext: images.file_extension.clone(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn defect_expand(&self) -> u32 {
        self.defect_expand
    }

    /// Deepest pyramid level supported by the configured frame geometry.
    pub fn max_level(&self) -> u32 {
        crate::mosaic::max_level(self.frame_width, self.frame_height)
    }

    pub fn cache_dir(&self, cache_root: &Path, seq_no: i64, view: Option<&str>) -> PathBuf {
        let view_dir = view.unwrap_or(&self.view_name);
        if self.flat_layout {
            cache_root.join("cache").join(view_dir)
        } else {
            cache_root
                .join(seq_no.to_string())
                .join("cache")
                .join(view_dir)
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn tile_path(
        &self,
        cache_root: &Path,
        seq_no: i64,
        view: Option<&str>,
        level: u32,
        orientation: Orientation,
        tile_x: u32,
        tile_y: u32,
    ) -> PathBuf {
        self.cache_dir(cache_root, seq_no, view)
            .join("tile")
            .join(level.to_string())
            .join(format!("{orientation}_{tile_x}_{tile_y}.{}", self.ext))
    }

    pub fn defect_path(
        &self,
        cache_root: &Path,
        seq_no: i64,
        view: Option<&str>,
        derived_key: &str,
    ) -> PathBuf {
        self.cache_dir(cache_root, seq_no, view)
            .join("defect")
            .join(format!("{derived_key}.{}", self.ext))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn read_tile(
        &self,
        cache_root: &Path,
        seq_no: i64,
        view: Option<&str>,
        level: u32,
        orientation: Orientation,
        tile_x: u32,
        tile_y: u32,
    ) -> Option<Bytes> {
        if !self.enabled {
            return None;
        }
        let path = self.tile_path(cache_root, seq_no, view, level, orientation, tile_x, tile_y);
        fs::read(path).ok().map(Bytes::from)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn write_tile(
        &self,
        cache_root: &Path,
        seq_no: i64,
        view: Option<&str>,
        level: u32,
        orientation: Orientation,
        tile_x: u32,
        tile_y: u32,
        payload: &[u8],
    ) {
        if !self.enabled || self.read_only {
            return;
        }
        let path = self.tile_path(cache_root, seq_no, view, level, orientation, tile_x, tile_y);
        self.atomic_write(&path, payload);
        self.ensure_meta(cache_root, seq_no, view);
    }

    pub fn read_defect(
        &self,
        cache_root: &Path,
        seq_no: i64,
        view: Option<&str>,
        derived_key: &str,
    ) -> Option<Bytes> {
        if !self.enabled {
            return None;
        }
        let path = self.defect_path(cache_root, seq_no, view, derived_key);
        fs::read(path).ok().map(Bytes::from)
    }

    pub fn write_defect(
        &self,
        cache_root: &Path,
        seq_no: i64,
        view: Option<&str>,
        derived_key: &str,
        payload: &[u8],
    ) {
        if !self.enabled || self.read_only {
            return;
        }
        let path = self.defect_path(cache_root, seq_no, view, derived_key);
        self.atomic_write(&path, payload);
        self.ensure_meta(cache_root, seq_no, view);
    }

    /// Read the per-sequence metadata record; absent on missing or corrupt.
    pub fn read_meta(
        &self,
        cache_root: &Path,
        seq_no: i64,
        view: Option<&str>,
    ) -> Option<DiskCacheMeta> {
        let path = self.cache_dir(cache_root, seq_no, view).join("cache.json");
        let content = fs::read_to_string(path).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Whether cached artifacts written under `meta` are stale for the live
    /// configuration. Only `max_level` and defect `expand` participate;
    /// already-written caches stay valid across other config changes.
    pub fn is_stale(&self, meta: &DiskCacheMeta) -> bool {
        meta.tile.max_level < self.max_level() || meta.defects.expand < self.defect_expand
    }

    /// Rewrite the metadata record with current parameters. Only rebuild and
    /// precache call this; ordinary writes never overwrite an existing record.
    pub fn write_meta(&self, cache_root: &Path, seq_no: i64, view: Option<&str>) {
        if !self.enabled || self.read_only {
            return;
        }
        let path = self.cache_dir(cache_root, seq_no, view).join("cache.json");
        let meta = self.current_meta(view);
        match serde_json::to_vec_pretty(&meta) {
            Ok(payload) => {
                self.atomic_write(&path, &payload);
                info!(path = %path.display(), "disk-cache meta written");
            }
            Err(err) => debug!(error = %err, "disk-cache meta serialize failed"),
        }
    }

    /// Enforce `max_tiles` / `max_defects` for one sequence by deleting the
    /// oldest files (by mtime) beyond the cap.
    pub fn cleanup_seq(&self, cache_root: &Path, seq_no: i64, view: Option<&str>) {
        if !self.enabled || self.read_only {
            return;
        }
        let base = self.cache_dir(cache_root, seq_no, view);
        self.enforce_limit(&base.join("tile"), self.max_tiles);
        self.enforce_limit(&base.join("defect"), self.max_defects);
    }

    fn current_meta(&self, view: Option<&str>) -> DiskCacheMeta {
        DiskCacheMeta {
            created_at: chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            view: view.unwrap_or(&self.view_name).to_string(),
            tile: TileMeta {
                tile_size: self.tile_size,
                max_level: self.max_level(),
                format: "JPEG".to_string(),
            },
            defects: DefectMeta {
                format: "JPEG".to_string(),
                expand: self.defect_expand,
                enabled: self.enabled,
            },
        }
    }

    /// Create the metadata record if absent. Idempotent check-then-create:
    /// two concurrent writers may both decide to create, and the second
    /// write lands identical content.
    fn ensure_meta(&self, cache_root: &Path, seq_no: i64, view: Option<&str>) {
        let path = self.cache_dir(cache_root, seq_no, view).join("cache.json");
        if path.exists() {
            return;
        }
        self.write_meta(cache_root, seq_no, view);
    }

    fn atomic_write(&self, path: &Path, payload: &[u8]) {
        if let Some(parent) = path.parent() {
            if fs::create_dir_all(parent).is_err() {
                return;
            }
        }
        let tmp = path.with_extension(format!(
            "{}.tmp",
            path.extension().and_then(|e| e.to_str()).unwrap_or("bin")
        ));
        let _guard = self.write_lock.lock();
        if let Err(err) = fs::write(&tmp, payload).and_then(|_| fs::rename(&tmp, path)) {
            debug!(path = %path.display(), error = %err, "disk-cache write failed");
            let _ = fs::remove_file(&tmp);
        }
    }

    fn enforce_limit(&self, root: &Path, max_items: usize) {
        if !root.exists() {
            return;
        }
        let mut files: Vec<(SystemTime, PathBuf)> = WalkDir::new(root)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                entry.file_type().is_file()
                    && entry
                        .path()
                        .extension()
                        .and_then(|e| e.to_str())
                        .is_some_and(|e| e == self.ext)
            })
            .filter_map(|entry| {
                let mtime = entry.metadata().ok()?.modified().ok()?;
                Some((mtime, entry.into_path()))
            })
            .collect();
        if files.len() <= max_items {
            return;
        }
        files.sort_by_key(|(mtime, _)| *mtime);
        let excess = files.len() - max_items;
        for (_, path) in files.into_iter().take(excess) {
            let _ = fs::remove_file(path);
        }
    }
}
