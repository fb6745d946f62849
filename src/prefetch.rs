//! Background tile prefetching.
//!
//! Requests are drained from a priority queue ordered by `(priority, enqueue
//! order)` with lower priority values served first. A dedup map keeps at
//! most one live entry per logical key: resubmitting a key at an equal or
//! worse priority is dropped, a better priority replaces the old entry and
//! the superseded heap item is discarded lazily on pop.
//!
//! Priorities: 0 = defect hint, 1 = adjacency and cross-level around a
//! served tile, 2 = adjacent-sequence warm.

use std::cmp::Ordering as CmpOrdering;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

use crate::config::PrefetchSettings;
use crate::error::TileResult;
use crate::stores::Surface;
use crate::ttl_cache::TtlLruCache;

pub const PRIORITY_DEFECT_HINT: u8 = 0;
pub const PRIORITY_ADJACENT: u8 = 1;
pub const PRIORITY_SEQ_WARM: u8 = 2;

/// Warm one tile into the caches.
#[derive(Debug, Clone)]
pub struct TileRequest {
    /// Set when a viewer's request scheduled this; prefetch-origin requests
    /// carry `None` so execution never schedules further prefetch.
    pub viewer_id: Option<String>,
    pub surface: Surface,
    pub seq_no: i64,
    pub view: String,
    pub level: u32,
    pub tile_x: u32,
    pub tile_y: u32,
}

/// Warm the first `count` tiles of a sequence at `level`.
#[derive(Debug, Clone)]
pub struct SeqWarmRequest {
    pub surface: Surface,
    pub seq_no: i64,
    pub view: String,
    pub level: u32,
    pub count: u32,
}

/// Warm the tiles covering a defect's mosaic position at every level.
#[derive(Debug, Clone)]
pub struct DefectHintRequest {
    pub surface: Surface,
    pub seq_no: i64,
    pub view: String,
    /// Defect center in level-0 mosaic coordinates, vertical orientation.
    pub center_x: u64,
    pub center_y: u64,
}

#[derive(Debug, Clone)]
pub enum PrefetchRequest {
    Tile(TileRequest),
    SeqWarm(SeqWarmRequest),
    DefectHint(DefectHintRequest),
}

/// Dedup identity of a request. Tile keys cover the full coordinate;
/// sequence warms dedup per level.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum PrefetchKey {
    Tile {
        surface: Surface,
        seq_no: i64,
        view: String,
        level: u32,
        tile_x: u32,
        tile_y: u32,
    },
    SeqWarm {
        surface: Surface,
        seq_no: i64,
        view: String,
        level: u32,
    },
    DefectHint {
        surface: Surface,
        seq_no: i64,
        view: String,
        center_x: u64,
        center_y: u64,
    },
}

impl PrefetchKey {
    fn seq_no(&self) -> i64 {
        match self {
            Self::Tile { seq_no, .. }
            | Self::SeqWarm { seq_no, .. }
            | Self::DefectHint { seq_no, .. } => *seq_no,
        }
    }
}

impl PrefetchRequest {
    fn key(&self) -> PrefetchKey {
        match self {
            Self::Tile(r) => PrefetchKey::Tile {
                surface: r.surface,
                seq_no: r.seq_no,
                view: r.view.clone(),
                level: r.level,
                tile_x: r.tile_x,
                tile_y: r.tile_y,
            },
            Self::SeqWarm(r) => PrefetchKey::SeqWarm {
                surface: r.surface,
                seq_no: r.seq_no,
                view: r.view.clone(),
                level: r.level,
            },
            Self::DefectHint(r) => PrefetchKey::DefectHint {
                surface: r.surface,
                seq_no: r.seq_no,
                view: r.view.clone(),
                center_x: r.center_x,
                center_y: r.center_y,
            },
        }
    }
}

/// What the manager runs requests against. The image service implements
/// this; the indirection keeps the queue testable without real imagery.
pub trait PrefetchExecutor: Send + Sync {
    fn warm_tile(&self, request: &TileRequest) -> TileResult<()>;

    /// Row-major coordinates of the first `count` tiles at `level`.
    fn first_tile_coords(
        &self,
        surface: Surface,
        seq_no: i64,
        view: &str,
        level: u32,
        count: u32,
    ) -> TileResult<Vec<(u32, u32)>>;

    /// `(level, tile_x, tile_y)` of the tile covering a mosaic position at
    /// every pyramid level.
    fn covering_tiles(&self, center_x: u64, center_y: u64) -> Vec<(u32, u32, u32)>;
}

struct HeapItem {
    priority: u8,
    order: u64,
    request: PrefetchRequest,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.order == other.order
    }
}

impl Eq for HeapItem {}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (self.priority, self.order).cmp(&(other.priority, other.order))
    }
}

struct Shared {
    heap: BinaryHeap<Reverse<HeapItem>>,
    best: HashMap<PrefetchKey, u8>,
    pending_by_viewer: HashMap<String, HashSet<PrefetchKey>>,
    active_seq: HashMap<String, i64>,
    stopped: bool,
}

/// Priority-ordered prefetch queue plus its worker threads.
pub struct PrefetchManager {
    settings: PrefetchSettings,
    shared: Mutex<Shared>,
    cond: Condvar,
    order: AtomicU64,
    // Remembers recently warmed neighbor sequences so viewer navigation
    // does not re-enqueue the same warm burst every tile.
    warm_mark: TtlLruCache<(Surface, i64, String), ()>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl PrefetchManager {
    pub fn new(settings: PrefetchSettings) -> TileResult<Self> {
        let warm_mark = TtlLruCache::new(1024, settings.ttl_seconds)?;
        Ok(Self {
            settings,
            shared: Mutex::new(Shared {
                heap: BinaryHeap::new(),
                best: HashMap::new(),
                pending_by_viewer: HashMap::new(),
                active_seq: HashMap::new(),
                stopped: false,
            }),
            cond: Condvar::new(),
            order: AtomicU64::new(0),
            warm_mark,
            workers: Mutex::new(Vec::new()),
        })
    }

    pub fn enqueue_tile(&self, request: TileRequest, priority: u8) -> bool {
        self.enqueue(PrefetchRequest::Tile(request), priority)
    }

    pub fn enqueue_seq_warm(&self, request: SeqWarmRequest) -> bool {
        self.enqueue(PrefetchRequest::SeqWarm(request), PRIORITY_SEQ_WARM)
    }

    pub fn enqueue_defect_hint(&self, request: DefectHintRequest) -> bool {
        self.enqueue(PrefetchRequest::DefectHint(request), PRIORITY_DEFECT_HINT)
    }

    /// Enqueue warm bursts for the neighbor sequences of `seq_no`, once per
    /// neighbor per TTL window.
    pub fn maybe_enqueue_adjacent_warm(&self, surface: Surface, seq_no: i64, view: &str) {
        if !self.settings.enabled || !self.settings.adjacent_seq_enabled {
            return;
        }
        for neighbor in [seq_no - 1, seq_no + 1] {
            if neighbor < 0 {
                continue;
            }
            let mark = (surface, neighbor, view.to_string());
            if self.warm_mark.get(&mark).is_some() {
                continue;
            }
            self.warm_mark.put(mark, ());
            for &(level, count) in &self.settings.adjacent_seq_warm_levels {
                self.enqueue_seq_warm(SeqWarmRequest {
                    surface,
                    seq_no: neighbor,
                    view: view.to_string(),
                    level,
                    count,
                });
            }
        }
    }

    /// Record that `viewer_id` is now looking at `seq_no`. On a sequence
    /// change with `clear_pending` set, pending work this viewer scheduled
    /// for other sequences is dropped so the queue tracks what is on screen.
    pub fn notify_seq_request(&self, viewer_id: &str, seq_no: i64, clear_pending: bool) {
        let mut shared = self.shared.lock();
        let previous = shared.active_seq.insert(viewer_id.to_string(), seq_no);
        if previous == Some(seq_no) || !clear_pending {
            return;
        }
        let Some(keys) = shared.pending_by_viewer.remove(viewer_id) else {
            return;
        };
        let mut kept = HashSet::new();
        let mut dropped = 0usize;
        for key in keys {
            if key.seq_no() == seq_no {
                kept.insert(key);
                continue;
            }
            // Another viewer may still be waiting on the same key.
            let wanted_elsewhere = shared
                .pending_by_viewer
                .values()
                .any(|set| set.contains(&key));
            if wanted_elsewhere {
                continue;
            }
            shared.best.remove(&key);
            dropped += 1;
        }
        if !kept.is_empty() {
            shared.pending_by_viewer.insert(viewer_id.to_string(), kept);
        }
        if dropped > 0 {
            debug!(viewer_id, seq_no, dropped, "cleared stale prefetch backlog");
        }
    }

    fn enqueue(&self, request: PrefetchRequest, priority: u8) -> bool {
        if !self.settings.enabled {
            return false;
        }
        let key = request.key();
        let viewer = match &request {
            PrefetchRequest::Tile(tile) => tile.viewer_id.clone(),
            _ => None,
        };
        let mut shared = self.shared.lock();
        if shared.stopped {
            return false;
        }
        match shared.best.get(&key) {
            Some(&best) if best <= priority => {
                // Already queued at least as urgently. Still record this
                // viewer's interest so another viewer's backlog clear cannot
                // drop the shared key out from under them.
                if let Some(viewer) = viewer {
                    shared
                        .pending_by_viewer
                        .entry(viewer)
                        .or_default()
                        .insert(key);
                }
                return false;
            }
            Some(_) => {}
            None if shared.best.len() >= self.settings.max_pending => return false,
            None => {}
        }
        shared.best.insert(key.clone(), priority);
        if let Some(viewer) = viewer {
            shared
                .pending_by_viewer
                .entry(viewer)
                .or_default()
                .insert(key);
        }
        let order = self.order.fetch_add(1, Ordering::Relaxed);
        shared.heap.push(Reverse(HeapItem {
            priority,
            order,
            request,
        }));
        drop(shared);
        self.cond.notify_one();
        true
    }

    /// Pop the most urgent live request without blocking.
    fn try_next_request(&self) -> Option<(u8, PrefetchRequest)> {
        let mut shared = self.shared.lock();
        Self::pop_locked(&mut shared)
    }

    fn pop_locked(shared: &mut Shared) -> Option<(u8, PrefetchRequest)> {
        while let Some(Reverse(item)) = shared.heap.pop() {
            let key = item.request.key();
            // Entries whose key was cleared or re-enqueued at a better
            // priority are stale.
            if shared.best.get(&key) != Some(&item.priority) {
                continue;
            }
            shared.best.remove(&key);
            // Every interested viewer is satisfied by the one execution.
            for set in shared.pending_by_viewer.values_mut() {
                set.remove(&key);
            }
            return Some((item.priority, item.request));
        }
        None
    }

    pub fn pending_len(&self) -> usize {
        self.shared.lock().best.len()
    }

    /// Spawn the worker threads. Idempotent: a second call is a no-op.
    pub fn start(self: &Arc<Self>, executor: Arc<dyn PrefetchExecutor>) {
        if !self.settings.enabled {
            return;
        }
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            return;
        }
        for i in 0..self.settings.workers.max(1) {
            let manager = Arc::clone(self);
            let executor = Arc::clone(&executor);
            let handle = std::thread::Builder::new()
                .name(format!("tile-prefetch-{i}"))
                .spawn(move || manager.worker_loop(executor.as_ref()))
                .expect("spawn prefetch worker");
            workers.push(handle);
        }
        info!(workers = workers.len(), "prefetch workers started");
    }

    /// Signal the workers to stop and join them.
    pub fn stop(&self) {
        {
            let mut shared = self.shared.lock();
            shared.stopped = true;
        }
        self.cond.notify_all();
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            let _ = handle.join();
        }
    }

    fn worker_loop(&self, executor: &dyn PrefetchExecutor) {
        loop {
            let next = {
                let mut shared = self.shared.lock();
                loop {
                    if shared.stopped {
                        return;
                    }
                    if let Some(next) = Self::pop_locked(&mut shared) {
                        break next;
                    }
                    self.cond.wait(&mut shared);
                }
            };
            match next.1 {
                PrefetchRequest::Tile(request) => {
                    if let Err(err) = executor.warm_tile(&request) {
                        debug!(
                            seq_no = request.seq_no,
                            level = request.level,
                            tile_x = request.tile_x,
                            tile_y = request.tile_y,
                            error = %err,
                            "prefetch tile failed"
                        );
                    }
                }
                PrefetchRequest::SeqWarm(request) => {
                    // Expand into per-tile requests so they interleave with
                    // more urgent work instead of hogging a worker.
                    match executor.first_tile_coords(
                        request.surface,
                        request.seq_no,
                        &request.view,
                        request.level,
                        request.count,
                    ) {
                        Ok(coords) => {
                            for (tile_x, tile_y) in coords {
                                self.enqueue_tile(
                                    TileRequest {
                                        viewer_id: None,
                                        surface: request.surface,
                                        seq_no: request.seq_no,
                                        view: request.view.clone(),
                                        level: request.level,
                                        tile_x,
                                        tile_y,
                                    },
                                    PRIORITY_SEQ_WARM,
                                );
                            }
                        }
                        Err(err) => {
                            debug!(seq_no = request.seq_no, error = %err, "seq warm skipped");
                        }
                    }
                }
                PrefetchRequest::DefectHint(request) => {
                    for (level, tile_x, tile_y) in
                        executor.covering_tiles(request.center_x, request.center_y)
                    {
                        self.enqueue_tile(
                            TileRequest {
                                viewer_id: None,
                                surface: request.surface,
                                seq_no: request.seq_no,
                                view: request.view.clone(),
                                level,
                                tile_x,
                                tile_y,
                            },
                            PRIORITY_DEFECT_HINT,
                        );
                    }
                }
            }
        }
    }
}

impl Drop for PrefetchManager {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> PrefetchManager {
        let settings: PrefetchSettings = serde_json::from_str("{}").unwrap();
        PrefetchManager::new(settings).unwrap()
    }

    fn tile(viewer: Option<&str>, seq_no: i64, level: u32, x: u32, y: u32) -> TileRequest {
        TileRequest {
            viewer_id: viewer.map(str::to_string),
            surface: Surface::Top,
            seq_no,
            view: "2D".into(),
            level,
            tile_x: x,
            tile_y: y,
        }
    }

    fn popped_coords(m: &PrefetchManager) -> Vec<(u8, i64, u32, u32)> {
        let mut out = Vec::new();
        while let Some((priority, request)) = m.try_next_request() {
            if let PrefetchRequest::Tile(r) = request {
                out.push((priority, r.seq_no, r.tile_x, r.tile_y));
            }
        }
        out
    }

    #[test]
    fn test_priority_then_fifo_order() {
        let m = manager();
        assert!(m.enqueue_tile(tile(None, 500, 0, 0, 0), PRIORITY_SEQ_WARM));
        assert!(m.enqueue_tile(tile(None, 500, 0, 1, 0), PRIORITY_ADJACENT));
        assert!(m.enqueue_tile(tile(None, 500, 0, 2, 0), PRIORITY_DEFECT_HINT));
        assert!(m.enqueue_tile(tile(None, 500, 0, 3, 0), PRIORITY_ADJACENT));
        let order = popped_coords(&m);
        assert_eq!(
            order,
            vec![(0, 500, 2, 0), (1, 500, 1, 0), (1, 500, 3, 0), (2, 500, 0, 0)]
        );
    }

    #[test]
    fn test_dedup_equal_or_worse_dropped() {
        let m = manager();
        assert!(m.enqueue_tile(tile(None, 500, 0, 0, 0), PRIORITY_ADJACENT));
        assert!(!m.enqueue_tile(tile(None, 500, 0, 0, 0), PRIORITY_ADJACENT));
        assert!(!m.enqueue_tile(tile(None, 500, 0, 0, 0), PRIORITY_SEQ_WARM));
        assert_eq!(m.pending_len(), 1);
        assert_eq!(popped_coords(&m).len(), 1);
    }

    #[test]
    fn test_dedup_better_priority_replaces() {
        let m = manager();
        assert!(m.enqueue_tile(tile(None, 500, 0, 0, 0), PRIORITY_SEQ_WARM));
        assert!(m.enqueue_tile(tile(None, 500, 0, 1, 1), PRIORITY_ADJACENT));
        assert!(m.enqueue_tile(tile(None, 500, 0, 0, 0), PRIORITY_DEFECT_HINT));
        // The upgraded key runs once, at the better priority, and its stale
        // original heap entry is discarded.
        let order = popped_coords(&m);
        assert_eq!(order, vec![(0, 500, 0, 0), (1, 500, 1, 1)]);
    }

    #[test]
    fn test_seq_change_clears_other_seq_pending() {
        let m = manager();
        m.notify_seq_request("viewer-a", 500, true);
        assert!(m.enqueue_tile(tile(Some("viewer-a"), 500, 0, 0, 0), PRIORITY_ADJACENT));
        assert!(m.enqueue_tile(tile(Some("viewer-a"), 500, 0, 1, 0), PRIORITY_ADJACENT));
        assert!(m.enqueue_tile(tile(Some("viewer-b"), 500, 0, 2, 0), PRIORITY_ADJACENT));
        m.notify_seq_request("viewer-a", 501, true);
        // viewer-a's pending work for seq 500 is gone; viewer-b's survives.
        let order = popped_coords(&m);
        assert_eq!(order, vec![(1, 500, 2, 0)]);
    }

    #[test]
    fn test_shared_key_survives_one_viewers_backlog_clear() {
        let m = manager();
        m.notify_seq_request("viewer-a", 500, true);
        m.notify_seq_request("viewer-b", 500, true);
        assert!(m.enqueue_tile(tile(Some("viewer-a"), 500, 0, 0, 0), PRIORITY_ADJACENT));
        // viewer-b's identical request dedups but records their interest.
        assert!(!m.enqueue_tile(tile(Some("viewer-b"), 500, 0, 0, 0), PRIORITY_ADJACENT));
        m.notify_seq_request("viewer-a", 501, true);
        assert_eq!(m.pending_len(), 1);
        m.notify_seq_request("viewer-b", 501, true);
        assert_eq!(m.pending_len(), 0);
    }

    #[test]
    fn test_seq_change_without_clear_keeps_pending() {
        let m = manager();
        m.notify_seq_request("viewer-a", 500, false);
        assert!(m.enqueue_tile(tile(Some("viewer-a"), 500, 0, 0, 0), PRIORITY_ADJACENT));
        m.notify_seq_request("viewer-a", 501, false);
        assert_eq!(m.pending_len(), 1);
    }

    #[test]
    fn test_same_seq_notify_keeps_pending() {
        let m = manager();
        m.notify_seq_request("viewer-a", 500, true);
        assert!(m.enqueue_tile(tile(Some("viewer-a"), 500, 0, 0, 0), PRIORITY_ADJACENT));
        m.notify_seq_request("viewer-a", 500, true);
        assert_eq!(m.pending_len(), 1);
    }

    #[test]
    fn test_max_pending_bounds_new_keys() {
        let settings: PrefetchSettings =
            serde_json::from_str(r#"{"max_pending": 2}"#).unwrap();
        let m = PrefetchManager::new(settings).unwrap();
        assert!(m.enqueue_tile(tile(None, 500, 0, 0, 0), PRIORITY_SEQ_WARM));
        assert!(m.enqueue_tile(tile(None, 500, 0, 1, 0), PRIORITY_SEQ_WARM));
        assert!(!m.enqueue_tile(tile(None, 500, 0, 2, 0), PRIORITY_SEQ_WARM));
        // Upgrading an existing key is still allowed at capacity.
        assert!(m.enqueue_tile(tile(None, 500, 0, 0, 0), PRIORITY_ADJACENT));
        assert_eq!(m.pending_len(), 2);
    }

    #[test]
    fn test_disabled_manager_accepts_nothing() {
        let settings: PrefetchSettings = serde_json::from_str(r#"{"enabled": false}"#).unwrap();
        let m = PrefetchManager::new(settings).unwrap();
        assert!(!m.enqueue_tile(tile(None, 500, 0, 0, 0), PRIORITY_DEFECT_HINT));
        assert_eq!(m.pending_len(), 0);
    }

    #[test]
    fn test_adjacent_warm_marks_once_per_neighbor() {
        let m = manager();
        m.maybe_enqueue_adjacent_warm(Surface::Top, 500, "2D");
        // Two neighbors, two warm levels each.
        assert_eq!(m.pending_len(), 4);
        m.maybe_enqueue_adjacent_warm(Surface::Top, 500, "2D");
        assert_eq!(m.pending_len(), 4);
        // Neighbor below zero is skipped.
        let m2 = manager();
        m2.maybe_enqueue_adjacent_warm(Surface::Top, 0, "2D");
        assert_eq!(m2.pending_len(), 2);
    }

    struct CountingExecutor {
        warmed: Mutex<Vec<(i64, u32, u32, u32)>>,
    }

    impl PrefetchExecutor for CountingExecutor {
        fn warm_tile(&self, request: &TileRequest) -> TileResult<()> {
            self.warmed.lock().push((
                request.seq_no,
                request.level,
                request.tile_x,
                request.tile_y,
            ));
            Ok(())
        }

        fn first_tile_coords(
            &self,
            _surface: Surface,
            _seq_no: i64,
            _view: &str,
            _level: u32,
            count: u32,
        ) -> TileResult<Vec<(u32, u32)>> {
            Ok((0..count).map(|x| (x, 0)).collect())
        }

        fn covering_tiles(&self, center_x: u64, center_y: u64) -> Vec<(u32, u32, u32)> {
            // Two-level pyramid with a 64px level-0 span.
            vec![
                (0, (center_x / 64) as u32, (center_y / 64) as u32),
                (1, (center_x / 128) as u32, (center_y / 128) as u32),
            ]
        }
    }

    #[test]
    fn test_workers_drain_queue_and_stop() {
        let m = Arc::new(manager());
        let executor = Arc::new(CountingExecutor {
            warmed: Mutex::new(Vec::new()),
        });
        m.start(Arc::clone(&executor) as Arc<dyn PrefetchExecutor>);
        for x in 0..8 {
            m.enqueue_tile(tile(None, 500, 1, x, 0), PRIORITY_ADJACENT);
        }
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while executor.warmed.lock().len() < 8 && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        m.stop();
        assert_eq!(executor.warmed.lock().len(), 8);
        // Stopped queue refuses new work.
        assert!(!m.enqueue_tile(tile(None, 500, 1, 9, 0), PRIORITY_ADJACENT));
    }

    #[test]
    fn test_seq_warm_expands_to_tiles() {
        let m = manager();
        m.enqueue_seq_warm(SeqWarmRequest {
            surface: Surface::Top,
            seq_no: 500,
            view: "2D".into(),
            level: 4,
            count: 3,
        });
        let (priority, request) = m.try_next_request().unwrap();
        assert_eq!(priority, PRIORITY_SEQ_WARM);
        let PrefetchRequest::SeqWarm(warm) = request else {
            panic!("expected seq warm");
        };
        assert_eq!((warm.level, warm.count), (4, 3));
        // Re-enqueue of the same warm dedups.
        m.enqueue_seq_warm(SeqWarmRequest {
            surface: Surface::Top,
            seq_no: 500,
            view: "2D".into(),
            level: 4,
            count: 3,
        });
        m.enqueue_seq_warm(SeqWarmRequest {
            surface: Surface::Top,
            seq_no: 500,
            view: "2D".into(),
            level: 4,
            count: 3,
        });
        assert_eq!(m.pending_len(), 1);
    }

    #[test]
    fn test_defect_hint_expands_to_covering_tiles_at_top_priority() {
        let m = Arc::new(manager());
        let executor = Arc::new(CountingExecutor {
            warmed: Mutex::new(Vec::new()),
        });
        assert!(m.enqueue_defect_hint(DefectHintRequest {
            surface: Surface::Top,
            seq_no: 500,
            view: "2D".into(),
            center_x: 200,
            center_y: 70,
        }));
        // The hint itself dedups on its center.
        assert!(!m.enqueue_defect_hint(DefectHintRequest {
            surface: Surface::Top,
            seq_no: 500,
            view: "2D".into(),
            center_x: 200,
            center_y: 70,
        }));
        m.start(Arc::clone(&executor) as Arc<dyn PrefetchExecutor>);
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while executor.warmed.lock().len() < 2 && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        m.stop();
        let warmed = executor.warmed.lock();
        assert!(warmed.contains(&(500, 0, 3, 1)));
        assert!(warmed.contains(&(500, 1, 1, 0)));
    }
}
