//! Tiled-image caching and prefetch engine for strip-surface inspection
//! imagery.
//!
//! A sequence of fixed-size line-scan frames is served as a zoomable mosaic
//! pyramid. The engine layers:
//! - TTL-bounded LRU memory caches for frames, tiles, mosaics and defect
//!   crops
//! - a persistent disk cache with per-sequence metadata and staleness
//!   detection
//! - a priority-ordered background prefetch queue
//! - an orchestrating service with precache, delete, rebuild, pause/resume
//!   and cache-root migration

pub mod config;
pub mod disk_cache;
pub mod error;
pub mod mosaic;
pub mod prefetch;
pub mod service;
pub mod status;
pub mod stores;
pub mod ttl_cache;
#[cfg(test)]
pub(crate) mod test_utils;

use std::sync::Arc;

pub use config::EngineConfig;
pub use error::{TileError, TileResult};
pub use mosaic::{Orientation, OutputFormat, PixelBox};
pub use service::{CacheTask, DefectCropParams, ImageService, MosaicParams, TileParams};
pub use stores::{DefectRecord, DefectStore, FrameStore, Surface};

use prefetch::{PrefetchExecutor, PrefetchManager};
use status::StatusSink;

/// Fully wired engine: the image service plus its prefetch queue and
/// background threads.
pub struct Engine {
    service: Arc<ImageService>,
    prefetch: Arc<PrefetchManager>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        frames: Arc<dyn FrameStore>,
        defects: Arc<dyn DefectStore>,
        status: Arc<dyn StatusSink>,
    ) -> TileResult<Self> {
        let prefetch_settings = config.prefetch.clone();
        let service = Arc::new(ImageService::new(config, frames, defects, status)?);
        let prefetch = Arc::new(PrefetchManager::new(prefetch_settings)?);
        service.attach_prefetch(Arc::clone(&prefetch));
        prefetch.start(Arc::clone(&service) as Arc<dyn PrefetchExecutor>);
        service.start_background();
        Ok(Self { service, prefetch })
    }

    pub fn service(&self) -> &Arc<ImageService> {
        &self.service
    }

    /// Stop the prefetch workers and background threads and join them.
    pub fn shutdown(&self) {
        self.prefetch.stop();
        self.service.shutdown();
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
