//! Engine configuration loaded from JSON.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::TileResult;

/// Frame layout and surface root settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ImageSettings {
    pub top_root: PathBuf,
    pub bottom_root: PathBuf,
    #[serde(default)]
    pub disk_cache_top_root: Option<PathBuf>,
    #[serde(default)]
    pub disk_cache_bottom_root: Option<PathBuf>,
    #[serde(default = "default_view")]
    pub default_view: String,
    #[serde(default = "default_extension")]
    pub file_extension: String,
    #[serde(default = "default_frame_width")]
    pub frame_width: u32,
    #[serde(default = "default_frame_height")]
    pub frame_height: u32,
    /// Level-0 tile edge in pixels. Defaults to the frame height so a level-0
    /// tile row maps onto exactly one frame stripe.
    #[serde(default)]
    pub tile_size: Option<u32>,
}

impl ImageSettings {
    pub fn tile_size(&self) -> u32 {
        self.tile_size.unwrap_or(self.frame_height)
    }
}

/// Memory- and disk-cache settings.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheSettings {
    #[serde(default = "default_max_frames")]
    pub max_frames: usize,
    #[serde(default = "default_max_tiles")]
    pub max_tiles: usize,
    #[serde(default = "default_max_mosaics")]
    pub max_mosaics: usize,
    #[serde(default = "default_max_defect_crops")]
    pub max_defect_crops: usize,
    #[serde(default = "default_ttl_seconds")]
    pub ttl_seconds: u64,
    /// Shard count for the tile memory cache.
    #[serde(default = "default_tile_segments")]
    pub tile_segments: usize,
    /// Gzip tile payloads inside the memory cache.
    #[serde(default)]
    pub tile_compression: bool,
    /// Use the hot/warm/cold tiered cache for tiles instead of the flat
    /// sharded one.
    #[serde(default)]
    pub tiered_tile_cache: bool,
    #[serde(default = "default_true")]
    pub defect_cache_enabled: bool,
    #[serde(default = "default_defect_expand")]
    pub defect_expand: u32,
    #[serde(default)]
    pub disk_cache_enabled: bool,
    #[serde(default)]
    pub disk_cache_read_only: bool,
    /// Drop the per-sequence path component ({root}/cache/{view} instead of
    /// {root}/{seq}/cache/{view}).
    #[serde(default)]
    pub disk_cache_flat_layout: bool,
    #[serde(default = "default_disk_max_tiles")]
    pub disk_cache_max_tiles: usize,
    #[serde(default = "default_disk_max_defects")]
    pub disk_cache_max_defects: usize,
    #[serde(default = "default_scan_interval")]
    pub disk_cache_scan_interval_seconds: u64,
    #[serde(default = "default_cleanup_interval")]
    pub disk_cache_cleanup_interval_seconds: u64,
    #[serde(default)]
    pub disk_precache_enabled: bool,
    /// How many of the coarsest pyramid levels the auto precache renders.
    #[serde(default = "default_precache_levels")]
    pub disk_precache_levels: u32,
    #[serde(default = "default_precache_workers")]
    pub disk_precache_workers: usize,
    /// Newest-N window inspected by the automatic staleness scan.
    #[serde(default = "default_scan_limit")]
    pub disk_cache_scan_limit: usize,
}

/// Prefetch scheduler settings.
#[derive(Debug, Clone, Deserialize)]
pub struct PrefetchSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_prefetch_workers")]
    pub workers: usize,
    #[serde(default = "default_prefetch_ttl")]
    pub ttl_seconds: u64,
    #[serde(default = "default_true")]
    pub clear_pending_on_seq_change: bool,
    /// How many neighbors from `adjacent_tile_order` to enqueue per served
    /// tile.
    #[serde(default = "default_adjacent_count")]
    pub adjacent_tile_count: usize,
    #[serde(default = "default_adjacent_order")]
    pub adjacent_tile_order: Vec<String>,
    #[serde(default = "default_true")]
    pub cross_level_enabled: bool,
    #[serde(default = "default_true")]
    pub adjacent_seq_enabled: bool,
    /// `(level, tile_count)` pairs warmed on neighbor sequences.
    #[serde(default = "default_warm_levels")]
    pub adjacent_seq_warm_levels: Vec<(u32, u32)>,
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    pub images: ImageSettings,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub prefetch: PrefetchSettings,
}

impl EngineConfig {
    /// Load configuration from a JSON file.
    pub fn load(path: &Path) -> TileResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: EngineConfig = serde_json::from_str(&content)?;
        Ok(config)
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        serde_json::from_str("{}").expect("static default")
    }
}

impl Default for PrefetchSettings {
    fn default() -> Self {
        serde_json::from_str("{}").expect("static default")
    }
}

fn default_view() -> String {
    "2D".to_string()
}

fn default_extension() -> String {
    "jpg".to_string()
}

fn default_frame_width() -> u32 {
    16384
}

fn default_frame_height() -> u32 {
    1024
}

fn default_max_frames() -> usize {
    64
}

fn default_max_tiles() -> usize {
    256
}

fn default_max_mosaics() -> usize {
    8
}

fn default_max_defect_crops() -> usize {
    256
}

fn default_ttl_seconds() -> u64 {
    120
}

fn default_tile_segments() -> usize {
    16
}

fn default_true() -> bool {
    true
}

fn default_defect_expand() -> u32 {
    100
}

fn default_disk_max_tiles() -> usize {
    20_000
}

fn default_disk_max_defects() -> usize {
    20_000
}

fn default_scan_interval() -> u64 {
    5
}

fn default_cleanup_interval() -> u64 {
    60
}

fn default_precache_levels() -> u32 {
    1
}

fn default_precache_workers() -> usize {
    2
}

fn default_scan_limit() -> usize {
    20
}

fn default_prefetch_workers() -> usize {
    2
}

fn default_prefetch_ttl() -> u64 {
    300
}

fn default_adjacent_count() -> usize {
    1
}

fn default_adjacent_order() -> Vec<String> {
    ["right", "left", "down", "up"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_warm_levels() -> Vec<(u32, u32)> {
    vec![(4, 10), (3, 20)]
}

fn default_max_pending() -> usize {
    5000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let json = r#"{
            "images": {"top_root": "/data/top", "bottom_root": "/data/bottom"}
        }"#;
        let config: EngineConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.images.default_view, "2D");
        assert_eq!(config.images.frame_width, 16384);
        assert_eq!(config.images.frame_height, 1024);
        assert_eq!(config.images.tile_size(), 1024);
        assert_eq!(config.cache.ttl_seconds, 120);
        assert!(!config.cache.disk_cache_enabled);
        assert_eq!(config.prefetch.workers, 2);
        assert_eq!(config.prefetch.adjacent_seq_warm_levels, vec![(4, 10), (3, 20)]);
    }

    #[test]
    fn test_explicit_tile_size_wins() {
        let json = r#"{
            "images": {
                "top_root": "/t", "bottom_root": "/b",
                "frame_height": 2048, "tile_size": 512
            }
        }"#;
        let config: EngineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.images.tile_size(), 512);
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let result = EngineConfig::load(Path::new("/nonexistent/server.json"));
        assert!(result.is_err());
    }
}
