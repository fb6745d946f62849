//! Shared fixtures: a small on-disk capture tree with real JPEG frames and
//! a service wired against it.

use std::fs;
use std::sync::Arc;

use image::{Rgb, RgbImage};
use tempfile::TempDir;

use crate::config::EngineConfig;
use crate::service::ImageService;
use crate::status::{NullStatusSink, StatusSink};
use crate::stores::{DefectStore, FsFrameStore, MemoryDefectStore};

pub(crate) struct FrameTree {
    pub temp: TempDir,
    pub config: EngineConfig,
}

/// Capture tree with one closed sequence (500) of 64x32 frames on both
/// surfaces, and separate disk-cache roots. Tile size defaults to the frame
/// height (32), giving a max level of 1.
pub(crate) fn frame_tree(frames: u32) -> FrameTree {
    let temp = TempDir::new().unwrap();
    let top = temp.path().join("frames-top");
    let bottom = temp.path().join("frames-bottom");
    for root in [&top, &bottom] {
        let dir = root.join("500").join("2D");
        fs::create_dir_all(&dir).unwrap();
        for i in 0..frames {
            let shade = 40 + (i as u8 % 8) * 25;
            let img = RgbImage::from_pixel(64, 32, Rgb([shade, shade, shade]));
            let mut out = std::io::Cursor::new(Vec::new());
            image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, 90)
                .encode_image(&img)
                .unwrap();
            fs::write(dir.join(format!("{i}.jpg")), out.into_inner()).unwrap();
        }
        fs::write(dir.join("complete.flag"), b"").unwrap();
    }
    let json = format!(
        r#"{{
            "images": {{
                "top_root": "{top}",
                "bottom_root": "{bottom}",
                "disk_cache_top_root": "{cache_top}",
                "disk_cache_bottom_root": "{cache_bottom}",
                "frame_width": 64,
                "frame_height": 32
            }},
            "cache": {{"disk_cache_enabled": true, "disk_precache_enabled": true}}
        }}"#,
        top = top.display(),
        bottom = bottom.display(),
        cache_top = temp.path().join("cache-top").display(),
        cache_bottom = temp.path().join("cache-bottom").display(),
    );
    let config = serde_json::from_str(&json).unwrap();
    FrameTree { temp, config }
}

pub(crate) struct Fixture {
    pub temp: TempDir,
    pub service: Arc<ImageService>,
    pub defects: Arc<MemoryDefectStore>,
}

pub(crate) fn service_fixture(frames: u32) -> Fixture {
    service_fixture_with(frames, Arc::new(NullStatusSink))
}

pub(crate) fn service_fixture_with(frames: u32, sink: Arc<dyn StatusSink>) -> Fixture {
    let tree = frame_tree(frames);
    let frame_store = Arc::new(FsFrameStore::new(&tree.config.images));
    let defects = Arc::new(MemoryDefectStore::new());
    let service = Arc::new(
        ImageService::new(
            tree.config,
            frame_store,
            Arc::clone(&defects) as Arc<dyn DefectStore>,
            sink,
        )
        .unwrap(),
    );
    Fixture {
        temp: tree.temp,
        service,
        defects,
    }
}
