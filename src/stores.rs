//! Frame and defect lookup behind trait seams, so the engine can be driven
//! from a real capture tree or from fixtures.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use parking_lot::RwLock;
use tracing::debug;

use crate::config::ImageSettings;
use crate::error::{TileError, TileResult};
use crate::mosaic::PixelBox;

/// Which side of the strip a camera bank images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Surface {
    Top,
    Bottom,
}

impl Surface {
    pub fn parse(value: &str) -> TileResult<Self> {
        match value {
            "top" => Ok(Self::Top),
            "bottom" => Ok(Self::Bottom),
            other => Err(TileError::BadRequest(format!("unknown surface: {other}"))),
        }
    }
}

impl fmt::Display for Surface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Top => write!(f, "top"),
            Self::Bottom => write!(f, "bottom"),
        }
    }
}

/// Source of captured frames for a surface.
pub trait FrameStore: Send + Sync {
    /// Frame file paths for one sequence and view, ordered by the numeric
    /// frame index encoded in the file stem.
    fn list_frame_paths(
        &self,
        surface: Surface,
        seq_no: i64,
        view: &str,
    ) -> TileResult<Vec<PathBuf>>;

    fn read_frame_bytes(&self, path: &Path) -> TileResult<Bytes>;

    /// Whether capture for the sequence has finished. Open sequences are
    /// still growing and must not be bulk-precached.
    fn is_seq_closed(&self, surface: Surface, seq_no: i64, view: &str) -> bool;

    /// Sequence numbers present under the surface root, newest first.
    fn list_seq_numbers(&self, surface: Surface) -> Vec<i64>;
}

/// Frame store over the on-disk capture layout:
/// `{root}/{seq}/{view}/{frame_index}.{ext}` with a `complete.flag` marker
/// written beside the frames once capture closes.
pub struct FsFrameStore {
    top_root: PathBuf,
    bottom_root: PathBuf,
    ext: String,
}

impl FsFrameStore {
    pub fn new(images: &ImageSettings) -> Self {
        Self {
            top_root: images.top_root.clone(),
            bottom_root: images.bottom_root.clone(),
            ext: images.file_extension.clone(),
        }
    }

    pub fn surface_root(&self, surface: Surface) -> &Path {
        match surface {
            Surface::Top => &self.top_root,
            Surface::Bottom => &self.bottom_root,
        }
    }

    fn seq_dir(&self, surface: Surface, seq_no: i64, view: &str) -> PathBuf {
        self.surface_root(surface).join(seq_no.to_string()).join(view)
    }
}

impl FrameStore for FsFrameStore {
    fn list_frame_paths(
        &self,
        surface: Surface,
        seq_no: i64,
        view: &str,
    ) -> TileResult<Vec<PathBuf>> {
        let dir = self.seq_dir(surface, seq_no, view);
        let entries = fs::read_dir(&dir).map_err(|_| {
            TileError::NotFound(format!("sequence {seq_no} ({surface}/{view}) not found"))
        })?;
        // Sort by the numeric frame index in the stem; non-numeric stems
        // (markers, strays) are skipped.
        let mut frames: Vec<(u64, PathBuf)> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| e == self.ext)
            })
            .filter_map(|path| {
                let index = path.file_stem()?.to_str()?.parse::<u64>().ok()?;
                Some((index, path))
            })
            .collect();
        frames.sort_by_key(|(index, _)| *index);
        if frames.is_empty() {
            return Err(TileError::NotFound(format!(
                "sequence {seq_no} ({surface}/{view}) has no frames"
            )));
        }
        Ok(frames.into_iter().map(|(_, path)| path).collect())
    }

    fn read_frame_bytes(&self, path: &Path) -> TileResult<Bytes> {
        match fs::read(path) {
            Ok(data) => Ok(Bytes::from(data)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(TileError::NotFound(format!("frame {}", path.display())))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn is_seq_closed(&self, surface: Surface, seq_no: i64, view: &str) -> bool {
        self.seq_dir(surface, seq_no, view).join("complete.flag").exists()
    }

    fn list_seq_numbers(&self, surface: Surface) -> Vec<i64> {
        let root = self.surface_root(surface);
        let Ok(entries) = fs::read_dir(root) else {
            debug!(root = %root.display(), "surface root unreadable");
            return Vec::new();
        };
        let mut seqs: Vec<i64> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .filter_map(|entry| entry.file_name().to_str()?.parse::<i64>().ok())
            .collect();
        seqs.sort_unstable_by(|a, b| b.cmp(a));
        seqs
    }
}

/// One known defect, located by its bounding box on a specific frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefectRecord {
    pub seq_no: i64,
    pub image_index: u32,
    pub bbox: PixelBox,
    pub camera_id: String,
}

/// Lookup of defect records by surface and defect id.
pub trait DefectStore: Send + Sync {
    fn find_defect(&self, surface: Surface, defect_id: i64) -> Option<DefectRecord>;
}

/// In-memory defect table, loaded by the host at startup and refreshed as
/// inspection results arrive.
#[derive(Default)]
pub struct MemoryDefectStore {
    records: RwLock<HashMap<(Surface, i64), DefectRecord>>,
}

impl MemoryDefectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, surface: Surface, defect_id: i64, record: DefectRecord) {
        self.records.write().insert((surface, defect_id), record);
    }
}

impl DefectStore for MemoryDefectStore {
    fn find_defect(&self, surface: Surface, defect_id: i64) -> Option<DefectRecord> {
        self.records.read().get(&(surface, defect_id)).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn settings(root: &Path) -> ImageSettings {
        let json = format!(
            r#"{{"top_root": "{root}", "bottom_root": "{root}"}}"#,
            root = root.display(),
        );
        serde_json::from_str(&json).unwrap()
    }

    fn write_frames(root: &Path, seq: i64, view: &str, stems: &[&str]) {
        let dir = root.join(seq.to_string()).join(view);
        fs::create_dir_all(&dir).unwrap();
        for stem in stems {
            fs::write(dir.join(format!("{stem}.jpg")), b"x").unwrap();
        }
    }

    #[test]
    fn test_frames_sorted_by_numeric_stem() {
        let temp = TempDir::new().unwrap();
        write_frames(temp.path(), 500, "2D", &["10", "2", "1", "notaframe"]);
        let store = FsFrameStore::new(&settings(temp.path()));
        let paths = store.list_frame_paths(Surface::Top, 500, "2D").unwrap();
        let stems: Vec<_> = paths
            .iter()
            .map(|p| p.file_stem().unwrap().to_str().unwrap().to_string())
            .collect();
        // Numeric order, not lexicographic; non-numeric stems dropped.
        assert_eq!(stems, vec!["1", "2", "10"]);
    }

    #[test]
    fn test_missing_sequence_is_not_found() {
        let temp = TempDir::new().unwrap();
        let store = FsFrameStore::new(&settings(temp.path()));
        let err = store.list_frame_paths(Surface::Top, 999, "2D").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_closed_marker() {
        let temp = TempDir::new().unwrap();
        write_frames(temp.path(), 500, "2D", &["1"]);
        let store = FsFrameStore::new(&settings(temp.path()));
        assert!(!store.is_seq_closed(Surface::Top, 500, "2D"));
        fs::write(
            temp.path().join("500").join("2D").join("complete.flag"),
            b"",
        )
        .unwrap();
        assert!(store.is_seq_closed(Surface::Top, 500, "2D"));
    }

    #[test]
    fn test_seq_numbers_newest_first() {
        let temp = TempDir::new().unwrap();
        for seq in [3, 11, 7] {
            write_frames(temp.path(), seq, "2D", &["1"]);
        }
        fs::create_dir_all(temp.path().join("junk")).unwrap();
        let store = FsFrameStore::new(&settings(temp.path()));
        assert_eq!(store.list_seq_numbers(Surface::Top), vec![11, 7, 3]);
    }

    #[test]
    fn test_memory_defect_store_lookup() {
        let store = MemoryDefectStore::new();
        let record = DefectRecord {
            seq_no: 500,
            image_index: 3,
            bbox: PixelBox {
                left: 10,
                top: 20,
                right: 74,
                bottom: 68,
            },
            camera_id: "cam-2".into(),
        };
        store.insert(Surface::Top, 42, record.clone());
        assert_eq!(store.find_defect(Surface::Top, 42), Some(record));
        assert!(store.find_defect(Surface::Bottom, 42).is_none());
        assert!(store.find_defect(Surface::Top, 43).is_none());
    }
}
