use std::io;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use log::{info, warn};

use crate::error::SnapshotError;
use crate::stream::Frame;

use super::atomic;

pub trait SnapshotSink: Send + Sync + 'static {
    /// Persist `frame` and return the file name it was written under. A name
    /// is only returned once the file is completely on disk.
    fn write(&self, frame: &Frame, captured_at: DateTime<Utc>) -> Result<String, SnapshotError>;
}

/// Writes snapshots into a flat image directory as
/// `<prefix>_<YYYYMMDD>_<HHMMSS>_<mmm>.jpg`, adding `_1`, `_2`, ... when
/// the name is taken. Files are write-once.
#[derive(Debug, Clone)]
pub struct SnapshotWriter {
    dir: PathBuf,
    prefix: String,
}

impl SnapshotWriter {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
        }
    }

    /// Create the image directory and clear temp files from an interrupted
    /// earlier run.
    pub fn initialize(&self) -> io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let removed = atomic::sweep_stale(&self.dir)?;
        if removed > 0 {
            warn!(
                "Removed {} unfinished snapshot file(s) from {}",
                removed,
                self.dir.display()
            );
        }
        Ok(())
    }

    pub fn file_name(&self, captured_at: DateTime<Utc>, attempt: u32) -> String {
        let stamp = captured_at.format("%Y%m%d_%H%M%S_%3f");
        match attempt {
            0 => format!("{}_{}.jpg", self.prefix, stamp),
            n => format!("{}_{}_{}.jpg", self.prefix, stamp, n),
        }
    }
}

impl SnapshotSink for SnapshotWriter {
    fn write(&self, frame: &Frame, captured_at: DateTime<Utc>) -> Result<String, SnapshotError> {
        if frame.is_empty() {
            return Err(SnapshotError::EmptyFrame);
        }

        let path = atomic::write_new(&self.dir, &frame.data, |attempt| {
            self.file_name(captured_at, attempt)
        })
        .map_err(|source| SnapshotError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        info!(
            "Snapshot written: {} ({} bytes, {}x{})",
            name,
            frame.len(),
            frame.width,
            frame.height
        );
        Ok(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::frame::test_support::jpeg_bytes;
    use chrono::TimeZone;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn frame() -> Frame {
        Frame::from_jpeg(jpeg_bytes(8, 8), 1).unwrap()
    }

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 2).unwrap() + chrono::Duration::milliseconds(41)
    }

    #[test]
    fn names_follow_capture_time() {
        let writer = SnapshotWriter::new("/unused", "event");
        assert_eq!(writer.file_name(at(), 0), "event_20240309_070502_041.jpg");
        assert_eq!(writer.file_name(at(), 2), "event_20240309_070502_041_2.jpg");
    }

    #[test]
    fn writes_the_frame_bytes_under_the_returned_name() {
        let dir = tempdir().unwrap();
        let writer = SnapshotWriter::new(dir.path(), "event");
        let frame = frame();

        let name = writer.write(&frame, at()).unwrap();
        assert_eq!(name, "event_20240309_070502_041.jpg");
        assert_eq!(std::fs::read(dir.path().join(&name)).unwrap(), *frame.data);
    }

    #[test]
    fn same_millisecond_captures_get_distinct_names() {
        let dir = tempdir().unwrap();
        let writer = SnapshotWriter::new(dir.path(), "event");

        let first = writer.write(&frame(), at()).unwrap();
        let second = writer.write(&frame(), at()).unwrap();

        assert_ne!(first, second);
        assert_eq!(second, "event_20240309_070502_041_1.jpg");
        assert!(dir.path().join(&first).exists());
        assert!(dir.path().join(&second).exists());
    }

    #[test]
    fn empty_frame_is_rejected_without_a_file() {
        let dir = tempdir().unwrap();
        let writer = SnapshotWriter::new(dir.path(), "event");
        let empty = Frame {
            data: Arc::new(Vec::new()),
            width: 0,
            height: 0,
            seq: 1,
        };

        assert!(matches!(writer.write(&empty, at()), Err(SnapshotError::EmptyFrame)));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn unwritable_directory_is_an_error() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("images");
        std::fs::write(&blocker, b"not a directory").unwrap();

        let writer = SnapshotWriter::new(&blocker, "event");
        assert!(matches!(writer.write(&frame(), at()), Err(SnapshotError::Io { .. })));
    }
}
