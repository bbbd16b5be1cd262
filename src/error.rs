//! Error types for the component seams.
//!
//! Each seam gets its own enum so the controller can tell the failure classes
//! apart: a [`SourceError`] ends the run, a [`StreamError`] is retried, a
//! [`SnapshotError`] degrades the event, and a [`StoreError`] is logged.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Serial sensor input failures. Always fatal to the run.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to open serial device {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: tokio_serial::Error,
    },

    #[error("serial device disconnected")]
    Disconnected,

    #[error("serial read failed: {0}")]
    Io(#[from] io::Error),
}

/// Video stream failures. Never conflated with "no frame yet".
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream is not open")]
    NotOpen,

    #[error("failed to spawn frame reader: {0}")]
    Spawn(#[source] io::Error),

    #[error("stream closed by remote end")]
    Closed,

    #[error("stream read failed: {0}")]
    Io(#[from] io::Error),

    #[error("no frame received for {0:?}")]
    Stalled(Duration),

    #[error("corrupt frame: {0}")]
    Corrupt(String),
}

impl StreamError {
    /// Whether the handle has to be closed and reopened before reading again.
    pub fn needs_reopen(&self) -> bool {
        !matches!(self, StreamError::Corrupt(_))
    }
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("refusing to write an empty frame")]
    EmptyFrame,

    #[error("failed to write snapshot into {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("snapshot worker failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("event log io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to encode event log: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("event log worker failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corrupt_frames_do_not_force_a_reconnect() {
        assert!(!StreamError::Corrupt("bad huffman table".into()).needs_reopen());
        assert!(StreamError::Closed.needs_reopen());
        assert!(StreamError::NotOpen.needs_reopen());
        assert!(StreamError::Stalled(Duration::from_secs(5)).needs_reopen());
    }
}
