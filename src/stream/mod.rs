//! Camera stream handle.
//!
//! Frames are served freshest-first: the handle holds at most one unread
//! frame, and a newer frame replaces an older unread one.

pub mod ffmpeg;
pub mod frame;
pub mod jpeg;

use async_trait::async_trait;
use tokio::time::Duration;

use crate::error::StreamError;

pub use ffmpeg::FfmpegStream;
pub use frame::Frame;

#[async_trait]
pub trait FrameSource: Send {
    /// Wait up to `wait` for a frame that has not been returned before.
    ///
    /// `Ok(None)` means no fresh frame arrived in time. A broken stream is
    /// always an `Err`, never `Ok(None)`.
    async fn read_frame(&mut self, wait: Duration) -> Result<Option<Frame>, StreamError>;

    /// Close the current handle and open a new one right away. Pacing of
    /// attempts is left to the caller.
    async fn reopen(&mut self) -> Result<(), StreamError>;

    /// Release the stream. Safe to call more than once.
    async fn close(&mut self);
}

#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub ffmpeg_path: String,
    pub url: String,
    pub stall_timeout: Duration,
    pub max_frame_bytes: usize,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".into(),
            url: String::new(),
            stall_timeout: Duration::from_secs(5),
            max_frame_bytes: 8 * 1024 * 1024,
        }
    }
}
