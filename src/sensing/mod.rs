//! Sensor line input: reads text lines from the radio receiver and
//! classifies each one as a trigger or noise.

pub mod serial;
pub mod trigger;

use async_trait::async_trait;
use tokio::time::Duration;

use crate::error::SourceError;

pub use serial::{LineReader, SerialLineSource};
pub use trigger::{TriggerMatcher, TriggerSignal};

#[async_trait]
pub trait LineSource: Send {
    /// Wait up to `wait` for the next non-blank line.
    ///
    /// `Ok(None)` is a timeout. Any `Err` means the device is gone and the
    /// run has to stop.
    async fn next_line(&mut self, wait: Duration) -> Result<Option<TriggerSignal>, SourceError>;
}
