use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::time::{Duration, Instant};
use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, SerialStream, StopBits};

use crate::error::SourceError;

use super::trigger::{TriggerMatcher, TriggerSignal};
use super::LineSource;

/// Longest accepted sensor line. Anything longer is line noise.
pub const MAX_LINE_BYTES: usize = 4 * 1024;

/// Line source for the serial radio receiver.
pub type SerialLineSource = LineReader<SerialStream>;

/// Reads newline-terminated sensor lines from any async byte stream.
///
/// Partially read lines survive a timed-out call in `pending`, so a line
/// split across two polls is still delivered whole. A line that grows past
/// [`MAX_LINE_BYTES`] is dropped up to its newline.
pub struct LineReader<R> {
    reader: BufReader<R>,
    pending: Vec<u8>,
    discarding: bool,
    matcher: TriggerMatcher,
}

impl<R> LineReader<R>
where
    R: AsyncRead + Unpin + Send,
{
    pub fn new(inner: R, matcher: TriggerMatcher) -> Self {
        Self {
            reader: BufReader::new(inner),
            pending: Vec::with_capacity(128),
            discarding: false,
            matcher,
        }
    }

    fn take_line(&mut self) -> String {
        let line = String::from_utf8_lossy(&self.pending).trim().to_string();
        self.pending.clear();
        line
    }
}

impl LineReader<SerialStream> {
    /// Open the serial device (8N1, no flow control). Must be called from
    /// within the tokio runtime.
    pub fn open(path: &str, baud_rate: u32, matcher: TriggerMatcher) -> Result<Self, SourceError> {
        let port = tokio_serial::new(path, baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .open_native_async()
            .map_err(|source| SourceError::Open {
                path: path.to_string(),
                source,
            })?;

        info!("Opened serial device {} at {} baud", path, baud_rate);
        Ok(Self::new(port, matcher))
    }
}

#[async_trait]
impl<R> LineSource for LineReader<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn next_line(&mut self, wait: Duration) -> Result<Option<TriggerSignal>, SourceError> {
        let deadline = Instant::now() + wait;

        loop {
            let room = (MAX_LINE_BYTES - self.pending.len()) as u64;
            let read = tokio::time::timeout_at(
                deadline,
                (&mut self.reader)
                    .take(room)
                    .read_until(b'\n', &mut self.pending),
            )
            .await;

            let bytes_read = match read {
                Err(_) => return Ok(None),
                Ok(result) => result?,
            };

            if bytes_read == 0 && self.pending.is_empty() {
                return Err(SourceError::Disconnected);
            }

            let complete = self.pending.last() == Some(&b'\n');
            if !complete && self.pending.len() >= MAX_LINE_BYTES {
                if !self.discarding {
                    warn!(
                        "Dropping sensor line longer than {} bytes (wrong baud rate?)",
                        MAX_LINE_BYTES
                    );
                }
                self.pending.clear();
                self.discarding = true;
                continue;
            }
            if self.discarding {
                // Tail of an overlong line.
                self.pending.clear();
                self.discarding = !complete;
                continue;
            }

            let line = self.take_line();
            if line.is_empty() {
                continue;
            }

            let signal = self.matcher.classify(line, Instant::now());
            if !signal.is_trigger {
                debug!("Ignoring non-trigger sensor line: {:?}", signal.raw_text);
            }
            return Ok(Some(signal));
        }
    }
}
