use std::io;
use std::process::Stdio;

use async_trait::async_trait;
use log::debug;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

use crate::error::StreamError;

use super::frame::Frame;
use super::jpeg::JpegSplitter;
use super::{FrameSource, StreamOptions};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

const READ_CHUNK_BYTES: usize = 64 * 1024;

/// Latest output of the pump task. The watch channel holding it is the
/// depth-1 frame buffer.
#[derive(Debug, Clone)]
enum FrameSlot {
    Empty,
    Frame(Frame),
    Corrupt(String),
}

struct ActiveStream {
    child: Option<Child>,
    slot: watch::Receiver<FrameSlot>,
    pump: JoinHandle<Result<(), StreamError>>,
}

impl ActiveStream {
    fn start<R>(reader: R, child: Option<Child>, max_frame_bytes: usize) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (tx, rx) = watch::channel(FrameSlot::Empty);
        let pump = tokio::spawn(pump_frames(reader, tx, max_frame_bytes));
        Self {
            child,
            slot: rx,
            pump,
        }
    }

    async fn kill(&mut self) {
        if let Some(child) = self.child.as_mut() {
            if let Err(err) = child.start_kill() {
                debug!("ffmpeg already exited: {err}");
            }
            if let Err(err) = child.wait().await {
                debug!("failed to reap ffmpeg: {err}");
            }
        }
    }
}

/// Camera stream decoded by an `ffmpeg` child process emitting MJPEG on
/// stdout.
pub struct FfmpegStream {
    options: StreamOptions,
    active: Option<ActiveStream>,
    last_frame_at: Instant,
}

impl FfmpegStream {
    pub fn new(options: StreamOptions) -> Self {
        Self {
            options,
            active: None,
            last_frame_at: Instant::now(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.active.is_some()
    }

    /// Spawn ffmpeg against the configured address. No-op when already open.
    pub fn open(&mut self) -> Result<(), StreamError> {
        if self.active.is_some() {
            return Ok(());
        }

        let mut child = self.command().spawn().map_err(StreamError::Spawn)?;
        let stdout = child.stdout.take().ok_or_else(|| {
            StreamError::Spawn(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "ffmpeg stdout was not captured",
            ))
        })?;

        self.active = Some(ActiveStream::start(
            stdout,
            Some(child),
            self.options.max_frame_bytes,
        ));
        self.last_frame_at = Instant::now();
        log_info!("Camera stream opened: {}", self.options.url);
        Ok(())
    }

    fn command(&self) -> Command {
        let url = self.options.url.as_str();
        let mut cmd = Command::new(&self.options.ffmpeg_path);
        cmd.args(["-hide_banner", "-loglevel", "error"]);
        cmd.args(["-fflags", "nobuffer", "-flags", "low_delay"]);
        if url.starts_with("rtsp://") || url.starts_with("rtsps://") {
            cmd.args(["-rtsp_transport", "tcp"]);
        }
        cmd.args(["-i", url, "-an", "-f", "image2pipe", "-vcodec", "mjpeg", "-q:v", "3", "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        cmd
    }

    /// Tear down a handle whose pump has stopped and report why it stopped.
    async fn reap(&mut self) -> StreamError {
        let Some(mut active) = self.active.take() else {
            return StreamError::NotOpen;
        };
        active.kill().await;

        match active.pump.await {
            Ok(Err(err)) => err,
            Ok(Ok(())) => StreamError::Closed,
            Err(join_err) => StreamError::Io(io::Error::other(join_err)),
        }
    }

    #[cfg(test)]
    fn attached<R>(options: StreamOptions, reader: R) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let active = ActiveStream::start(reader, None, options.max_frame_bytes);
        Self {
            options,
            active: Some(active),
            last_frame_at: Instant::now(),
        }
    }
}

#[async_trait]
impl FrameSource for FfmpegStream {
    async fn read_frame(&mut self, wait: Duration) -> Result<Option<Frame>, StreamError> {
        let Some(active) = self.active.as_mut() else {
            return Err(StreamError::NotOpen);
        };

        match tokio::time::timeout(wait, active.slot.changed()).await {
            Err(_) => {
                let idle = self.last_frame_at.elapsed();
                if idle >= self.options.stall_timeout {
                    log_warn!("Camera stream stalled: no frame for {:?}", idle);
                    self.close().await;
                    return Err(StreamError::Stalled(idle));
                }
                Ok(None)
            }
            Ok(Err(_)) => Err(self.reap().await),
            Ok(Ok(())) => {
                let slot = active.slot.borrow_and_update().clone();
                self.last_frame_at = Instant::now();
                match slot {
                    FrameSlot::Frame(frame) => Ok(Some(frame)),
                    FrameSlot::Corrupt(reason) => Err(StreamError::Corrupt(reason)),
                    FrameSlot::Empty => Ok(None),
                }
            }
        }
    }

    async fn reopen(&mut self) -> Result<(), StreamError> {
        self.close().await;
        self.open()
    }

    async fn close(&mut self) {
        if let Some(mut active) = self.active.take() {
            active.kill().await;
            active.pump.abort();
            let _ = active.pump.await;
            log_info!("Camera stream closed");
        }
    }
}

/// Read MJPEG bytes until EOF, publishing each complete frame into the slot.
async fn pump_frames<R>(
    mut reader: R,
    tx: watch::Sender<FrameSlot>,
    max_frame_bytes: usize,
) -> Result<(), StreamError>
where
    R: AsyncRead + Unpin,
{
    let mut splitter = JpegSplitter::new(max_frame_bytes);
    let mut chunk = vec![0u8; READ_CHUNK_BYTES];
    let mut seq: u64 = 0;

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(StreamError::Closed);
        }

        for image in splitter.push(&chunk[..n]) {
            seq += 1;
            let slot = match image.and_then(|bytes| Frame::from_jpeg(bytes, seq)) {
                Ok(frame) => FrameSlot::Frame(frame),
                Err(StreamError::Corrupt(reason)) => FrameSlot::Corrupt(reason),
                Err(err) => FrameSlot::Corrupt(err.to_string()),
            };
            if tx.send(slot).is_err() {
                return Ok(());
            }
        }
    }
}
