use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::capture::{CaptureConfig, ControllerOptions};
use crate::stream::StreamOptions;

/// On-disk format of the event log.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Single JSON array, replaced atomically on every append.
    #[default]
    Json,
    /// One JSON record per line, appended in place.
    Jsonl,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub serial_port: String,
    pub baud_rate: u32,
    pub stream_url: String,
    pub ffmpeg_path: String,
    pub sensor_id: String,
    pub image_dir: PathBuf,
    pub event_log: PathBuf,
    pub log_format: LogFormat,
    pub image_prefix: String,
    pub settle_frames: u32,
    pub disarm_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub reconnect_delay_ms: u64,
    pub stall_timeout_ms: u64,
    pub trigger_markers: Vec<String>,
    pub trigger_tags: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            serial_port: "/dev/ttyUSB0".into(),
            baud_rate: 115_200,
            stream_url: "rtsp://127.0.0.1:554/stream".into(),
            ffmpeg_path: "ffmpeg".into(),
            sensor_id: "lora-node-1".into(),
            image_dir: PathBuf::from("static/images"),
            event_log: PathBuf::from("data/logs.json"),
            log_format: LogFormat::Json,
            image_prefix: "event".into(),
            settle_frames: 3,
            disarm_timeout_ms: 10_000,
            poll_interval_ms: 100,
            reconnect_delay_ms: 1_000,
            stall_timeout_ms: 5_000,
            trigger_markers: vec!["IR".into(), "TRIGGER".into()],
            trigger_tags: vec!["motion".into(), "intrusion".into(), "alarm".into()],
        }
    }
}

impl Settings {
    /// Load settings from a JSON file. Keys missing from the file keep their
    /// defaults; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings from {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse settings in {}", path.display()))
    }

    /// Apply `LORACAM_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("LORACAM_SERIAL_PORT") {
            self.serial_port = value;
        }
        if let Some(value) = lookup("LORACAM_BAUD_RATE") {
            self.baud_rate = value
                .trim()
                .parse()
                .with_context(|| format!("LORACAM_BAUD_RATE is not a number: {value:?}"))?;
        }
        if let Some(value) = lookup("LORACAM_STREAM_URL") {
            self.stream_url = value;
        }
        if let Some(value) = lookup("LORACAM_SENSOR_ID") {
            self.sensor_id = value;
        }
        if let Some(value) = lookup("LORACAM_IMAGE_DIR") {
            self.image_dir = PathBuf::from(value);
        }
        if let Some(value) = lookup("LORACAM_EVENT_LOG") {
            self.event_log = PathBuf::from(value);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.settle_frames == 0 {
            bail!("settle_frames must be at least 1");
        }
        if self.baud_rate == 0 {
            bail!("baud_rate must be greater than zero");
        }
        if self.poll_interval_ms == 0 {
            bail!("poll_interval_ms must be greater than zero");
        }
        if self.poll_interval_ms >= self.disarm_timeout_ms {
            bail!(
                "poll_interval_ms ({}) must be shorter than disarm_timeout_ms ({})",
                self.poll_interval_ms,
                self.disarm_timeout_ms
            );
        }
        let has_marker = self.trigger_markers.iter().any(|m| !m.trim().is_empty());
        let has_tag = self.trigger_tags.iter().any(|t| !t.trim().is_empty());
        if !has_marker && !has_tag {
            bail!("at least one trigger marker or trigger tag is required");
        }
        if self.image_prefix.is_empty() || self.image_prefix.contains(['/', '\\']) {
            bail!("image_prefix must be a plain, non-empty file name prefix");
        }
        Ok(())
    }

    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            settle_frames: self.settle_frames,
            disarm_timeout: Duration::from_millis(self.disarm_timeout_ms),
        }
    }

    pub fn controller_options(&self) -> ControllerOptions {
        ControllerOptions {
            capture: self.capture_config(),
            sensor_id: self.sensor_id.clone(),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
        }
    }

    pub fn stream_options(&self) -> StreamOptions {
        StreamOptions {
            ffmpeg_path: self.ffmpeg_path.clone(),
            url: self.stream_url.clone(),
            stall_timeout: Duration::from_millis(self.stall_timeout_ms),
            ..StreamOptions::default()
        }
    }
}
