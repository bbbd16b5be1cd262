use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;

use loracam::settings::{LogFormat, Settings};

/// Capture a camera snapshot whenever the LoRa sensor network reports a
/// trigger, and record each capture in the event log.
#[derive(Debug, Parser)]
#[command(name = "loracam", version, about)]
struct Cli {
    /// JSON settings file.
    #[arg(short, long, env = "LORACAM_CONFIG", default_value = "loracam.json")]
    config: PathBuf,

    /// Serial device of the radio receiver.
    #[arg(long)]
    serial_port: Option<String>,

    #[arg(long)]
    baud_rate: Option<u32>,

    /// Camera stream address passed to ffmpeg.
    #[arg(long)]
    stream_url: Option<String>,

    #[arg(long)]
    sensor_id: Option<String>,

    #[arg(long)]
    image_dir: Option<PathBuf>,

    #[arg(long)]
    event_log: Option<PathBuf>,

    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,

    /// Frames to read after a trigger before the snapshot is taken.
    #[arg(long)]
    settle_frames: Option<u32>,

    #[arg(long)]
    disarm_timeout_ms: Option<u64>,

    /// Print the resolved settings as JSON and exit.
    #[arg(long)]
    print_settings: bool,
}

impl Cli {
    fn resolve(&self) -> Result<Settings> {
        let mut settings = Settings::load(&self.config)?;
        settings.apply_env()?;

        if let Some(value) = &self.serial_port {
            settings.serial_port = value.clone();
        }
        if let Some(value) = self.baud_rate {
            settings.baud_rate = value;
        }
        if let Some(value) = &self.stream_url {
            settings.stream_url = value.clone();
        }
        if let Some(value) = &self.sensor_id {
            settings.sensor_id = value.clone();
        }
        if let Some(value) = &self.image_dir {
            settings.image_dir = value.clone();
        }
        if let Some(value) = &self.event_log {
            settings.event_log = value.clone();
        }
        if let Some(value) = self.log_format {
            settings.log_format = value;
        }
        if let Some(value) = self.settle_frames {
            settings.settle_frames = value;
        }
        if let Some(value) = self.disarm_timeout_ms {
            settings.disarm_timeout_ms = value;
        }
        Ok(settings)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    loracam::utils::logging::init();

    let cli = Cli::parse();
    let settings = match cli.resolve() {
        Ok(settings) => settings,
        Err(err) => {
            log::error!("{err:#}");
            return ExitCode::FAILURE;
        }
    };

    if cli.print_settings {
        match serde_json::to_string_pretty(&settings) {
            Ok(json) => {
                println!("{json}");
                return ExitCode::SUCCESS;
            }
            Err(err) => {
                log::error!("failed to encode settings: {err}");
                return ExitCode::FAILURE;
            }
        }
    }

    match loracam::run(settings).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}
