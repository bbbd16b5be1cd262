pub mod capture;
pub mod error;
pub mod metrics;
pub mod models;
pub mod sensing;
pub mod settings;
pub mod storage;
pub mod stream;
pub mod utils;

use std::sync::Arc;

use anyhow::{Context, Result};
use log::{info, warn};
use tokio_util::sync::CancellationToken;

use capture::CaptureController;
use sensing::{SerialLineSource, TriggerMatcher};
use settings::Settings;
use storage::{open_event_log, EventSink, SnapshotWriter};
use stream::FfmpegStream;

/// Wire the serial port, the camera and the on-disk stores together and run
/// the capture controller until a stop signal arrives.
///
/// Returns an error when the settings are unusable, a store cannot be
/// prepared, or the serial device fails.
pub async fn run(settings: Settings) -> Result<()> {
    settings.validate().context("invalid settings")?;

    info!(
        "loracam starting: serial={} @ {} baud, stream={}, images={}, log={} ({:?})",
        settings.serial_port,
        settings.baud_rate,
        settings.stream_url,
        settings.image_dir.display(),
        settings.event_log.display(),
        settings.log_format
    );

    let snapshots = SnapshotWriter::new(&settings.image_dir, &settings.image_prefix);
    snapshots.initialize().with_context(|| {
        format!("failed to prepare image directory {}", settings.image_dir.display())
    })?;

    let events: Arc<dyn EventSink> = open_event_log(settings.log_format, &settings.event_log).into();
    events.initialize().with_context(|| {
        format!("failed to prepare event log {}", settings.event_log.display())
    })?;
    match events.load() {
        Ok(existing) => info!("Event log holds {} event(s)", existing.len()),
        Err(err) => warn!("Could not count existing events: {err}"),
    }

    let matcher = TriggerMatcher::new(&settings.trigger_markers, &settings.trigger_tags);
    let lines = SerialLineSource::open(&settings.serial_port, settings.baud_rate, matcher)
        .context("serial sensor input unavailable")?;

    let mut frames = FfmpegStream::new(settings.stream_options());
    if let Err(err) = frames.open() {
        warn!("Camera stream not available yet ({err}); will keep retrying");
    }

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(cancel.clone()));

    let controller = CaptureController::new(
        lines,
        frames,
        Arc::new(snapshots),
        events,
        settings.controller_options(),
    );

    let stats = controller
        .run(cancel)
        .await
        .context("sensor line source failed")?;

    info!("loracam stopped ({} capture(s))", stats.captures);
    Ok(())
}

async fn shutdown_on_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
                    _ = term.recv() => info!("SIGTERM received"),
                }
            }
            Err(err) => {
                warn!("Cannot listen for SIGTERM ({err}); only Ctrl-C will stop the controller");
                let _ = tokio::signal::ctrl_c().await;
                info!("SIGINT received");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Ctrl-C received");
    }

    cancel.cancel();
}
