use std::sync::Arc;

use chrono::Utc;
use log::debug;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::{SnapshotError, SourceError, StoreError, StreamError};
use crate::metrics::ControllerStats;
use crate::models::Event;
use crate::sensing::{LineSource, TriggerSignal};
use crate::storage::{EventSink, SnapshotSink};
use crate::stream::{Frame, FrameSource};

use super::state::{CaptureConfig, CaptureState, FrameDecision, TriggerOutcome};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info, log_warn};

#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub capture: CaptureConfig,
    pub sensor_id: String,
    /// Longest a single poll of either input may block.
    pub poll_interval: Duration,
    /// Minimum gap between a stream failure and the next reopen attempt.
    pub reconnect_delay: Duration,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            capture: CaptureConfig::default(),
            sensor_id: "lora-node-1".into(),
            poll_interval: Duration::from_millis(100),
            reconnect_delay: Duration::from_secs(1),
        }
    }
}

/// Drives the capture state machine from the sensor lines and the camera
/// frames, on a single task.
pub struct CaptureController<L, F> {
    lines: L,
    frames: F,
    snapshots: Arc<dyn SnapshotSink>,
    events: Arc<dyn EventSink>,
    options: ControllerOptions,
    stats: ControllerStats,
    failing_since: Option<Instant>,
    reopen_at: Option<Instant>,
    cancel: CancellationToken,
}

impl<L, F> CaptureController<L, F>
where
    L: LineSource,
    F: FrameSource,
{
    pub fn new(
        lines: L,
        frames: F,
        snapshots: Arc<dyn SnapshotSink>,
        events: Arc<dyn EventSink>,
        options: ControllerOptions,
    ) -> Self {
        Self {
            lines,
            frames,
            snapshots,
            events,
            options,
            stats: ControllerStats::default(),
            failing_since: None,
            reopen_at: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn stats(&self) -> &ControllerStats {
        &self.stats
    }

    /// Run until `cancel` fires or the sensor line source fails.
    ///
    /// Cancellation interrupts the input polls only; a capture that has
    /// started always finishes writing its event. The frame source is closed
    /// on both paths.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<ControllerStats, SourceError> {
        self.cancel = cancel;
        let mut state = CaptureState::Idle;
        log_info!(
            "Capture controller running (settle_frames={}, disarm_timeout={:?}, poll={:?})",
            self.options.capture.settle_frames,
            self.options.capture.disarm_timeout,
            self.options.poll_interval
        );

        let outcome = loop {
            if self.cancel.is_cancelled() {
                log_info!("Capture controller shutting down");
                break Ok(());
            }
            if let Err(err) = self.step(&mut state).await {
                log_error!("Sensor input failed: {err}");
                break Err(err);
            }
        };

        if let Some(session) = state.session() {
            log_info!(
                "Dropping armed session {} on shutdown (captured: {})",
                session.id,
                session.snapshot_taken
            );
        }
        self.frames.close().await;
        log_info!("Controller stats: {}", self.stats.summary());

        outcome.map(|()| self.stats)
    }

    /// One scheduling round: poll the sensor line, check the disarm window,
    /// then poll the camera while armed.
    ///
    /// No wait inside a step outlasts the disarm deadline, and a pending
    /// reconnect never blocks the sensor line.
    pub async fn step(&mut self, state: &mut CaptureState) -> Result<(), SourceError> {
        let cancel = self.cancel.clone();

        let wait = self.poll_budget(state, Instant::now());
        let line = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            line = self.lines.next_line(wait) => line?,
        };
        if let Some(signal) = line {
            self.apply_signal(state, &signal);
        }
        self.expire(state, Instant::now());

        if !self.stream_ready(Instant::now()).await {
            return Ok(());
        }

        if !state.is_armed() {
            // Keep the single frame slot fresh while idle.
            match self.frames.read_frame(Duration::ZERO).await {
                Ok(Some(_)) => self.mark_stream_healthy(),
                Ok(None) => {}
                Err(err) => self.recover_stream(err).await,
            }
            return Ok(());
        }

        let wait = self.poll_budget(state, Instant::now());
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            read = self.frames.read_frame(wait) => read,
        };
        match read {
            Ok(Some(frame)) => {
                self.mark_stream_healthy();
                self.apply_frame(state, frame).await;
            }
            Ok(None) => {}
            Err(err) => self.recover_stream(err).await,
        }
        self.expire(state, Instant::now());
        Ok(())
    }

    /// Attempt a due reopen. `false` while the stream is down and the next
    /// attempt is not yet due, or when the attempt failed.
    async fn stream_ready(&mut self, now: Instant) -> bool {
        let Some(due) = self.reopen_at else {
            return true;
        };
        if now < due {
            return false;
        }

        self.reopen_at = None;
        self.stats.reconnects += 1;
        match self.frames.reopen().await {
            Ok(()) => true,
            Err(err) => {
                self.stats.stream_failures += 1;
                debug!("Camera stream reopen failed: {err}");
                self.reopen_at = Some(Instant::now() + self.options.reconnect_delay);
                false
            }
        }
    }

    /// Poll interval, cut short so the disarm deadline is never overshot.
    fn poll_budget(&self, state: &CaptureState, now: Instant) -> Duration {
        match state.disarm_deadline(&self.options.capture) {
            Some(deadline) => self
                .options
                .poll_interval
                .min(deadline.saturating_duration_since(now)),
            None => self.options.poll_interval,
        }
    }

    fn apply_signal(&mut self, state: &mut CaptureState, signal: &TriggerSignal) {
        self.stats.lines_read += 1;
        if !signal.is_trigger {
            self.stats.noise_lines += 1;
            return;
        }
        self.stats.triggers += 1;

        match state.on_signal(signal) {
            TriggerOutcome::Armed => {
                self.stats.sessions_armed += 1;
                if let Some(session) = state.session() {
                    log_info!("Armed session {} on trigger {:?}", session.id, signal.raw_text);
                }
            }
            TriggerOutcome::Extended => {
                self.stats.retriggers += 1;
                if let Some(session) = state.session() {
                    debug!(
                        "Session {} re-triggered ({} triggers, {} frames seen)",
                        session.id, session.trigger_count, session.frames_seen_since_arm
                    );
                }
            }
            TriggerOutcome::Ignored => {}
        }
    }

    async fn apply_frame(&mut self, state: &mut CaptureState, frame: Frame) {
        match state.on_frame(&self.options.capture) {
            FrameDecision::Capture => {
                self.stats.frames_counted += 1;
                self.capture(state, frame).await;
            }
            FrameDecision::Settling { seen, needed } => {
                self.stats.frames_counted += 1;
                debug!("Settling frame {}/{} (seq {})", seen, needed, frame.seq);
            }
            FrameDecision::AlreadyCaptured => {
                self.stats.frames_counted += 1;
            }
            FrameDecision::Idle => {}
        }
    }

    /// Write the snapshot, then the event that references it.
    async fn capture(&mut self, state: &mut CaptureState, frame: Frame) {
        let Some(session) = state.session() else {
            return;
        };
        let session_id = session.id;
        let event_type = session.event_type.clone();
        let captured_at = Utc::now();

        let snapshots = Arc::clone(&self.snapshots);
        let written = tokio::task::spawn_blocking(move || snapshots.write(&frame, captured_at))
            .await
            .unwrap_or_else(|join_err| Err(SnapshotError::from(join_err)));

        let event = match written {
            Ok(filename) => {
                Event::triggered(captured_at, &self.options.sensor_id, event_type, filename)
            }
            Err(err) => {
                log_error!("Snapshot for session {} failed: {err}", session_id);
                Event::capture_failed(captured_at, &self.options.sensor_id, event_type)
            }
        };
        let status = event.status;
        let image = event.image_filename.clone();

        let events = Arc::clone(&self.events);
        let stored = tokio::task::spawn_blocking(move || events.append(&event))
            .await
            .unwrap_or_else(|join_err| Err(StoreError::from(join_err)));

        state.mark_captured();

        match stored {
            Ok(()) => {
                match image {
                    Some(_) => self.stats.captures += 1,
                    None => self.stats.capture_failures += 1,
                }
                log_info!(
                    "Session {} recorded event: status={} image={}",
                    session_id,
                    status.as_str(),
                    image.as_deref().unwrap_or("none")
                );
            }
            Err(err) => {
                self.stats.store_failures += 1;
                log_error!("Failed to record event for session {}: {err}", session_id);
            }
        }
        log_info!("Controller stats: {}", self.stats.summary());
    }

    fn expire(&mut self, state: &mut CaptureState, now: Instant) {
        let Some(session) = state.check_timeout(now, &self.options.capture) else {
            return;
        };

        let armed_for = now.saturating_duration_since(session.armed_at);
        let armed_wall = session.armed_wall.format("%H:%M:%S%.3f");
        if session.snapshot_taken {
            log_info!(
                "Disarmed session {} (armed {} UTC) after {:?}",
                session.id,
                armed_wall,
                armed_for
            );
        } else {
            self.stats.silent_misses += 1;
            log_info!(
                "Disarmed session {} (armed {} UTC) after {:?} without a capture ({} of {} frames)",
                session.id,
                armed_wall,
                armed_for,
                session.frames_seen_since_arm,
                self.options.capture.settle_frames
            );
        }
    }

    async fn recover_stream(&mut self, err: StreamError) {
        self.stats.stream_failures += 1;

        if self.failing_since.is_none() {
            self.failing_since = Some(Instant::now());
            log_warn!("Camera stream failure: {err}");
        } else {
            debug!("Camera stream still failing: {err}");
        }

        if !err.needs_reopen() {
            return;
        }

        self.frames.close().await;
        self.reopen_at = Some(Instant::now() + self.options.reconnect_delay);
    }

    fn mark_stream_healthy(&mut self) {
        if let Some(since) = self.failing_since.take() {
            log_info!("Camera stream recovered after {:?}", since.elapsed());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EventStatus;
    use crate::sensing::TriggerMatcher;
    use crate::storage::{JsonArrayLog, SnapshotWriter};
    use crate::stream::frame::test_support::jpeg_bytes;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::{tempdir, TempDir};

    /// Lines delivered at fixed offsets from construction.
    struct ScriptedLines {
        start: Instant,
        script: VecDeque<(Duration, &'static str)>,
        disconnect_when_done: bool,
        matcher: TriggerMatcher,
    }

    impl ScriptedLines {
        fn new(script: &[(u64, &'static str)]) -> Self {
            Self {
                start: Instant::now(),
                script: script
                    .iter()
                    .map(|(ms, line)| (Duration::from_millis(*ms), *line))
                    .collect(),
                disconnect_when_done: false,
                matcher: TriggerMatcher::new(["IR", "TRIGGER"], ["motion", "intrusion"]),
            }
        }

        fn then_disconnect(mut self) -> Self {
            self.disconnect_when_done = true;
            self
        }
    }

    #[async_trait]
    impl LineSource for ScriptedLines {
        async fn next_line(&mut self, wait: Duration) -> Result<Option<TriggerSignal>, SourceError> {
            let deadline = Instant::now() + wait;
            match self.script.front().copied() {
                Some((offset, _)) if self.start + offset <= deadline => {
                    tokio::time::sleep_until(self.start + offset).await;
                    let (_, line) = self.script.pop_front().unwrap();
                    Ok(Some(self.matcher.classify(line.to_string(), Instant::now())))
                }
                Some(_) => {
                    tokio::time::sleep_until(deadline).await;
                    Ok(None)
                }
                None if self.disconnect_when_done => Err(SourceError::Disconnected),
                None => {
                    tokio::time::sleep_until(deadline).await;
                    Ok(None)
                }
            }
        }
    }

    #[derive(Default)]
    struct StreamCalls {
        reopens: AtomicUsize,
        closes: AtomicUsize,
    }

    /// Produces one queued item every `period`, only while someone is
    /// waiting for it.
    struct ScriptedFrames {
        period: Duration,
        queue: VecDeque<Result<Frame, StreamError>>,
        calls: Arc<StreamCalls>,
    }

    impl ScriptedFrames {
        fn new(queue: Vec<Result<Frame, StreamError>>) -> Self {
            Self {
                period: Duration::from_millis(40),
                queue: queue.into(),
                calls: Arc::default(),
            }
        }

        fn good(count: u64) -> Self {
            Self::new((1..=count).map(|seq| Ok(frame(seq))).collect())
        }
    }

    #[async_trait]
    impl FrameSource for ScriptedFrames {
        async fn read_frame(&mut self, wait: Duration) -> Result<Option<Frame>, StreamError> {
            if self.queue.is_empty() || wait < self.period {
                tokio::time::sleep(wait).await;
                return Ok(None);
            }
            tokio::time::sleep(self.period).await;
            match self.queue.pop_front() {
                Some(Ok(frame)) => Ok(Some(frame)),
                Some(Err(err)) => Err(err),
                None => Ok(None),
            }
        }

        async fn reopen(&mut self) -> Result<(), StreamError> {
            self.calls.reopens.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn close(&mut self) {
            self.calls.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Camera that never delivers: every read fails and every reopen
    /// takes a while before failing again on the next read.
    #[derive(Default)]
    struct DeadCamera {
        reopens: usize,
    }

    #[async_trait]
    impl FrameSource for DeadCamera {
        async fn read_frame(&mut self, _wait: Duration) -> Result<Option<Frame>, StreamError> {
            Err(StreamError::Closed)
        }

        async fn reopen(&mut self) -> Result<(), StreamError> {
            self.reopens += 1;
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(())
        }

        async fn close(&mut self) {}
    }

    /// Requests shutdown from inside the snapshot write, then writes.
    struct CancellingSnapshots {
        cancel: CancellationToken,
        inner: SnapshotWriter,
    }

    impl SnapshotSink for CancellingSnapshots {
        fn write(&self, frame: &Frame, at: chrono::DateTime<Utc>) -> Result<String, SnapshotError> {
            self.cancel.cancel();
            self.inner.write(frame, at)
        }
    }

    struct FailingSnapshots;

    impl SnapshotSink for FailingSnapshots {
        fn write(&self, _frame: &Frame, _at: chrono::DateTime<Utc>) -> Result<String, SnapshotError> {
            Err(SnapshotError::Io {
                path: PathBuf::from("/nowhere"),
                source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
            })
        }
    }

    /// Records, for every appended event, whether its image was already on
    /// disk at append time.
    struct CheckingLog {
        image_dir: PathBuf,
        inner: JsonArrayLog,
        image_present: Mutex<Vec<bool>>,
    }

    impl EventSink for CheckingLog {
        fn initialize(&self) -> Result<(), StoreError> {
            self.inner.initialize()
        }

        fn append(&self, event: &Event) -> Result<(), StoreError> {
            let present = event
                .image_filename
                .as_ref()
                .is_some_and(|name| self.image_dir.join(name).is_file());
            self.image_present.lock().unwrap().push(present);
            self.inner.append(event)
        }

        fn load(&self) -> Result<Vec<Event>, StoreError> {
            self.inner.load()
        }
    }

    fn frame(seq: u64) -> Frame {
        Frame::from_jpeg(jpeg_bytes(8, 8), seq).unwrap()
    }

    struct Stores {
        _dir: TempDir,
        image_dir: PathBuf,
        log: Arc<JsonArrayLog>,
    }

    fn stores() -> Stores {
        let dir = tempdir().unwrap();
        let image_dir = dir.path().join("images");
        let writer = SnapshotWriter::new(&image_dir, "event");
        writer.initialize().unwrap();
        let log = Arc::new(JsonArrayLog::new(dir.path().join("logs.json")));
        log.initialize().unwrap();
        Stores {
            _dir: dir,
            image_dir,
            log,
        }
    }

    fn controller<F: FrameSource>(
        lines: ScriptedLines,
        frames: F,
        snapshots: Arc<dyn SnapshotSink>,
        events: Arc<dyn EventSink>,
    ) -> CaptureController<ScriptedLines, F> {
        let options = ControllerOptions {
            sensor_id: "node-test".into(),
            ..ControllerOptions::default()
        };
        CaptureController::new(lines, frames, snapshots, events, options)
    }

    fn image_count(dir: &Path) -> usize {
        std::fs::read_dir(dir).unwrap().count()
    }

    /// Step until a session arms and then disarms again. Returns the time
    /// since the call, which equals the armed time when the trigger is due
    /// immediately.
    async fn drive_until_disarmed<F: FrameSource>(
        ctl: &mut CaptureController<ScriptedLines, F>,
        state: &mut CaptureState,
    ) -> Duration {
        let start = Instant::now();
        while !state.is_armed() {
            ctl.step(state).await.unwrap();
            assert!(start.elapsed() < Duration::from_secs(60), "never armed");
        }
        while state.is_armed() {
            ctl.step(state).await.unwrap();
            assert!(start.elapsed() < Duration::from_secs(60), "never disarmed");
        }
        start.elapsed()
    }

    #[tokio::test(start_paused = true)]
    async fn trigger_then_settle_frames_writes_one_event() {
        let stores = stores();
        let writer = Arc::new(SnapshotWriter::new(&stores.image_dir, "event"));
        let mut ctl = controller(
            ScriptedLines::new(&[(0, "IR")]),
            ScriptedFrames::good(5),
            writer,
            stores.log.clone(),
        );
        let mut state = CaptureState::Idle;

        drive_until_disarmed(&mut ctl, &mut state).await;

        let events = stores.log.load().unwrap();
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.status, EventStatus::Triggered);
        assert_eq!(event.event_type, "IR");
        assert_eq!(event.sensor_id, "node-test");
        let name = event.image_filename.as_deref().unwrap();
        assert!(name.starts_with("event_") && name.ends_with(".jpg"));
        assert!(stores.image_dir.join(name).is_file());
        assert_eq!(image_count(&stores.image_dir), 1);

        let stats = ctl.stats();
        assert_eq!(stats.sessions_armed, 1);
        assert_eq!(stats.captures, 1);
        assert_eq!(stats.silent_misses, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn capture_waits_for_settle_frames_after_stream_failures() {
        let stores = stores();
        let writer = Arc::new(SnapshotWriter::new(&stores.image_dir, "event"));
        let frames = ScriptedFrames::new(vec![
            Err(StreamError::Closed),
            Err(StreamError::Stalled(Duration::from_secs(5))),
            Ok(frame(1)),
            Ok(frame(2)),
            Ok(frame(3)),
        ]);
        let calls = Arc::clone(&frames.calls);
        let mut ctl = controller(
            ScriptedLines::new(&[(0, "IR")]),
            frames,
            writer,
            stores.log.clone(),
        );
        let mut state = CaptureState::Idle;

        drive_until_disarmed(&mut ctl, &mut state).await;

        assert_eq!(stores.log.load().unwrap().len(), 1);
        assert_eq!(calls.reopens.load(Ordering::SeqCst), 2);
        assert_eq!(calls.closes.load(Ordering::SeqCst), 2);
        let stats = ctl.stats();
        assert_eq!(stats.stream_failures, 2);
        assert_eq!(stats.reconnects, 2);
        assert_eq!(stats.frames_counted, 3);
        assert_eq!(stats.captures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn corrupt_frame_is_skipped_without_reopen() {
        let stores = stores();
        let writer = Arc::new(SnapshotWriter::new(&stores.image_dir, "event"));
        let frames = ScriptedFrames::new(vec![
            Ok(frame(1)),
            Err(StreamError::Corrupt("bad header".into())),
            Ok(frame(2)),
            Ok(frame(3)),
        ]);
        let calls = Arc::clone(&frames.calls);
        let mut ctl = controller(
            ScriptedLines::new(&[(0, "TRIGGER")]),
            frames,
            writer,
            stores.log.clone(),
        );
        let mut state = CaptureState::Idle;

        drive_until_disarmed(&mut ctl, &mut state).await;

        assert_eq!(stores.log.load().unwrap().len(), 1);
        assert_eq!(calls.reopens.load(Ordering::SeqCst), 0);
        assert_eq!(ctl.stats().stream_failures, 1);
        assert_eq!(ctl.stats().frames_counted, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn no_frames_disarms_after_timeout_without_event() {
        let stores = stores();
        let writer = Arc::new(SnapshotWriter::new(&stores.image_dir, "event"));
        let mut ctl = controller(
            ScriptedLines::new(&[(0, "IR")]),
            ScriptedFrames::good(0),
            writer,
            stores.log.clone(),
        );
        let mut state = CaptureState::Idle;

        let armed_for = drive_until_disarmed(&mut ctl, &mut state).await;

        assert!(armed_for >= Duration::from_secs(10), "disarmed early: {armed_for:?}");
        assert!(armed_for < Duration::from_millis(10_250), "disarmed late: {armed_for:?}");
        assert!(stores.log.load().unwrap().is_empty());
        assert_eq!(image_count(&stores.image_dir), 0);
        assert_eq!(ctl.stats().silent_misses, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dead_camera_does_not_delay_disarm() {
        let stores = stores();
        let writer = Arc::new(SnapshotWriter::new(&stores.image_dir, "event"));
        let mut ctl = controller(
            ScriptedLines::new(&[(0, "IR")]),
            DeadCamera::default(),
            writer,
            stores.log.clone(),
        );
        let mut state = CaptureState::Idle;

        let armed_for = drive_until_disarmed(&mut ctl, &mut state).await;

        assert!(armed_for >= Duration::from_secs(10), "disarmed early: {armed_for:?}");
        assert!(armed_for < Duration::from_millis(10_250), "disarmed late: {armed_for:?}");
        assert!(stores.log.load().unwrap().is_empty());
        // One attempt per reconnect delay, not one per poll.
        assert!(ctl.frames.reopens <= 11, "reopened {} times", ctl.frames.reopens);
        assert!(ctl.frames.reopens >= 8, "reopened {} times", ctl.frames.reopens);
    }

    #[tokio::test(start_paused = true)]
    async fn dead_camera_does_not_delay_trigger_lines() {
        let stores = stores();
        let writer = Arc::new(SnapshotWriter::new(&stores.image_dir, "event"));
        let mut ctl = controller(
            ScriptedLines::new(&[(2_500, "IR")]),
            DeadCamera::default(),
            writer,
            stores.log.clone(),
        );
        let mut state = CaptureState::Idle;

        let elapsed = drive_until_disarmed(&mut ctl, &mut state).await;

        assert!(elapsed >= Duration::from_millis(12_500), "disarmed early: {elapsed:?}");
        assert!(elapsed < Duration::from_millis(12_750), "trigger read late: {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn retrigger_extends_session_without_second_event() {
        let stores = stores();
        let writer = Arc::new(SnapshotWriter::new(&stores.image_dir, "event"));
        let mut ctl = controller(
            ScriptedLines::new(&[(0, "IR"), (2_000, "motion detected")]),
            ScriptedFrames::good(10),
            writer,
            stores.log.clone(),
        );
        let mut state = CaptureState::Idle;

        let armed_for = drive_until_disarmed(&mut ctl, &mut state).await;

        assert!(armed_for >= Duration::from_secs(12), "window not extended: {armed_for:?}");
        let events = stores.log.load().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "IR");
        let stats = ctl.stats();
        assert_eq!(stats.sessions_armed, 1);
        assert_eq!(stats.retriggers, 1);
        assert_eq!(stats.captures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn noise_lines_do_not_arm() {
        let stores = stores();
        let writer = Arc::new(SnapshotWriter::new(&stores.image_dir, "event"));
        let mut ctl = controller(
            ScriptedLines::new(&[(0, "temp=21.5"), (50, "rssi=-97")]),
            ScriptedFrames::good(5),
            writer,
            stores.log.clone(),
        );
        let mut state = CaptureState::Idle;

        for _ in 0..10 {
            ctl.step(&mut state).await.unwrap();
            assert!(!state.is_armed());
        }

        assert!(stores.log.load().unwrap().is_empty());
        assert_eq!(ctl.stats().noise_lines, 2);
        assert_eq!(ctl.stats().sessions_armed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_snapshot_records_capture_failed_event() {
        let stores = stores();
        let mut ctl = controller(
            ScriptedLines::new(&[(0, "IR")]),
            ScriptedFrames::good(5),
            Arc::new(FailingSnapshots),
            stores.log.clone(),
        );
        let mut state = CaptureState::Idle;

        drive_until_disarmed(&mut ctl, &mut state).await;

        let events = stores.log.load().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, EventStatus::CaptureFailed);
        assert_eq!(events[0].image_filename, None);

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(stores.log.path()).unwrap()).unwrap();
        assert!(raw[0]["image_filename"].is_null());
        assert_eq!(raw[0]["status"], "capture_failed");
        assert_eq!(ctl.stats().capture_failures, 1);
        assert_eq!(ctl.stats().captures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn image_is_on_disk_before_event_is_appended() {
        let stores = stores();
        let writer = Arc::new(SnapshotWriter::new(&stores.image_dir, "event"));
        let log = Arc::new(CheckingLog {
            image_dir: stores.image_dir.clone(),
            inner: JsonArrayLog::new(stores.log.path()),
            image_present: Mutex::new(Vec::new()),
        });
        let mut ctl = controller(
            ScriptedLines::new(&[(0, "IR"), (11_000, "IR")]),
            ScriptedFrames::good(200),
            writer,
            log.clone(),
        );
        let mut state = CaptureState::Idle;

        drive_until_disarmed(&mut ctl, &mut state).await;
        drive_until_disarmed(&mut ctl, &mut state).await;

        assert_eq!(*log.image_present.lock().unwrap(), vec![true, true]);
        assert_eq!(image_count(&stores.image_dir), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_on_cancel_and_closes_stream() {
        let stores = stores();
        let writer = Arc::new(SnapshotWriter::new(&stores.image_dir, "event"));
        let frames = ScriptedFrames::good(3);
        let calls = Arc::clone(&frames.calls);
        let ctl = controller(
            ScriptedLines::new(&[(0, "IR")]),
            frames,
            writer,
            stores.log.clone(),
        );

        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(15)).await;
            stopper.cancel();
        });

        let stats = ctl.run(cancel).await.unwrap();

        assert_eq!(stats.captures, 1);
        assert_eq!(stats.triggers, 1);
        assert_eq!(calls.closes.load(Ordering::SeqCst), 1);
        assert_eq!(stores.log.load().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_during_capture_still_records_the_event() {
        let stores = stores();
        let cancel = CancellationToken::new();
        let snapshots = Arc::new(CancellingSnapshots {
            cancel: cancel.clone(),
            inner: SnapshotWriter::new(&stores.image_dir, "event"),
        });
        let ctl = controller(
            ScriptedLines::new(&[(0, "IR")]),
            ScriptedFrames::good(5),
            snapshots,
            stores.log.clone(),
        );

        let stats = ctl.run(cancel).await.unwrap();

        assert_eq!(stats.captures, 1);
        assert_eq!(image_count(&stores.image_dir), 1);
        let events = stores.log.load().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, EventStatus::Triggered);
    }

    #[tokio::test(start_paused = true)]
    async fn run_fails_when_sensor_disconnects() {
        let stores = stores();
        let writer = Arc::new(SnapshotWriter::new(&stores.image_dir, "event"));
        let frames = ScriptedFrames::good(0);
        let calls = Arc::clone(&frames.calls);
        let ctl = controller(
            ScriptedLines::new(&[(0, "rssi=-90")]).then_disconnect(),
            frames,
            writer,
            stores.log.clone(),
        );

        let result = ctl.run(CancellationToken::new()).await;

        assert!(matches!(result, Err(SourceError::Disconnected)));
        assert_eq!(calls.closes.load(Ordering::SeqCst), 1);
    }
}
