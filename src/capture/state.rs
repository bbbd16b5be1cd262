use chrono::{DateTime, Utc};
use tokio::time::{Duration, Instant};
use uuid::Uuid;

use crate::sensing::TriggerSignal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConfig {
    /// Frames to read after arming before the snapshot is taken.
    pub settle_frames: u32,
    /// Quiet period after the last trigger that closes the armed window.
    pub disarm_timeout: Duration,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            settle_frames: 3,
            disarm_timeout: Duration::from_secs(10),
        }
    }
}

/// One armed window. At most one capture is attempted per session.
#[derive(Debug, Clone)]
pub struct CaptureSession {
    pub id: Uuid,
    pub event_type: String,
    pub armed_at: Instant,
    /// Wall-clock arm time, for the session log lines.
    pub armed_wall: DateTime<Utc>,
    pub last_trigger_at: Instant,
    pub frames_seen_since_arm: u32,
    pub snapshot_taken: bool,
    pub trigger_count: u32,
}

#[derive(Debug, Clone, Default)]
pub enum CaptureState {
    #[default]
    Idle,
    Armed(CaptureSession),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// Not a trigger; state unchanged.
    Ignored,
    Armed,
    /// Already armed; the disarm window restarts from this trigger.
    Extended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDecision {
    /// Not armed; the frame does not count.
    Idle,
    Settling { seen: u32, needed: u32 },
    /// Threshold reached: take the snapshot from this frame.
    Capture,
    AlreadyCaptured,
}

impl CaptureState {
    pub fn is_armed(&self) -> bool {
        matches!(self, CaptureState::Armed(_))
    }

    pub fn session(&self) -> Option<&CaptureSession> {
        match self {
            CaptureState::Armed(session) => Some(session),
            CaptureState::Idle => None,
        }
    }

    pub fn on_signal(&mut self, signal: &TriggerSignal) -> TriggerOutcome {
        if !signal.is_trigger {
            return TriggerOutcome::Ignored;
        }

        match self {
            CaptureState::Idle => {
                *self = CaptureState::Armed(CaptureSession {
                    id: Uuid::new_v4(),
                    event_type: signal.raw_text.clone(),
                    armed_at: signal.received_at,
                    armed_wall: signal.received_wall,
                    last_trigger_at: signal.received_at,
                    frames_seen_since_arm: 0,
                    snapshot_taken: false,
                    trigger_count: 1,
                });
                TriggerOutcome::Armed
            }
            CaptureState::Armed(session) => {
                session.last_trigger_at = session.last_trigger_at.max(signal.received_at);
                session.trigger_count = session.trigger_count.saturating_add(1);
                TriggerOutcome::Extended
            }
        }
    }

    /// Count one successfully read frame.
    pub fn on_frame(&mut self, config: &CaptureConfig) -> FrameDecision {
        let CaptureState::Armed(session) = self else {
            return FrameDecision::Idle;
        };

        session.frames_seen_since_arm = session.frames_seen_since_arm.saturating_add(1);
        if session.snapshot_taken {
            FrameDecision::AlreadyCaptured
        } else if session.frames_seen_since_arm >= config.settle_frames {
            FrameDecision::Capture
        } else {
            FrameDecision::Settling {
                seen: session.frames_seen_since_arm,
                needed: config.settle_frames,
            }
        }
    }

    /// Record that this session's single capture attempt has been made,
    /// whether or not it succeeded.
    pub fn mark_captured(&mut self) {
        if let CaptureState::Armed(session) = self {
            session.snapshot_taken = true;
        }
    }

    pub fn disarm_deadline(&self, config: &CaptureConfig) -> Option<Instant> {
        self.session()
            .map(|session| session.last_trigger_at + config.disarm_timeout)
    }

    /// Disarm once `now` has reached `last_trigger_at + disarm_timeout`.
    /// Returns the finished session.
    pub fn check_timeout(&mut self, now: Instant, config: &CaptureConfig) -> Option<CaptureSession> {
        let deadline = self.disarm_deadline(config)?;
        if now < deadline {
            return None;
        }

        match std::mem::take(self) {
            CaptureState::Armed(session) => Some(session),
            CaptureState::Idle => None,
        }
    }
}
