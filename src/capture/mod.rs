pub mod controller;
pub mod state;

pub use controller::{CaptureController, ControllerOptions};
pub use state::{CaptureConfig, CaptureSession, CaptureState, FrameDecision, TriggerOutcome};
