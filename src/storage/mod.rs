//! Files shared with the reporting layer: the image directory and the event
//! log. Every mutation is either write-once or an atomic replace.

pub mod atomic;
pub mod event_log;
pub mod snapshot;

pub use event_log::{open_event_log, EventSink, JsonArrayLog, JsonLinesLog};
pub use snapshot::{SnapshotSink, SnapshotWriter};
