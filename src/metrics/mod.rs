use serde::Serialize;

/// Running counters for one controller run.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ControllerStats {
    pub lines_read: u64,
    pub noise_lines: u64,
    pub triggers: u64,
    pub sessions_armed: u64,
    pub retriggers: u64,
    pub frames_counted: u64,
    pub stream_failures: u64,
    pub reconnects: u64,
    pub captures: u64,
    pub capture_failures: u64,
    pub store_failures: u64,
    pub silent_misses: u64,
}

impl ControllerStats {
    pub fn summary(&self) -> String {
        format!(
            "lines={} noise={} triggers={} sessions={} retriggers={} frames={} \
             stream_failures={} reconnects={} captures={} capture_failures={} \
             store_failures={} misses={}",
            self.lines_read,
            self.noise_lines,
            self.triggers,
            self.sessions_armed,
            self.retriggers,
            self.frames_counted,
            self.stream_failures,
            self.reconnects,
            self.captures,
            self.capture_failures,
            self.store_failures,
            self.silent_misses,
        )
    }
}
