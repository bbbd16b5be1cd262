use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// One classified line of sensor input. Lives only until the state machine
/// has consumed it.
#[derive(Debug, Clone)]
pub struct TriggerSignal {
    pub raw_text: String,
    pub received_at: Instant,
    pub received_wall: DateTime<Utc>,
    pub is_trigger: bool,
}

/// Decides whether a sensor line is a trigger.
///
/// A line triggers when it equals one of the literal markers exactly, or
/// when it contains one of the semantic tags (case-insensitive).
#[derive(Debug, Clone)]
pub struct TriggerMatcher {
    markers: Vec<String>,
    tags: Vec<String>,
}

impl TriggerMatcher {
    pub fn new<M, T>(markers: M, tags: T) -> Self
    where
        M: IntoIterator,
        M::Item: AsRef<str>,
        T: IntoIterator,
        T::Item: AsRef<str>,
    {
        let markers = markers
            .into_iter()
            .map(|m| m.as_ref().trim().to_string())
            .filter(|m| !m.is_empty())
            .collect();
        let tags = tags
            .into_iter()
            .map(|t| t.as_ref().trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();

        Self { markers, tags }
    }

    pub fn is_trigger(&self, line: &str) -> bool {
        let line = line.trim();
        if line.is_empty() {
            return false;
        }
        if self.markers.iter().any(|marker| marker == line) {
            return true;
        }

        let lowered = line.to_lowercase();
        self.tags.iter().any(|tag| lowered.contains(tag.as_str()))
    }

    /// Wrap a non-blank line into a [`TriggerSignal`].
    pub fn classify(&self, raw_text: String, received_at: Instant) -> TriggerSignal {
        let is_trigger = self.is_trigger(&raw_text);
        TriggerSignal {
            raw_text,
            received_at,
            received_wall: Utc::now(),
            is_trigger,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher() -> TriggerMatcher {
        TriggerMatcher::new(["IR", "TRIGGER"], ["motion", "Intrusion"])
    }

    #[test]
    fn literal_markers_match_whole_payload_only() {
        let m = matcher();
        assert!(m.is_trigger("IR"));
        assert!(m.is_trigger("  IR \r"));
        assert!(!m.is_trigger("ir"));
        assert!(!m.is_trigger("IRQ 5 raised"));
    }

    #[test]
    fn tags_match_as_case_insensitive_substrings() {
        let m = matcher();
        assert!(m.is_trigger("node3: MOTION detected"));
        assert!(m.is_trigger("possible intrusion at gate"));
        assert!(!m.is_trigger("battery 3.71V"));
    }

    #[test]
    fn blank_lines_never_trigger() {
        let m = matcher();
        assert!(!m.is_trigger(""));
        assert!(!m.is_trigger("   "));
    }

    #[test]
    fn empty_entries_are_dropped() {
        let m = TriggerMatcher::new(["", "  "], [" "]);
        assert!(!m.is_trigger("anything"));
    }

    #[test]
    fn classify_keeps_raw_text_verbatim() {
        let m = matcher();
        let signal = m.classify("Motion zone=2".into(), Instant::now());
        assert!(signal.is_trigger);
        assert_eq!(signal.raw_text, "Motion zone=2");
    }
}
