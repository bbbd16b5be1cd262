use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Triggered,
    CaptureFailed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Triggered => "triggered",
            EventStatus::CaptureFailed => "capture_failed",
        }
    }
}

/// One entry of the event log read by the reporting layer.
///
/// Field names are part of the on-disk contract. `image_filename` is written
/// as `null` when no snapshot was produced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub sensor_id: String,
    pub event_type: String,
    pub status: EventStatus,
    pub image_filename: Option<String>,
}

impl Event {
    pub fn triggered(
        timestamp: DateTime<Utc>,
        sensor_id: impl Into<String>,
        event_type: impl Into<String>,
        image_filename: impl Into<String>,
    ) -> Self {
        Self {
            timestamp,
            sensor_id: sensor_id.into(),
            event_type: event_type.into(),
            status: EventStatus::Triggered,
            image_filename: Some(image_filename.into()),
        }
    }

    pub fn capture_failed(
        timestamp: DateTime<Utc>,
        sensor_id: impl Into<String>,
        event_type: impl Into<String>,
    ) -> Self {
        Self {
            timestamp,
            sensor_id: sensor_id.into(),
            event_type: event_type.into(),
            status: EventStatus::CaptureFailed,
            image_filename: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn failed_capture_serializes_null_image() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap();
        let event = Event::capture_failed(at, "node-7", "IR");

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({
                "timestamp": "2024-05-01T12:30:00Z",
                "sensor_id": "node-7",
                "event_type": "IR",
                "status": "capture_failed",
                "image_filename": null,
            })
        );
    }

    #[test]
    fn missing_image_field_reads_as_none() {
        let raw = r#"{"timestamp":"2024-05-01T12:30:00Z","sensor_id":"a","event_type":"IR","status":"triggered"}"#;
        let event: Event = serde_json::from_str(raw).unwrap();
        assert_eq!(event.status, EventStatus::Triggered);
        assert!(event.image_filename.is_none());
    }
}
