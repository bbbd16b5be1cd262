use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use log::warn;
use serde_json::Value;

use crate::error::StoreError;
use crate::models::Event;
use crate::settings::LogFormat;

use super::atomic;

pub trait EventSink: Send + Sync + 'static {
    /// Make sure the log exists and is readable as an empty collection.
    fn initialize(&self) -> Result<(), StoreError>;

    fn append(&self, event: &Event) -> Result<(), StoreError>;

    /// Every event currently in the log, oldest first.
    fn load(&self) -> Result<Vec<Event>, StoreError>;
}

pub fn open_event_log(format: LogFormat, path: impl Into<PathBuf>) -> Box<dyn EventSink> {
    match format {
        LogFormat::Json => Box::new(JsonArrayLog::new(path)),
        LogFormat::Jsonl => Box::new(JsonLinesLog::new(path)),
    }
}

/// Event log stored as one JSON array, rewritten with an atomic replace on
/// every append.
///
/// Records already in the file are carried over as raw JSON, so fields this
/// crate does not know about survive the rewrite. An unreadable file is
/// treated as empty; its bytes are copied aside first.
pub struct JsonArrayLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonArrayLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_records(&self) -> Result<Vec<Value>, StoreError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                warn!(
                    "Event log {} is unreadable ({err}); starting a fresh collection",
                    self.path.display()
                );
                return Ok(Vec::new());
            }
        };

        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }

        match serde_json::from_slice::<Value>(&bytes) {
            Ok(Value::Array(records)) => Ok(records),
            Ok(other) => {
                self.quarantine(&format!("top-level value is {}", json_kind(&other)));
                Ok(Vec::new())
            }
            Err(err) => {
                self.quarantine(&err.to_string());
                Ok(Vec::new())
            }
        }
    }

    fn quarantine(&self, reason: &str) {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(format!(".corrupt-{}", Utc::now().timestamp()));
        let backup = PathBuf::from(name);

        match fs::copy(&self.path, &backup) {
            Ok(_) => warn!(
                "Event log {} is corrupt ({reason}); kept a copy at {} and starting a fresh collection",
                self.path.display(),
                backup.display()
            ),
            Err(err) => warn!(
                "Event log {} is corrupt ({reason}); backup failed ({err}), starting a fresh collection",
                self.path.display()
            ),
        }
    }
}

impl EventSink for JsonArrayLog {
    fn initialize(&self) -> Result<(), StoreError> {
        if self.path.exists() {
            return Ok(());
        }
        atomic::atomic_replace(&self.path, b"[]").map_err(|err| StoreError::io(&self.path, err))
    }

    fn append(&self, event: &Event) -> Result<(), StoreError> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut records = self.read_records()?;
        records.push(serde_json::to_value(event)?);

        let encoded = serde_json::to_vec_pretty(&records)?;
        atomic::atomic_replace(&self.path, &encoded).map_err(|err| StoreError::io(&self.path, err))
    }

    fn load(&self) -> Result<Vec<Event>, StoreError> {
        let records = self.read_records()?;
        Ok(records
            .into_iter()
            .filter_map(|record| serde_json::from_value(record).ok())
            .collect())
    }
}

/// Event log stored as JSON lines, appended in place.
pub struct JsonLinesLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonLinesLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn open_for_append(&self) -> io::Result<fs::File> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        OpenOptions::new().create(true).append(true).open(&self.path)
    }
}

impl EventSink for JsonLinesLog {
    fn initialize(&self) -> Result<(), StoreError> {
        self.open_for_append()
            .map(|_| ())
            .map_err(|err| StoreError::io(&self.path, err))
    }

    fn append(&self, event: &Event) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');

        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut file = self
            .open_for_append()
            .map_err(|err| StoreError::io(&self.path, err))?;
        file.write_all(&line)
            .and_then(|()| file.sync_data())
            .map_err(|err| StoreError::io(&self.path, err))
    }

    fn load(&self) -> Result<Vec<Event>, StoreError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(StoreError::io(&self.path, err)),
        };

        let mut events = Vec::new();
        for (idx, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(event) => events.push(event),
                Err(err) => warn!(
                    "Skipping malformed record on line {} of {}: {err}",
                    idx + 1,
                    self.path.display()
                ),
            }
        }
        Ok(events)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
