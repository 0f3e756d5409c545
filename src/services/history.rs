use chrono::Local;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const FOLDER_REFERENCE_EVENT: &str = "folder_reference";
pub const CLASSIFICATION_GROUPING_EVENT: &str = "classification_grouping";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventResults {
    pub total_processed: usize,
    /// Destination folder -> filenames moved into it.
    pub groups: BTreeMap<String, Vec<String>>,
    pub moved_count: usize,
    pub unchanged_count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventExtra {
    pub is_placeholder: bool,
    pub dest_sub: String,
    pub moved: usize,
    pub unchanged_count: usize,
    pub total_processed: usize,
    pub failed: usize,
}

/// One line of the session log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub id: String,
    pub timestamp: String,
    pub date: String,
    pub time: String,
    pub event_type: String,
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub source_prefix: String,
    #[serde(default)]
    pub output_prefix: String,
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub reference_image: Option<String>,
    #[serde(default)]
    pub results: EventResults,
    #[serde(default)]
    pub extra: EventExtra,
}

impl SessionEvent {
    pub fn new(event_type: &str) -> Self {
        let now = Local::now();
        let timestamp = now.to_rfc3339();
        let id = format!("{}_{}", timestamp, event_type).replace([':', '.'], "-");

        Self {
            id,
            timestamp,
            date: now.format("%Y-%m-%d").to_string(),
            time: now.format("%H:%M:%S").to_string(),
            event_type: event_type.to_string(),
            bucket: String::new(),
            source_prefix: String::new(),
            output_prefix: String::new(),
            mode: String::new(),
            reference_image: None,
            results: EventResults::default(),
            extra: EventExtra::default(),
        }
    }
}

/// Audit destination. Recording is fire-and-forget: implementations log
/// their own failures and never fail the run.
pub trait EventSink: Send + Sync {
    fn record(&self, event: &SessionEvent);
}

/// Appends one JSON object per line to a file.
#[derive(Debug, Clone)]
pub struct JsonlEventLog {
    path: PathBuf,
}

impl JsonlEventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, event: &SessionEvent) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let line = serde_json::to_string(event)?;
        let mut out = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(out, "{}", line)
    }
}

impl EventSink for JsonlEventLog {
    fn record(&self, event: &SessionEvent) {
        match self.append(event) {
            Ok(()) => log::debug!("Recorded {} in {}", event.id, self.path.display()),
            Err(e) => log::warn!(
                "Failed to record session event {} in {}: {}",
                event.id,
                self.path.display(),
                e
            ),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryEventLog {
    events: Mutex<Vec<SessionEvent>>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SessionEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl EventSink for MemoryEventLog {
    fn record(&self, event: &SessionEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event.clone()),
            Err(poisoned) => poisoned.into_inner().push(event.clone()),
        }
    }
}

/// Discards everything; used for dry runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn record(&self, _event: &SessionEvent) {}
}

/// Read a session log, skipping lines that do not parse.
pub fn read_events(path: &Path) -> std::io::Result<Vec<SessionEvent>> {
    let reader = BufReader::new(File::open(path)?);
    let mut events = Vec::new();
    for (i, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<SessionEvent>(&line) {
            Ok(event) => events.push(event),
            Err(e) => log::warn!("Skipping malformed session log entry {}: {}", i, e),
        }
    }
    Ok(events)
}
