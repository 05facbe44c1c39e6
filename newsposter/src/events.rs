//! Run event log.
//!
//! Every stage transition and the terminal outcome of a run is written as one
//! JSON object per line. Recording is best-effort: a sink that cannot write
//! logs a warning and the run carries on.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Started,
    Succeeded,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineEvent {
    pub timestamp: DateTime<Utc>,
    pub run_id: String,
    pub mode: String,
    pub stage: String,
    pub status: EventStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

pub trait EventSink: Send + Sync {
    /// Never fails; implementations swallow their own errors.
    fn record(&self, event: &PipelineEvent);
}

/// Appends events to a JSON-lines file.
pub struct JsonlEventSink {
    path: PathBuf,
}

impl JsonlEventSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    // Synchronous std::fs: `record` is not async and runs on the one
    // sequential run task. `block_in_place` panics on a current-thread runtime.
    fn append(&self, event: &PipelineEvent) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut line = serde_json::to_string(event)?;
        line.push('\n');
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }
}

impl EventSink for JsonlEventSink {
    fn record(&self, event: &PipelineEvent) {
        if let Err(e) = self.append(event) {
            warn!(path = %self.path.display(), stage = %event.stage, "failed to record event: {:#}", e);
        }
    }
}

/// Keeps events in memory. Used by tests and dry runs.
#[derive(Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<PipelineEvent>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<PipelineEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl EventSink for MemoryEventSink {
    fn record(&self, event: &PipelineEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event.clone()),
            Err(poisoned) => poisoned.into_inner().push(event.clone()),
        }
    }
}
