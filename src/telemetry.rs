use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Structured event categories emitted by the core. Ordered by wall clock
/// at the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TelemetryKind {
    EpochStart,
    EpochDone,
    TaskState,
    AgentStart,
    AgentDone,
    EntanglementPosted,
    ClaimAcquired,
    ClaimReleased,
    DiscoveryPosted,
    DiscoveryResolved,
    FilterResult,
    CycleStart,
    CycleDone,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub at: DateTime<Utc>,
    pub kind: TelemetryKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl TelemetryEvent {
    pub fn new(kind: TelemetryKind) -> Self {
        Self {
            at: Utc::now(),
            kind,
            task_id: None,
            detail: None,
        }
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Structured-event consumer. Implementations must tolerate concurrent
/// emitters.
pub trait TelemetrySink: Send + Sync {
    fn emit(&self, event: &TelemetryEvent);
}

/// Optional shared sink; `None` is a no-op.
pub type SharedSink = Option<Arc<dyn TelemetrySink>>;

pub fn emit(sink: &SharedSink, event: TelemetryEvent) {
    if let Some(sink) = sink {
        sink.emit(&event);
    }
}

/// Collects events in memory. Test instrumentation.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<TelemetryEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events.lock().expect("sink mutex poisoned").clone()
    }

    pub fn kinds(&self) -> Vec<TelemetryKind> {
        self.events().into_iter().map(|e| e.kind).collect()
    }
}

impl TelemetrySink for MemorySink {
    fn emit(&self, event: &TelemetryEvent) {
        self.events
            .lock()
            .expect("sink mutex poisoned")
            .push(event.clone());
    }
}

/// Appends one JSON object per line to a file. Serialization and write
/// failures are swallowed.
pub struct JsonlSink {
    file: Mutex<File>,
}

impl JsonlSink {
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl TelemetrySink for JsonlSink {
    fn emit(&self, event: &TelemetryEvent) {
        if let Ok(line) = serde_json::to_string(event) {
            let mut file = self.file.lock().expect("sink mutex poisoned");
            let _ = writeln!(file, "{line}");
        }
    }
}
