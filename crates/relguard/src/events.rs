//! Structured records of every DML/DDL attempt and outcome.
//!
//! Components never log operation outcomes to a global logger; they are
//! handed an [`EventSink`] by the caller. [`TracingSink`] forwards records
//! to `tracing`, [`MemorySink`] keeps them for inspection.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

/// Severity of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for EventLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EventLevel::Debug => "debug",
            EventLevel::Info => "info",
            EventLevel::Warn => "warn",
            EventLevel::Error => "error",
        })
    }
}

/// One structured record.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub level: EventLevel,
    /// Operation name, e.g. `insert`, `add_column`, `refresh`.
    pub operation: String,
    pub table: Option<String>,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl Event {
    pub fn new(level: EventLevel, operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level,
            operation: operation.into(),
            table: None,
            message: message.into(),
            at: Utc::now(),
        }
    }

    pub fn info(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(EventLevel::Info, operation, message)
    }

    pub fn warn(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(EventLevel::Warn, operation, message)
    }

    pub fn error(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(EventLevel::Error, operation, message)
    }

    pub fn debug(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(EventLevel::Debug, operation, message)
    }

    /// Attach the table the operation targeted.
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }
}

/// Destination for events. Implementations must be cheap and non-blocking.
pub trait EventSink: Send + Sync {
    fn record(&self, event: Event);
}

/// Forwards events to `tracing` with the operation and table as fields.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn record(&self, event: Event) {
        let table = event.table.as_deref().unwrap_or("-");
        match event.level {
            EventLevel::Debug => {
                tracing::debug!(operation = %event.operation, table, "{}", event.message)
            }
            EventLevel::Info => {
                tracing::info!(operation = %event.operation, table, "{}", event.message)
            }
            EventLevel::Warn => {
                tracing::warn!(operation = %event.operation, table, "{}", event.message)
            }
            EventLevel::Error => {
                tracing::error!(operation = %event.operation, table, "{}", event.message)
            }
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<Event>>,
}

impl MemorySink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Copy of the events recorded so far.
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// Events of one operation.
    pub fn for_operation(&self, operation: &str) -> Vec<Event> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.operation == operation)
            .cloned()
            .collect()
    }

    /// Whether any event at `level` or above was recorded for `operation`.
    pub fn has(&self, operation: &str, level: EventLevel) -> bool {
        self.events
            .lock()
            .iter()
            .any(|e| e.operation == operation && e.level >= level)
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for MemorySink {
    fn record(&self, event: Event) {
        self.events.lock().push(event);
    }
}

/// The default sink.
pub fn tracing_sink() -> Arc<dyn EventSink> {
    Arc::new(TracingSink)
}
