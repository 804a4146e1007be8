//! Trace-correlated log records.
//!
//! The [`CorrelationLayer`] plugs into a `tracing` subscriber stack and
//! converts every event into a [`LogRecord`], stamping it with the trace
//! and span ids of the active span so logs and traces can be joined in the
//! backend. Records are handed to a [`LogSink`].

mod layer;

pub use layer::CorrelationLayer;

use crate::trace::{SpanId, TraceId};
use crate::KeyValue;
use std::fmt::Debug;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tracing_core::Level;

/// Severity of a [`LogRecord`], mapped from the `tracing` level.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Finer-grained than Debug.
    Trace,
    /// Debugging information.
    Debug,
    /// Routine information.
    Info,
    /// Something unexpected, but recoverable.
    Warn,
    /// An operation failed.
    Error,
}

impl From<&Level> for Severity {
    fn from(level: &Level) -> Self {
        match *level {
            Level::TRACE => Severity::Trace,
            Level::DEBUG => Severity::Debug,
            Level::INFO => Severity::Info,
            Level::WARN => Severity::Warn,
            Level::ERROR => Severity::Error,
        }
    }
}

/// A single log event, annotated with the active span's identifiers.
#[derive(Clone, Debug)]
pub struct LogRecord {
    /// When the event was observed.
    pub timestamp: SystemTime,
    /// Severity mapped from the event's level.
    pub severity: Severity,
    /// The event's target, typically its module path.
    pub target: String,
    /// The event's message field.
    pub body: String,
    /// The event's remaining fields.
    pub attributes: Vec<KeyValue>,
    /// Trace id of the active span, if a span was active.
    pub trace_id: Option<TraceId>,
    /// Span id of the active span, if a span was active.
    pub span_id: Option<SpanId>,
}

/// Destination for correlated [`LogRecord`]s.
pub trait LogSink: Send + Sync + Debug {
    /// Accept a record. Called inline from the logging call site, so
    /// implementations should hand off quickly.
    fn emit(&self, record: LogRecord);
}

/// A [`LogSink`] that stores records in memory, for tests and debugging.
///
/// Clones share the same storage.
#[derive(Clone, Debug, Default)]
pub struct InMemoryLogSink {
    records: Arc<Mutex<Vec<LogRecord>>>,
}

impl InMemoryLogSink {
    /// Returns the records received so far.
    pub fn get_records(&self) -> Vec<LogRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Clears the stored records.
    pub fn reset(&self) {
        if let Ok(mut records) = self.records.lock() {
            records.clear();
        }
    }
}

impl LogSink for InMemoryLogSink {
    fn emit(&self, record: LogRecord) {
        if let Ok(mut records) = self.records.lock() {
            records.push(record);
        }
    }
}
