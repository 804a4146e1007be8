//! Finished-span export contract.

use crate::error::TelemetryError;
use crate::resource::Resource;
use crate::trace::{SpanContext, SpanId, Status};
use crate::KeyValue;
use futures_util::future::BoxFuture;
use std::borrow::Cow;
use std::fmt::Debug;
use std::time::SystemTime;

/// Result of an export attempt.
pub type ExportResult = Result<(), TelemetryError>;

/// The immutable record of a finished span, as handed to exporters.
#[derive(Clone, Debug, PartialEq)]
pub struct SpanData {
    /// The trace id and span id of this span.
    pub span_context: SpanContext,
    /// Span id of the parent, [`SpanId::INVALID`] for root spans.
    pub parent_span_id: SpanId,
    /// Operation name.
    pub name: Cow<'static, str>,
    /// When the span started.
    pub start_time: SystemTime,
    /// When the span ended.
    pub end_time: SystemTime,
    /// Attributes in insertion order, one entry per key.
    pub attributes: Vec<KeyValue>,
    /// Final status of the span.
    pub status: Status,
}

impl SpanData {
    /// Returns `true` if this is a root span.
    pub fn is_root(&self) -> bool {
        self.parent_span_id == SpanId::INVALID
    }
}

/// `SpanExporter` defines the interface that protocol-specific exporters
/// must implement so they can be plugged into the trace pipeline.
///
/// The pipeline calls `export` from a single worker thread, one batch at a
/// time; implementations do not need to be re-entrant. An `Err` return is
/// treated as transient and retried under the pipeline's retry policy, so
/// exporters should fail fast and apply any per-attempt timeout themselves.
pub trait SpanExporter: Send + Debug {
    /// Exports a batch of finished spans.
    ///
    /// Batches are never empty and never exceed the processor's configured
    /// maximum batch size.
    fn export(&mut self, batch: Vec<SpanData>) -> BoxFuture<'static, ExportResult>;

    /// Shuts down the exporter. Called at most once, after the final drain.
    fn shutdown(&mut self) {}

    /// Set the resource describing the producing entity for subsequent
    /// exports.
    fn set_resource(&mut self, _resource: &Resource) {}
}

impl SpanExporter for Box<dyn SpanExporter> {
    fn export(&mut self, batch: Vec<SpanData>) -> BoxFuture<'static, ExportResult> {
        (**self).export(batch)
    }

    fn shutdown(&mut self) {
        (**self).shutdown()
    }

    fn set_resource(&mut self, resource: &Resource) {
        (**self).set_resource(resource)
    }
}
