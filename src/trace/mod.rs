//! Distributed tracing: span lifecycle, context identifiers, and the
//! batching/export subsystem.
//!
//! Spans are created by a [`Tracer`] obtained from a [`TracerProvider`].
//! Finished spans are handed to the provider's [`SpanProcessor`]s, the
//! default being the [`BatchSpanProcessor`] which buffers them and flushes
//! to a [`SpanExporter`] on a dedicated worker thread.

mod export;
mod id_generator;
mod in_memory_exporter;
mod provider;
mod span;
mod span_processor;
mod tracer;

pub use export::{ExportResult, SpanData, SpanExporter};
pub use id_generator::{IdGenerator, IncrementIdGenerator, RandomIdGenerator};
pub use in_memory_exporter::InMemorySpanExporter;
pub use provider::{Config, TracerProvider, TracerProviderBuilder};
pub use span::Span;
pub use span_processor::{
    BackpressurePolicy, BatchConfig, BatchConfigBuilder, BatchSpanProcessor, PipelineStats,
    SimpleSpanProcessor, SpanProcessor,
};
pub use tracer::Tracer;

use std::borrow::Cow;
use std::fmt;

/// A 128-bit identifier shared by every span in one trace.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TraceId(u128);

impl TraceId {
    /// Invalid trace id, used by spans from a shut-down provider.
    pub const INVALID: TraceId = TraceId(0);

    /// Construct a trace id from its representation as a `u128`.
    pub const fn from_u128(value: u128) -> Self {
        TraceId(value)
    }

    /// The underlying `u128` representation.
    pub const fn to_u128(self) -> u128 {
        self.0
    }
}

impl From<u128> for TraceId {
    fn from(value: u128) -> Self {
        TraceId(value)
    }
}

impl fmt::Debug for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// A 64-bit identifier unique to a single span within a trace.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpanId(u64);

impl SpanId {
    /// Invalid span id, used as the parent id of root spans.
    pub const INVALID: SpanId = SpanId(0);

    /// Construct a span id from its representation as a `u64`.
    pub const fn from_u64(value: u64) -> Self {
        SpanId(value)
    }

    /// The underlying `u64` representation.
    pub const fn to_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for SpanId {
    fn from(value: u64) -> Self {
        SpanId(value)
    }
}

impl fmt::Debug for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Immutable identity of a span: its trace id and span id.
///
/// Created when a span is started and never mutated afterwards. The trace
/// id is inherited from the active parent span if there is one.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SpanContext {
    trace_id: TraceId,
    span_id: SpanId,
}

impl SpanContext {
    /// An invalid span context.
    pub const NONE: SpanContext = SpanContext {
        trace_id: TraceId::INVALID,
        span_id: SpanId::INVALID,
    };

    /// Construct a new `SpanContext`.
    pub fn new(trace_id: TraceId, span_id: SpanId) -> Self {
        SpanContext { trace_id, span_id }
    }

    /// The [`TraceId`] for this span context.
    pub fn trace_id(&self) -> TraceId {
        self.trace_id
    }

    /// The [`SpanId`] for this span context.
    pub fn span_id(&self) -> SpanId {
        self.span_id
    }

    /// Returns `true` if both ids are non-zero.
    pub fn is_valid(&self) -> bool {
        self.trace_id != TraceId::INVALID && self.span_id != SpanId::INVALID
    }
}

/// The status of a finished span.
///
/// These values form a total order: `Ok > Error > Unset`, so an explicit
/// `Ok` cannot be downgraded and `Unset` never overrides anything.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Status {
    /// The default status.
    #[default]
    Unset,

    /// The operation contains an error.
    Error {
        /// The description of the error
        description: Cow<'static, str>,
    },

    /// The operation has been validated to have completed successfully.
    Ok,
}

impl Status {
    /// Create an error status with the given description.
    pub fn error(description: impl Into<Cow<'static, str>>) -> Self {
        Status::Error {
            description: description.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_hex_formatting() {
        assert_eq!(
            TraceId::from_u128(0xdead_beef).to_string(),
            "000000000000000000000000deadbeef"
        );
        assert_eq!(SpanId::from_u64(42).to_string(), "000000000000002a");
    }

    #[test]
    fn status_precedence() {
        assert!(Status::Ok > Status::error("boom"));
        assert!(Status::error("boom") > Status::Unset);
    }

    #[test]
    fn invalid_context() {
        assert!(!SpanContext::NONE.is_valid());
        assert!(SpanContext::new(TraceId::from_u128(1), SpanId::from_u64(1)).is_valid());
    }
}
