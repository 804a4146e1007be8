//! Errors surfaced by the telemetry pipeline.
//!
//! Failures inside the pipeline never propagate into the instrumented
//! application's request path; they are returned from the telemetry API
//! calls themselves so callers can observe them, and are otherwise counted
//! and logged internally.

use std::sync::PoisonError;
use std::time::Duration;
use thiserror::Error;

/// Result type returned by fallible pipeline operations.
pub type TelemetryResult<T> = Result<T, TelemetryError>;

/// Errors produced by the telemetry pipeline.
#[derive(Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum TelemetryError {
    /// Attempted to mutate a span that has already ended.
    #[error("span has already ended")]
    InvalidState,

    /// An argument violated an instrument's contract, e.g. a negative
    /// counter increment.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The exporter rejected a batch. Transient failures are retried before
    /// this error is surfaced.
    #[error("export failed: {0}")]
    ExportFailed(String),

    /// A flush or shutdown did not complete within its configured bound.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Operation attempted after the pipeline was shut down.
    #[error("pipeline has already shut down")]
    AlreadyShutdown,

    /// Other failures not covered by the variants above.
    #[error("{0}")]
    Other(String),
}

impl<T> From<PoisonError<T>> for TelemetryError {
    fn from(err: PoisonError<T>) -> Self {
        TelemetryError::Other(err.to_string())
    }
}
