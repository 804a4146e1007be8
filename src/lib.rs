//! An in-process telemetry pipeline: spans, counters, and trace-correlated
//! logs with batched, retrying export.
//!
//! # Overview
//!
//! Instrumented code records three kinds of telemetry:
//!
//! - **Spans** describe timed operations. A [`trace::Tracer`] starts them,
//!   the active span propagates through the thread-local [`Context`], and
//!   finished spans flow through a [`trace::SpanProcessor`] to a
//!   [`trace::SpanExporter`]. The default [`trace::BatchSpanProcessor`]
//!   batches spans on a dedicated worker thread with a bounded queue,
//!   retry with exponential backoff, and a drain on shutdown, keeping
//!   exporter latency off the application's request path.
//! - **Counters** aggregate increments per attribute set inside a
//!   [`metrics::Meter`], collected on demand with cumulative or delta
//!   temporality.
//! - **Log records** are ordinary `tracing` events; the
//!   [`logs::CorrelationLayer`] stamps them with the ids of the active
//!   span so logs and traces join up in the backend.
//!
//! Everything hangs off an explicitly owned [`Pipeline`] handle; there is
//! no global, process-wide pipeline.
//!
//! # Getting started
//!
//! ```
//! use tracepipe::trace::InMemorySpanExporter;
//! use tracepipe::{KeyValue, Pipeline};
//!
//! let exporter = InMemorySpanExporter::default();
//! let pipeline = Pipeline::builder()
//!     .with_service_name("checkout-service")
//!     .with_exporter(exporter.clone())
//!     .build();
//!
//! let tracer = pipeline.tracer();
//! let orders = pipeline.meter().create_counter("checkout.orders")?;
//!
//! tracer.in_span("checkout", |cx| {
//!     cx.span()
//!         .set_attribute(KeyValue::new("payment.method", "card"))
//!         .ok();
//!     orders.add(1.0, &[KeyValue::new("payment.method", "card")]).ok();
//! });
//!
//! pipeline.shutdown()?;
//! assert_eq!(exporter.get_finished_spans()?.len(), 1);
//! # Ok::<(), tracepipe::TelemetryError>(())
//! ```

#![warn(missing_debug_implementations, missing_docs, unreachable_pub)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod common;
mod context;
mod error;
mod pipeline;
mod retry;

pub mod logs;
pub mod metrics;
pub mod resource;
pub mod trace;

pub use common::{Key, KeyValue, Value};
pub use context::{Context, ContextGuard, FutureExt, SpanRef, WithContext};
pub use error::{TelemetryError, TelemetryResult};
pub use pipeline::{Pipeline, PipelineBuilder};
pub use resource::{Resource, ResourceBuilder};
pub use retry::RetryPolicy;
