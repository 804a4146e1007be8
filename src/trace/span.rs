//! The recording half of a span's lifecycle.

use crate::error::{TelemetryError, TelemetryResult};
use crate::trace::provider::TracerProvider;
use crate::trace::{SpanContext, SpanData, SpanId, Status};
use crate::KeyValue;
use std::borrow::Cow;
use std::time::SystemTime;

/// A single operation within a trace, open until ended.
///
/// While open, attributes and status may be recorded. Ending the span
/// freezes it into a [`SpanData`] and hands it to the provider's span
/// processors; further mutation attempts fail with
/// [`TelemetryError::InvalidState`]. If a span is dropped without an
/// explicit `end`, it is ended at drop time so unwinding code paths still
/// produce telemetry.
#[derive(Debug)]
pub struct Span {
    span_context: SpanContext,
    data: Option<SpanState>,
    provider: TracerProvider,
}

/// The mutable portion of an open span, taken when the span ends.
#[derive(Debug)]
struct SpanState {
    parent_span_id: SpanId,
    name: Cow<'static, str>,
    start_time: SystemTime,
    attributes: Vec<KeyValue>,
    status: Status,
}

impl Span {
    pub(crate) fn new(
        span_context: SpanContext,
        parent_span_id: SpanId,
        name: Cow<'static, str>,
        provider: TracerProvider,
    ) -> Self {
        Span {
            span_context,
            data: Some(SpanState {
                parent_span_id,
                name,
                start_time: SystemTime::now(),
                attributes: Vec::new(),
                status: Status::Unset,
            }),
            provider,
        }
    }

    /// An inert span, handed out after provider shutdown. It records
    /// nothing and ending it never reaches a processor.
    pub(crate) fn new_noop(provider: TracerProvider) -> Self {
        Span {
            span_context: SpanContext::NONE,
            data: None,
            provider,
        }
    }

    /// The immutable identity of this span.
    pub fn span_context(&self) -> &SpanContext {
        &self.span_context
    }

    /// Returns `true` until the span has ended.
    pub fn is_recording(&self) -> bool {
        self.data.is_some()
    }

    /// Record an attribute on this span.
    ///
    /// Setting a key that is already present replaces its value in place,
    /// so each key appears at most once and keeps its original position.
    pub fn set_attribute(&mut self, attribute: KeyValue) -> TelemetryResult<()> {
        let data = self.data.as_mut().ok_or(TelemetryError::InvalidState)?;
        match data
            .attributes
            .iter_mut()
            .find(|existing| existing.key == attribute.key)
        {
            Some(existing) => existing.value = attribute.value,
            None => data.attributes.push(attribute),
        }
        Ok(())
    }

    /// Set the status of this span.
    ///
    /// Statuses only escalate: `Ok` beats `Error` beats `Unset`, so an
    /// explicit `Ok` cannot be downgraded by a later `Error`.
    pub fn set_status(&mut self, status: Status) -> TelemetryResult<()> {
        let data = self.data.as_mut().ok_or(TelemetryError::InvalidState)?;
        if status > data.status {
            data.status = status;
        }
        Ok(())
    }

    /// End the span with the current time. Ending twice is a no-op.
    pub fn end(&mut self) {
        self.end_with_timestamp(SystemTime::now());
    }

    /// End the span with the given timestamp. Ending twice is a no-op.
    pub fn end_with_timestamp(&mut self, end_time: SystemTime) {
        let Some(data) = self.data.take() else {
            return;
        };

        let status = match data.status {
            Status::Unset => Status::Ok,
            other => other,
        };
        let span_data = SpanData {
            span_context: self.span_context.clone(),
            parent_span_id: data.parent_span_id,
            name: data.name,
            start_time: data.start_time,
            end_time,
            attributes: data.attributes,
            status,
        };

        self.provider.on_span_end(span_data);
    }
}

impl Drop for Span {
    fn drop(&mut self) {
        if self.data.is_some() {
            self.end();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{InMemorySpanExporter, SimpleSpanProcessor, TracerProvider};
    use crate::{KeyValue, Value};

    fn test_pipeline() -> (TracerProvider, InMemorySpanExporter) {
        let exporter = InMemorySpanExporter::default();
        let provider = TracerProvider::builder()
            .with_span_processor(SimpleSpanProcessor::new(exporter.clone()))
            .build();
        (provider, exporter)
    }

    #[test]
    fn end_freezes_span() {
        let (provider, exporter) = test_pipeline();
        let mut span = provider.tracer().start("charge-card");
        assert!(span.is_recording());
        span.set_attribute(KeyValue::new("amount", 42.5)).unwrap();
        span.end();

        assert!(!span.is_recording());
        assert_eq!(
            span.set_attribute(KeyValue::new("late", true)),
            Err(TelemetryError::InvalidState)
        );
        assert_eq!(span.set_status(Status::Ok), Err(TelemetryError::InvalidState));

        let spans = exporter.get_finished_spans().unwrap();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].name, "charge-card");
        assert_eq!(spans[0].attributes, vec![KeyValue::new("amount", 42.5)]);
    }

    #[test]
    fn double_end_exports_once() {
        let (provider, exporter) = test_pipeline();
        let mut span = provider.tracer().start("op");
        span.end();
        span.end();
        drop(span);
        assert_eq!(exporter.get_finished_spans().unwrap().len(), 1);
    }

    #[test]
    fn drop_ends_open_span() {
        let (provider, exporter) = test_pipeline();
        {
            let _span = provider.tracer().start("abandoned");
        }
        assert_eq!(exporter.get_finished_spans().unwrap().len(), 1);
    }

    #[test]
    fn attribute_last_write_wins() {
        let (provider, exporter) = test_pipeline();
        let mut span = provider.tracer().start("op");
        span.set_attribute(KeyValue::new("result", "pending")).unwrap();
        span.set_attribute(KeyValue::new("retries", 1)).unwrap();
        span.set_attribute(KeyValue::new("result", "approved")).unwrap();
        span.end();

        let spans = exporter.get_finished_spans().unwrap();
        assert_eq!(spans[0].attributes.len(), 2);
        assert_eq!(spans[0].attributes[0].key.as_str(), "result");
        assert_eq!(spans[0].attributes[0].value, Value::from("approved"));
    }

    #[test]
    fn unset_status_becomes_ok_at_end() {
        let (provider, exporter) = test_pipeline();
        provider.tracer().start("op").end();
        assert_eq!(exporter.get_finished_spans().unwrap()[0].status, Status::Ok);
    }

    #[test]
    fn explicit_ok_is_not_downgraded() {
        let (provider, exporter) = test_pipeline();
        let mut span = provider.tracer().start("op");
        span.set_status(Status::Ok).unwrap();
        span.set_status(Status::error("payment declined")).unwrap();
        span.end();
        assert_eq!(exporter.get_finished_spans().unwrap()[0].status, Status::Ok);
    }

    #[test]
    fn error_status_survives_end() {
        let (provider, exporter) = test_pipeline();
        let mut span = provider.tracer().start("op");
        span.set_status(Status::error("payment declined")).unwrap();
        span.end();
        assert_eq!(
            exporter.get_finished_spans().unwrap()[0].status,
            Status::error("payment declined")
        );
    }
}
