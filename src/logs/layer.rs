use crate::context::Context;
use crate::logs::{LogRecord, LogSink};
use crate::KeyValue;
use std::time::SystemTime;
use tracing_core::{Event, Subscriber};
use tracing_subscriber::layer::Context as LayerContext;
use tracing_subscriber::Layer;

/// A `tracing` layer that converts events into [`LogRecord`]s correlated
/// with the active span.
///
/// If a span is active on the emitting thread when the event fires, its
/// trace and span ids are stamped onto the record; otherwise both are
/// `None` and the record is still delivered.
///
/// # Example
/// ```
/// use tracing_subscriber::prelude::*;
/// use tracepipe::logs::{CorrelationLayer, InMemoryLogSink};
///
/// let sink = InMemoryLogSink::default();
/// let subscriber = tracing_subscriber::registry()
///     .with(CorrelationLayer::new(sink.clone()));
///
/// tracing::subscriber::with_default(subscriber, || {
///     tracing::info!(order_id = 7, "order placed");
/// });
/// assert_eq!(sink.get_records()[0].body, "order placed");
/// ```
#[derive(Debug)]
pub struct CorrelationLayer<K: LogSink> {
    sink: K,
}

impl<K: LogSink> CorrelationLayer<K> {
    /// Create a layer delivering records to the given sink.
    pub fn new(sink: K) -> Self {
        CorrelationLayer { sink }
    }
}

impl<S, K> Layer<S> for CorrelationLayer<K>
where
    S: Subscriber,
    K: LogSink + 'static,
{
    fn on_event(&self, event: &Event<'_>, _ctx: LayerContext<'_, S>) {
        let mut visitor = EventVisitor::default();
        event.record(&mut visitor);

        let (trace_id, span_id) = Context::map_current(|cx| {
            let span_context = cx.span().span_context().clone();
            if span_context.is_valid() {
                (Some(span_context.trace_id()), Some(span_context.span_id()))
            } else {
                (None, None)
            }
        });

        let meta = event.metadata();
        self.sink.emit(LogRecord {
            timestamp: SystemTime::now(),
            severity: meta.level().into(),
            target: meta.target().to_string(),
            body: visitor.body.unwrap_or_default(),
            attributes: visitor.attributes,
            trace_id,
            span_id,
        });
    }
}

#[derive(Default)]
struct EventVisitor {
    body: Option<String>,
    attributes: Vec<KeyValue>,
}

impl tracing::field::Visit for EventVisitor {
    fn record_debug(&mut self, field: &tracing_core::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.body = Some(format!("{value:?}"));
        } else {
            self.attributes
                .push(KeyValue::new(field.name().to_string(), format!("{value:?}")));
        }
    }

    fn record_str(&mut self, field: &tracing_core::Field, value: &str) {
        if field.name() == "message" {
            self.body = Some(value.to_string());
        } else {
            self.attributes
                .push(KeyValue::new(field.name().to_string(), value.to_string()));
        }
    }

    fn record_bool(&mut self, field: &tracing_core::Field, value: bool) {
        self.attributes
            .push(KeyValue::new(field.name().to_string(), value));
    }

    fn record_f64(&mut self, field: &tracing_core::Field, value: f64) {
        self.attributes
            .push(KeyValue::new(field.name().to_string(), value));
    }

    fn record_i64(&mut self, field: &tracing_core::Field, value: i64) {
        self.attributes
            .push(KeyValue::new(field.name().to_string(), value));
    }

    fn record_u64(&mut self, field: &tracing_core::Field, value: u64) {
        match i64::try_from(value) {
            Ok(signed) => self
                .attributes
                .push(KeyValue::new(field.name().to_string(), signed)),
            Err(_) => self
                .attributes
                .push(KeyValue::new(field.name().to_string(), value.to_string())),
        }
    }

    fn record_error(
        &mut self,
        field: &tracing_core::Field,
        value: &(dyn std::error::Error + 'static),
    ) {
        self.attributes
            .push(KeyValue::new(field.name().to_string(), value.to_string()));
    }
}
