use crate::error::TelemetryResult;
use crate::resource::Resource;
use crate::trace::{ExportResult, SpanData, SpanExporter};
use futures_util::future::BoxFuture;
use std::sync::{Arc, Mutex};

/// An in-memory span exporter that stores span data in memory.
///
/// Useful for testing and debugging. Finished spans are kept in a
/// `Vec<SpanData>` and retrieved with
/// [`get_finished_spans`](InMemorySpanExporter::get_finished_spans).
/// Clones share the same storage, so a clone handed to the pipeline can be
/// inspected from the test afterwards.
///
/// # Example
/// ```
/// use tracepipe::trace::{BatchSpanProcessor, InMemorySpanExporter, TracerProvider};
///
/// let exporter = InMemorySpanExporter::default();
/// let provider = TracerProvider::builder()
///     .with_span_processor(BatchSpanProcessor::new(exporter.clone()))
///     .build();
///
/// let tracer = provider.tracer();
/// tracer.in_span("say hello", |_cx| {});
///
/// provider.force_flush().unwrap();
/// for span in exporter.get_finished_spans().unwrap() {
///     println!("{:?}", span);
/// }
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemorySpanExporter {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
    spans: Vec<SpanData>,
    resource: Resource,
    is_shutdown: bool,
}

impl InMemorySpanExporter {
    /// Returns the finished spans received so far.
    ///
    /// # Errors
    ///
    /// Fails if the internal lock cannot be acquired.
    pub fn get_finished_spans(&self) -> TelemetryResult<Vec<SpanData>> {
        Ok(self.inner.lock()?.spans.clone())
    }

    /// The resource last recorded by the pipeline, if any.
    pub fn resource(&self) -> TelemetryResult<Resource> {
        Ok(self.inner.lock()?.resource.clone())
    }

    /// Returns `true` once the pipeline has shut this exporter down.
    pub fn is_shutdown(&self) -> bool {
        self.inner.lock().map(|inner| inner.is_shutdown).unwrap_or(false)
    }

    /// Clears the internal storage of finished spans.
    pub fn reset(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.spans.clear();
        }
    }
}

impl SpanExporter for InMemorySpanExporter {
    fn export(&mut self, mut batch: Vec<SpanData>) -> BoxFuture<'static, ExportResult> {
        let result = self
            .inner
            .lock()
            .map(|mut inner| inner.spans.append(&mut batch))
            .map_err(Into::into);
        Box::pin(std::future::ready(result))
    }

    fn shutdown(&mut self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.is_shutdown = true;
        }
    }

    fn set_resource(&mut self, resource: &Resource) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.resource = resource.clone();
        }
    }
}
