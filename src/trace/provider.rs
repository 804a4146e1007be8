//! # Tracer Provider
//!
//! The [`TracerProvider`] owns the trace half of the pipeline: the id
//! generator, the resource, and the chain of [`SpanProcessor`]s that
//! finished spans flow through. It hands out [`Tracer`]s, which are cheap
//! clones of a shared handle.
//!
//! Shutting the provider down is terminal: processors drain and release
//! their worker threads, and any tracer created from the provider starts
//! only inert, non-recording spans from then on. Dropping the last handle
//! shuts the provider down implicitly.

use crate::error::{TelemetryError, TelemetryResult};
use crate::resource::Resource;
use crate::trace::{
    IdGenerator, RandomIdGenerator, SpanData, SpanProcessor, Tracer,
};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Creator and registry of [`Tracer`]s, owner of the span pipeline.
#[derive(Clone, Debug)]
pub struct TracerProvider {
    inner: Arc<TracerProviderInner>,
}

struct TracerProviderInner {
    processors: Vec<Box<dyn SpanProcessor>>,
    config: Config,
    is_shutdown: AtomicBool,
}

impl TracerProviderInner {
    /// Shuts down the inner processors, returning the first error.
    fn shutdown(&self) -> TelemetryResult<()> {
        let mut result = Ok(());
        for processor in &self.processors {
            if let Err(err) = processor.shutdown() {
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        result
    }
}

impl Drop for TracerProviderInner {
    fn drop(&mut self) {
        if !self.is_shutdown.load(Ordering::Relaxed) {
            if let Err(err) = self.shutdown() {
                warn!(
                    name: "telemetry.provider.drop_shutdown_failed",
                    error = %err,
                    "tracer provider shutdown failed in drop"
                );
            }
        }
    }
}

impl fmt::Debug for TracerProviderInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TracerProviderInner")
            .field("processors", &self.processors.len())
            .field("config", &self.config)
            .finish()
    }
}

/// Shared configuration of a [`TracerProvider`].
#[derive(Debug)]
pub struct Config {
    /// Generator of trace and span ids.
    pub id_generator: Box<dyn IdGenerator>,
    /// Attributes describing the producing entity.
    pub resource: Resource,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            id_generator: Box::<RandomIdGenerator>::default(),
            resource: Resource::empty(),
        }
    }
}

impl TracerProvider {
    /// Create a [`TracerProviderBuilder`].
    pub fn builder() -> TracerProviderBuilder {
        TracerProviderBuilder::default()
    }

    /// Create a [`Tracer`] backed by this provider.
    pub fn tracer(&self) -> Tracer {
        Tracer::new(self.clone())
    }

    pub(crate) fn config(&self) -> &Config {
        &self.inner.config
    }

    /// The resource this provider stamps on its telemetry.
    pub fn resource(&self) -> &Resource {
        &self.inner.config.resource
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.inner.is_shutdown.load(Ordering::Relaxed)
    }

    /// Delivers a finished span to every registered processor.
    pub(crate) fn on_span_end(&self, span: SpanData) {
        if self.is_shutdown() {
            return;
        }
        let processors = &self.inner.processors;
        // clone for all but the last processor
        for processor in processors.iter().take(processors.len().saturating_sub(1)) {
            processor.on_end(span.clone());
        }
        if let Some(last) = processors.last() {
            last.on_end(span);
        }
    }

    /// Asks every processor to export its buffered spans, blocking until
    /// done. Returns the first error encountered.
    pub fn force_flush(&self) -> TelemetryResult<()> {
        if self.is_shutdown() {
            return Err(TelemetryError::AlreadyShutdown);
        }
        let mut result = Ok(());
        for processor in &self.inner.processors {
            if let Err(err) = processor.force_flush() {
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        result
    }

    /// Drains and shuts down every processor. Terminal and idempotent;
    /// the second and later calls fail with
    /// [`TelemetryError::AlreadyShutdown`].
    pub fn shutdown(&self) -> TelemetryResult<()> {
        if self
            .inner
            .is_shutdown
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.inner.shutdown()
        } else {
            Err(TelemetryError::AlreadyShutdown)
        }
    }
}

/// Builder for [`TracerProvider`].
#[derive(Debug, Default)]
pub struct TracerProviderBuilder {
    processors: Vec<Box<dyn SpanProcessor>>,
    id_generator: Option<Box<dyn IdGenerator>>,
    resource: Option<Resource>,
}

impl TracerProviderBuilder {
    /// Append a [`SpanProcessor`] to the pipeline. Finished spans visit
    /// processors in registration order.
    pub fn with_span_processor<T: SpanProcessor + 'static>(mut self, processor: T) -> Self {
        self.processors.push(Box::new(processor));
        self
    }

    /// Replace the default random [`IdGenerator`].
    pub fn with_id_generator<T: IdGenerator + 'static>(mut self, id_generator: T) -> Self {
        self.id_generator = Some(Box::new(id_generator));
        self
    }

    /// Set the [`Resource`] describing the producing entity.
    pub fn with_resource(mut self, resource: Resource) -> Self {
        self.resource = Some(resource);
        self
    }

    /// Build the configured [`TracerProvider`].
    pub fn build(self) -> TracerProvider {
        let mut config = Config::default();
        if let Some(id_generator) = self.id_generator {
            config.id_generator = id_generator;
        }
        if let Some(resource) = self.resource {
            config.resource = resource;
        }

        let mut processors = self.processors;
        for processor in &mut processors {
            processor.set_resource(&config.resource);
        }

        TracerProvider {
            inner: Arc::new(TracerProviderInner {
                processors,
                config,
                is_shutdown: AtomicBool::new(false),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{BatchSpanProcessor, InMemorySpanExporter, SimpleSpanProcessor};
    use crate::KeyValue;

    #[test]
    fn shutdown_is_terminal_and_idempotent() {
        let exporter = InMemorySpanExporter::default();
        let provider = TracerProvider::builder()
            .with_span_processor(BatchSpanProcessor::new(exporter.clone()))
            .build();

        let tracer = provider.tracer();
        tracer.start("before").end();

        provider.shutdown().unwrap();
        assert_eq!(exporter.get_finished_spans().unwrap().len(), 1);
        assert_eq!(provider.shutdown(), Err(TelemetryError::AlreadyShutdown));
        assert_eq!(provider.force_flush(), Err(TelemetryError::AlreadyShutdown));
    }

    #[test]
    fn spans_after_shutdown_are_inert() {
        let exporter = InMemorySpanExporter::default();
        let provider = TracerProvider::builder()
            .with_span_processor(SimpleSpanProcessor::new(exporter.clone()))
            .build();
        let tracer = provider.tracer();
        provider.shutdown().unwrap();

        let mut span = tracer.start("late");
        assert!(!span.is_recording());
        assert!(!span.span_context().is_valid());
        span.end();
        assert!(exporter.get_finished_spans().unwrap().is_empty());
    }

    #[test]
    fn drop_flushes_pending_spans() {
        let exporter = InMemorySpanExporter::default();
        {
            let provider = TracerProvider::builder()
                .with_span_processor(BatchSpanProcessor::new(exporter.clone()))
                .build();
            provider.tracer().start("pending").end();
        }
        assert_eq!(exporter.get_finished_spans().unwrap().len(), 1);
        assert!(exporter.is_shutdown());
    }

    #[test]
    fn resource_reaches_exporter() {
        let exporter = InMemorySpanExporter::default();
        let resource = Resource::builder().with_service_name("checkout-service").build();
        let provider = TracerProvider::builder()
            .with_span_processor(SimpleSpanProcessor::new(exporter.clone()))
            .with_resource(resource.clone())
            .build();

        assert_eq!(exporter.resource().unwrap(), resource);
        assert_eq!(provider.resource(), &resource);
    }

    #[test]
    fn every_processor_sees_each_span() {
        let first = InMemorySpanExporter::default();
        let second = InMemorySpanExporter::default();
        let provider = TracerProvider::builder()
            .with_span_processor(SimpleSpanProcessor::new(first.clone()))
            .with_span_processor(SimpleSpanProcessor::new(second.clone()))
            .build();

        let mut span = provider.tracer().start("op");
        span.set_attribute(KeyValue::new("shared", true)).unwrap();
        span.end();

        assert_eq!(first.get_finished_spans().unwrap().len(), 1);
        assert_eq!(second.get_finished_spans().unwrap().len(), 1);
    }
}
