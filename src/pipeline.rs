//! The assembled telemetry pipeline.
//!
//! [`Pipeline`] bundles a [`TracerProvider`], a [`Meter`] and the batch
//! export machinery behind one handle. There is deliberately no global,
//! process-wide pipeline: the application builds one, clones the handle
//! (or the tracers and counters it hands out) wherever telemetry is
//! produced, and shuts it down explicitly at exit. This keeps ownership
//! visible and lets tests run isolated pipelines side by side.
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
//! let orders = pipeline.meter().create_counter("checkout.orders").unwrap();
//!
//! tracer.in_span("checkout", |_cx| {
//!     orders.add(1.0, &[KeyValue::new("payment.method", "card")]).unwrap();
//! });
//!
//! pipeline.shutdown().unwrap();
//! assert_eq!(exporter.get_finished_spans().unwrap().len(), 1);
//! ```

use crate::error::{TelemetryError, TelemetryResult};
use crate::metrics::{Meter, MetricsExporter, Temporality};
use crate::resource::Resource;
use crate::trace::{
    BatchConfig, BatchSpanProcessor, IdGenerator, PipelineStats, SpanExporter, SpanProcessor,
    Tracer, TracerProvider,
};
use std::borrow::Cow;
use std::fmt;
use std::sync::{Arc, Mutex};

/// A handle onto one telemetry pipeline: traces, metrics, and their
/// shared resource. Cheap to clone.
#[derive(Clone, Debug)]
pub struct Pipeline {
    inner: Arc<PipelineInner>,
}

struct PipelineInner {
    provider: TracerProvider,
    meter: Meter,
    metrics_exporter: Option<Mutex<Box<dyn MetricsExporter>>>,
    stats: PipelineStats,
}

impl PipelineInner {
    fn export_metrics(&self) -> TelemetryResult<()> {
        if let Some(exporter) = &self.metrics_exporter {
            let snapshot = self.meter.collect()?;
            exporter.lock()?.export(snapshot)?;
        }
        Ok(())
    }
}

impl fmt::Debug for PipelineInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineInner")
            .field("resource", self.provider.resource())
            .finish()
    }
}

impl Pipeline {
    /// Create a [`PipelineBuilder`].
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    /// A tracer creating spans in this pipeline.
    pub fn tracer(&self) -> Tracer {
        self.inner.provider.tracer()
    }

    /// The pipeline's meter.
    pub fn meter(&self) -> Meter {
        self.inner.meter.clone()
    }

    /// The underlying tracer provider, for advanced wiring.
    pub fn tracer_provider(&self) -> &TracerProvider {
        &self.inner.provider
    }

    /// The resource stamped onto this pipeline's telemetry.
    pub fn resource(&self) -> &Resource {
        self.inner.provider.resource()
    }

    /// Health counters of the span export path.
    pub fn stats(&self) -> PipelineStats {
        self.inner.stats.clone()
    }

    /// Export all buffered spans and a metrics collection, blocking until
    /// done or timed out. Both halves are attempted even if one fails; the
    /// span-side error wins when both do.
    pub fn force_flush(&self) -> TelemetryResult<()> {
        let spans = self.inner.provider.force_flush();
        let metrics = self.inner.export_metrics();
        spans.and(metrics)
    }

    /// Export metrics one final time, then drain buffered spans and shut
    /// the pipeline down. Terminal: spans started afterwards are inert and
    /// counter increments still aggregate but are no longer exported
    /// anywhere.
    pub fn shutdown(&self) -> TelemetryResult<()> {
        if self.inner.provider.is_shutdown() {
            return Err(TelemetryError::AlreadyShutdown);
        }
        let metrics = self.inner.export_metrics();
        if let Some(exporter) = &self.inner.metrics_exporter {
            if let Ok(mut exporter) = exporter.lock() {
                exporter.shutdown();
            }
        }
        let spans = self.inner.provider.shutdown();
        spans.and(metrics)
    }
}

/// Builder for [`Pipeline`].
#[derive(Default)]
pub struct PipelineBuilder {
    exporter: Option<Box<dyn SpanExporter>>,
    metrics_exporter: Option<Box<dyn MetricsExporter>>,
    batch_config: Option<BatchConfig>,
    extra_processors: Vec<Box<dyn SpanProcessor>>,
    resource: Option<Resource>,
    service_name: Option<Cow<'static, str>>,
    temporality: Temporality,
    id_generator: Option<Box<dyn IdGenerator>>,
}

impl fmt::Debug for PipelineBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineBuilder")
            .field("has_exporter", &self.exporter.is_some())
            .field("has_metrics_exporter", &self.metrics_exporter.is_some())
            .field("service_name", &self.service_name)
            .field("temporality", &self.temporality)
            .finish()
    }
}

impl PipelineBuilder {
    /// Export finished spans through the given exporter, batched on a
    /// background thread.
    pub fn with_exporter<E: SpanExporter + 'static>(mut self, exporter: E) -> Self {
        self.exporter = Some(Box::new(exporter));
        self
    }

    /// Export metrics collections through the given exporter on every
    /// flush and once more at shutdown.
    pub fn with_metrics_exporter<M: MetricsExporter + 'static>(mut self, exporter: M) -> Self {
        self.metrics_exporter = Some(Box::new(exporter));
        self
    }

    /// Override the default [`BatchConfig`] for the batch processor
    /// created by [`with_exporter`](Self::with_exporter).
    pub fn with_batch_config(mut self, config: BatchConfig) -> Self {
        self.batch_config = Some(config);
        self
    }

    /// Register an additional, pre-built [`SpanProcessor`].
    pub fn with_span_processor<P: SpanProcessor + 'static>(mut self, processor: P) -> Self {
        self.extra_processors.push(Box::new(processor));
        self
    }

    /// Set the pipeline's resource.
    pub fn with_resource(mut self, resource: Resource) -> Self {
        self.resource = Some(resource);
        self
    }

    /// Shorthand for a resource carrying only `service.name`. Merged into
    /// the resource given to [`with_resource`](Self::with_resource), if any.
    pub fn with_service_name(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.service_name = Some(name.into());
        self
    }

    /// Set the metrics collection [`Temporality`]. Defaults to
    /// [`Temporality::Cumulative`].
    pub fn with_temporality(mut self, temporality: Temporality) -> Self {
        self.temporality = temporality;
        self
    }

    /// Replace the default random id generator.
    pub fn with_id_generator<G: IdGenerator + 'static>(mut self, id_generator: G) -> Self {
        self.id_generator = Some(Box::new(id_generator));
        self
    }

    /// Assemble the [`Pipeline`].
    pub fn build(self) -> Pipeline {
        let mut resource = self.resource.unwrap_or_else(Resource::empty);
        if let Some(name) = self.service_name {
            resource = Resource::builder()
                .with_attributes(resource.iter().map(|(k, v)| crate::KeyValue {
                    key: k.clone(),
                    value: v.clone(),
                }))
                .with_service_name(name)
                .build();
        }

        let mut provider_builder = TracerProvider::builder().with_resource(resource);
        if let Some(id_generator) = self.id_generator {
            provider_builder = provider_builder.with_id_generator(id_generator);
        }

        let mut stats = PipelineStats::default();
        if let Some(exporter) = self.exporter {
            let processor = BatchSpanProcessor::with_config(
                exporter,
                self.batch_config.unwrap_or_default(),
            );
            stats = processor.stats();
            provider_builder = provider_builder.with_span_processor(processor);
        }
        for processor in self.extra_processors {
            provider_builder = provider_builder.with_span_processor(processor);
        }
        let provider = provider_builder.build();

        let metrics_exporter = self.metrics_exporter.map(|mut exporter| {
            exporter.set_resource(provider.resource());
            Mutex::new(exporter)
        });

        Pipeline {
            inner: Arc::new(PipelineInner {
                provider,
                meter: Meter::new(self.temporality),
                metrics_exporter,
                stats,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::InMemorySpanExporter;
    use crate::{Key, KeyValue, Value};

    #[test]
    fn service_name_lands_in_resource() {
        let exporter = InMemorySpanExporter::default();
        let pipeline = Pipeline::builder()
            .with_service_name("checkout-service")
            .with_resource(Resource::new([KeyValue::new("deployment.environment", "ci")]))
            .with_exporter(exporter.clone())
            .build();

        assert_eq!(
            pipeline.resource().get(&Key::from_static_str("service.name")),
            Some(&Value::from("checkout-service"))
        );
        assert_eq!(
            pipeline
                .resource()
                .get(&Key::from_static_str("deployment.environment")),
            Some(&Value::from("ci"))
        );
        assert_eq!(exporter.resource().unwrap(), *pipeline.resource());
        pipeline.shutdown().unwrap();
    }

    #[test]
    fn clones_share_one_pipeline() {
        let exporter = InMemorySpanExporter::default();
        let pipeline = Pipeline::builder().with_exporter(exporter.clone()).build();
        let clone = pipeline.clone();

        clone.tracer().start("from-clone").end();
        pipeline.force_flush().unwrap();
        assert_eq!(exporter.get_finished_spans().unwrap().len(), 1);
        assert_eq!(pipeline.stats().exported_spans(), 1);

        pipeline.shutdown().unwrap();
        assert_eq!(
            clone.shutdown(),
            Err(crate::TelemetryError::AlreadyShutdown)
        );
    }

    #[test]
    fn metrics_are_exported_on_flush_and_shutdown() {
        let metrics = crate::metrics::InMemoryMetricsExporter::default();
        let pipeline = Pipeline::builder()
            .with_metrics_exporter(metrics.clone())
            .build();
        let orders = pipeline.meter().create_counter("orders").unwrap();

        orders.add(2.0, &[]).unwrap();
        pipeline.force_flush().unwrap();
        orders.add(1.0, &[]).unwrap();
        pipeline.shutdown().unwrap();

        let collections = metrics.get_snapshots().unwrap();
        assert_eq!(collections.len(), 2);
        assert_eq!(collections[0][0].value(&[]), Some(2.0));
        // cumulative temporality: the final export carries the total
        assert_eq!(collections[1][0].value(&[]), Some(3.0));
    }

    #[test]
    fn meter_survives_shutdown() {
        let pipeline = Pipeline::builder().build();
        let counter = pipeline.meter().create_counter("orders").unwrap();
        counter.add(1.0, &[]).unwrap();
        pipeline.shutdown().unwrap();
        counter.add(1.0, &[]).unwrap();
        assert_eq!(pipeline.meter().collect().unwrap()[0].value(&[]), Some(2.0));
    }
}
