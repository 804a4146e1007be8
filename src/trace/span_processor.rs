//! Span processors: the bridge between ended spans and exporters.
//!
//! # Span processor
//!
//! A span processor is notified of every finished span and decides how it
//! reaches the exporter. Two implementations are provided:
//!
//! - [`SimpleSpanProcessor`] exports each span inline on the thread that
//!   ended it. Simple and lossless, but it puts exporter latency on the
//!   application's critical path. Intended for tests and examples.
//! - [`BatchSpanProcessor`] buffers spans in a bounded queue and exports
//!   them in batches from a dedicated worker thread, off the application's
//!   critical path. This is the default choice for production.
//!
//! # Batching model
//!
//! The batch processor owns a queue of at most `max_queue_size` spans. The
//! worker drains it when a full batch of `max_export_batch_size` spans has
//! accumulated, when `scheduled_delay` elapses, on `force_flush`, and once
//! more during `shutdown`. When the queue is full, the configured
//! [`BackpressurePolicy`] decides which span is dropped; the application
//! thread never blocks.
//!
//! Failed exports are retried with exponential backoff per the configured
//! [`RetryPolicy`]. Shutdown cancels any in-progress backoff so the final
//! drain is a single best-effort attempt.

use crate::error::{TelemetryError, TelemetryResult};
use crate::resource::Resource;
use crate::retry::{retry_with_exponential_backoff, CancelToken, RetryPolicy};
use crate::trace::{SpanData, SpanExporter};
use std::collections::VecDeque;
use std::env;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Maximum queue size of the batch span processor.
pub(crate) const ENV_MAX_QUEUE_SIZE: &str = "TRACEPIPE_MAX_QUEUE_SIZE";
/// Delay interval, in milliseconds, between two consecutive scheduled exports.
pub(crate) const ENV_SCHEDULE_DELAY: &str = "TRACEPIPE_SCHEDULE_DELAY";
/// Maximum number of spans in a single export batch.
pub(crate) const ENV_MAX_EXPORT_BATCH_SIZE: &str = "TRACEPIPE_MAX_EXPORT_BATCH_SIZE";
/// Maximum time, in milliseconds, a flush or shutdown may wait for the worker.
pub(crate) const ENV_EXPORT_TIMEOUT: &str = "TRACEPIPE_EXPORT_TIMEOUT";

const DEFAULT_MAX_QUEUE_SIZE: usize = 2048;
const DEFAULT_SCHEDULE_DELAY: Duration = Duration::from_secs(5);
const DEFAULT_MAX_EXPORT_BATCH_SIZE: usize = 512;
const DEFAULT_EXPORT_TIMEOUT: Duration = Duration::from_secs(30);

/// Handles finished spans on their way to an exporter.
pub trait SpanProcessor: Send + Sync + Debug {
    /// Called when a span ends. Must not block the calling thread.
    fn on_end(&self, span: SpanData);

    /// Export all spans received so far, blocking until done or timed out.
    fn force_flush(&self) -> TelemetryResult<()>;

    /// Drain remaining spans and release resources. Idempotent.
    fn shutdown(&self) -> TelemetryResult<()>;

    /// Record the resource describing the producing entity. Called once,
    /// while the pipeline is being assembled.
    fn set_resource(&mut self, _resource: &Resource) {}
}

impl SpanProcessor for Box<dyn SpanProcessor> {
    fn on_end(&self, span: SpanData) {
        (**self).on_end(span)
    }

    fn force_flush(&self) -> TelemetryResult<()> {
        (**self).force_flush()
    }

    fn shutdown(&self) -> TelemetryResult<()> {
        (**self).shutdown()
    }

    fn set_resource(&mut self, resource: &Resource) {
        (**self).set_resource(resource)
    }
}

/// What to do with a new span when the batch queue is full.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BackpressurePolicy {
    /// Evict the oldest queued span to make room. Recent telemetry is
    /// usually the telemetry being debugged, so this is the default.
    #[default]
    DropOldest,
    /// Drop the incoming span, keeping the queue as is.
    DropNewest,
}

/// Counters exposing the pipeline's health to the host application.
///
/// All counters are monotonic totals since the processor was created.
/// Cloning yields a handle onto the same underlying counters.
#[derive(Clone, Debug, Default)]
pub struct PipelineStats {
    pub(crate) exported_spans: Arc<AtomicUsize>,
    pub(crate) dropped_spans: Arc<AtomicUsize>,
    pub(crate) export_failures: Arc<AtomicUsize>,
}

impl PipelineStats {
    /// Spans successfully handed to the exporter.
    pub fn exported_spans(&self) -> usize {
        self.exported_spans.load(Ordering::Relaxed)
    }

    /// Spans dropped under backpressure or after shutdown.
    pub fn dropped_spans(&self) -> usize {
        self.dropped_spans.load(Ordering::Relaxed)
    }

    /// Batches whose export failed after exhausting retries.
    pub fn export_failures(&self) -> usize {
        self.export_failures.load(Ordering::Relaxed)
    }
}

/// A [SpanProcessor] that passes finished spans to the configured
/// `SpanExporter` as soon as they are ended, one span per export call.
#[derive(Debug)]
pub struct SimpleSpanProcessor<T: SpanExporter> {
    exporter: Mutex<T>,
    is_shutdown: AtomicBool,
}

impl<T: SpanExporter> SimpleSpanProcessor<T> {
    /// Create a new [SimpleSpanProcessor] using the provided exporter.
    pub fn new(exporter: T) -> Self {
        Self {
            exporter: Mutex::new(exporter),
            is_shutdown: AtomicBool::new(false),
        }
    }
}

impl<T: SpanExporter> SpanProcessor for SimpleSpanProcessor<T> {
    fn on_end(&self, span: SpanData) {
        if self.is_shutdown.load(Ordering::Relaxed) {
            warn!(
                name: "telemetry.processor.simple.on_end_after_shutdown",
                "span dropped, processor already shut down"
            );
            return;
        }

        let result = self
            .exporter
            .lock()
            .map_err(TelemetryError::from)
            .and_then(|mut exporter| futures_executor::block_on(exporter.export(vec![span])));

        if let Err(err) = result {
            error!(
                name: "telemetry.processor.simple.export_failed",
                error = %err,
                "failed to export span"
            );
        }
    }

    fn force_flush(&self) -> TelemetryResult<()> {
        // spans are exported inline, nothing is buffered
        Ok(())
    }

    fn shutdown(&self) -> TelemetryResult<()> {
        if self.is_shutdown.swap(true, Ordering::Relaxed) {
            return Err(TelemetryError::AlreadyShutdown);
        }
        let mut exporter = self.exporter.lock()?;
        exporter.shutdown();
        Ok(())
    }

    fn set_resource(&mut self, resource: &Resource) {
        if let Ok(exporter) = self.exporter.get_mut() {
            exporter.set_resource(resource);
        }
    }
}

/// Messages sent from the processor handle to the worker thread.
#[derive(Debug)]
enum ControlMessage {
    /// The queue holds at least one full batch.
    BatchReady,
    /// Drain everything and reply on the channel.
    ForceFlush(SyncSender<TelemetryResult<()>>),
    /// Drain everything, shut the exporter down, reply, and exit.
    Shutdown(SyncSender<TelemetryResult<()>>),
    /// Forward the pipeline resource to the exporter.
    SetResource(Resource),
}

/// A [SpanProcessor] that buffers finished spans and exports them in
/// batches from a dedicated background thread.
///
/// Independent of any async runtime: the worker is a plain OS thread and
/// the exporter future is driven to completion with a lightweight local
/// executor. `on_end` only takes a queue lock and possibly sends a wakeup
/// message, so ending a span stays cheap and non-blocking.
#[derive(Debug)]
pub struct BatchSpanProcessor {
    control_sender: mpsc::Sender<ControlMessage>,
    queue: Arc<Mutex<VecDeque<SpanData>>>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
    is_shutdown: AtomicBool,
    cancel: Arc<CancelToken>,
    stats: PipelineStats,
    max_queue_size: usize,
    max_export_batch_size: usize,
    export_timeout: Duration,
    backpressure: BackpressurePolicy,
}

impl BatchSpanProcessor {
    /// Create a batch processor with default [`BatchConfig`].
    pub fn new<E>(exporter: E) -> Self
    where
        E: SpanExporter + 'static,
    {
        Self::with_config(exporter, BatchConfig::default())
    }

    /// Create a batch processor with the provided configuration.
    pub fn with_config<E>(exporter: E, config: BatchConfig) -> Self
    where
        E: SpanExporter + 'static,
    {
        let (control_sender, control_receiver) = mpsc::channel();
        let queue = Arc::new(Mutex::new(VecDeque::with_capacity(config.max_queue_size)));
        let cancel = Arc::new(CancelToken::new());
        let stats = PipelineStats::default();

        let worker = BatchWorker {
            exporter,
            queue: Arc::clone(&queue),
            cancel: Arc::clone(&cancel),
            stats: stats.clone(),
            max_export_batch_size: config.max_export_batch_size,
            scheduled_delay: config.scheduled_delay,
            retry: config.retry.clone(),
        };

        let handle = thread::Builder::new()
            .name("tracepipe-span-batch".to_string())
            .spawn(move || worker.run(control_receiver))
            .expect("failed to spawn batch span processor thread");

        BatchSpanProcessor {
            control_sender,
            queue,
            handle: Mutex::new(Some(handle)),
            is_shutdown: AtomicBool::new(false),
            cancel,
            stats,
            max_queue_size: config.max_queue_size,
            max_export_batch_size: config.max_export_batch_size,
            export_timeout: config.export_timeout,
            backpressure: config.backpressure,
        }
    }

    /// A handle onto this processor's counters. The handle stays valid
    /// after the processor is boxed or shut down.
    pub fn stats(&self) -> PipelineStats {
        self.stats.clone()
    }

    fn call_worker(
        &self,
        make_message: impl FnOnce(SyncSender<TelemetryResult<()>>) -> ControlMessage,
    ) -> TelemetryResult<()> {
        let (response_tx, response_rx) = mpsc::sync_channel(1);
        self.control_sender
            .send(make_message(response_tx))
            .map_err(|_| TelemetryError::Other("batch worker is gone".into()))?;
        match response_rx.recv_timeout(self.export_timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(TelemetryError::Timeout(self.export_timeout)),
            Err(RecvTimeoutError::Disconnected) => {
                Err(TelemetryError::Other("batch worker is gone".into()))
            }
        }
    }
}

impl SpanProcessor for BatchSpanProcessor {
    fn on_end(&self, span: SpanData) {
        if self.is_shutdown.load(Ordering::Relaxed) {
            self.stats.dropped_spans.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let batch_ready = {
            let Ok(mut queue) = self.queue.lock() else {
                self.stats.dropped_spans.fetch_add(1, Ordering::Relaxed);
                return;
            };
            if queue.len() >= self.max_queue_size {
                self.stats.dropped_spans.fetch_add(1, Ordering::Relaxed);
                match self.backpressure {
                    BackpressurePolicy::DropOldest => {
                        queue.pop_front();
                    }
                    BackpressurePolicy::DropNewest => return,
                }
            }
            queue.push_back(span);
            // signal once, when the batch threshold is first crossed
            queue.len() == self.max_export_batch_size
        };

        if batch_ready {
            let _ = self.control_sender.send(ControlMessage::BatchReady);
        }
    }

    fn force_flush(&self) -> TelemetryResult<()> {
        if self.is_shutdown.load(Ordering::Relaxed) {
            return Err(TelemetryError::AlreadyShutdown);
        }
        self.call_worker(ControlMessage::ForceFlush)
    }

    fn shutdown(&self) -> TelemetryResult<()> {
        if self.is_shutdown.swap(true, Ordering::Relaxed) {
            return Err(TelemetryError::AlreadyShutdown);
        }

        // make the final drain single-attempt: wake any in-progress backoff
        self.cancel.cancel();
        let result = self.call_worker(ControlMessage::Shutdown);

        if let Ok(mut handle) = self.handle.lock() {
            if let Some(handle) = handle.take() {
                if result.is_ok() && handle.join().is_err() {
                    return Err(TelemetryError::Other("batch worker panicked".into()));
                }
            }
        }
        result
    }

    fn set_resource(&mut self, resource: &Resource) {
        let _ = self
            .control_sender
            .send(ControlMessage::SetResource(resource.clone()));
    }
}

impl Drop for BatchSpanProcessor {
    fn drop(&mut self) {
        if !self.is_shutdown.load(Ordering::Relaxed) {
            if let Err(err) = self.shutdown() {
                error!(
                    name: "telemetry.processor.batch.shutdown_failed",
                    error = %err,
                    "batch span processor shutdown failed in drop"
                );
            }
        }
    }
}

/// State owned by the background thread of a [`BatchSpanProcessor`].
struct BatchWorker<E> {
    exporter: E,
    queue: Arc<Mutex<VecDeque<SpanData>>>,
    cancel: Arc<CancelToken>,
    stats: PipelineStats,
    max_export_batch_size: usize,
    scheduled_delay: Duration,
    retry: RetryPolicy,
}

impl<E: SpanExporter> BatchWorker<E> {
    fn run(mut self, control: Receiver<ControlMessage>) {
        let mut next_export = Instant::now() + self.scheduled_delay;

        loop {
            let timeout = next_export.saturating_duration_since(Instant::now());
            match control.recv_timeout(timeout) {
                Ok(ControlMessage::BatchReady) => {
                    if let Err(err) = self.flush() {
                        warn!(
                            name: "telemetry.processor.batch.export_failed",
                            error = %err,
                            "batch export failed"
                        );
                    }
                    next_export = Instant::now() + self.scheduled_delay;
                }
                Ok(ControlMessage::ForceFlush(response)) => {
                    let _ = response.send(self.flush());
                    next_export = Instant::now() + self.scheduled_delay;
                }
                Ok(ControlMessage::Shutdown(response)) => {
                    let result = self.flush();
                    self.exporter.shutdown();
                    let _ = response.send(result);
                    debug!(
                        name: "telemetry.processor.batch.worker_exit",
                        "batch span processor worker exiting"
                    );
                    return;
                }
                Ok(ControlMessage::SetResource(resource)) => {
                    self.exporter.set_resource(&resource);
                }
                Err(RecvTimeoutError::Timeout) => {
                    if let Err(err) = self.flush() {
                        warn!(
                            name: "telemetry.processor.batch.export_failed",
                            error = %err,
                            "scheduled export failed"
                        );
                    }
                    next_export = Instant::now() + self.scheduled_delay;
                }
                Err(RecvTimeoutError::Disconnected) => {
                    // all handles dropped without shutdown, drain what's left
                    let _ = self.flush();
                    self.exporter.shutdown();
                    return;
                }
            }
        }
    }

    /// Drains the queue and exports its contents in batch-sized chunks.
    /// Returns the first export error, after attempting every chunk.
    fn flush(&mut self) -> TelemetryResult<()> {
        let spans = {
            let mut queue = self.queue.lock()?;
            std::mem::take(&mut *queue)
        };
        if spans.is_empty() {
            return Ok(());
        }

        let mut spans = Vec::from(spans);
        let mut first_error = None;
        while !spans.is_empty() {
            let rest = spans.split_off(spans.len().min(self.max_export_batch_size));
            let batch = std::mem::replace(&mut spans, rest);
            let batch_len = batch.len();

            match self.export_with_retry(batch) {
                Ok(()) => {
                    self.stats
                        .exported_spans
                        .fetch_add(batch_len, Ordering::Relaxed);
                }
                Err(err) => {
                    self.stats.export_failures.fetch_add(1, Ordering::Relaxed);
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn export_with_retry(&mut self, batch: Vec<SpanData>) -> TelemetryResult<()> {
        let exporter = &mut self.exporter;
        retry_with_exponential_backoff(&self.retry, &self.cancel, "span_batch_export", || {
            futures_executor::block_on(exporter.export(batch.clone()))
        })
    }
}

/// Batch span processor configuration. Use [`BatchConfigBuilder`] or rely
/// on [`BatchConfig::default`], which also honors the `TRACEPIPE_*`
/// environment variables.
#[derive(Clone, Debug)]
pub struct BatchConfig {
    /// Maximum number of spans held while waiting for export.
    max_queue_size: usize,
    /// Delay between two consecutive scheduled exports.
    scheduled_delay: Duration,
    /// Maximum number of spans in a single export call.
    max_export_batch_size: usize,
    /// How long `force_flush` and `shutdown` wait for the worker.
    export_timeout: Duration,
    /// What to drop when the queue is full.
    backpressure: BackpressurePolicy,
    /// Backoff schedule for failed exports.
    retry: RetryPolicy,
}

impl Default for BatchConfig {
    fn default() -> Self {
        BatchConfigBuilder::default().build()
    }
}

/// A builder for creating [`BatchConfig`] instances.
#[derive(Clone, Debug)]
pub struct BatchConfigBuilder {
    max_queue_size: usize,
    scheduled_delay: Duration,
    max_export_batch_size: usize,
    export_timeout: Duration,
    backpressure: BackpressurePolicy,
    retry: RetryPolicy,
}

impl Default for BatchConfigBuilder {
    /// Create a builder seeded from hardcoded defaults, then from the
    /// `TRACEPIPE_MAX_QUEUE_SIZE`, `TRACEPIPE_SCHEDULE_DELAY`,
    /// `TRACEPIPE_MAX_EXPORT_BATCH_SIZE` and `TRACEPIPE_EXPORT_TIMEOUT`
    /// environment variables (durations in milliseconds). Explicit
    /// `with_*` calls take precedence over both.
    fn default() -> Self {
        BatchConfigBuilder {
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            scheduled_delay: DEFAULT_SCHEDULE_DELAY,
            max_export_batch_size: DEFAULT_MAX_EXPORT_BATCH_SIZE,
            export_timeout: DEFAULT_EXPORT_TIMEOUT,
            backpressure: BackpressurePolicy::default(),
            retry: RetryPolicy::default(),
        }
        .init_from_env_vars()
    }
}

impl BatchConfigBuilder {
    /// Set the maximum queue size. The default is 2048.
    pub fn with_max_queue_size(mut self, max_queue_size: usize) -> Self {
        self.max_queue_size = max_queue_size;
        self
    }

    /// Set the scheduled export interval. The default is 5 seconds.
    pub fn with_scheduled_delay(mut self, scheduled_delay: Duration) -> Self {
        self.scheduled_delay = scheduled_delay;
        self
    }

    /// Set the maximum export batch size. The default is 512; values above
    /// `max_queue_size` are clamped down at build time.
    pub fn with_max_export_batch_size(mut self, max_export_batch_size: usize) -> Self {
        self.max_export_batch_size = max_export_batch_size;
        self
    }

    /// Set the flush/shutdown wait bound. The default is 30 seconds.
    pub fn with_export_timeout(mut self, export_timeout: Duration) -> Self {
        self.export_timeout = export_timeout;
        self
    }

    /// Set the backpressure policy. The default is
    /// [`BackpressurePolicy::DropOldest`].
    pub fn with_backpressure_policy(mut self, backpressure: BackpressurePolicy) -> Self {
        self.backpressure = backpressure;
        self
    }

    /// Set the retry policy for failed exports.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Build a [`BatchConfig`] with this configuration.
    pub fn build(self) -> BatchConfig {
        // max export batch size can never exceed the queue holding it
        let max_export_batch_size = self.max_export_batch_size.min(self.max_queue_size).max(1);

        BatchConfig {
            max_queue_size: self.max_queue_size.max(1),
            scheduled_delay: self.scheduled_delay,
            max_export_batch_size,
            export_timeout: self.export_timeout,
            backpressure: self.backpressure,
            retry: self.retry,
        }
    }

    fn init_from_env_vars(mut self) -> Self {
        if let Some(max_queue_size) = env::var(ENV_MAX_QUEUE_SIZE)
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
        {
            self.max_queue_size = max_queue_size;
        }

        if let Some(scheduled_delay_ms) = env::var(ENV_SCHEDULE_DELAY)
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
        {
            self.scheduled_delay = Duration::from_millis(scheduled_delay_ms);
        }

        if let Some(max_export_batch_size) = env::var(ENV_MAX_EXPORT_BATCH_SIZE)
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
        {
            self.max_export_batch_size = max_export_batch_size;
        }

        if let Some(export_timeout_ms) = env::var(ENV_EXPORT_TIMEOUT)
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
        {
            self.export_timeout = Duration::from_millis(export_timeout_ms);
        }

        self
    }
}
