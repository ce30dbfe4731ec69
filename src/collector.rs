use std::collections::VecDeque;
use std::hash::Hash;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error};

use crate::endpoint::{
    AfterSend, BackoffState, EndpointHandler, MetricEndpoint, SendContext, SendOutcome,
};
use crate::error::MetricsError;
use crate::metrics::{
    lifecycle, Aggregate, AggregateGauge, CollectedMetric, Counter, CumulativeCounter, EventGauge,
    MetricGroup, SamplingGauge, SnapshotCounter, SnapshotGauge,
};
use crate::payload::{Payload, PayloadQueue};
use crate::registry::Registry;
use crate::tags::{default_name_transformer, NameTransformer, TagSet};
use crate::writer::MetricWriter;

const DEFAULT_SNAPSHOT_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_METADATA_INTERVAL: Duration = Duration::from_secs(300);
const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_MAX_PAYLOAD_SIZE: usize = 8000;
const DEFAULT_MAX_PAYLOAD_COUNT: usize = 240;
const DEFAULT_MAX_RETRIES: u32 = 3;

/// Errors that can occur while building a collector or its endpoint handlers.
#[derive(Debug, Error)]
pub enum BuildError {
    /// An endpoint address failed to parse or resolve.
    #[error("invalid endpoint address: {reason}")]
    InvalidEndpointAddress {
        /// Details about the parsing failure.
        reason: String,
    },

    /// The TLS trust store could not be loaded for an HTTPS endpoint.
    #[error("failed to load native TLS roots: {reason}")]
    Tls {
        /// Underlying failure description.
        reason: String,
    },

    /// The collector's runtime for asynchronous transports failed to start.
    #[error("failed to build collector runtime: {reason}")]
    Runtime {
        /// Underlying failure description.
        reason: String,
    },

    /// The collector worker thread could not be spawned.
    #[error("failed to spawn collector worker thread")]
    WorkerSpawn,

    /// The configured default tags are invalid.
    #[error("invalid default tags")]
    DefaultTags {
        /// The underlying tag validation failure.
        #[source]
        source: MetricsError,
    },
}

/// User callback invoked with every error the background pipeline swallows.
pub type ExceptionHandler = Arc<dyn Fn(&MetricsError) + Send + Sync>;

/// User callback invoked once per payload send attempt.
pub type AfterSendHandler = Arc<dyn Fn(&AfterSend) + Send + Sync>;

struct Options {
    default_tags: TagSet,
    prefix: String,
    snapshot_interval: Duration,
    metadata_interval: Duration,
    throw_on_queue_full: bool,
    transform: NameTransformer,
    exception_handler: Option<ExceptionHandler>,
    after_send: Option<AfterSendHandler>,
    max_retries: u32,
    delay_between_retries: Option<Duration>,
    send_timeout: Duration,
    self_telemetry: bool,
}

struct EndpointTelemetry {
    payloads_sent: Counter,
    bytes_sent: Counter,
    payloads_dropped: Counter,
}

struct EndpointState {
    name: Arc<str>,
    handler: Mutex<Box<dyn EndpointHandler>>,
    queue: Arc<PayloadQueue>,
    backoff: Mutex<BackoffState>,
    telemetry: OnceLock<EndpointTelemetry>,
}

/// Shared collector state: the registry, the endpoints, and everything the
/// worker thread needs to run snapshots and flushes.
pub(crate) struct CollectorCore {
    registry: Registry,
    endpoints: Vec<EndpointState>,
    options: Options,
    lifecycle: Arc<AtomicU8>,
    runtime: tokio::runtime::Runtime,
    // Snapshot, metadata, and manual flushes never overlap.
    cycle: Mutex<()>,
    clock: quanta::Clock,
}

impl CollectorCore {
    pub(crate) fn register_metric<M>(
        &self,
        name: &str,
        unit: &str,
        description: &str,
        metric: M,
    ) -> Result<M, MetricsError>
    where
        M: CollectedMetric + Clone,
    {
        if self.lifecycle.load(Ordering::Acquire) != lifecycle::RUNNING {
            return Err(MetricsError::NotAttached);
        }

        let full_name: Arc<str> = Arc::from(format!("{}{}", self.options.prefix, name));
        self.registry.register(
            full_name,
            unit,
            description,
            metric,
            &self.options.default_tags,
            &self.options.transform,
            &self.lifecycle,
        )
    }

    fn report_exception(&self, error: &MetricsError) {
        debug!(error = %error, "Reporting pipeline error.");
        if let Some(handler) = &self.options.exception_handler {
            // User callbacks are untrusted: a panic must not kill the worker.
            let _ = catch_unwind(AssertUnwindSafe(|| handler(error)));
        }
    }

    fn emit_after_send(&self, event: &AfterSend) {
        if let Some(handler) = &self.options.after_send {
            let _ = catch_unwind(AssertUnwindSafe(|| handler(event)));
        }
    }

    /// Runs one snapshot: capture every metric's window, serialize it per
    /// endpoint, then flush each endpoint's queue.
    fn run_snapshot(&self, retries_enabled: bool) {
        let _cycle = self.cycle.lock();
        let now = SystemTime::now();
        let metrics = self.registry.metrics_snapshot();

        for metric in &metrics {
            metric.pre_serialize();
        }

        let mut serialize_errors = Vec::new();
        for endpoint in &self.endpoints {
            let mut handler = endpoint.handler.lock();
            {
                let mut writer = MetricWriter::new(&endpoint.queue, handler.wire_format());
                for metric in &metrics {
                    metric.serialize(&mut writer, now, &mut serialize_errors);
                }
                writer.finish();
            }
            self.flush_endpoint(endpoint, handler.as_mut(), retries_enabled);
        }

        for error in serialize_errors {
            self.report_exception(&error);
        }
    }

    /// Flushes one endpoint's queue: merge retries, then send pending
    /// payloads in FIFO order, one at a time.
    fn flush_endpoint(
        &self,
        endpoint: &EndpointState,
        handler: &mut dyn EndpointHandler,
        retries_enabled: bool,
    ) {
        endpoint.queue.merge_retry();

        if retries_enabled && endpoint.backoff.lock().suppressed(&self.clock) {
            // Still backing off from a failed cycle; keep accumulating.
            return;
        }

        let cx = SendContext {
            endpoint: &endpoint.name,
            runtime: &self.runtime,
            timeout: self.options.send_timeout,
        };

        let mut passes = 0u32;
        'cycle: loop {
            passes += 1;
            let mut batch: VecDeque<Payload> = endpoint.queue.take_for_flush().into();
            if batch.is_empty() {
                break;
            }

            while let Some(payload) = batch.pop_front() {
                let started = self.clock.now();
                let result = handler.send_payload(&payload.data, &cx);
                let duration = self.clock.now() - started;

                let dropped = endpoint.queue.take_dropped();
                if dropped > 0 {
                    self.track_dropped(endpoint, dropped);
                }

                let outcome = match &result {
                    Ok(()) => SendOutcome::Success,
                    Err(e) if e.is_transient() => SendOutcome::TransientFailure,
                    Err(_) => SendOutcome::FatalFailure,
                };
                self.emit_after_send(&AfterSend {
                    endpoint: endpoint.name.clone(),
                    duration,
                    bytes_written: payload.used(),
                    metrics_written: payload.metrics_count(),
                    outcome,
                    error: result.as_ref().err().map(ToString::to_string),
                    dropped_payloads: dropped,
                });

                match result {
                    Ok(()) => {
                        if let Some(telemetry) = endpoint.telemetry.get() {
                            let _ = telemetry.payloads_sent.increment();
                            let _ = telemetry.bytes_sent.increment_by(payload.used() as i64);
                        }
                        endpoint.backoff.lock().on_success();
                        endpoint.queue.release(payload);
                    }
                    Err(e) if e.is_transient() => {
                        error!(endpoint = %endpoint.name, error = %e, "Failed to send payload.");
                        if retries_enabled {
                            endpoint.queue.retry(payload, self.options.max_retries);
                            endpoint.queue.requeue(batch.drain(..));

                            // A fixed retry delay re-attempts within this
                            // cycle; the default policy backs the endpoint
                            // off until a later cycle instead.
                            if let Some(delay) = self.options.delay_between_retries {
                                if passes < self.options.max_retries.max(1) {
                                    std::thread::sleep(delay);
                                    endpoint.queue.merge_retry();
                                    continue 'cycle;
                                }
                            }
                            endpoint
                                .backoff
                                .lock()
                                .on_failure(&self.clock, self.options.snapshot_interval);
                        } else {
                            endpoint.queue.requeue(std::iter::once(payload));
                            endpoint.queue.requeue(batch.drain(..));
                        }
                        break 'cycle;
                    }
                    Err(e) => {
                        error!(endpoint = %endpoint.name, error = %e, "Dropping payload after fatal send failure.");
                        self.report_exception(&e);
                        self.track_dropped(endpoint, 1);
                        endpoint.queue.release(payload);
                    }
                }
            }

            break;
        }
    }

    fn track_dropped(&self, endpoint: &EndpointState, dropped: u64) {
        if let Some(telemetry) = endpoint.telemetry.get() {
            let _ = telemetry.payloads_dropped.increment_by(dropped as i64);
        }
        if self.options.throw_on_queue_full {
            self.report_exception(&MetricsError::QueueFull {
                endpoint: endpoint.name.to_string(),
                dropped,
            });
        }
    }

    /// Ships the metadata definitions to every endpoint.
    fn run_metadata(&self) {
        let _cycle = self.cycle.lock();
        let definitions = self.registry.definitions_snapshot();
        if definitions.is_empty() {
            return;
        }

        for endpoint in &self.endpoints {
            let mut handler = endpoint.handler.lock();
            let cx = SendContext {
                endpoint: &endpoint.name,
                runtime: &self.runtime,
                timeout: self.options.send_timeout,
            };
            if let Err(e) = handler.send_metadata(&definitions, &cx) {
                error!(endpoint = %endpoint.name, error = %e, "Failed to send metadata.");
                self.report_exception(&e);
            }
        }
    }

    /// Final best-effort snapshot and flush, then teardown.
    fn final_drain(&self) {
        self.run_snapshot(false);

        for endpoint in &self.endpoints {
            let abandoned = endpoint.queue.abandon_queued();
            if abandoned > 0 {
                self.report_exception(&MetricsError::ShutdownAborted {
                    endpoint: endpoint.name.to_string(),
                    dropped: abandoned,
                });
            }
            endpoint.handler.lock().dispose();
        }
    }
}

enum WorkerSignal {
    Shutdown,
}

fn worker_loop(core: Arc<CollectorCore>, signals: Receiver<WorkerSignal>) {
    let snapshot_interval = core.options.snapshot_interval;
    let metadata_interval = core.options.metadata_interval;
    let mut next_snapshot = Instant::now() + snapshot_interval;
    let mut next_metadata = Instant::now() + metadata_interval;

    loop {
        let due = next_snapshot.min(next_metadata);
        let wait = due.saturating_duration_since(Instant::now());
        match signals.recv_timeout(wait) {
            Ok(WorkerSignal::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }

        if Instant::now() >= next_snapshot {
            core.run_snapshot(true);
            next_snapshot = next_deadline(next_snapshot, snapshot_interval);
        }
        if Instant::now() >= next_metadata {
            core.run_metadata();
            next_metadata = next_deadline(next_metadata, metadata_interval);
        }
    }

    core.final_drain();
}

/// An over-running cycle schedules the next one immediately.
fn next_deadline(previous: Instant, interval: Duration) -> Instant {
    (previous + interval).max(Instant::now())
}

/// Builder for a [`MetricsCollector`].
pub struct MetricsCollectorBuilder {
    endpoints: Vec<MetricEndpoint>,
    default_tags: TagSet,
    prefix: String,
    snapshot_interval: Duration,
    metadata_interval: Duration,
    throw_on_queue_full: bool,
    transform: NameTransformer,
    exception_handler: Option<ExceptionHandler>,
    after_send: Option<AfterSendHandler>,
    max_payload_size: usize,
    max_payload_count: usize,
    max_retries: u32,
    delay_between_retries: Option<Duration>,
    send_timeout: Duration,
    self_telemetry: bool,
}

impl MetricsCollectorBuilder {
    /// Adds an endpoint to ship snapshots to.
    #[must_use]
    pub fn endpoint(mut self, endpoint: MetricEndpoint) -> Self {
        self.endpoints.push(endpoint);
        self
    }

    /// Adds a tag merged into every metric's tag set at attachment time.
    #[must_use]
    pub fn default_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_tags.push(crate::tags::Tag::new(key, value));
        self
    }

    /// Prefix prepended to every metric name.
    #[must_use]
    pub fn metrics_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// How often snapshots are taken and flushed. Defaults to 30 seconds.
    #[must_use]
    pub fn snapshot_interval(mut self, interval: Duration) -> Self {
        self.snapshot_interval = interval;
        self
    }

    /// How often metadata is shipped. Defaults to 5 minutes.
    #[must_use]
    pub fn metadata_interval(mut self, interval: Duration) -> Self {
        self.metadata_interval = interval;
        self
    }

    /// Report queue-pressure drops through the exception handler instead of
    /// only counting them. Defaults to `false`.
    #[must_use]
    pub fn throw_on_queue_full(mut self, throw: bool) -> Self {
        self.throw_on_queue_full = throw;
        self
    }

    /// Transformer applied to declared tag keys. Defaults to
    /// CamelCase-to-snake_case.
    #[must_use]
    pub fn name_transformer(mut self, transform: NameTransformer) -> Self {
        self.transform = transform;
        self
    }

    /// Callback for errors the background pipeline would otherwise swallow.
    #[must_use]
    pub fn exception_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&MetricsError) + Send + Sync + 'static,
    {
        self.exception_handler = Some(Arc::new(handler));
        self
    }

    /// Callback invoked once per payload send attempt.
    #[must_use]
    pub fn after_send<F>(mut self, handler: F) -> Self
    where
        F: Fn(&AfterSend) + Send + Sync + 'static,
    {
        self.after_send = Some(Arc::new(handler));
        self
    }

    /// Payload buffer size in bytes; also the statsd datagram cap.
    /// Defaults to 8000.
    #[must_use]
    pub fn max_payload_size(mut self, size: usize) -> Self {
        self.max_payload_size = size;
        self
    }

    /// Bound on queued payloads per endpoint. Defaults to 240.
    #[must_use]
    pub fn max_payload_count(mut self, count: usize) -> Self {
        self.max_payload_count = count;
        self
    }

    /// Send attempts per payload before it is dropped. Defaults to 3.
    #[must_use]
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Fixed delay between in-cycle retry attempts. When unset, failed
    /// endpoints instead back off exponentially (from 2 seconds, capped at
    /// the snapshot interval) across cycles.
    #[must_use]
    pub fn delay_between_retries(mut self, delay: Duration) -> Self {
        self.delay_between_retries = Some(delay);
        self
    }

    /// Per-request send timeout. Defaults to 10 seconds.
    #[must_use]
    pub fn send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Whether the collector registers counters about its own pipeline
    /// (payloads and bytes sent, payloads dropped, per endpoint). Defaults to
    /// `true`.
    #[must_use]
    pub fn self_telemetry(mut self, enabled: bool) -> Self {
        self.self_telemetry = enabled;
        self
    }

    /// Builds the collector and starts its worker thread.
    pub fn build(self) -> Result<MetricsCollector, BuildError> {
        crate::tags::resolve_tags(&TagSet::new(), &self.default_tags, &self.transform)
            .map_err(|source| BuildError::DefaultTags { source })?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| BuildError::Runtime { reason: e.to_string() })?;

        let endpoints = self
            .endpoints
            .into_iter()
            .map(|endpoint| {
                let (name, handler) = endpoint.into_parts();
                EndpointState {
                    name,
                    handler: Mutex::new(handler),
                    queue: Arc::new(PayloadQueue::new(
                        self.max_payload_size,
                        self.max_payload_count,
                    )),
                    backoff: Mutex::new(BackoffState::new()),
                    telemetry: OnceLock::new(),
                }
            })
            .collect();

        let core = Arc::new(CollectorCore {
            registry: Registry::new(),
            endpoints,
            options: Options {
                default_tags: self.default_tags,
                prefix: self.prefix,
                snapshot_interval: self.snapshot_interval,
                metadata_interval: self.metadata_interval,
                throw_on_queue_full: self.throw_on_queue_full,
                transform: self.transform,
                exception_handler: self.exception_handler,
                after_send: self.after_send,
                max_retries: self.max_retries,
                delay_between_retries: self.delay_between_retries,
                send_timeout: self.send_timeout,
                self_telemetry: self.self_telemetry,
            },
            lifecycle: Arc::new(AtomicU8::new(lifecycle::RUNNING)),
            runtime,
            cycle: Mutex::new(()),
            clock: quanta::Clock::new(),
        });

        if core.options.self_telemetry {
            register_endpoint_telemetry(&core);
        }

        let (signals, receiver) = bounded(1);
        let worker_core = Arc::clone(&core);
        let worker = std::thread::Builder::new()
            .name("tsdb-reporter-collector".to_string())
            .spawn(move || worker_loop(worker_core, receiver))
            .map_err(|_| BuildError::WorkerSpawn)?;

        Ok(MetricsCollector { core, signals, worker: Some(worker) })
    }
}

impl Default for MetricsCollectorBuilder {
    fn default() -> Self {
        MetricsCollectorBuilder {
            endpoints: Vec::new(),
            default_tags: TagSet::new(),
            prefix: String::new(),
            snapshot_interval: DEFAULT_SNAPSHOT_INTERVAL,
            metadata_interval: DEFAULT_METADATA_INTERVAL,
            throw_on_queue_full: false,
            transform: default_name_transformer(),
            exception_handler: None,
            after_send: None,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            max_payload_count: DEFAULT_MAX_PAYLOAD_COUNT,
            max_retries: DEFAULT_MAX_RETRIES,
            delay_between_retries: None,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            self_telemetry: true,
        }
    }
}

/// Per-endpoint counters about the pipeline itself, registered like any
/// other metric so they flow to every endpoint.
fn register_endpoint_telemetry(core: &Arc<CollectorCore>) {
    for endpoint in &core.endpoints {
        match build_endpoint_telemetry(core, &endpoint.name) {
            Ok(telemetry) => {
                let _ = endpoint.telemetry.set(telemetry);
            }
            Err(e) => {
                debug!(endpoint = %endpoint.name, error = %e, "Skipping endpoint self-telemetry.");
            }
        }
    }
}

fn build_endpoint_telemetry(
    core: &Arc<CollectorCore>,
    endpoint_name: &str,
) -> Result<EndpointTelemetry, MetricsError> {
    let tags = TagSet::new().with("endpoint", endpoint_name);
    Ok(EndpointTelemetry {
        payloads_sent: core.register_metric(
            "tsdb_reporter.payloads_sent",
            "payloads",
            "Payloads successfully sent to an endpoint.",
            Counter::new(tags.clone()),
        )?,
        bytes_sent: core.register_metric(
            "tsdb_reporter.bytes_sent",
            "bytes",
            "Payload bytes successfully sent to an endpoint.",
            Counter::new(tags.clone()),
        )?,
        payloads_dropped: core.register_metric(
            "tsdb_reporter.payloads_dropped",
            "payloads",
            "Payloads dropped due to queue pressure or failed sends.",
            Counter::new(tags),
        )?,
    })
}

/// The collector: registry facade, snapshot scheduler, and shipper.
///
/// Built via [`MetricsCollector::builder`]. Dropping the collector shuts it
/// down, running one final snapshot and flush.
pub struct MetricsCollector {
    core: Arc<CollectorCore>,
    signals: Sender<WorkerSignal>,
    worker: Option<JoinHandle<()>>,
}

impl MetricsCollector {
    /// Starts configuring a collector.
    pub fn builder() -> MetricsCollectorBuilder {
        MetricsCollectorBuilder::default()
    }

    /// Registers (or idempotently retrieves) a metric built by `factory`.
    ///
    /// The factory produces the prototype carrying the metric's tags; if an
    /// identical registration already exists, the existing handle is returned
    /// and the prototype discarded.
    pub fn get_metric<M, F>(
        &self,
        name: &str,
        unit: &str,
        description: &str,
        factory: F,
    ) -> Result<M, MetricsError>
    where
        M: CollectedMetric + Clone,
        F: FnOnce() -> M,
    {
        self.core.register_metric(name, unit, description, factory())
    }

    /// Attaches a caller-constructed metric instance.
    pub fn bind_metric<M>(
        &self,
        name: &str,
        unit: &str,
        description: &str,
        metric: M,
    ) -> Result<M, MetricsError>
    where
        M: CollectedMetric + Clone,
    {
        self.core.register_metric(name, unit, description, metric)
    }

    /// Registers a [`Counter`].
    pub fn counter(
        &self,
        name: &str,
        unit: &str,
        description: &str,
        tags: TagSet,
    ) -> Result<Counter, MetricsError> {
        self.get_metric(name, unit, description, || Counter::new(tags))
    }

    /// Registers a [`CumulativeCounter`].
    pub fn cumulative_counter(
        &self,
        name: &str,
        unit: &str,
        description: &str,
        tags: TagSet,
    ) -> Result<CumulativeCounter, MetricsError> {
        self.get_metric(name, unit, description, || CumulativeCounter::new(tags))
    }

    /// Registers a [`SnapshotCounter`] over `producer`.
    pub fn snapshot_counter<F>(
        &self,
        name: &str,
        unit: &str,
        description: &str,
        tags: TagSet,
        producer: F,
    ) -> Result<SnapshotCounter, MetricsError>
    where
        F: Fn() -> Option<f64> + Send + Sync + 'static,
    {
        self.get_metric(name, unit, description, || SnapshotCounter::new(tags, producer))
    }

    /// Registers a [`SamplingGauge`].
    pub fn sampling_gauge(
        &self,
        name: &str,
        unit: &str,
        description: &str,
        tags: TagSet,
    ) -> Result<SamplingGauge, MetricsError> {
        self.get_metric(name, unit, description, || SamplingGauge::new(tags))
    }

    /// Registers an [`EventGauge`].
    pub fn event_gauge(
        &self,
        name: &str,
        unit: &str,
        description: &str,
        tags: TagSet,
    ) -> Result<EventGauge, MetricsError> {
        self.get_metric(name, unit, description, || EventGauge::new(tags))
    }

    /// Registers an [`AggregateGauge`] computing `aggregates`.
    pub fn aggregate_gauge(
        &self,
        name: &str,
        unit: &str,
        description: &str,
        tags: TagSet,
        aggregates: impl Into<Vec<Aggregate>>,
    ) -> Result<AggregateGauge, MetricsError> {
        self.get_metric(name, unit, description, || AggregateGauge::new(tags, aggregates))
    }

    /// Registers a [`SnapshotGauge`] over `producer`.
    pub fn snapshot_gauge<F>(
        &self,
        name: &str,
        unit: &str,
        description: &str,
        tags: TagSet,
        producer: F,
    ) -> Result<SnapshotGauge, MetricsError>
    where
        F: Fn() -> Option<f64> + Send + Sync + 'static,
    {
        self.get_metric(name, unit, description, || SnapshotGauge::new(tags, producer))
    }

    /// Creates a [`MetricGroup`]: a family of metrics sharing `name` and
    /// varying over a tag value produced by `factory`.
    pub fn metric_group<K, M, F>(
        &self,
        name: &str,
        unit: &str,
        description: &str,
        factory: F,
    ) -> MetricGroup<K, M>
    where
        K: Eq + Hash + Clone,
        M: CollectedMetric + Clone,
        F: Fn(&K) -> M + Send + Sync + 'static,
    {
        MetricGroup::new(
            Arc::clone(&self.core),
            name.to_string(),
            unit.to_string(),
            description.to_string(),
            Box::new(factory),
        )
    }

    /// Number of registered metrics.
    pub fn metrics_len(&self) -> usize {
        self.core.registry.len()
    }

    /// Runs one snapshot and flush synchronously on the calling thread.
    ///
    /// The scheduled loops and manual flushes are mutually exclusive, so this
    /// never overlaps a background cycle.
    pub fn flush(&self) {
        self.core.run_snapshot(true);
    }

    /// Ships metadata definitions synchronously on the calling thread.
    pub fn flush_metadata(&self) {
        self.core.run_metadata();
    }

    /// Stops the loops, runs one final best-effort snapshot and flush with
    /// retries disabled, and disposes every endpoint handler.
    ///
    /// Payloads still queued afterwards are dropped and reported as
    /// [`MetricsError::ShutdownAborted`]. Recording stays permitted while the
    /// final drain runs and is rejected once it completes; registration is
    /// rejected as soon as shutdown begins.
    pub fn shutdown(mut self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&mut self) {
        if self
            .core
            .lifecycle
            .compare_exchange(
                lifecycle::RUNNING,
                lifecycle::DRAINING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }

        let _ = self.signals.send(WorkerSignal::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }

        self.core.lifecycle.store(lifecycle::CLOSED, Ordering::Release);
    }
}

impl Drop for MetricsCollector {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}
