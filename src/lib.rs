//! An in-process metrics client that aggregates tagged counters and gauges
//! and ships periodic snapshots to one or more telemetry backends.
//!
//! # Usage
//!
//! Build a collector, register metrics against it, and record from as many
//! threads as you like. A collector-owned background thread snapshots every
//! metric on an interval, serializes the readings into pooled payload
//! buffers per endpoint, and flushes them with bounded retries.
//!
//! ```no_run
//! use tsdb_reporter::{BosunHandler, MetricEndpoint, MetricsCollector, TagSet};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let collector = MetricsCollector::builder()
//!     .endpoint(MetricEndpoint::new("bosun", BosunHandler::new("http://bosun:8070")?))
//!     .default_tag("host", "web1")
//!     .metrics_name_prefix("myapp.")
//!     .build()?;
//!
//! let requests = collector.counter(
//!     "http.requests",
//!     "requests",
//!     "HTTP requests served.",
//!     TagSet::new().with("route", "/api"),
//! )?;
//! requests.increment()?;
//! # Ok(())
//! # }
//! ```
//!
//! # Endpoints
//!
//! Four remote backends are supported out of the box -- Bosun/OpenTSDB HTTP
//! JSON, DataDog HTTP JSON, SignalFx HTTP JSON, and statsd-style UDP -- plus
//! an in-memory [`LocalSink`] that retains the most recent reading per metric
//! for tests and in-process consumers. A slow or unreachable endpoint backs
//! off and retries from its own bounded queue without stalling the others.
//!
//! # Recording
//!
//! Recording never blocks and never takes a lock shared with I/O: counters
//! and sampling gauges are single atomic operations, and event/aggregate
//! gauges append to lock-free segment lists that snapshots swap out
//! wholesale. Backpressure is expressed only through the bounded per-endpoint
//! payload queues, which drop their oldest payloads when full and surface the
//! drop count through [`AfterSend`] events.

#![deny(clippy::all)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]
#![deny(missing_docs)]

mod bag;
mod payload;
mod registry;

mod error;
pub use self::error::MetricsError;

mod tags;
pub use self::tags::{default_name_transformer, NameTransformer, ResolvedTags, Tag, TagSet};

mod reading;
pub use self::reading::{MetricDefinition, MetricReading, RateKind};

mod writer;
pub use self::writer::{MetricWriter, TimestampCache, WireFormat};

mod metrics;
pub use self::metrics::{
    Aggregate, AggregateGauge, CollectedMetric, Counter, CumulativeCounter, EventGauge,
    MetricGroup, SamplingGauge, SnapshotCounter, SnapshotGauge,
};

mod endpoint;
pub use self::endpoint::{
    AfterSend, BosunHandler, DataDogHandler, EndpointHandler, LocalSink, LocalSinkHandler,
    MetricEndpoint, SendContext, SendOutcome, SignalFxHandler, StatsdHandler,
};

mod collector;
pub use self::collector::{
    AfterSendHandler, BuildError, ExceptionHandler, MetricsCollector, MetricsCollectorBuilder,
};
