//! Metric types and their shared collection surface.

use std::any::Any;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::SystemTime;

use crate::error::MetricsError;
use crate::tags::{ResolvedTags, TagSet};
use crate::writer::MetricWriter;

mod counter;
pub use counter::{Counter, CumulativeCounter, SnapshotCounter};

mod gauge;
pub use gauge::{EventGauge, SamplingGauge, SnapshotGauge};

mod aggregate;
pub use aggregate::{Aggregate, AggregateGauge};

mod group;
pub use group::MetricGroup;

use crate::reading::RateKind;

/// Collector lifecycle states, shared with every attached metric.
pub(crate) mod lifecycle {
    pub const RUNNING: u8 = 0;
    pub const DRAINING: u8 = 1;
    pub const CLOSED: u8 = 2;
}

/// Everything a metric learns when the registry attaches it: its frozen full
/// name, its canonical merged tags, and the lifecycle cell of the collector
/// that owns it.
#[derive(Debug)]
pub(crate) struct Attachment {
    pub(crate) name: Arc<str>,
    pub(crate) tags: Arc<ResolvedTags>,
    pub(crate) lifecycle: Arc<AtomicU8>,
}

/// One-shot attachment slot embedded in every metric.
#[derive(Debug)]
pub(crate) struct AttachCell {
    slot: OnceLock<Attachment>,
}

impl AttachCell {
    pub(crate) fn new() -> AttachCell {
        AttachCell { slot: OnceLock::new() }
    }

    pub(crate) fn attach(&self, attachment: Attachment) -> Result<(), MetricsError> {
        // A metric belongs to exactly one collector; a second attach means the
        // same instance was registered twice under different keys.
        self.slot.set(attachment).map_err(|_| MetricsError::NotAttached)
    }

    pub(crate) fn get(&self) -> Option<&Attachment> {
        self.slot.get()
    }

    /// The attachment, provided recording is currently allowed.
    ///
    /// Recording is rejected before attachment and after the collector has
    /// fully closed; it stays allowed while the collector drains.
    pub(crate) fn recordable(&self) -> Result<&Attachment, MetricsError> {
        let attachment = self.slot.get().ok_or(MetricsError::NotAttached)?;
        if attachment.lifecycle.load(Ordering::Acquire) == lifecycle::CLOSED {
            return Err(MetricsError::NotAttached);
        }
        Ok(attachment)
    }
}

#[cfg(test)]
pub(crate) fn attach_for_test(metric: &dyn CollectedMetric, name: &str) {
    use crate::tags::{default_name_transformer, resolve_tags};

    let tags = resolve_tags(metric.declared_tags(), &TagSet::new(), &default_name_transformer())
        .expect("test tags must resolve");
    metric
        .attach(Attachment {
            name: Arc::from(name),
            tags,
            lifecycle: Arc::new(AtomicU8::new(lifecycle::RUNNING)),
        })
        .expect("test metric must attach");
}

mod private {
    pub trait Sealed {}
}

pub(crate) use private::Sealed;

/// The collection surface shared by every metric type.
///
/// `pre_serialize` and `serialize` are called only from the collector's
/// worker thread: `pre_serialize` once per snapshot to capture a consistent
/// window, `serialize` once per endpoint to emit that window's readings.
/// Recording operations are the per-type inherent methods and may be called
/// from any thread.
///
/// This trait is sealed; the metric types in this module are the full set.
pub trait CollectedMetric: private::Sealed + Send + Sync + Any {
    /// Rate kind carried by this metric's readings and metadata.
    fn rate_kind(&self) -> RateKind;

    /// Tags declared at construction time.
    #[doc(hidden)]
    fn declared_tags(&self) -> &TagSet;

    #[doc(hidden)]
    fn attach(&self, attachment: Attachment) -> Result<(), MetricsError>;

    /// Captures the current window, swapping accumulators so writers proceed
    /// against fresh state.
    #[doc(hidden)]
    fn pre_serialize(&self);

    /// Emits the captured window's readings into `writer`.
    ///
    /// Reading-level failures (timestamp range) are appended to `errors`; the
    /// rest of the window still goes out.
    #[doc(hidden)]
    fn serialize(
        &self,
        writer: &mut MetricWriter<'_>,
        timestamp: SystemTime,
        errors: &mut Vec<MetricsError>,
    );

    #[doc(hidden)]
    fn as_any(&self) -> &dyn Any;
}
