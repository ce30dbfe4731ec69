use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;

use super::{AttachCell, Attachment, CollectedMetric, Sealed};
use crate::bag::AtomicBag;
use crate::error::MetricsError;
use crate::reading::{MetricReading, RateKind};
use crate::tags::TagSet;
use crate::writer::MetricWriter;

/// A last-write-wins gauge.
///
/// The value lives bit-cast in an atomic; recording is a single store. One
/// reading per snapshot once a value has ever been recorded.
#[derive(Clone)]
pub struct SamplingGauge {
    inner: Arc<SamplingGaugeInner>,
}

struct SamplingGaugeInner {
    tags: TagSet,
    bits: AtomicU64,
    recorded: AtomicBool,
    window: AtomicU64,
    window_valid: AtomicBool,
    attach: AttachCell,
}

impl SamplingGauge {
    /// Creates an unattached sampling gauge with the given tags.
    pub fn new(tags: TagSet) -> SamplingGauge {
        SamplingGauge {
            inner: Arc::new(SamplingGaugeInner {
                tags,
                bits: AtomicU64::new(0.0f64.to_bits()),
                recorded: AtomicBool::new(false),
                window: AtomicU64::new(0.0f64.to_bits()),
                window_valid: AtomicBool::new(false),
                attach: AttachCell::new(),
            }),
        }
    }

    /// Records the current value; the latest write wins.
    pub fn record(&self, value: f64) -> Result<(), MetricsError> {
        self.inner.attach.recordable()?;
        self.inner.bits.store(value.to_bits(), Ordering::Release);
        self.inner.recorded.store(true, Ordering::Release);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn window_value(&self) -> Option<f64> {
        self.inner
            .window_valid
            .load(Ordering::Acquire)
            .then(|| f64::from_bits(self.inner.window.load(Ordering::Acquire)))
    }
}

impl Sealed for SamplingGauge {}

impl CollectedMetric for SamplingGauge {
    fn rate_kind(&self) -> RateKind {
        RateKind::Gauge
    }

    fn declared_tags(&self) -> &TagSet {
        &self.inner.tags
    }

    fn attach(&self, attachment: Attachment) -> Result<(), MetricsError> {
        self.inner.attach.attach(attachment)
    }

    fn pre_serialize(&self) {
        if self.inner.recorded.load(Ordering::Acquire) {
            self.inner.window.store(self.inner.bits.load(Ordering::Acquire), Ordering::Release);
            self.inner.window_valid.store(true, Ordering::Release);
        }
    }

    fn serialize(
        &self,
        writer: &mut MetricWriter<'_>,
        timestamp: SystemTime,
        errors: &mut Vec<MetricsError>,
    ) {
        let Some(attachment) = self.inner.attach.get() else { return };
        if !self.inner.window_valid.load(Ordering::Acquire) {
            return;
        }
        let value = f64::from_bits(self.inner.window.load(Ordering::Acquire));
        match MetricReading::new(
            attachment.name.clone(),
            "",
            RateKind::Gauge,
            value,
            attachment.tags.clone(),
            timestamp,
        ) {
            Ok(reading) => writer.write_reading(&reading),
            Err(e) => errors.push(e),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A gauge that buffers every recorded event with its own timestamp.
///
/// Events are appended to a lock-free bag; the snapshot swaps the bag out and
/// emits one reading per buffered event, in arrival order.
#[derive(Clone, Debug)]
pub struct EventGauge {
    inner: Arc<EventGaugeInner>,
}

#[derive(Debug)]
struct EventGaugeInner {
    tags: TagSet,
    events: AtomicBag<(f64, SystemTime)>,
    window: Mutex<Vec<(f64, SystemTime)>>,
    attach: AttachCell,
}

impl EventGauge {
    /// Creates an unattached event gauge with the given tags.
    pub fn new(tags: TagSet) -> EventGauge {
        EventGauge {
            inner: Arc::new(EventGaugeInner {
                tags,
                events: AtomicBag::new(),
                window: Mutex::new(Vec::new()),
                attach: AttachCell::new(),
            }),
        }
    }

    /// Records an event stamped with the current wall clock.
    pub fn record(&self, value: f64) -> Result<(), MetricsError> {
        self.record_at(value, SystemTime::now())
    }

    /// Records an event with an explicit timestamp.
    ///
    /// The timestamp is range-checked at serialization time; an out-of-range
    /// event is dropped then, not here, so recording stays cheap.
    pub fn record_at(&self, value: f64, timestamp: SystemTime) -> Result<(), MetricsError> {
        self.inner.attach.recordable()?;
        self.inner.events.push((value, timestamp));
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn window_len(&self) -> usize {
        self.inner.window.lock().len()
    }
}

impl Sealed for EventGauge {}

impl CollectedMetric for EventGauge {
    fn rate_kind(&self) -> RateKind {
        RateKind::Gauge
    }

    fn declared_tags(&self) -> &TagSet {
        &self.inner.tags
    }

    fn attach(&self, attachment: Attachment) -> Result<(), MetricsError> {
        self.inner.attach.attach(attachment)
    }

    fn pre_serialize(&self) {
        *self.inner.window.lock() = self.inner.events.take();
    }

    fn serialize(
        &self,
        writer: &mut MetricWriter<'_>,
        _timestamp: SystemTime,
        errors: &mut Vec<MetricsError>,
    ) {
        let Some(attachment) = self.inner.attach.get() else { return };
        let window = self.inner.window.lock();
        for (value, event_time) in window.iter() {
            match MetricReading::new(
                attachment.name.clone(),
                "",
                RateKind::Gauge,
                *value,
                attachment.tags.clone(),
                *event_time,
            ) {
                Ok(reading) => writer.write_reading(&reading),
                Err(e) => errors.push(e),
            }
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A gauge whose value comes from a user-supplied producer closure.
///
/// The closure runs once per snapshot on the collector thread; returning
/// `None` (or panicking) means no reading this cycle.
#[derive(Clone)]
pub struct SnapshotGauge {
    inner: Arc<SnapshotGaugeInner>,
}

struct SnapshotGaugeInner {
    tags: TagSet,
    producer: Box<dyn Fn() -> Option<f64> + Send + Sync>,
    window: Mutex<Option<f64>>,
    attach: AttachCell,
}

impl SnapshotGauge {
    /// Creates an unattached snapshot gauge over `producer`.
    pub fn new<F>(tags: TagSet, producer: F) -> SnapshotGauge
    where
        F: Fn() -> Option<f64> + Send + Sync + 'static,
    {
        SnapshotGauge {
            inner: Arc::new(SnapshotGaugeInner {
                tags,
                producer: Box::new(producer),
                window: Mutex::new(None),
                attach: AttachCell::new(),
            }),
        }
    }
}

impl Sealed for SnapshotGauge {}

impl CollectedMetric for SnapshotGauge {
    fn rate_kind(&self) -> RateKind {
        RateKind::Gauge
    }

    fn declared_tags(&self) -> &TagSet {
        &self.inner.tags
    }

    fn attach(&self, attachment: Attachment) -> Result<(), MetricsError> {
        self.inner.attach.attach(attachment)
    }

    fn pre_serialize(&self) {
        let produced =
            catch_unwind(AssertUnwindSafe(|| (self.inner.producer)())).unwrap_or(None);
        *self.inner.window.lock() = produced;
    }

    fn serialize(
        &self,
        writer: &mut MetricWriter<'_>,
        timestamp: SystemTime,
        errors: &mut Vec<MetricsError>,
    ) {
        let Some(attachment) = self.inner.attach.get() else { return };
        let Some(value) = *self.inner.window.lock() else { return };
        match MetricReading::new(
            attachment.name.clone(),
            "",
            RateKind::Gauge,
            value,
            attachment.tags.clone(),
            timestamp,
        ) {
            Ok(reading) => writer.write_reading(&reading),
            Err(e) => errors.push(e),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, UNIX_EPOCH};

    use super::{EventGauge, SamplingGauge};
    use crate::metrics::{attach_for_test, CollectedMetric};
    use crate::tags::TagSet;

    #[test]
    fn sampling_gauge_last_write_wins() {
        let gauge = SamplingGauge::new(TagSet::new());
        attach_for_test(&gauge, "test.cpu");

        assert_eq!(gauge.window_value(), None);

        gauge.record(0.1).unwrap();
        gauge.record(0.2).unwrap();
        gauge.record(0.3).unwrap();
        gauge.pre_serialize();
        assert_eq!(gauge.window_value(), Some(0.3));

        // No new writes: the last value keeps reporting.
        gauge.pre_serialize();
        assert_eq!(gauge.window_value(), Some(0.3));
    }

    #[test]
    fn event_gauge_swaps_its_window() {
        let gauge = EventGauge::new(TagSet::new());
        attach_for_test(&gauge, "test.latency");

        let base = UNIX_EPOCH + Duration::from_millis(1_700_000_000_000);
        gauge.record_at(10.0, base).unwrap();
        gauge.record_at(20.0, base + Duration::from_millis(1)).unwrap();
        gauge.record_at(30.0, base + Duration::from_millis(2)).unwrap();

        gauge.pre_serialize();
        assert_eq!(gauge.window_len(), 3);

        gauge.pre_serialize();
        assert_eq!(gauge.window_len(), 0);
    }
}
