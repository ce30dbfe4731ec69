use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;

use super::{AttachCell, Attachment, CollectedMetric, Sealed};
use crate::error::MetricsError;
use crate::reading::{MetricReading, RateKind};
use crate::tags::TagSet;
use crate::writer::MetricWriter;

/// A per-window counter: increments accumulate and reset at every snapshot.
///
/// Increment is a single atomic add; the snapshot swaps the accumulator to
/// zero and emits the delta as one reading.
#[derive(Clone, Debug)]
pub struct Counter {
    inner: Arc<CounterInner>,
}

#[derive(Debug)]
struct CounterInner {
    tags: TagSet,
    value: AtomicI64,
    window: AtomicI64,
    attach: AttachCell,
}

impl Counter {
    /// Creates an unattached counter with the given tags.
    pub fn new(tags: TagSet) -> Counter {
        Counter {
            inner: Arc::new(CounterInner {
                tags,
                value: AtomicI64::new(0),
                window: AtomicI64::new(0),
                attach: AttachCell::new(),
            }),
        }
    }

    /// Increments the counter by one.
    pub fn increment(&self) -> Result<(), MetricsError> {
        self.increment_by(1)
    }

    /// Increments the counter by `amount`.
    pub fn increment_by(&self, amount: i64) -> Result<(), MetricsError> {
        self.inner.attach.recordable()?;
        self.inner.value.fetch_add(amount, Ordering::Relaxed);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn window_value(&self) -> i64 {
        self.inner.window.load(Ordering::Acquire)
    }
}

impl Sealed for Counter {}

impl CollectedMetric for Counter {
    fn rate_kind(&self) -> RateKind {
        RateKind::Counter
    }

    fn declared_tags(&self) -> &TagSet {
        &self.inner.tags
    }

    fn attach(&self, attachment: Attachment) -> Result<(), MetricsError> {
        self.inner.attach.attach(attachment)
    }

    fn pre_serialize(&self) {
        let delta = self.inner.value.swap(0, Ordering::AcqRel);
        self.inner.window.store(delta, Ordering::Release);
    }

    fn serialize(
        &self,
        writer: &mut MetricWriter<'_>,
        timestamp: SystemTime,
        errors: &mut Vec<MetricsError>,
    ) {
        let Some(attachment) = self.inner.attach.get() else { return };
        let delta = self.inner.window.load(Ordering::Acquire);
        match MetricReading::new(
            attachment.name.clone(),
            "",
            RateKind::Counter,
            delta as f64,
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

/// A counter whose total is never reset within the process.
///
/// The snapshot captures both the absolute total and the delta since the
/// previous snapshot; each endpoint's writer picks whichever its backend
/// expects.
#[derive(Clone)]
pub struct CumulativeCounter {
    inner: Arc<CumulativeCounterInner>,
}

struct CumulativeCounterInner {
    tags: TagSet,
    value: AtomicU64,
    last: AtomicU64,
    window_total: AtomicU64,
    window_delta: AtomicU64,
    attach: AttachCell,
}

impl CumulativeCounter {
    /// Creates an unattached cumulative counter with the given tags.
    pub fn new(tags: TagSet) -> CumulativeCounter {
        CumulativeCounter {
            inner: Arc::new(CumulativeCounterInner {
                tags,
                value: AtomicU64::new(0),
                last: AtomicU64::new(0),
                window_total: AtomicU64::new(0),
                window_delta: AtomicU64::new(0),
                attach: AttachCell::new(),
            }),
        }
    }

    /// Increments the total by one.
    pub fn increment(&self) -> Result<(), MetricsError> {
        self.increment_by(1)
    }

    /// Increments the total by `amount`.
    pub fn increment_by(&self, amount: u64) -> Result<(), MetricsError> {
        self.inner.attach.recordable()?;
        self.inner.value.fetch_add(amount, Ordering::Relaxed);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn window_values(&self) -> (u64, u64) {
        (
            self.inner.window_total.load(Ordering::Acquire),
            self.inner.window_delta.load(Ordering::Acquire),
        )
    }
}

impl Sealed for CumulativeCounter {}

impl CollectedMetric for CumulativeCounter {
    fn rate_kind(&self) -> RateKind {
        RateKind::CumulativeCounter
    }

    fn declared_tags(&self) -> &TagSet {
        &self.inner.tags
    }

    fn attach(&self, attachment: Attachment) -> Result<(), MetricsError> {
        self.inner.attach.attach(attachment)
    }

    fn pre_serialize(&self) {
        let current = self.inner.value.load(Ordering::Acquire);
        let last = self.inner.last.swap(current, Ordering::AcqRel);
        self.inner.window_total.store(current, Ordering::Release);
        self.inner.window_delta.store(current.wrapping_sub(last), Ordering::Release);
    }

    fn serialize(
        &self,
        writer: &mut MetricWriter<'_>,
        timestamp: SystemTime,
        errors: &mut Vec<MetricsError>,
    ) {
        let Some(attachment) = self.inner.attach.get() else { return };
        let value = if writer.prefers_deltas() {
            self.inner.window_delta.load(Ordering::Acquire)
        } else {
            self.inner.window_total.load(Ordering::Acquire)
        };
        match MetricReading::new(
            attachment.name.clone(),
            "",
            RateKind::CumulativeCounter,
            value as f64,
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

/// A counter whose value comes from a user-supplied producer closure.
///
/// The closure runs once per snapshot on the collector thread; returning
/// `None` (or panicking) means no reading this cycle.
#[derive(Clone)]
pub struct SnapshotCounter {
    inner: Arc<SnapshotCounterInner>,
}

struct SnapshotCounterInner {
    tags: TagSet,
    producer: Box<dyn Fn() -> Option<f64> + Send + Sync>,
    window: Mutex<Option<f64>>,
    attach: AttachCell,
}

impl SnapshotCounter {
    /// Creates an unattached snapshot counter over `producer`.
    pub fn new<F>(tags: TagSet, producer: F) -> SnapshotCounter
    where
        F: Fn() -> Option<f64> + Send + Sync + 'static,
    {
        SnapshotCounter {
            inner: Arc::new(SnapshotCounterInner {
                tags,
                producer: Box::new(producer),
                window: Mutex::new(None),
                attach: AttachCell::new(),
            }),
        }
    }

    #[cfg(test)]
    pub(crate) fn window_value(&self) -> Option<f64> {
        *self.inner.window.lock()
    }
}

impl Sealed for SnapshotCounter {}

impl CollectedMetric for SnapshotCounter {
    fn rate_kind(&self) -> RateKind {
        RateKind::Rate
    }

    fn declared_tags(&self) -> &TagSet {
        &self.inner.tags
    }

    fn attach(&self, attachment: Attachment) -> Result<(), MetricsError> {
        self.inner.attach.attach(attachment)
    }

    fn pre_serialize(&self) {
        // The producer is user code: a panic counts as "no reading".
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
            RateKind::Rate,
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
    use super::{Counter, CumulativeCounter, SnapshotCounter};
    use crate::error::MetricsError;
    use crate::metrics::{attach_for_test, CollectedMetric};
    use crate::tags::TagSet;

    #[test]
    fn unattached_counter_rejects_increment() {
        let counter = Counter::new(TagSet::new());
        assert!(matches!(counter.increment(), Err(MetricsError::NotAttached)));
    }

    #[test]
    fn counter_window_is_the_delta_since_last_snapshot() {
        let counter = Counter::new(TagSet::new());
        attach_for_test(&counter, "test.counter");

        counter.increment_by(42).unwrap();
        counter.pre_serialize();
        assert_eq!(counter.window_value(), 42);

        // Accumulator was swapped to zero: the next window starts clean.
        counter.increment_by(13).unwrap();
        counter.pre_serialize();
        assert_eq!(counter.window_value(), 13);
    }

    #[test]
    fn cumulative_counter_keeps_total_and_delta() {
        let counter = CumulativeCounter::new(TagSet::new());
        attach_for_test(&counter, "test.cumulative");

        counter.increment_by(40).unwrap();
        counter.pre_serialize();
        assert_eq!(counter.window_values(), (40, 40));

        counter.increment_by(2).unwrap();
        counter.pre_serialize();
        assert_eq!(counter.window_values(), (42, 2));

        // No updates: total holds, delta goes to zero.
        counter.pre_serialize();
        assert_eq!(counter.window_values(), (42, 0));
    }

    #[test]
    fn snapshot_counter_runs_the_producer_each_window() {
        let counter = SnapshotCounter::new(TagSet::new(), || Some(7.0));
        attach_for_test(&counter, "test.snapshot");

        assert_eq!(counter.window_value(), None);
        counter.pre_serialize();
        assert_eq!(counter.window_value(), Some(7.0));
    }

    #[test]
    fn snapshot_counter_swallows_producer_panics() {
        let counter = SnapshotCounter::new(TagSet::new(), || panic!("producer bug"));
        attach_for_test(&counter, "test.snapshot");

        counter.pre_serialize();
        assert_eq!(counter.window_value(), None);
    }
}
