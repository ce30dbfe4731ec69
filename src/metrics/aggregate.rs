use std::any::Any;
use std::borrow::Cow;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;

use super::{AttachCell, Attachment, CollectedMetric, Sealed};
use crate::bag::AtomicBag;
use crate::error::MetricsError;
use crate::reading::{MetricReading, RateKind};
use crate::tags::TagSet;
use crate::writer::MetricWriter;

/// A summary derived from one window of samples.
///
/// Each enabled aggregate produces a reading with its own name suffix.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Aggregate {
    /// The most recently recorded sample; no suffix.
    Last,
    /// Number of samples, `_count`, always an integer.
    Count,
    /// Arithmetic mean, `_avg`.
    Mean,
    /// Nearest-rank median, `_median`.
    Median,
    /// Smallest sample, `_min`.
    Min,
    /// Largest sample, `_max`.
    Max,
    /// Sum of samples, `_sum`.
    Sum,
    /// Nearest-rank percentile for `p` in (0, 1), suffixed `_<100p>`
    /// (0.99 becomes `_99`, 0.999 becomes `_999`).
    Percentile(f64),
}

impl Aggregate {
    /// The reading-name suffix for this aggregate.
    pub fn suffix(&self) -> Cow<'static, str> {
        match self {
            Aggregate::Last => Cow::Borrowed(""),
            Aggregate::Count => Cow::Borrowed("_count"),
            Aggregate::Mean => Cow::Borrowed("_avg"),
            Aggregate::Median => Cow::Borrowed("_median"),
            Aggregate::Min => Cow::Borrowed("_min"),
            Aggregate::Max => Cow::Borrowed("_max"),
            Aggregate::Sum => Cow::Borrowed("_sum"),
            Aggregate::Percentile(p) => {
                // Percentile display form: 0.99 -> "99", 0.999 -> "999".
                let display = (p.clamp(0.0, 1.0) * 100.0).to_string().replace('.', "");
                Cow::Owned(format!("_{}", display))
            }
        }
    }
}

/// Nearest-rank index for percentile `p` over `n` sorted samples.
fn nearest_rank(p: f64, n: usize) -> usize {
    let rank = (p * n as f64).ceil() as usize;
    rank.saturating_sub(1).min(n - 1)
}

/// A gauge that aggregates a window of samples into summary readings.
///
/// Samples land in a lock-free bag; the snapshot swaps the bag, sorts the
/// window once, and computes every enabled aggregate from it. A window with
/// no samples emits nothing.
#[derive(Clone)]
pub struct AggregateGauge {
    inner: Arc<AggregateGaugeInner>,
}

struct AggregateGaugeInner {
    tags: TagSet,
    aggregates: Vec<Aggregate>,
    samples: AtomicBag<f64>,
    window: Mutex<Vec<(Cow<'static, str>, f64)>>,
    attach: AttachCell,
}

impl AggregateGauge {
    /// Creates an unattached aggregate gauge computing `aggregates`.
    pub fn new(tags: TagSet, aggregates: impl Into<Vec<Aggregate>>) -> AggregateGauge {
        AggregateGauge {
            inner: Arc::new(AggregateGaugeInner {
                tags,
                aggregates: aggregates.into(),
                samples: AtomicBag::new(),
                window: Mutex::new(Vec::new()),
                attach: AttachCell::new(),
            }),
        }
    }

    /// Records one sample into the current window.
    pub fn record(&self, value: f64) -> Result<(), MetricsError> {
        self.inner.attach.recordable()?;
        self.inner.samples.push(value);
        Ok(())
    }

    fn compute_window(&self, samples: Vec<f64>) -> Vec<(Cow<'static, str>, f64)> {
        if samples.is_empty() {
            return Vec::new();
        }

        let last = *samples.last().expect("non-empty window");
        let mut sorted = samples;
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let n = sorted.len();
        let sum: f64 = sorted.iter().sum();

        self.inner
            .aggregates
            .iter()
            .map(|aggregate| {
                let value = match aggregate {
                    Aggregate::Last => last,
                    Aggregate::Count => n as f64,
                    Aggregate::Mean => sum / n as f64,
                    Aggregate::Median => sorted[nearest_rank(0.5, n)],
                    Aggregate::Min => sorted[0],
                    Aggregate::Max => sorted[n - 1],
                    Aggregate::Sum => sum,
                    Aggregate::Percentile(p) => sorted[nearest_rank(*p, n)],
                };
                (aggregate.suffix(), value)
            })
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn window(&self) -> Vec<(String, f64)> {
        self.inner.window.lock().iter().map(|(s, v)| (s.to_string(), *v)).collect()
    }
}

impl Sealed for AggregateGauge {}

impl CollectedMetric for AggregateGauge {
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
        let samples = self.inner.samples.take();
        *self.inner.window.lock() = self.compute_window(samples);
    }

    fn serialize(
        &self,
        writer: &mut MetricWriter<'_>,
        timestamp: SystemTime,
        errors: &mut Vec<MetricsError>,
    ) {
        let Some(attachment) = self.inner.attach.get() else { return };
        let window = self.inner.window.lock();
        for (suffix, value) in window.iter() {
            match MetricReading::new(
                attachment.name.clone(),
                suffix.clone(),
                RateKind::Gauge,
                *value,
                attachment.tags.clone(),
                timestamp,
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
