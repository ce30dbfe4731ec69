use std::borrow::Cow;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::MetricsError;
use crate::tags::ResolvedTags;

/// 2000-01-01T00:00:00Z, in milliseconds since the Unix epoch.
pub(crate) const MIN_TIMESTAMP_MS: u64 = 946_684_800_000;

/// 2250-01-01T00:00:00Z, in milliseconds since the Unix epoch.
pub(crate) const MAX_TIMESTAMP_MS: u64 = 8_835_955_200_000;

/// How a metric's values relate to each other across snapshots.
///
/// Determined by the metric type, not by the caller, and carried in both
/// readings and metadata definitions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RateKind {
    /// Per-window delta.
    Counter,
    /// A rate derived from a counter on the backend.
    Rate,
    /// Point-in-time value.
    Gauge,
    /// Monotonic total that survives in-process resets.
    CumulativeCounter,
}

impl RateKind {
    /// Wire name used in metadata payloads.
    pub fn as_str(self) -> &'static str {
        match self {
            RateKind::Counter => "counter",
            RateKind::Rate => "rate",
            RateKind::Gauge => "gauge",
            RateKind::CumulativeCounter => "cumulative_counter",
        }
    }
}

/// A single serialized-to-be value: one point destined for every endpoint.
///
/// Immutable once constructed; the collector builds these during `serialize`
/// and hands them straight to the per-endpoint writers.
#[derive(Clone, Debug)]
pub struct MetricReading {
    name: Arc<str>,
    suffix: Cow<'static, str>,
    kind: RateKind,
    value: f64,
    tags: Arc<ResolvedTags>,
    timestamp: SystemTime,
}

impl MetricReading {
    /// Creates a reading after validating the timestamp range.
    ///
    /// Timestamps must fall within the closed interval
    /// [2000-01-01T00:00:00Z, 2250-01-01T00:00:00Z].
    pub fn new(
        name: Arc<str>,
        suffix: impl Into<Cow<'static, str>>,
        kind: RateKind,
        value: f64,
        tags: Arc<ResolvedTags>,
        timestamp: SystemTime,
    ) -> Result<MetricReading, MetricsError> {
        let millis = epoch_millis(timestamp);
        if !(MIN_TIMESTAMP_MS..=MAX_TIMESTAMP_MS).contains(&millis) {
            return Err(MetricsError::TimestampOutOfRange { timestamp });
        }

        Ok(MetricReading { name, suffix: suffix.into(), kind, value, tags, timestamp })
    }

    /// The full (prefixed) metric name, without the suffix.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The aggregate suffix, empty for plain readings.
    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    /// The rate kind of the metric that produced this reading.
    pub fn kind(&self) -> RateKind {
        self.kind
    }

    /// The recorded value.
    pub fn value(&self) -> f64 {
        self.value
    }

    /// The canonical merged tag set.
    pub fn tags(&self) -> &ResolvedTags {
        &self.tags
    }

    /// The reading's timestamp.
    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    /// The timestamp as milliseconds since the Unix epoch.
    pub fn timestamp_millis(&self) -> u64 {
        epoch_millis(self.timestamp)
    }
}

/// Converts a timestamp to milliseconds since the Unix epoch.
///
/// Pre-epoch timestamps saturate to zero, which the range check in
/// [`MetricReading::new`] rejects anyway.
pub(crate) fn epoch_millis(timestamp: SystemTime) -> u64 {
    timestamp
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

/// Name-level metadata describing a registered metric.
///
/// One definition exists per full metric name; the registry rejects
/// registrations whose metadata diverges from the first one seen.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetricDefinition {
    /// Full (prefixed) metric name.
    pub name: Arc<str>,
    /// Unit of the recorded values, e.g. `requests` or `milliseconds`.
    pub unit: String,
    /// Human-readable description.
    pub description: String,
    /// Rate kind, derived from the metric type.
    pub rate_kind: RateKind,
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::{Duration, UNIX_EPOCH};

    use super::{MetricReading, RateKind, MAX_TIMESTAMP_MS, MIN_TIMESTAMP_MS};
    use crate::error::MetricsError;
    use crate::tags::{default_name_transformer, resolve_tags, TagSet};

    fn reading_at(millis: u64) -> Result<MetricReading, MetricsError> {
        let tags =
            resolve_tags(&TagSet::new(), &TagSet::new(), &default_name_transformer()).unwrap();
        MetricReading::new(
            Arc::from("test.metric"),
            "",
            RateKind::Gauge,
            1.0,
            tags,
            UNIX_EPOCH + Duration::from_millis(millis),
        )
    }

    #[test]
    fn accepts_epoch_2000_exactly() {
        let reading = reading_at(MIN_TIMESTAMP_MS).unwrap();
        assert_eq!(reading.timestamp_millis(), MIN_TIMESTAMP_MS);
    }

    #[test]
    fn rejects_last_millisecond_of_1999() {
        assert!(matches!(
            reading_at(MIN_TIMESTAMP_MS - 1),
            Err(MetricsError::TimestampOutOfRange { .. })
        ));
    }

    #[test]
    fn accepts_upper_bound_rejects_beyond() {
        assert!(reading_at(MAX_TIMESTAMP_MS).is_ok());
        assert!(matches!(
            reading_at(MAX_TIMESTAMP_MS + 1),
            Err(MetricsError::TimestampOutOfRange { .. })
        ));
    }
}
