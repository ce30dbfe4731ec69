use std::time::SystemTime;

use thiserror::Error;

/// Errors surfaced by the collector, its registry, and its endpoints.
///
/// Registration errors are returned synchronously from `get_metric`/`bind_metric`.
/// Serialization and transport errors are routed to the configured exception
/// handler from the collector's worker thread.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// A metric name was re-registered with a different unit, description, or rate kind.
    #[error("metric '{name}' already registered with different metadata ({conflict})")]
    InconsistentMetadata {
        /// Full (prefixed) metric name.
        name: String,
        /// Which piece of metadata diverged.
        conflict: &'static str,
    },

    /// A metric key resolved to an existing metric of a different concrete type.
    #[error("metric '{name}' already registered as a different metric type")]
    TypeMismatch {
        /// Full (prefixed) metric name.
        name: String,
    },

    /// A tag key appears more than once after merging in the default tags.
    #[error("tag '{key}' conflicts with an already-present tag of the same name")]
    TagConflict {
        /// The offending tag key, post-transform.
        key: String,
    },

    /// A tag was declared with an empty key or value.
    #[error("tag '{key}' has an empty or missing value")]
    InvalidTag {
        /// The offending tag key.
        key: String,
    },

    /// A tag value contains characters outside the allowed set.
    #[error("tag '{key}' has invalid value '{value}' (allowed: letters, digits, '-', '_', '.', '/')")]
    InvalidTagValue {
        /// The offending tag key.
        key: String,
        /// The rejected value.
        value: String,
    },

    /// A reading's timestamp fell outside the supported range.
    #[error("timestamp {timestamp:?} is outside the supported range [2000-01-01, 2250-01-01]")]
    TimestampOutOfRange {
        /// The rejected timestamp.
        timestamp: SystemTime,
    },

    /// The metric has not been attached to a running collector.
    #[error("metric is not attached to a running collector")]
    NotAttached,

    /// A payload queue hit its bound and dropped queued payloads.
    #[error("payload queue for endpoint '{endpoint}' is full; dropped {dropped} payload(s)")]
    QueueFull {
        /// Endpoint whose queue overflowed.
        endpoint: String,
        /// Number of payloads dropped by this overflow.
        dropped: u64,
    },

    /// A send failed in a way that is worth retrying.
    #[error("transient transport failure for endpoint '{endpoint}': {reason}")]
    TransportTransient {
        /// Endpoint whose send failed.
        endpoint: String,
        /// Underlying failure description.
        reason: String,
    },

    /// A send failed in a way that retrying cannot fix; the payload is dropped.
    #[error("fatal transport failure for endpoint '{endpoint}': {reason}")]
    TransportFatal {
        /// Endpoint whose send failed.
        endpoint: String,
        /// Underlying failure description.
        reason: String,
    },

    /// Payloads were still pending when the shutdown grace period expired.
    #[error("shutdown aborted delivery of {dropped} payload(s) for endpoint '{endpoint}'")]
    ShutdownAborted {
        /// Endpoint whose payloads were abandoned.
        endpoint: String,
        /// Number of payloads abandoned.
        dropped: u64,
    },
}

impl MetricsError {
    /// Returns `true` if the error is a transport failure worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, MetricsError::TransportTransient { .. })
    }
}
