//! Endpoint handlers: the transport-specific halves of the pipeline.

use std::sync::Arc;
use std::time::Duration;

use crate::error::MetricsError;
use crate::reading::MetricDefinition;
use crate::writer::WireFormat;

mod http;
pub use http::{BosunHandler, DataDogHandler, SignalFxHandler};

mod statsd;
pub use statsd::StatsdHandler;

mod local;
pub use local::{LocalSink, LocalSinkHandler};

/// Ambient context for one send attempt, provided by the collector worker.
pub struct SendContext<'a> {
    pub(crate) endpoint: &'a str,
    pub(crate) runtime: &'a tokio::runtime::Runtime,
    pub(crate) timeout: Duration,
}

impl SendContext<'_> {
    /// Name of the endpoint this send belongs to.
    pub fn endpoint(&self) -> &str {
        self.endpoint
    }

    /// Runtime for handlers whose transport is asynchronous.
    pub fn runtime(&self) -> &tokio::runtime::Runtime {
        self.runtime
    }

    /// Per-request timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// One downstream destination's transport.
///
/// Handlers are driven exclusively from the collector worker, one payload at
/// a time; they never see concurrent calls. Transient failures
/// ([`MetricsError::TransportTransient`]) send the payload into the retry
/// queue; fatal failures drop it.
pub trait EndpointHandler: Send {
    /// The framing used to serialize readings for this endpoint.
    fn wire_format(&self) -> &dyn WireFormat;

    /// Sends one finalized payload.
    fn send_payload(&mut self, payload: &[u8], cx: &SendContext<'_>) -> Result<(), MetricsError>;

    /// Ships the current metadata definitions, where the backend has a
    /// metadata surface; the default does nothing.
    fn send_metadata(
        &mut self,
        definitions: &[MetricDefinition],
        cx: &SendContext<'_>,
    ) -> Result<(), MetricsError> {
        let _ = (definitions, cx);
        Ok(())
    }

    /// Releases transport resources; called once at shutdown.
    fn dispose(&mut self) {}
}

/// A named pairing of an endpoint handler with its place in the collector.
///
/// The payload queue and retry policy are attached when the collector is
/// built; until then this is just the name and the transport.
pub struct MetricEndpoint {
    name: Arc<str>,
    handler: Box<dyn EndpointHandler>,
}

impl MetricEndpoint {
    /// Pairs a handler with a name used in callbacks, errors, and self-metrics.
    pub fn new<H>(name: impl Into<String>, handler: H) -> MetricEndpoint
    where
        H: EndpointHandler + 'static,
    {
        MetricEndpoint { name: Arc::from(name.into()), handler: Box::new(handler) }
    }

    /// The endpoint's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn into_parts(self) -> (Arc<str>, Box<dyn EndpointHandler>) {
        (self.name, self.handler)
    }
}

/// Outcome of one send attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    /// The endpoint accepted the payload.
    Success,
    /// The send failed but the payload will be retried.
    TransientFailure,
    /// The send failed permanently and the payload was dropped.
    FatalFailure,
}

/// Observation of one send attempt, handed to the `after_send` callback.
#[derive(Clone, Debug)]
pub struct AfterSend {
    /// Endpoint the payload was sent to.
    pub endpoint: Arc<str>,
    /// Wall time the attempt took.
    pub duration: Duration,
    /// Bytes in the payload.
    pub bytes_written: usize,
    /// Readings framed into the payload.
    pub metrics_written: u32,
    /// What happened.
    pub outcome: SendOutcome,
    /// Failure description, for non-success outcomes.
    pub error: Option<String>,
    /// Payloads this endpoint dropped (queue pressure or retry exhaustion)
    /// since the previous event.
    pub dropped_payloads: u64,
}

/// Per-endpoint exponential backoff across failed flush cycles.
///
/// Starts at two seconds, doubles per consecutive failed cycle, and is capped
/// at the snapshot interval so a recovered endpoint never sits out more than
/// one window.
pub(crate) struct BackoffState {
    consecutive_failures: u32,
    resume_at: Option<quanta::Instant>,
}

const BACKOFF_BASE: Duration = Duration::from_secs(2);

impl BackoffState {
    pub(crate) fn new() -> BackoffState {
        BackoffState { consecutive_failures: 0, resume_at: None }
    }

    pub(crate) fn on_failure(&mut self, clock: &quanta::Clock, cap: Duration) {
        let exponent = self.consecutive_failures.min(16);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let delay = BACKOFF_BASE.saturating_mul(1u32 << exponent).min(cap);
        self.resume_at = Some(clock.now() + delay);
    }

    pub(crate) fn on_success(&mut self) {
        self.consecutive_failures = 0;
        self.resume_at = None;
    }

    /// Whether sends should be skipped this cycle.
    pub(crate) fn suppressed(&self, clock: &quanta::Clock) -> bool {
        self.resume_at.is_some_and(|resume_at| clock.now() < resume_at)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::BackoffState;

    #[test]
    fn backoff_grows_and_caps() {
        let clock = quanta::Clock::new();
        let cap = Duration::from_secs(30);
        let mut backoff = BackoffState::new();

        assert!(!backoff.suppressed(&clock));

        backoff.on_failure(&clock, cap);
        assert!(backoff.suppressed(&clock));

        // Many consecutive failures must not overflow past the cap.
        for _ in 0..40 {
            backoff.on_failure(&clock, cap);
        }
        assert!(backoff.suppressed(&clock));

        backoff.on_success();
        assert!(!backoff.suppressed(&clock));
    }
}
