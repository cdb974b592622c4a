//! Prometheus Metrics Module
//!
//! Exposes session sync metrics in Prometheus format.
//!
//! # Metrics Categories
//!
//! - **Circuit breakers**: state, transitions, request outcomes
//! - **Polling**: poll outcomes, emitted sessions, dedup cache size
//! - **Realtime**: WebSocket connection state and reconnects
//! - **Publishing**: published events, history sync duration
//!
//! Recording functions are no-ops until [`init_metrics`] installs a recorder.
//! Metrics are exposed at `/metrics` on the health server port.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::domain::Source;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Subsequent calls return the handle installed by the first one.
///
/// # Panics
///
/// Panics if the recorder cannot be installed (another global recorder is
/// already set).
#[allow(clippy::expect_used)]
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let handle = PrometheusBuilder::new()
                .install_recorder()
                .expect("failed to install Prometheus recorder");

            register_metrics();
            handle
        })
        .clone()
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Circuit breakers
    describe_gauge!(
        "session_sync_circuit_breaker_state",
        "Circuit breaker state (0 = closed, 1 = half-open, 2 = open)"
    );
    describe_counter!(
        "session_sync_circuit_breaker_transitions_total",
        "Circuit breaker state transitions"
    );
    describe_counter!(
        "session_sync_circuit_breaker_requests_total",
        "Requests through a circuit breaker by result"
    );
    describe_gauge!(
        "session_sync_circuit_breaker_consecutive_failures",
        "Consecutive failures seen by a circuit breaker"
    );

    // Polling
    describe_counter!(
        "session_sync_polls_total",
        "Session polls by source and result"
    );
    describe_counter!(
        "session_sync_sessions_emitted_total",
        "Sessions passed to the pipeline after deduplication"
    );
    describe_gauge!(
        "session_sync_dedup_tracked_sessions",
        "Session keys held in the dedup cache"
    );
    describe_counter!(
        "session_sync_rate_limit_retries_total",
        "Retries caused by HTTP 429 responses"
    );

    // Realtime
    describe_counter!(
        "session_sync_websocket_reconnects_total",
        "WebSocket reconnection attempts"
    );
    describe_gauge!(
        "session_sync_websocket_connected",
        "Whether the WebSocket feed is connected (1) or not (0)"
    );

    // Publishing
    describe_counter!(
        "session_sync_events_published_total",
        "Playback events handed to the publisher by result"
    );
    describe_histogram!(
        "session_sync_history_sync_duration_seconds",
        "Duration of history sync runs"
    );
}

// =============================================================================
// Metric Labels
// =============================================================================

/// Outcome of a call through a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerOutcome {
    /// Wrapped call succeeded.
    Success,
    /// Wrapped call failed.
    Failure,
    /// Breaker refused the call.
    Rejected,
}

impl BreakerOutcome {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Rejected => "rejected",
        }
    }
}

/// Outcome of an operation that either succeeds or fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Operation succeeded.
    Success,
    /// Operation failed.
    Failure,
}

impl Outcome {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }

    /// Outcome of a `Result`.
    #[must_use]
    pub const fn of<T, E>(result: &Result<T, E>) -> Self {
        match result {
            Ok(_) => Self::Success,
            Err(_) => Self::Failure,
        }
    }
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Set the circuit breaker state gauge.
pub fn set_circuit_breaker_state(name: &str, value: f64) {
    gauge!("session_sync_circuit_breaker_state", "name" => name.to_string()).set(value);
}

/// Record a circuit breaker state transition.
pub fn record_circuit_breaker_transition(name: &str, from: &'static str, to: &'static str) {
    counter!(
        "session_sync_circuit_breaker_transitions_total",
        "name" => name.to_string(),
        "from" => from,
        "to" => to
    )
    .increment(1);
}

/// Record the outcome of a call through a circuit breaker.
pub fn record_circuit_breaker_request(name: &str, outcome: BreakerOutcome) {
    counter!(
        "session_sync_circuit_breaker_requests_total",
        "name" => name.to_string(),
        "result" => outcome.as_str()
    )
    .increment(1);
}

/// Set the consecutive failure gauge for a circuit breaker.
pub fn set_circuit_breaker_consecutive_failures(name: &str, count: u32) {
    gauge!(
        "session_sync_circuit_breaker_consecutive_failures",
        "name" => name.to_string()
    )
    .set(f64::from(count));
}

/// Record a session poll.
pub fn record_poll(source: Source, outcome: Outcome) {
    counter!(
        "session_sync_polls_total",
        "source" => source.as_str(),
        "result" => outcome.as_str()
    )
    .increment(1);
}

/// Record sessions emitted after deduplication.
pub fn record_sessions_emitted(source: Source, count: usize) {
    counter!("session_sync_sessions_emitted_total", "source" => source.as_str())
        .increment(count as u64);
}

/// Update the dedup cache size gauge.
pub fn set_dedup_tracked_sessions(source: Source, count: usize) {
    gauge!("session_sync_dedup_tracked_sessions", "source" => source.as_str()).set(count as f64);
}

/// Record a retry after HTTP 429.
pub fn record_rate_limit_retry() {
    counter!("session_sync_rate_limit_retries_total").increment(1);
}

/// Record a WebSocket reconnection attempt.
pub fn record_websocket_reconnect(source: Source) {
    counter!("session_sync_websocket_reconnects_total", "source" => source.as_str()).increment(1);
}

/// Update the WebSocket connection gauge.
pub fn set_websocket_connected(source: Source, connected: bool) {
    gauge!("session_sync_websocket_connected", "source" => source.as_str())
        .set(if connected { 1.0 } else { 0.0 });
}

/// Record a publish attempt.
pub fn record_event_published(source: Source, outcome: Outcome) {
    counter!(
        "session_sync_events_published_total",
        "source" => source.as_str(),
        "result" => outcome.as_str()
    )
    .increment(1);
}

/// Record a history sync run duration.
pub fn record_history_sync_duration(duration: Duration) {
    histogram!("session_sync_history_sync_duration_seconds").record(duration.as_secs_f64());
}

// =============================================================================
// Tests
// =============================================================================
