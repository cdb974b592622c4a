//! Circuit breaker for upstream media server calls.
//!
//! Stops hammering a media server that is failing and gives it time to
//! recover before letting trial traffic through again.
//!
//! # State Machine
//!
//! ```text
//! CLOSED → OPEN        (requests >= min_requests and failure ratio >= threshold)
//! OPEN → HALF_OPEN     (timeout elapsed)
//! HALF_OPEN → CLOSED   (max_requests consecutive successes)
//! HALF_OPEN → OPEN     (any failure)
//! ```
//!
//! Counts are kept per *generation*. A generation ends on every state change
//! and, while closed, whenever the measurement interval elapses. Results of
//! calls that started in an earlier generation are discarded.
//!
//! # Example
//!
//! ```rust,ignore
//! use session_sync::infrastructure::resilience::{CircuitBreaker, CircuitBreakerConfig};
//!
//! let breaker = CircuitBreaker::new("emby-api", CircuitBreakerConfig::default());
//! let sessions = breaker.call(|| client.active_sessions()).await?;
//! ```

use std::future::Future;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::infrastructure::metrics::{self, BreakerOutcome};

// =============================================================================
// State and Configuration
// =============================================================================

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitBreakerState {
    /// Calls flow normally.
    Closed,
    /// Calls are rejected.
    Open,
    /// A limited number of trial calls are allowed.
    HalfOpen,
}

impl CircuitBreakerState {
    /// Lowercase label used in logs, metrics and health output.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        }
    }

    /// Gauge value: closed = 0, half-open = 1, open = 2.
    #[must_use]
    pub const fn gauge_value(self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::HalfOpen => 1.0,
            Self::Open => 2.0,
        }
    }
}

impl std::fmt::Display for CircuitBreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Trial calls allowed while half-open, and the consecutive successes
    /// needed to close. Zero is treated as one.
    pub max_requests: u32,
    /// Measurement interval while closed. Zero keeps counts until the next
    /// state change.
    pub interval: Duration,
    /// Time spent open before moving to half-open.
    pub timeout: Duration,
    /// Requests required in a generation before the breaker may trip.
    pub min_requests: u32,
    /// Failure ratio (0.0-1.0) at which the breaker trips.
    pub failure_ratio: f64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_requests: 3,
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(120),
            min_requests: 10,
            failure_ratio: 0.6,
        }
    }
}

impl CircuitBreakerConfig {
    /// Whether `counts` should move a closed breaker to open.
    #[must_use]
    pub fn should_trip(&self, counts: &Counts) -> bool {
        counts.requests >= self.min_requests && counts.failure_ratio() >= self.failure_ratio
    }

    const fn half_open_quota(&self) -> u32 {
        if self.max_requests == 0 {
            1
        } else {
            self.max_requests
        }
    }
}

/// Request counts for the current generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counts {
    /// Requests admitted.
    pub requests: u32,
    /// Successful requests.
    pub total_successes: u32,
    /// Failed requests.
    pub total_failures: u32,
    /// Successes since the last failure.
    pub consecutive_successes: u32,
    /// Failures since the last success.
    pub consecutive_failures: u32,
}

impl Counts {
    /// Failures divided by admitted requests; zero when nothing was admitted.
    #[must_use]
    pub fn failure_ratio(&self) -> f64 {
        if self.requests == 0 {
            return 0.0;
        }
        f64::from(self.total_failures) / f64::from(self.requests)
    }

    const fn on_request(&mut self) {
        self.requests = self.requests.saturating_add(1);
    }

    const fn on_success(&mut self) {
        self.total_successes = self.total_successes.saturating_add(1);
        self.consecutive_successes = self.consecutive_successes.saturating_add(1);
        self.consecutive_failures = 0;
    }

    const fn on_failure(&mut self) {
        self.total_failures = self.total_failures.saturating_add(1);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_successes = 0;
    }
}

/// Error returned by [`CircuitBreaker::call`].
#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    /// Breaker is open; the operation was not run.
    #[error("circuit breaker '{name}' is open")]
    Open {
        /// Breaker name.
        name: String,
    },

    /// Breaker is half-open and its trial quota is in use.
    #[error("circuit breaker '{name}' is half-open: too many requests")]
    TooManyRequests {
        /// Breaker name.
        name: String,
    },

    /// The operation ran and failed.
    #[error(transparent)]
    Inner(E),
}

impl<E> BreakerError<E> {
    /// Whether the breaker refused the call.
    #[must_use]
    pub const fn is_rejection(&self) -> bool {
        matches!(self, Self::Open { .. } | Self::TooManyRequests { .. })
    }
}

// =============================================================================
// Circuit Breaker
// =============================================================================

#[derive(Debug, Clone, Copy)]
enum Rejection {
    Open,
    TooManyRequests,
}

#[derive(Debug, Clone, Copy)]
struct Transition {
    from: CircuitBreakerState,
    to: CircuitBreakerState,
    counts: Counts,
}

#[derive(Debug)]
struct Inner {
    state: CircuitBreakerState,
    generation: u64,
    counts: Counts,
    expiry: Option<Instant>,
}

/// Three-state circuit breaker gating arbitrary async operations.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Create a closed circuit breaker.
    #[must_use]
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name = name.into();
        let expiry = (!config.interval.is_zero()).then(|| Instant::now() + config.interval);

        metrics::set_circuit_breaker_state(&name, CircuitBreakerState::Closed.gauge_value());
        metrics::set_circuit_breaker_consecutive_failures(&name, 0);

        Self {
            name,
            config,
            inner: Mutex::new(Inner {
                state: CircuitBreakerState::Closed,
                generation: 0,
                counts: Counts::default(),
                expiry,
            }),
        }
    }

    /// Breaker name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Breaker configuration.
    #[must_use]
    pub const fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state, after applying any elapsed timeout or interval.
    #[must_use]
    pub fn state(&self) -> CircuitBreakerState {
        let (state, transition) = {
            let mut inner = self.inner.lock();
            let transition = self.refresh(&mut inner, Instant::now());
            (inner.state, transition)
        };
        self.emit(transition);
        state
    }

    /// Counts for the current generation.
    #[must_use]
    pub fn counts(&self) -> Counts {
        let (counts, transition) = {
            let mut inner = self.inner.lock();
            let transition = self.refresh(&mut inner, Instant::now());
            (inner.counts, transition)
        };
        self.emit(transition);
        counts
    }

    /// Run `op` through the breaker.
    ///
    /// A rejected call never invokes `op`. An `Err` from `op` counts as a
    /// failure. If the returned future is dropped before `op` completes, the
    /// call is recorded as a failure.
    pub async fn call<T, E, F, Fut>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let generation = match self.before_request() {
            Ok(generation) => generation,
            Err(rejection) => {
                metrics::record_circuit_breaker_request(&self.name, BreakerOutcome::Rejected);
                tracing::warn!(name = %self.name, "Circuit breaker rejected request");
                return Err(match rejection {
                    Rejection::Open => BreakerError::Open {
                        name: self.name.clone(),
                    },
                    Rejection::TooManyRequests => BreakerError::TooManyRequests {
                        name: self.name.clone(),
                    },
                });
            }
        };

        let mut guard = InFlight {
            breaker: self,
            generation,
            finished: false,
        };
        let result = op().await;
        guard.finish(result.is_ok());

        result.map_err(BreakerError::Inner)
    }

    fn before_request(&self) -> Result<u64, Rejection> {
        let (result, transition) = {
            let mut inner = self.inner.lock();
            let transition = self.refresh(&mut inner, Instant::now());
            let result = match inner.state {
                CircuitBreakerState::Open => Err(Rejection::Open),
                CircuitBreakerState::HalfOpen
                    if inner.counts.requests >= self.config.half_open_quota() =>
                {
                    Err(Rejection::TooManyRequests)
                }
                _ => {
                    inner.counts.on_request();
                    Ok(inner.generation)
                }
            };
            (result, transition)
        };
        self.emit(transition);
        result
    }

    fn after_request(&self, generation: u64, success: bool) {
        let (refreshed, outcome, consecutive_failures) = {
            let mut inner = self.inner.lock();
            let now = Instant::now();
            let refreshed = self.refresh(&mut inner, now);
            if inner.generation != generation {
                drop(inner);
                self.emit(refreshed);
                return;
            }

            let outcome = if success {
                self.on_success(&mut inner, now)
            } else {
                self.on_failure(&mut inner, now)
            };
            (refreshed, outcome, inner.counts.consecutive_failures)
        };

        let result = if success {
            BreakerOutcome::Success
        } else {
            BreakerOutcome::Failure
        };
        metrics::record_circuit_breaker_request(&self.name, result);
        metrics::set_circuit_breaker_consecutive_failures(&self.name, consecutive_failures);

        self.emit(refreshed);
        self.emit(outcome);
    }

    fn on_success(&self, inner: &mut Inner, now: Instant) -> Option<Transition> {
        match inner.state {
            CircuitBreakerState::Closed => {
                inner.counts.on_success();
                None
            }
            CircuitBreakerState::HalfOpen => {
                inner.counts.on_success();
                if inner.counts.consecutive_successes >= self.config.half_open_quota() {
                    self.set_state(inner, CircuitBreakerState::Closed, now)
                } else {
                    None
                }
            }
            CircuitBreakerState::Open => None,
        }
    }

    fn on_failure(&self, inner: &mut Inner, now: Instant) -> Option<Transition> {
        match inner.state {
            CircuitBreakerState::Closed => {
                inner.counts.on_failure();
                if self.config.should_trip(&inner.counts) {
                    self.set_state(inner, CircuitBreakerState::Open, now)
                } else {
                    None
                }
            }
            CircuitBreakerState::HalfOpen => self.set_state(inner, CircuitBreakerState::Open, now),
            CircuitBreakerState::Open => None,
        }
    }

    /// Apply time-based transitions.
    fn refresh(&self, inner: &mut Inner, now: Instant) -> Option<Transition> {
        match inner.state {
            CircuitBreakerState::Closed => {
                if inner.expiry.is_some_and(|expiry| expiry <= now) {
                    self.new_generation(inner, now);
                }
                None
            }
            CircuitBreakerState::Open => {
                if inner.expiry.is_some_and(|expiry| expiry <= now) {
                    self.set_state(inner, CircuitBreakerState::HalfOpen, now)
                } else {
                    None
                }
            }
            CircuitBreakerState::HalfOpen => None,
        }
    }

    fn set_state(
        &self,
        inner: &mut Inner,
        to: CircuitBreakerState,
        now: Instant,
    ) -> Option<Transition> {
        if inner.state == to {
            return None;
        }
        let transition = Transition {
            from: inner.state,
            to,
            counts: inner.counts,
        };
        inner.state = to;
        self.new_generation(inner, now);
        Some(transition)
    }

    fn new_generation(&self, inner: &mut Inner, now: Instant) {
        inner.generation = inner.generation.wrapping_add(1);
        inner.counts = Counts::default();
        inner.expiry = match inner.state {
            CircuitBreakerState::Closed => {
                (!self.config.interval.is_zero()).then(|| now + self.config.interval)
            }
            CircuitBreakerState::Open => Some(now + self.config.timeout),
            CircuitBreakerState::HalfOpen => None,
        };
    }

    fn emit(&self, transition: Option<Transition>) {
        let Some(Transition { from, to, counts }) = transition else {
            return;
        };

        if to == CircuitBreakerState::Open {
            tracing::warn!(
                name = %self.name,
                from = %from,
                to = %to,
                failures = counts.total_failures,
                failure_rate = counts.failure_ratio() * 100.0,
                "Circuit breaker opened"
            );
        } else {
            tracing::info!(
                name = %self.name,
                from = %from,
                to = %to,
                "Circuit breaker state transition"
            );
        }

        metrics::set_circuit_breaker_state(&self.name, to.gauge_value());
        metrics::record_circuit_breaker_transition(&self.name, from.as_str(), to.as_str());
        if to == CircuitBreakerState::Closed {
            metrics::set_circuit_breaker_consecutive_failures(&self.name, 0);
        }
    }
}

/// Records the outcome of an admitted call, or a failure if it never finishes.
struct InFlight<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    finished: bool,
}

impl InFlight<'_> {
    fn finish(&mut self, success: bool) {
        self.finished = true;
        self.breaker.after_request(self.generation, success);
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.breaker.after_request(self.generation, false);
        }
    }
}
