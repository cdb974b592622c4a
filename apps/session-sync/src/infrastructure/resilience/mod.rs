//! Resilience patterns for upstream media server calls.
//!
//! Circuit breakers that fail fast while a server is unhealthy.

mod breaker_client;
mod circuit_breaker;

pub use breaker_client::CircuitBreakerClient;
pub use circuit_breaker::{
    BreakerError, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerState, Counts,
};
