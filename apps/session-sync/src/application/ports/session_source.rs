//! Session Source Port (Driven Port)
//!
//! The capability every upstream media server client offers to the core:
//! a health check and a fetch of currently active sessions. Pollers and
//! circuit breakers depend only on this shape.

use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::SessionIdentity;

/// Errors surfaced by an upstream session source.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    /// Network or transport failure before a response arrived.
    #[error("request failed: {message}")]
    Transport {
        /// Underlying error text.
        message: String,
    },

    /// Upstream answered with a non-success status.
    #[error("upstream returned status {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, possibly truncated.
        body: String,
    },

    /// Response body did not match the expected shape.
    #[error("failed to decode response: {message}")]
    Decode {
        /// Decoder error text.
        message: String,
    },

    /// Upstream kept answering 429 until retries ran out.
    #[error("rate limit exceeded after {retries} retries (HTTP 429)")]
    RateLimited {
        /// Retries performed before giving up.
        retries: u32,
    },

    /// Circuit breaker rejected the call without contacting upstream.
    #[error("circuit breaker '{name}' is open")]
    CircuitOpen {
        /// Breaker name.
        name: String,
    },

    /// Circuit breaker is half-open and its trial quota is in use.
    #[error("circuit breaker '{name}' is half-open: too many requests")]
    TooManyRequests {
        /// Breaker name.
        name: String,
    },

    /// Configured base URL cannot be used.
    #[error("invalid url: {message}")]
    InvalidUrl {
        /// Parse error text.
        message: String,
    },

    /// The operation was cancelled by shutdown.
    #[error("operation cancelled")]
    Cancelled,
}

impl SourceError {
    /// Whether the error was produced by the circuit breaker itself.
    #[must_use]
    pub const fn is_rejection(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. } | Self::TooManyRequests { .. })
    }
}

/// Session record used by the generated mock.
#[cfg(test)]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StubSession {
    /// Dedup key.
    pub key: String,
}

#[cfg(test)]
impl SessionIdentity for StubSession {
    fn session_key(&self) -> &str {
        &self.key
    }

    fn has_active_playback(&self) -> bool {
        true
    }
}

/// Port for an upstream server that reports active playback sessions.
#[cfg_attr(test, mockall::automock(type Session = StubSession;))]
#[async_trait]
pub trait SessionSource: Send + Sync {
    /// Vendor session record.
    type Session: SessionIdentity + Clone + Send + Sync + 'static;

    /// Human-readable name for logs and metrics.
    fn name(&self) -> &str;

    /// Check that the upstream server is reachable.
    async fn ping(&self) -> Result<(), SourceError>;

    /// Fetch sessions with active playback.
    async fn active_sessions(&self) -> Result<Vec<Self::Session>, SourceError>;

    /// Circuit breaker state, when the source is wrapped in one.
    fn circuit_state(&self) -> Option<String> {
        None
    }
}

#[async_trait]
impl<T: SessionSource + ?Sized> SessionSource for Arc<T> {
    type Session = T::Session;

    fn name(&self) -> &str {
        (**self).name()
    }

    async fn ping(&self) -> Result<(), SourceError> {
        (**self).ping().await
    }

    async fn active_sessions(&self) -> Result<Vec<Self::Session>, SourceError> {
        (**self).active_sessions().await
    }

    fn circuit_state(&self) -> Option<String> {
        (**self).circuit_state()
    }
}
