//! Rate-Limited Request Executor
//!
//! Issues an HTTP request and retries only on `429 Too Many Requests`,
//! backing off exponentially (`base * 2^attempt`) unless the server sends
//! an integer `Retry-After` hint. Every other response or transport error
//! is returned on the attempt that produced it.
//!
//! The executor holds configuration only; backoff state lives for the
//! duration of one [`RateLimitedExecutor::execute`] call.

use std::future::Future;
use std::time::Duration;

use reqwest::header::RETRY_AFTER;
use reqwest::{RequestBuilder, Response, StatusCode};
use tokio_util::sync::CancellationToken;

use crate::application::ports::SourceError;
use crate::infrastructure::metrics;

/// Retry settings for rate-limited requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Retries after the first 429 before giving up.
    pub max_retries: u32,
    /// Delay before the first retry; doubles on each subsequent retry.
    pub base_delay: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
        }
    }
}

/// Rate-limited execution errors.
#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    /// Server kept answering 429.
    #[error("rate limit exceeded after {retries} retries (HTTP 429)")]
    Exceeded {
        /// Retries performed.
        retries: u32,
    },

    /// Cancelled before or while waiting to retry.
    #[error("request cancelled")]
    Cancelled,

    /// Transport failure; not retried.
    #[error("HTTP request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// Request could not be cloned for a retry.
    #[error("request body cannot be retried")]
    NotRetryable,
}

impl From<RateLimitError> for SourceError {
    fn from(err: RateLimitError) -> Self {
        match err {
            RateLimitError::Exceeded { retries } => Self::RateLimited { retries },
            RateLimitError::Cancelled => Self::Cancelled,
            RateLimitError::Transport(e) => Self::Transport {
                message: e.to_string(),
            },
            RateLimitError::NotRetryable => Self::Transport {
                message: "request body cannot be retried".to_string(),
            },
        }
    }
}

/// Stateless executor that retries on HTTP 429.
#[derive(Debug, Clone, Copy, Default)]
pub struct RateLimitedExecutor {
    config: RateLimitConfig,
}

impl RateLimitedExecutor {
    /// Create an executor with the given retry settings.
    #[must_use]
    pub const fn new(config: RateLimitConfig) -> Self {
        Self { config }
    }

    /// Retry settings.
    #[must_use]
    pub const fn config(&self) -> RateLimitConfig {
        self.config
    }

    /// Send a prepared request, cloning it for each retry.
    pub async fn send(
        &self,
        cancel: &CancellationToken,
        request: RequestBuilder,
    ) -> Result<Response, RateLimitError> {
        self.execute(cancel, || {
            let attempt = request.try_clone();
            async move {
                match attempt {
                    Some(builder) => builder.send().await.map_err(RateLimitError::from),
                    None => Err(RateLimitError::NotRetryable),
                }
            }
        })
        .await
    }

    /// Run `send` until it yields a non-429 response, an error, or retries
    /// run out.
    pub async fn execute<F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut send: F,
    ) -> Result<Response, RateLimitError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Response, RateLimitError>>,
    {
        for attempt in 0..=self.config.max_retries {
            if cancel.is_cancelled() {
                return Err(RateLimitError::Cancelled);
            }

            let response = send().await?;
            if response.status() != StatusCode::TOO_MANY_REQUESTS {
                return Ok(response);
            }

            let hint = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            // Release the connection before sleeping.
            drop(response);

            if attempt == self.config.max_retries {
                break;
            }

            let delay = hint.unwrap_or_else(|| self.backoff_delay(attempt));
            metrics::record_rate_limit_retry();
            tracing::warn!(
                attempt = attempt + 1,
                max_retries = self.config.max_retries,
                delay_ms = delay.as_millis(),
                retry_after = hint.is_some(),
                "Rate limited (HTTP 429), backing off"
            );

            tokio::select! {
                () = cancel.cancelled() => return Err(RateLimitError::Cancelled),
                () = tokio::time::sleep(delay) => {}
            }
        }

        Err(RateLimitError::Exceeded {
            retries: self.config.max_retries,
        })
    }

    /// Exponential delay for a zero-based retry attempt.
    #[must_use]
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.config.base_delay.saturating_mul(factor)
    }
}

/// Parse a `Retry-After` value given in whole seconds.
///
/// HTTP-date values are not supported and yield `None`.
#[must_use]
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}
