//! Circuit-breaker-wrapped session source.
//!
//! Every operation on the wrapped client passes through one breaker, so a
//! failing `ping` counts the same as a failing session fetch.

use std::future::Future;

use async_trait::async_trait;

use super::circuit_breaker::{
    BreakerError, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerState, Counts,
};
use crate::application::ports::{SessionSource, SourceError};

/// A [`SessionSource`] guarded by a [`CircuitBreaker`].
#[derive(Debug)]
pub struct CircuitBreakerClient<S> {
    inner: S,
    breaker: CircuitBreaker,
}

impl<S: SessionSource> CircuitBreakerClient<S> {
    /// Wrap `inner` in a breaker named `name`.
    #[must_use]
    pub fn new(inner: S, name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            inner,
            breaker: CircuitBreaker::new(name, config),
        }
    }

    /// Wrapped client, for operations that must bypass the breaker.
    #[must_use]
    pub const fn inner(&self) -> &S {
        &self.inner
    }

    /// Current breaker state.
    #[must_use]
    pub fn state(&self) -> CircuitBreakerState {
        self.breaker.state()
    }

    /// Current breaker counts.
    #[must_use]
    pub fn counts(&self) -> Counts {
        self.breaker.counts()
    }

    /// Run any client operation through the breaker.
    ///
    /// `op` is only polled when the breaker admits the call.
    pub async fn execute<T, Fut>(&self, op: Fut) -> Result<T, SourceError>
    where
        Fut: Future<Output = Result<T, SourceError>>,
    {
        self.breaker
            .call(|| op)
            .await
            .map_err(into_source_error)
    }
}

fn into_source_error(err: BreakerError<SourceError>) -> SourceError {
    match err {
        BreakerError::Open { name } => SourceError::CircuitOpen { name },
        BreakerError::TooManyRequests { name } => SourceError::TooManyRequests { name },
        BreakerError::Inner(inner) => inner,
    }
}

#[async_trait]
impl<S: SessionSource> SessionSource for CircuitBreakerClient<S> {
    type Session = S::Session;

    fn name(&self) -> &str {
        self.breaker.name()
    }

    async fn ping(&self) -> Result<(), SourceError> {
        self.execute(self.inner.ping()).await
    }

    async fn active_sessions(&self) -> Result<Vec<Self::Session>, SourceError> {
        self.execute(self.inner.active_sessions()).await
    }

    fn circuit_state(&self) -> Option<String> {
        Some(self.breaker.state().to_string())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::domain::SessionIdentity;

    #[derive(Debug, Clone)]
    struct Fake(String);

    impl SessionIdentity for Fake {
        fn session_key(&self) -> &str {
            &self.0
        }

        fn has_active_playback(&self) -> bool {
            true
        }
    }

    #[derive(Debug, Default)]
    struct FlakySource {
        fail: bool,
        calls: AtomicU32,
    }

    #[async_trait]
    impl SessionSource for FlakySource {
        type Session = Fake;

        fn name(&self) -> &str {
            "flaky"
        }

        async fn ping(&self) -> Result<(), SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn active_sessions(&self) -> Result<Vec<Fake>, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(SourceError::Status {
                    status: 500,
                    body: "internal error".to_string(),
                })
            } else {
                Ok(vec![Fake("a".to_string())])
            }
        }
    }

    #[tokio::test]
    async fn test_passes_through_when_closed() {
        let client = CircuitBreakerClient::new(
            FlakySource::default(),
            "emby-api",
            CircuitBreakerConfig::default(),
        );
        assert_eq!(client.name(), "emby-api");
        assert_eq!(client.active_sessions().await.unwrap().len(), 1);
        assert_eq!(client.circuit_state().as_deref(), Some("closed"));
    }

    #[tokio::test]
    async fn test_opens_and_short_circuits() {
        let client = CircuitBreakerClient::new(
            FlakySource {
                fail: true,
                ..FlakySource::default()
            },
            "emby-api",
            CircuitBreakerConfig::default(),
        );

        for _ in 0..10 {
            let err = client.active_sessions().await.unwrap_err();
            assert!(matches!(err, SourceError::Status { status: 500, .. }));
        }
        assert_eq!(client.state(), CircuitBreakerState::Open);

        let err = client.ping().await.unwrap_err();
        assert_eq!(
            err,
            SourceError::CircuitOpen {
                name: "emby-api".to_string()
            }
        );
        assert_eq!(client.inner().calls.load(Ordering::SeqCst), 10);
        assert_eq!(client.circuit_state().as_deref(), Some("open"));
    }
}
