//! Session Poller Service
//!
//! One poller per media server. It fetches active sessions on a fixed
//! interval, filters them through a [`DedupCache`], and hands each new
//! session to the registered callback.
//!
//! Sessions pushed over a realtime feed go through [`SessionPoller::ingest`],
//! which shares the same cache, so a session seen by both paths is emitted
//! once.
//!
//! The poller is `stopped` until [`SessionPoller::start`] and can be
//! restarted after [`SessionPoller::stop`].

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::application::ports::{SessionSource, SourceError};
use crate::domain::dedup::DEFAULT_CAPACITY;
use crate::domain::{DedupCache, SessionIdentity, Source};
use crate::infrastructure::metrics::{self, Outcome};

/// Handler invoked for every emitted session.
pub type SessionCallback<T> = Arc<dyn Fn(T) -> BoxFuture<'static, ()> + Send + Sync>;

/// Poller configuration. Fixed once the poller is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollerConfig {
    /// Time between polls.
    pub interval: Duration,
    /// Emit every active session on every poll instead of only new ones.
    pub publish_all: bool,
    /// How long a seen session suppresses duplicates. Zero never expires.
    pub seen_session_ttl: Duration,
    /// Maximum number of tracked sessions.
    pub capacity: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            publish_all: false,
            seen_session_ttl: Duration::from_secs(3600),
            capacity: DEFAULT_CAPACITY,
        }
    }
}

impl PollerConfig {
    /// Interval of the expired-entry sweep, or `None` when entries never
    /// expire.
    #[must_use]
    pub fn sweep_interval(&self) -> Option<Duration> {
        if self.seen_session_ttl.is_zero() {
            None
        } else {
            Some((self.seen_session_ttl / 2).max(Duration::from_millis(1)))
        }
    }
}

struct Shared<S: SessionSource> {
    source: S,
    tag: Source,
    config: PollerConfig,
    dedup: DedupCache,
    callback: RwLock<Option<SessionCallback<S::Session>>>,
}

impl<S: SessionSource> Shared<S> {
    async fn poll(&self) -> Result<usize, SourceError> {
        let sessions = match self.source.active_sessions().await {
            Ok(sessions) => sessions,
            Err(e) => {
                metrics::record_poll(self.tag, Outcome::Failure);
                tracing::warn!(error = %e, "Failed to fetch active sessions");
                return Err(e);
            }
        };
        metrics::record_poll(self.tag, Outcome::Success);
        Ok(self.emit(sessions).await)
    }

    async fn emit(&self, sessions: Vec<S::Session>) -> usize {
        let callback = self.callback.read().clone();
        let mut emitted = 0;

        for session in sessions {
            if !session.has_active_playback() {
                continue;
            }
            let key = session.session_key().to_owned();
            if !self.config.publish_all && self.dedup.is_duplicate(&key) {
                continue;
            }

            if let Some(callback) = &callback {
                callback(session).await;
            }
            if self.config.publish_all {
                self.dedup.add(&key, Instant::now());
            }
            emitted += 1;
        }

        if emitted > 0 {
            tracing::debug!(emitted, tracked = self.dedup.len(), "Sessions emitted");
            metrics::record_sessions_emitted(self.tag, emitted);
        }
        metrics::set_dedup_tracked_sessions(self.tag, self.dedup.len());
        emitted
    }

    fn sweep(&self) {
        let removed = self.dedup.cleanup_expired();
        if removed > 0 {
            tracing::debug!(removed, "Expired seen sessions");
        }
        metrics::set_dedup_tracked_sessions(self.tag, self.dedup.len());
    }
}

async fn run<S: SessionSource>(shared: Arc<Shared<S>>, stop: CancellationToken) {
    tracing::info!(
        interval_secs = shared.config.interval.as_secs(),
        publish_all = shared.config.publish_all,
        "Session poller started"
    );

    tokio::select! {
        () = stop.cancelled() => return,
        _ = shared.poll() => {}
    }

    let interval = shared.config.interval.max(Duration::from_millis(1));
    let mut poll_ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    poll_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let sweep_every = shared.config.sweep_interval();
    let sweep_period = sweep_every.unwrap_or(Duration::from_secs(3600));
    let mut sweep_ticker =
        tokio::time::interval_at(tokio::time::Instant::now() + sweep_period, sweep_period);
    sweep_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            () = stop.cancelled() => break,
            _ = poll_ticker.tick() => {
                tokio::select! {
                    () = stop.cancelled() => break,
                    _ = shared.poll() => {}
                }
            }
            _ = sweep_ticker.tick(), if sweep_every.is_some() => shared.sweep(),
        }
    }

    tracing::info!("Session poller stopped");
}

struct PollTask {
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

/// Polls one [`SessionSource`] and emits each new session once.
pub struct SessionPoller<S: SessionSource> {
    shared: Arc<Shared<S>>,
    task: Mutex<Option<PollTask>>,
    span: tracing::Span,
}

impl<S: SessionSource + 'static> SessionPoller<S> {
    /// Create a stopped poller. `span` scopes every log line it emits.
    pub fn new(source: S, tag: Source, config: PollerConfig, span: tracing::Span) -> Self {
        Self {
            shared: Arc::new(Shared {
                dedup: DedupCache::new(config.capacity, config.seen_session_ttl),
                source,
                tag,
                config,
                callback: RwLock::new(None),
            }),
            task: Mutex::new(None),
            span,
        }
    }

    /// Register the handler for emitted sessions, replacing any previous one.
    pub fn set_callback<F, Fut>(&self, callback: F)
    where
        F: Fn(S::Session) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let callback: SessionCallback<S::Session> = Arc::new(move |session| callback(session).boxed());
        *self.shared.callback.write() = Some(callback);
    }

    /// Start the polling loop: one immediate poll, then one per interval.
    ///
    /// A no-op while already running. `cancel` stops the loop as well as
    /// [`Self::stop`].
    pub fn start(&self, cancel: &CancellationToken) {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.handle.is_finished()) {
            return;
        }

        let stop = cancel.child_token();
        let handle = tokio::spawn(
            run(Arc::clone(&self.shared), stop.clone()).instrument(self.span.clone()),
        );
        *task = Some(PollTask { stop, handle });
    }

    /// Stop the polling loop and wait for it to exit. A no-op when stopped.
    pub async fn stop(&self) {
        let task = self.task.lock().take();
        if let Some(PollTask { stop, handle }) = task {
            stop.cancel();
            if let Err(e) = handle.await {
                tracing::error!(parent: &self.span, error = %e, "Session poller task panicked");
            }
        }
    }

    /// Whether the polling loop is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|t| !t.handle.is_finished())
    }

    /// Run one poll cycle now. Returns the number of sessions emitted.
    ///
    /// Safe to call while the loop is running.
    pub async fn poll(&self) -> Result<usize, SourceError> {
        self.shared.poll().instrument(self.span.clone()).await
    }

    /// Emit pushed sessions through the same dedup filter as polling.
    pub async fn ingest(&self, sessions: Vec<S::Session>) -> usize {
        self.shared.emit(sessions).instrument(self.span.clone()).await
    }

    /// Whether a session key is currently tracked as seen.
    #[must_use]
    pub fn is_tracked(&self, key: &str) -> bool {
        self.shared.dedup.contains(key)
    }

    /// Number of sessions currently tracked.
    #[must_use]
    pub fn tracked_sessions(&self) -> usize {
        self.shared.dedup.len()
    }

    /// Drop expired seen-session entries now.
    pub fn cleanup_expired(&self) -> usize {
        self.shared.dedup.cleanup_expired()
    }

    /// The polled source.
    #[must_use]
    pub fn source(&self) -> &S {
        &self.shared.source
    }

    /// Poller configuration.
    #[must_use]
    pub fn config(&self) -> &PollerConfig {
        &self.shared.config
    }
}

impl<S: SessionSource> std::fmt::Debug for SessionPoller<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionPoller")
            .field("source", &self.shared.tag)
            .field("config", &self.shared.config)
            .field("tracked", &self.shared.dedup.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Fake {
        key: String,
        active: bool,
    }

    impl SessionIdentity for Fake {
        fn session_key(&self) -> &str {
            &self.key
        }

        fn has_active_playback(&self) -> bool {
            self.active
        }
    }

    #[derive(Default)]
    struct FakeSource {
        sessions: Mutex<Vec<Fake>>,
        fail: std::sync::atomic::AtomicBool,
        fetches: AtomicUsize,
    }

    impl FakeSource {
        fn with_keys(keys: &[&str]) -> Arc<Self> {
            let source = Self::default();
            *source.sessions.lock() = keys
                .iter()
                .map(|k| Fake {
                    key: (*k).to_string(),
                    active: true,
                })
                .collect();
            Arc::new(source)
        }
    }

    #[async_trait]
    impl SessionSource for FakeSource {
        type Session = Fake;

        fn name(&self) -> &str {
            "fake"
        }

        async fn ping(&self) -> Result<(), SourceError> {
            Ok(())
        }

        async fn active_sessions(&self) -> Result<Vec<Fake>, SourceError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(SourceError::Status {
                    status: 500,
                    body: "boom".to_string(),
                });
            }
            Ok(self.sessions.lock().clone())
        }
    }

    fn poller(
        source: Arc<FakeSource>,
        config: PollerConfig,
    ) -> (SessionPoller<Arc<FakeSource>>, Arc<AtomicUsize>) {
        let poller = SessionPoller::new(source, Source::Emby, config, tracing::Span::none());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        poller.set_callback(move |_session: Fake| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        (poller, calls)
    }

    #[tokio::test]
    async fn test_repeated_polls_emit_each_session_once() {
        let source = FakeSource::with_keys(&["a", "b", "c"]);
        let (poller, calls) = poller(source, PollerConfig::default());

        for _ in 0..5 {
            poller.poll().await.unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(poller.tracked_sessions(), 3);
    }

    #[tokio::test]
    async fn test_publish_all_emits_every_poll() {
        let source = FakeSource::with_keys(&["a", "b"]);
        let config = PollerConfig {
            publish_all: true,
            ..PollerConfig::default()
        };
        let (poller, calls) = poller(source, config);

        for _ in 0..3 {
            assert_eq!(poller.poll().await.unwrap(), 2);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 6);
        assert_eq!(poller.tracked_sessions(), 2);
    }

    #[tokio::test]
    async fn test_inactive_sessions_are_skipped() {
        let source = FakeSource::with_keys(&["a"]);
        source.sessions.lock().push(Fake {
            key: "idle".to_string(),
            active: false,
        });
        let (poller, calls) = poller(source, PollerConfig::default());

        assert_eq!(poller.poll().await.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!poller.is_tracked("idle"));
    }

    #[tokio::test]
    async fn test_expired_session_is_new_again() {
        let source = FakeSource::with_keys(&["a"]);
        let config = PollerConfig {
            seen_session_ttl: Duration::from_millis(20),
            ..PollerConfig::default()
        };
        let (poller, calls) = poller(source, config);

        poller.poll().await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(poller.cleanup_expired(), 1);
        poller.poll().await.unwrap();
        poller.poll().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_fetch_error_is_returned_without_emitting() {
        let source = FakeSource::with_keys(&["a"]);
        source.fail.store(true, Ordering::SeqCst);
        let (poller, calls) = poller(Arc::clone(&source), PollerConfig::default());

        assert!(poller.poll().await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        source.fail.store(false, Ordering::SeqCst);
        assert_eq!(poller.poll().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_ingest_shares_dedup_with_polling() {
        let source = FakeSource::with_keys(&["a", "b"]);
        let (poller, calls) = poller(source, PollerConfig::default());

        let pushed = vec![Fake {
            key: "a".to_string(),
            active: true,
        }];
        assert_eq!(poller.ingest(pushed).await, 1);
        assert_eq!(poller.poll().await.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_lifecycle_start_twice_and_stop() {
        let source = FakeSource::with_keys(&["a"]);
        let config = PollerConfig {
            interval: Duration::from_millis(10),
            ..PollerConfig::default()
        };
        let (poller, _calls) = poller(Arc::clone(&source), config);
        let cancel = CancellationToken::new();

        poller.stop().await;
        poller.start(&cancel);
        poller.start(&cancel);
        assert!(poller.is_running());

        tokio::time::sleep(Duration::from_millis(50)).await;
        poller.stop().await;
        assert!(!poller.is_running());

        let fetched = source.fetches.load(Ordering::SeqCst);
        assert!(fetched >= 2, "expected repeated polls, got {fetched}");
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(source.fetches.load(Ordering::SeqCst), fetched);
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let source = FakeSource::with_keys(&["a"]);
        let (poller, calls) = poller(Arc::clone(&source), PollerConfig::default());
        let cancel = CancellationToken::new();

        let fetched = |n: usize| {
            let source = Arc::clone(&source);
            tokio::time::timeout(Duration::from_secs(1), async move {
                while source.fetches.load(Ordering::SeqCst) < n {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
        };

        poller.start(&cancel);
        fetched(1).await.unwrap();
        poller.stop().await;
        poller.start(&cancel);
        fetched(2).await.unwrap();
        poller.stop().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancellation_stops_the_loop() {
        let source = FakeSource::with_keys(&[]);
        let (poller, _calls) = poller(source, PollerConfig::default());
        let cancel = CancellationToken::new();

        poller.start(&cancel);
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), async {
            while poller.is_running() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[test]
    fn test_sweep_runs_at_half_the_ttl() {
        let config = PollerConfig {
            seen_session_ttl: Duration::from_secs(300),
            ..PollerConfig::default()
        };
        assert_eq!(config.sweep_interval(), Some(Duration::from_secs(150)));

        let config = PollerConfig {
            seen_session_ttl: Duration::ZERO,
            ..PollerConfig::default()
        };
        assert_eq!(config.sweep_interval(), None);
    }
}
