//! Source Manager Service
//!
//! Runs one media server integration: a [`SessionPoller`] and, optionally, a
//! realtime feed. Every emitted session is converted to a canonical event,
//! given an internal user ID and handed to the publisher.
//!
//! Realtime pushes travel over a channel to a pump task:
//! - `Sessions` pushes are ingested by the poller, sharing its dedup cache.
//! - `Refresh` pushes trigger an out-of-band poll unless every session they
//!   name is already tracked.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::session_poller::{PollerConfig, SessionPoller};
use crate::application::ports::{
    EventPublisherPort, RealtimeFeed, SessionPush, SessionSource, UserLookup, UserResolverPort,
};
use crate::domain::{CanonicalPlaybackEvent, Source, ToPlaybackEvent, UNKNOWN_USER_ID};
use crate::infrastructure::metrics::{self, Outcome};

/// Buffered realtime pushes per source.
const PUSH_CHANNEL_CAPACITY: usize = 64;

/// Source manager configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceManagerConfig {
    /// Server family.
    pub source: Source,
    /// Identifier attached to events, when configured.
    pub server_id: Option<String>,
    /// Connect the realtime feed on start.
    pub realtime_enabled: bool,
    /// Run the polling loop on start.
    pub polling_enabled: bool,
    /// Poller settings.
    pub poller: PollerConfig,
}

impl SourceManagerConfig {
    /// Defaults for `source`: realtime and polling on, no server ID.
    #[must_use]
    pub fn new(source: Source) -> Self {
        Self {
            source,
            server_id: None,
            realtime_enabled: true,
            polling_enabled: true,
            poller: PollerConfig::default(),
        }
    }
}

/// Source manager errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceManagerError {
    /// `start` was called twice.
    #[error("{media} manager already running")]
    AlreadyRunning {
        /// Server family.
        media: Source,
    },
}

/// Point-in-time view of one integration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceStatus {
    /// Server family.
    pub source: Source,
    /// Client name, usually the circuit breaker name.
    pub name: String,
    /// Configured server identifier.
    pub server_id: Option<String>,
    /// Whether the manager has been started.
    pub running: bool,
    /// Whether a realtime feed is configured and enabled.
    pub realtime_enabled: bool,
    /// Whether the realtime feed is connected.
    pub realtime_connected: bool,
    /// Whether the polling loop is running.
    pub polling: bool,
    /// Sessions currently tracked by the dedup cache.
    pub tracked_sessions: usize,
    /// Circuit breaker state, when the client has one.
    pub circuit_state: Option<String>,
}

impl SourceStatus {
    /// Running, circuit not open, and realtime connected when enabled.
    #[must_use]
    pub fn is_operational(&self) -> bool {
        self.running
            && self.circuit_state.as_deref() != Some("open")
            && (!self.realtime_enabled || self.realtime_connected)
    }
}

/// Object-safe view of a source manager, used by the sync manager.
#[async_trait]
pub trait ManagedSource: Send + Sync {
    /// Server family.
    fn source(&self) -> Source;

    /// Start polling and the realtime feed.
    async fn start(&self, cancel: &CancellationToken) -> Result<(), SourceManagerError>;

    /// Stop everything started by [`ManagedSource::start`].
    async fn stop(&self);

    /// Current status.
    fn status(&self) -> SourceStatus;
}

// =============================================================================
// Event Pipeline
// =============================================================================

/// Session to canonical event to publisher.
struct EventPipeline {
    source: Source,
    server_id: Option<String>,
    publisher: Option<Arc<dyn EventPublisherPort>>,
    resolver: Option<Arc<dyn UserResolverPort>>,
}

impl EventPipeline {
    async fn handle<T: ToPlaybackEvent>(&self, session: T) {
        let Some(mut event) = session.to_playback_event() else {
            return;
        };
        event.source = self.source;
        event.server_id.clone_from(&self.server_id);
        event.user_id = self.resolve_user(&event).await;

        let Some(publisher) = &self.publisher else {
            tracing::debug!(session_key = %event.session_key, "No publisher, dropping event");
            return;
        };

        let session_key = event.session_key.clone();
        let result = publisher.publish_playback_event(event).await;
        metrics::record_event_published(self.source, Outcome::of(&result));
        if let Err(e) = result {
            tracing::warn!(session_key = %session_key, error = %e, "Failed to publish playback event");
        }
    }

    async fn resolve_user(&self, event: &CanonicalPlaybackEvent) -> i64 {
        let (Some(resolver), Some(external_user_id)) = (&self.resolver, &event.external_user_id)
        else {
            return UNKNOWN_USER_ID;
        };

        let lookup = UserLookup {
            source: self.source,
            server_id: self.server_id.clone().unwrap_or_default(),
            external_user_id: external_user_id.clone(),
            username: Some(event.username.clone()).filter(|u| !u.is_empty()),
            friendly_name: event.friendly_name.clone(),
        };
        match resolver.resolve_user_id(lookup).await {
            Ok(user_id) => user_id,
            Err(e) => {
                tracing::warn!(
                    external_user_id = %external_user_id,
                    error = %e,
                    "Failed to resolve user, using fallback ID"
                );
                UNKNOWN_USER_ID
            }
        }
    }
}

// =============================================================================
// Source Manager
// =============================================================================

struct Running {
    stop: CancellationToken,
    pump: JoinHandle<()>,
}

/// Manages one media server integration.
pub struct SourceManager<S>
where
    S: SessionSource,
{
    config: SourceManagerConfig,
    poller: Arc<SessionPoller<S>>,
    realtime: Option<Arc<dyn RealtimeFeed<Session = S::Session>>>,
    publisher: Option<Arc<dyn EventPublisherPort>>,
    resolver: Option<Arc<dyn UserResolverPort>>,
    running: tokio::sync::Mutex<Option<Running>>,
    started: AtomicBool,
    span: tracing::Span,
}

impl<S> SourceManager<S>
where
    S: SessionSource + 'static,
    S::Session: ToPlaybackEvent,
{
    /// Create a stopped manager polling `client`. `span` scopes its logs.
    pub fn new(client: S, config: SourceManagerConfig, span: tracing::Span) -> Self {
        let poller = SessionPoller::new(client, config.source, config.poller, span.clone());
        Self {
            config,
            poller: Arc::new(poller),
            realtime: None,
            publisher: None,
            resolver: None,
            running: tokio::sync::Mutex::new(None),
            started: AtomicBool::new(false),
            span,
        }
    }

    /// Attach a realtime feed.
    #[must_use]
    pub fn with_realtime(mut self, feed: Arc<dyn RealtimeFeed<Session = S::Session>>) -> Self {
        self.realtime = Some(feed);
        self
    }

    /// Attach the event publisher.
    #[must_use]
    pub fn with_publisher(mut self, publisher: Arc<dyn EventPublisherPort>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Attach the user resolver.
    #[must_use]
    pub fn with_user_resolver(mut self, resolver: Arc<dyn UserResolverPort>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// The poller, for manual polls and inspection.
    #[must_use]
    pub fn poller(&self) -> &SessionPoller<S> {
        &self.poller
    }

    /// Ping, then start the realtime feed and the poller as configured.
    ///
    /// A failed ping or realtime connect is logged and does not fail start.
    pub async fn start(&self, cancel: &CancellationToken) -> Result<(), SourceManagerError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(SourceManagerError::AlreadyRunning {
                media: self.config.source,
            });
        }

        let span = self.span.clone();
        async {
            tracing::info!("Starting source manager");
            if let Err(e) = self.poller.source().ping().await {
                tracing::warn!(error = %e, "Ping failed, continuing startup");
            }

            let pipeline = Arc::new(EventPipeline {
                source: self.config.source,
                server_id: self.config.server_id.clone(),
                publisher: self.publisher.clone(),
                resolver: self.resolver.clone(),
            });
            self.poller.set_callback(move |session| {
                let pipeline = Arc::clone(&pipeline);
                async move { pipeline.handle(session).await }
            });

            let stop = cancel.child_token();
            let (tx, rx) = mpsc::channel(PUSH_CHANNEL_CAPACITY);
            let pump = tokio::spawn(
                pump(Arc::clone(&self.poller), rx, stop.clone()).instrument(tracing::Span::current()),
            );

            if let Some(feed) = self.realtime.as_ref().filter(|_| self.config.realtime_enabled) {
                match feed.connect(&stop, tx).await {
                    Ok(()) => tracing::info!("Realtime feed started"),
                    Err(e) => tracing::warn!(error = %e, "Realtime connect failed"),
                }
            }
            if self.config.polling_enabled {
                self.poller.start(&stop);
            }

            *running = Some(Running { stop, pump });
            self.started.store(true, Ordering::SeqCst);
        }
        .instrument(span)
        .await;
        Ok(())
    }

    /// Close the realtime feed, stop the poller and the pump. Safe to call
    /// on a manager that was never started.
    pub async fn stop(&self) {
        let Some(Running { stop, pump }) = self.running.lock().await.take() else {
            return;
        };

        if let Some(feed) = &self.realtime {
            feed.close().await;
        }
        self.poller.stop().await;
        stop.cancel();
        if let Err(e) = pump.await {
            tracing::error!(parent: &self.span, error = %e, "Push pump panicked");
        }

        self.started.store(false, Ordering::SeqCst);
        tracing::info!(parent: &self.span, "Source manager stopped");
    }

    /// Current status.
    pub fn status(&self) -> SourceStatus {
        let realtime_enabled = self.config.realtime_enabled && self.realtime.is_some();
        SourceStatus {
            source: self.config.source,
            name: self.poller.source().name().to_string(),
            server_id: self.config.server_id.clone(),
            running: self.started.load(Ordering::SeqCst),
            realtime_enabled,
            realtime_connected: realtime_enabled
                && self.realtime.as_ref().is_some_and(|f| f.is_connected()),
            polling: self.poller.is_running(),
            tracked_sessions: self.poller.tracked_sessions(),
            circuit_state: self.poller.source().circuit_state(),
        }
    }
}

async fn pump<S: SessionSource + 'static>(
    poller: Arc<SessionPoller<S>>,
    mut rx: mpsc::Receiver<SessionPush<S::Session>>,
    stop: CancellationToken,
) {
    let mut deferred = None;
    loop {
        let push = match deferred.take() {
            Some(push) => push,
            None => {
                let next = tokio::select! {
                    () = stop.cancelled() => break,
                    push = rx.recv() => push,
                };
                let Some(push) = next else { break };
                push
            }
        };

        match push {
            SessionPush::Sessions(sessions) => {
                poller.ingest(sessions).await;
            }
            SessionPush::Refresh(keys) => {
                if !keys.is_empty() && keys.iter().all(|k| poller.is_tracked(k)) {
                    continue;
                }
                // Queued refreshes are served by this fetch.
                while let Ok(next) = rx.try_recv() {
                    if matches!(next, SessionPush::Sessions(_)) {
                        deferred = Some(next);
                        break;
                    }
                }
                // Fetch errors are logged by the poller.
                let _ = poller.poll().await;
            }
        }
    }
    tracing::debug!("Push pump stopped");
}

#[async_trait]
impl<S> ManagedSource for SourceManager<S>
where
    S: SessionSource + 'static,
    S::Session: ToPlaybackEvent,
{
    fn source(&self) -> Source {
        self.config.source
    }

    async fn start(&self, cancel: &CancellationToken) -> Result<(), SourceManagerError> {
        Self::start(self, cancel).await
    }

    async fn stop(&self) {
        Self::stop(self).await;
    }

    fn status(&self) -> SourceStatus {
        Self::status(self)
    }
}

impl<S: SessionSource> std::fmt::Debug for SourceManager<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceManager")
            .field("config", &self.config)
            .field("realtime", &self.realtime.is_some())
            .field("started", &self.started.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}
