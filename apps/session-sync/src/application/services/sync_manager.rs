//! Sync Manager Service
//!
//! Top-level orchestrator. Owns the lifecycle of every registered source
//! manager and runs the scheduled history sync:
//! - one sync in the background right after `start`
//! - then one every `interval`, until `stop`
//!
//! Manual syncs via [`SyncManager::trigger_sync`] are serialized with the
//! scheduled loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::source_manager::{ManagedSource, SourceStatus};
use crate::application::ports::{HistorySyncError, HistorySyncPort};
use crate::infrastructure::metrics;

/// Start of the window when syncing all history (2000-01-01T00:00:00Z).
const SYNC_ALL_SINCE_SECS: i64 = 946_684_800;

/// Called after each successful sync with `(new_records, duration_ms)`.
pub type SyncCompleteCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Sync manager configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncManagerConfig {
    /// Time between scheduled syncs.
    pub interval: Duration,
    /// Window of the first sync when no previous sync is recorded.
    pub lookback: Duration,
    /// Start the first sync at 2000-01-01 instead of `now - lookback`.
    pub sync_all: bool,
}

impl Default for SyncManagerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            lookback: Duration::from_secs(24 * 3600),
            sync_all: false,
        }
    }
}

/// Sync manager errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SyncManagerError {
    /// `start` was called twice.
    #[error("sync manager already running")]
    AlreadyRunning,

    /// `stop` was called on a stopped manager.
    #[error("sync manager not running")]
    NotRunning,

    /// The history sync failed.
    #[error(transparent)]
    Sync(#[from] HistorySyncError),
}

// =============================================================================
// Sync State
// =============================================================================

struct SyncState {
    config: SyncManagerConfig,
    history: Arc<dyn HistorySyncPort>,
    last_sync: RwLock<Option<DateTime<Utc>>>,
    sync_lock: tokio::sync::Mutex<()>,
    on_complete: RwLock<Option<SyncCompleteCallback>>,
}

impl SyncState {
    fn window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        if let Some(last) = *self.last_sync.read() {
            return last;
        }
        let sync_all_since = DateTime::from_timestamp(SYNC_ALL_SINCE_SECS, 0).unwrap_or_default();
        if self.config.sync_all {
            return sync_all_since;
        }
        TimeDelta::from_std(self.config.lookback)
            .ok()
            .and_then(|lookback| now.checked_sub_signed(lookback))
            .unwrap_or(sync_all_since)
    }

    async fn run(&self) -> Result<u64, HistorySyncError> {
        let _guard = self.sync_lock.lock().await;

        let started_at = Utc::now();
        let since = self.window_start(started_at);
        let clock = Instant::now();
        tracing::info!(since = %since, "Starting history sync");

        let new_records = self.history.sync_since(since).await?;

        let elapsed = clock.elapsed();
        *self.last_sync.write() = Some(started_at);
        metrics::record_history_sync_duration(elapsed);

        let duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        tracing::info!(new_records, duration_ms, "History sync completed");

        let callback = self.on_complete.read().clone();
        if let Some(callback) = callback {
            callback(new_records, duration_ms);
        }
        Ok(new_records)
    }
}

async fn sync_loop(state: Arc<SyncState>, stop: CancellationToken) {
    tokio::select! {
        () = stop.cancelled() => return,
        result = state.run() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Initial history sync failed");
            }
        }
    }

    let period = state.config.interval;
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            () = stop.cancelled() => break,
            _ = ticker.tick() => {
                tokio::select! {
                    () = stop.cancelled() => break,
                    result = state.run() => {
                        if let Err(e) = result {
                            tracing::error!(error = %e, "Scheduled history sync failed");
                        }
                    }
                }
            }
        }
    }
    tracing::debug!("Sync loop stopped");
}

// =============================================================================
// Sync Manager
// =============================================================================

struct SyncTask {
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

/// Orchestrates source managers and the scheduled history sync.
pub struct SyncManager {
    state: Arc<SyncState>,
    sources: RwLock<Vec<Arc<dyn ManagedSource>>>,
    task: tokio::sync::Mutex<Option<SyncTask>>,
    running: AtomicBool,
    span: tracing::Span,
}

impl SyncManager {
    /// Create a stopped manager.
    pub fn new(config: SyncManagerConfig, history: Arc<dyn HistorySyncPort>) -> Self {
        Self {
            state: Arc::new(SyncState {
                config,
                history,
                last_sync: RwLock::new(None),
                sync_lock: tokio::sync::Mutex::new(()),
                on_complete: RwLock::new(None),
            }),
            sources: RwLock::new(Vec::new()),
            task: tokio::sync::Mutex::new(None),
            running: AtomicBool::new(false),
            span: tracing::info_span!("sync_manager"),
        }
    }

    /// Register a source manager. Sources added after `start` are started
    /// on the next `start`.
    pub fn add_source(&self, source: Arc<dyn ManagedSource>) {
        tracing::info!(parent: &self.span, source = %source.source(), "Registered source");
        self.sources.write().push(source);
    }

    /// Install the completion callback.
    pub fn set_on_sync_complete<F>(&self, callback: F)
    where
        F: Fn(u64, u64) + Send + Sync + 'static,
    {
        *self.state.on_complete.write() = Some(Arc::new(callback));
    }

    /// Start every source and the sync loop.
    ///
    /// # Errors
    ///
    /// [`SyncManagerError::AlreadyRunning`] when already started.
    pub async fn start(&self, cancel: &CancellationToken) -> Result<(), SyncManagerError> {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return Err(SyncManagerError::AlreadyRunning);
        }

        let stop = cancel.child_token();
        for source in self.sources() {
            if let Err(e) = source.start(&stop).await {
                tracing::warn!(parent: &self.span, source = %source.source(), error = %e, "Source failed to start");
            }
        }

        let handle = tokio::spawn(
            sync_loop(Arc::clone(&self.state), stop.clone()).instrument(self.span.clone()),
        );
        *task = Some(SyncTask { stop, handle });
        self.running.store(true, Ordering::SeqCst);

        tracing::info!(
            parent: &self.span,
            sources = self.sources.read().len(),
            interval_secs = self.state.config.interval.as_secs(),
            "Sync manager started"
        );
        Ok(())
    }

    /// Stop every source and wait for the sync loop to exit.
    ///
    /// # Errors
    ///
    /// [`SyncManagerError::NotRunning`] when not started.
    pub async fn stop(&self) -> Result<(), SyncManagerError> {
        let Some(SyncTask { stop, handle }) = self.task.lock().await.take() else {
            return Err(SyncManagerError::NotRunning);
        };

        for source in self.sources() {
            source.stop().await;
        }
        stop.cancel();
        if let Err(e) = handle.await {
            tracing::error!(parent: &self.span, error = %e, "Sync loop panicked");
        }

        self.running.store(false, Ordering::SeqCst);
        tracing::info!(parent: &self.span, "Sync manager stopped");
        Ok(())
    }

    /// Run a history sync now. Waits for any sync already in progress.
    ///
    /// # Errors
    ///
    /// [`SyncManagerError::Sync`] when the history import fails.
    pub async fn trigger_sync(&self) -> Result<u64, SyncManagerError> {
        let new_records = self.state.run().instrument(self.span.clone()).await?;
        Ok(new_records)
    }

    /// Whether `start` has been called without a matching `stop`.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start time of the last successful sync.
    #[must_use]
    pub fn last_sync_time(&self) -> Option<DateTime<Utc>> {
        *self.state.last_sync.read()
    }

    /// Status of every registered source.
    #[must_use]
    pub fn sources_status(&self) -> Vec<SourceStatus> {
        self.sources().iter().map(|s| s.status()).collect()
    }

    fn sources(&self) -> Vec<Arc<dyn ManagedSource>> {
        self.sources.read().clone()
    }
}

impl std::fmt::Debug for SyncManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncManager")
            .field("config", &self.state.config)
            .field("sources", &self.sources.read().len())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}
