//! History Sync Port (Driven Port)
//!
//! The scheduled full-history import run by the sync manager. The backend
//! that actually fetches and stores history lives outside this crate.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// History sync error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HistorySyncError {
    /// Upstream history could not be fetched.
    #[error("history fetch failed: {message}")]
    Fetch {
        /// Error detail.
        message: String,
    },

    /// Records could not be stored.
    #[error("history store failed: {message}")]
    Store {
        /// Error detail.
        message: String,
    },
}

/// Port for importing playback history.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HistorySyncPort: Send + Sync {
    /// Import everything recorded since `since`. Returns the number of new records.
    async fn sync_since(&self, since: DateTime<Utc>) -> Result<u64, HistorySyncError>;
}

/// History sync that imports nothing.
#[derive(Debug, Clone, Default)]
pub struct NoOpHistorySync;

#[async_trait]
impl HistorySyncPort for NoOpHistorySync {
    async fn sync_since(&self, _since: DateTime<Utc>) -> Result<u64, HistorySyncError> {
        Ok(0)
    }
}
