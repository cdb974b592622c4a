//! Logging event publisher.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;

use crate::application::ports::{EventPublishError, EventPublisherPort};
use crate::domain::CanonicalPlaybackEvent;

/// Publishes playback events as structured log lines.
///
/// Stands in for a message bus when none is configured.
#[derive(Debug, Default)]
pub struct LoggingEventPublisher {
    published: AtomicU64,
}

impl LoggingEventPublisher {
    /// Create a new publisher.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            published: AtomicU64::new(0),
        }
    }

    /// Number of events published so far.
    #[must_use]
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl EventPublisherPort for LoggingEventPublisher {
    async fn publish_playback_event(
        &self,
        event: CanonicalPlaybackEvent,
    ) -> Result<(), EventPublishError> {
        let payload =
            serde_json::to_string(&event).map_err(|e| EventPublishError::SerializationError {
                message: e.to_string(),
            })?;

        tracing::info!(
            source = %event.source,
            session_key = %event.session_key,
            user_id = event.user_id,
            title = %event.title,
            state = ?event.state,
            percent = event.percent_complete,
            event = %payload,
            "Playback event"
        );
        self.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
