//! Event Publisher Port (Driven Port)
//!
//! Interface for handing canonical playback events to downstream systems.

use async_trait::async_trait;

use crate::domain::CanonicalPlaybackEvent;

/// Event publishing error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EventPublishError {
    /// Connection error.
    #[error("Event publish connection error: {message}")]
    ConnectionError {
        /// Error detail.
        message: String,
    },

    /// Serialization error.
    #[error("Event serialization error: {message}")]
    SerializationError {
        /// Error detail.
        message: String,
    },

    /// Publishing failed.
    #[error("Event publish failed: {message}")]
    PublishFailed {
        /// Error detail.
        message: String,
    },
}

/// Port for publishing playback events.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventPublisherPort: Send + Sync {
    /// Publish a single playback event.
    async fn publish_playback_event(
        &self,
        event: CanonicalPlaybackEvent,
    ) -> Result<(), EventPublishError>;
}

/// No-op event publisher for testing.
#[derive(Debug, Clone, Default)]
pub struct NoOpEventPublisher;

#[async_trait]
impl EventPublisherPort for NoOpEventPublisher {
    async fn publish_playback_event(
        &self,
        _event: CanonicalPlaybackEvent,
    ) -> Result<(), EventPublishError> {
        Ok(())
    }
}
