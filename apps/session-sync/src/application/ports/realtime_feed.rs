//! Realtime Feed Port (Driven Port)
//!
//! Push notifications from a media server. A feed forwards what it hears
//! into a channel owned by the source manager; the manager decides what to
//! do with it.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Something a realtime feed learned about active sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionPush<T> {
    /// The server pushed the full list of current sessions.
    Sessions(Vec<T>),
    /// Playback changed for the listed session keys; the sessions should be
    /// fetched again unless every key is already known. An empty list always
    /// triggers a fetch.
    Refresh(Vec<String>),
}

/// Channel end a feed pushes into.
pub type PushSender<T> = mpsc::Sender<SessionPush<T>>;

/// Realtime connection errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RealtimeError {
    /// Feed URL could not be built.
    #[error("invalid websocket url: {message}")]
    InvalidUrl {
        /// Error detail.
        message: String,
    },

    /// An operation did not finish in time.
    #[error("websocket {operation} timed out")]
    Timeout {
        /// Operation that timed out.
        operation: String,
    },

    /// Dial or handshake failed.
    #[error("websocket connect failed: {message}")]
    ConnectFailed {
        /// Error detail.
        message: String,
    },

    /// No connection is currently open.
    #[error("not connected")]
    NotConnected,

    /// Writing a frame failed.
    #[error("websocket send failed: {message}")]
    SendFailed {
        /// Error detail.
        message: String,
    },

    /// Outbound message could not be encoded.
    #[error("websocket encode failed: {message}")]
    Encode {
        /// Error detail.
        message: String,
    },
}

/// Port for a media server's push notification feed.
#[async_trait]
pub trait RealtimeFeed: Send + Sync {
    /// Session record carried by [`SessionPush::Sessions`].
    type Session: Send + 'static;

    /// Connect and start forwarding notifications to `push`.
    ///
    /// A no-op when already running. Once connected, the feed reconnects on
    /// its own until [`RealtimeFeed::close`] or cancellation.
    async fn connect(
        &self,
        cancel: &CancellationToken,
        push: PushSender<Self::Session>,
    ) -> Result<(), RealtimeError>;

    /// Disconnect and wait for background work to finish.
    async fn close(&self);

    /// Whether a connection is currently open.
    fn is_connected(&self) -> bool;
}
