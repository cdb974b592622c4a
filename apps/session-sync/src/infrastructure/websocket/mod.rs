//! Realtime WebSocket Infrastructure
//!
//! Auto-reconnecting notification feed client shared by every media server
//! that supports push.
//!
//! # Architecture
//!
//! ```text
//! Media Server ──ws──▶ RealtimeClient ──decode──▶ EnvelopeCodec
//!                          │                          │
//!                   keepalive + reconnect          Callbacks ──▶ handlers
//! ```

mod callbacks;
mod client;
mod envelope;
mod reconnect;

pub use callbacks::{Callbacks, Dispatch};
pub use client::{RealtimeClient, RealtimeConfig};
pub use envelope::{Envelope, EnvelopeCodec, EnvelopeError, MessageTypeCodec, PlexCodec};
pub use reconnect::{ReconnectConfig, ReconnectPolicy};
