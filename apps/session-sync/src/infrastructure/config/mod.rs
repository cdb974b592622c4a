//! Configuration Module
//!
//! Environment-driven configuration for the sync service, and the wiring
//! that turns it into running source managers.

mod container;
mod settings;

pub use container::{ContainerError, Pipeline, build_sources};
pub use settings::{
    ConfigError, Credentials, PLEX_MIN_POLL_INTERVAL, ServerSettings, SourceSettings, SyncConfig,
    SyncSettings, WebSocketSettings,
};
