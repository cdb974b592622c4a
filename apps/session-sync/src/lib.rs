// Allow unwrap/expect in tests - tests should panic on unexpected errors
#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::items_after_statements
    )
)]

//! Session Sync - Multi-Source Playback Session Synchronization
//!
//! Ingests polled and pushed playback sessions from Plex, Emby and Jellyfin
//! servers and turns them into a deduplicated stream of canonical playback
//! events.
//!
//! # Architecture (Hexagonal)
//!
//! ## Layers (inside → outside)
//!
//! - **Domain**: Session types and the bounded dedup cache
//!   - `dedup`: LRU + TTL cache of seen session keys
//!   - `session`: `Source`, session capabilities, `CanonicalPlaybackEvent`
//!
//! - **Application**: Ports and long-running services
//!   - `ports`: `SessionSource`, `RealtimeFeed`, `EventPublisherPort`,
//!     `UserResolverPort`, `HistorySyncPort`
//!   - `services`: `SessionPoller`, `SourceManager`, `SyncManager`
//!
//! - **Infrastructure**: Adapters
//!   - `http`: 429-aware request executor and JSON client
//!   - `resilience`: circuit breaker and breaker-wrapped client
//!   - `websocket`: auto-reconnecting realtime client
//!   - `media`: Plex and Emby/Jellyfin REST and realtime adapters
//!   - `config`, `telemetry`, `metrics`, `health`, `publisher`
//!
//! # Data Flow
//!
//! ```text
//! media server ──REST──► SessionPoller ─┐
//!              ──WS────► RealtimeFeed ──┴► DedupCache ► SourceManager ► EventPublisherPort
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Clean Architecture Layers
// =============================================================================

/// Domain layer - Session types and deduplication with no I/O.
pub mod domain;

/// Application layer - Ports and background services.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

pub use application::services::{SessionPoller, SourceManager, SyncManager};
pub use domain::{CanonicalPlaybackEvent, DedupCache, Source};
pub use infrastructure::config::SyncConfig;
pub use infrastructure::metrics::init_metrics;
