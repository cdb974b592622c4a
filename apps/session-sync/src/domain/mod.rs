//! Domain Layer - Session types and deduplication with no I/O.

/// Bounded LRU + TTL cache of seen session keys.
pub mod dedup;

/// Source tags, session capabilities and the canonical playback event.
pub mod session;

pub use dedup::{DEFAULT_CAPACITY, DedupCache};
pub use session::{
    CanonicalPlaybackEvent, PlaybackState, SessionIdentity, Source, StreamQuality,
    ToPlaybackEvent, UNKNOWN_USER_ID,
};
