//! Session Domain Types
//!
//! Source-agnostic vocabulary shared by every media server integration:
//! which server family a session came from, the minimal capability the
//! poller needs from a vendor session record, and the canonical playback
//! event handed to downstream publishers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Internal user ID used when an external user cannot be resolved.
pub const UNKNOWN_USER_ID: i64 = 0;

// =============================================================================
// Source
// =============================================================================

/// Media server family a session originates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// Plex Media Server.
    Plex,
    /// Emby Server.
    Emby,
    /// Jellyfin Server.
    Jellyfin,
}

impl Source {
    /// Lowercase tag used in logs, metrics and events.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Plex => "plex",
            Self::Emby => "emby",
            Self::Jellyfin => "jellyfin",
        }
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Session Capabilities
// =============================================================================

/// What the poller needs to know about a vendor session record.
pub trait SessionIdentity {
    /// Dedup key as provided by the upstream server. May be empty.
    fn session_key(&self) -> &str;

    /// Whether the session currently has something playing or paused.
    fn has_active_playback(&self) -> bool;
}

/// Conversion from a vendor session record to a canonical event.
pub trait ToPlaybackEvent {
    /// Build the canonical event, or `None` when nothing is playing.
    fn to_playback_event(&self) -> Option<CanonicalPlaybackEvent>;
}

// =============================================================================
// Canonical Event
// =============================================================================

/// Playback state reported by the upstream server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    /// Content is playing.
    Playing,
    /// Playback is paused.
    Paused,
    /// Client is buffering.
    Buffering,
    /// Playback stopped.
    Stopped,
}

impl PlaybackState {
    /// Parse a vendor state string, case-insensitively.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "playing" => Some(Self::Playing),
            "paused" => Some(Self::Paused),
            "buffering" => Some(Self::Buffering),
            "stopped" => Some(Self::Stopped),
            _ => None,
        }
    }
}

/// Source media, transcoder output and hardware acceleration details.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamQuality {
    /// Source video codec.
    pub video_codec: Option<String>,
    /// Source audio codec.
    pub audio_codec: Option<String>,
    /// Source resolution label (`1080`, `4k`, `720p`, ...).
    pub video_resolution: Option<String>,
    /// Source frame width in pixels.
    pub video_width: Option<i32>,
    /// Source frame height in pixels.
    pub video_height: Option<i32>,
    /// Source audio channel count.
    pub audio_channels: Option<i32>,
    /// Source container format.
    pub container: Option<String>,
    /// Source bitrate in kbps.
    pub bitrate: Option<i64>,

    /// Per-stream video decision (`transcode`, `copy`, `directplay`).
    pub video_decision: Option<String>,
    /// Per-stream audio decision.
    pub audio_decision: Option<String>,

    /// Transcoder output video codec.
    pub transcode_video_codec: Option<String>,
    /// Transcoder output audio codec.
    pub transcode_audio_codec: Option<String>,
    /// Transcoder output container.
    pub transcode_container: Option<String>,
    /// Transcoder output width in pixels.
    pub transcode_video_width: Option<i32>,
    /// Transcoder output height in pixels.
    pub transcode_video_height: Option<i32>,
    /// Transcoder output bitrate in kbps.
    pub transcode_bitrate: Option<i64>,

    /// Hardware transcoding was requested.
    pub hw_requested: bool,
    /// Hardware decoder in use (`vaapi`, `nvdec`, ...).
    pub hw_decode: Option<String>,
    /// Hardware encoder in use (`vaapi`, `nvenc`, `qsv`, ...).
    pub hw_encode: Option<String>,
    /// Decode and encode both run on the hardware.
    pub hw_full_pipeline: bool,
}

impl StreamQuality {
    /// Resolution label for a frame height.
    #[must_use]
    pub const fn resolution_label(height: i32) -> &'static str {
        if height >= 2160 {
            "4K"
        } else if height >= 1080 {
            "1080p"
        } else if height >= 720 {
            "720p"
        } else {
            "SD"
        }
    }

    /// Overall decision from per-stream decisions: any `transcode` wins,
    /// then any `copy`, else direct play.
    #[must_use]
    pub fn overall_decision(video: &str, audio: &str) -> &'static str {
        let decisions = [video, audio];
        if decisions.contains(&"transcode") {
            "transcode"
        } else if decisions.contains(&"copy") {
            "copy"
        } else {
            "direct play"
        }
    }
}

/// Positive values only.
pub(crate) fn positive<T: Default + PartialOrd>(value: T) -> Option<T> {
    (value > T::default()).then_some(value)
}

/// Source-agnostic playback record produced from a vendor session.
///
/// Ownership moves to the publisher once emitted; nothing mutates an event
/// after it has been handed off.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalPlaybackEvent {
    /// Unique event ID.
    pub id: Uuid,
    /// Upstream session identifier.
    pub session_key: String,
    /// Server family.
    pub source: Source,
    /// Configured server identifier, when one is set.
    pub server_id: Option<String>,

    /// Resolved internal user ID ([`UNKNOWN_USER_ID`] when unresolved).
    pub user_id: i64,
    /// Upstream user identifier.
    pub external_user_id: Option<String>,
    /// Upstream username.
    pub username: String,
    /// Display name.
    pub friendly_name: Option<String>,

    /// Media type (`movie`, `episode`, `track`, ...).
    pub media_type: String,
    /// Content title.
    pub title: String,
    /// Season or album title.
    pub parent_title: Option<String>,
    /// Series or artist title.
    pub grandparent_title: Option<String>,
    /// Release year.
    pub year: Option<i32>,
    /// Episode or track number.
    pub media_index: Option<i32>,
    /// Season or disc number.
    pub parent_media_index: Option<i32>,
    /// Upstream content identifier.
    pub rating_key: Option<String>,
    /// External GUID (`imdb://`, `tmdb://`, ...).
    pub guid: Option<String>,

    /// Playback state.
    pub state: Option<PlaybackState>,
    /// Progress through the item, 0-100.
    pub percent_complete: u8,
    /// Transcode decision (`direct play`, `copy`, `transcode`).
    pub transcode_decision: Option<String>,
    /// Codec, resolution, bitrate and hardware acceleration details.
    pub quality: StreamQuality,

    /// Client platform.
    pub platform: Option<String>,
    /// Client player name.
    pub player: Option<String>,
    /// Client device identifier.
    pub machine_id: Option<String>,
    /// Client IP address.
    pub ip_address: Option<String>,

    /// When playback started, as far as the source knows.
    pub started_at: DateTime<Utc>,
    /// When this event was created.
    pub created_at: DateTime<Utc>,
}

impl CanonicalPlaybackEvent {
    /// Create an event with the identifying fields set and the rest empty.
    #[must_use]
    pub fn new(source: Source, session_key: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            session_key: session_key.into(),
            source,
            server_id: None,
            user_id: UNKNOWN_USER_ID,
            external_user_id: None,
            username: String::new(),
            friendly_name: None,
            media_type: String::new(),
            title: title.into(),
            parent_title: None,
            grandparent_title: None,
            year: None,
            media_index: None,
            parent_media_index: None,
            rating_key: None,
            guid: None,
            state: None,
            percent_complete: 0,
            transcode_decision: None,
            quality: StreamQuality::default(),
            platform: None,
            player: None,
            machine_id: None,
            ip_address: None,
            started_at: now,
            created_at: now,
        }
    }

    /// Progress percentage from a position and a total, clamped to 0-100.
    #[must_use]
    pub fn percent_of(position: i64, total: i64) -> u8 {
        if total <= 0 || position <= 0 {
            return 0;
        }
        let pct = position.saturating_mul(100) / total;
        pct.clamp(0, 100) as u8
    }
}

/// Wrap a possibly-empty string as an `Option`.
pub(crate) fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_tags() {
        assert_eq!(Source::Plex.as_str(), "plex");
        assert_eq!(Source::Emby.to_string(), "emby");
        assert_eq!(
            serde_json::to_string(&Source::Jellyfin).unwrap(),
            "\"jellyfin\""
        );
    }

    #[test]
    fn test_playback_state_parsing() {
        assert_eq!(PlaybackState::parse("Playing"), Some(PlaybackState::Playing));
        assert_eq!(PlaybackState::parse("paused"), Some(PlaybackState::Paused));
        assert_eq!(
            PlaybackState::parse("BUFFERING"),
            Some(PlaybackState::Buffering)
        );
        assert_eq!(PlaybackState::parse("idle"), None);
    }

    #[test]
    fn test_new_event_defaults() {
        let event = CanonicalPlaybackEvent::new(Source::Emby, "s-1", "The Matrix");
        assert_eq!(event.session_key, "s-1");
        assert_eq!(event.user_id, UNKNOWN_USER_ID);
        assert!(event.server_id.is_none());
        assert_eq!(event.started_at, event.created_at);
    }

    #[test]
    fn test_resolution_labels() {
        assert_eq!(StreamQuality::resolution_label(2160), "4K");
        assert_eq!(StreamQuality::resolution_label(1080), "1080p");
        assert_eq!(StreamQuality::resolution_label(800), "720p");
        assert_eq!(StreamQuality::resolution_label(480), "SD");
    }

    #[test]
    fn test_overall_decision_prefers_transcode_then_copy() {
        assert_eq!(StreamQuality::overall_decision("copy", "transcode"), "transcode");
        assert_eq!(StreamQuality::overall_decision("copy", "directplay"), "copy");
        assert_eq!(StreamQuality::overall_decision("directplay", ""), "direct play");
    }

    #[test]
    fn test_percent_of_handles_edges() {
        assert_eq!(CanonicalPlaybackEvent::percent_of(36, 88), 40);
        assert_eq!(CanonicalPlaybackEvent::percent_of(0, 100), 0);
        assert_eq!(CanonicalPlaybackEvent::percent_of(50, 0), 0);
        assert_eq!(CanonicalPlaybackEvent::percent_of(150, 100), 100);
    }
}
