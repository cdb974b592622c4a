//! Plex Media Server Adapter
//!
//! - REST: `GET /identity` (ping) and `GET /status/sessions` (active sessions),
//!   authenticated with `X-Plex-Token`.
//! - Realtime: `/:/websockets/notifications`. Plex only announces that
//!   something changed, so `playing` notifications for unseen sessions
//!   become a [`SessionPush::Refresh`] and the sessions are fetched again.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Url;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use super::{forward, lenient_string, started_at, websocket_url};
use crate::application::ports::{
    PushSender, RealtimeError, RealtimeFeed, SessionPush, SessionSource, SourceError,
};
use crate::domain::session::{non_empty, positive};
use crate::domain::{
    CanonicalPlaybackEvent, PlaybackState, SessionIdentity, Source, StreamQuality,
    ToPlaybackEvent,
};
use crate::infrastructure::http::{ApiClient, HttpSettings};
use crate::infrastructure::websocket::{Callbacks, PlexCodec, RealtimeClient, RealtimeConfig};

// =============================================================================
// Models
// =============================================================================

#[derive(Debug, Deserialize)]
struct SessionsResponse {
    #[serde(rename = "MediaContainer")]
    container: SessionsContainer,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SessionsContainer {
    #[serde(rename = "Metadata")]
    metadata: Vec<PlexSession>,
}

/// Account watching a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PlexUser {
    /// Account ID.
    #[serde(deserialize_with = "lenient_string")]
    pub id: String,
    /// Account name.
    pub title: String,
}

/// Client device playing a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlexPlayer {
    /// Client IP address.
    pub address: String,
    /// Device name.
    pub device: String,
    /// Client identifier.
    pub machine_identifier: String,
    /// Platform (`Roku`, `Chrome`, ...).
    pub platform: String,
    /// Product name.
    pub product: String,
    /// `playing`, `paused` or `buffering`.
    pub state: String,
    /// User-facing player name.
    pub title: String,
    /// Whether the client is on the server's LAN.
    pub local: bool,
}

/// Source media file of a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlexMedia {
    /// Video codec (`h264`, `hevc`, ...).
    pub video_codec: String,
    /// Audio codec (`aac`, `eac3`, ...).
    pub audio_codec: String,
    /// Resolution label (`1080`, `4k`, `sd`).
    #[serde(deserialize_with = "lenient_string")]
    pub video_resolution: String,
    /// Bitrate in kbps.
    pub bitrate: i64,
    /// Frame width.
    pub width: i32,
    /// Frame height.
    pub height: i32,
    /// Audio channel count.
    pub audio_channels: i32,
    /// Container format.
    pub container: String,
}

/// Transcoder details, present only while transcoding or remuxing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlexTranscodeSession {
    /// Transcode session key.
    pub key: String,
    /// `transcode`, `copy` or `directplay`.
    pub video_decision: String,
    /// `transcode`, `copy` or `directplay`.
    pub audio_decision: String,
    /// Codec of the source video stream.
    pub source_video_codec: String,
    /// Codec of the source audio stream.
    pub source_audio_codec: String,
    /// Output video codec.
    pub video_codec: String,
    /// Output audio codec.
    pub audio_codec: String,
    /// Output container.
    pub container: String,
    /// Output width.
    pub width: i32,
    /// Output height.
    pub height: i32,
    /// Bytes transcoded so far.
    pub size: i64,
    /// Transcoded duration in milliseconds.
    pub duration: i64,
    /// Hardware transcoding requested.
    pub transcode_hw_requested: bool,
    /// Hardware decoder name.
    pub transcode_hw_decoding: String,
    /// Hardware encoder name.
    pub transcode_hw_encoding: String,
    /// Decode and encode both in hardware.
    pub transcode_hw_full_pipeline: bool,
}

impl PlexTranscodeSession {
    fn decision(&self) -> &'static str {
        StreamQuality::overall_decision(&self.video_decision, &self.audio_decision)
    }

    /// Output bitrate in kbps from bytes over milliseconds.
    fn bitrate_kbps(&self) -> Option<i64> {
        if self.size > 0 && self.duration > 0 {
            Some(self.size.saturating_mul(8) / self.duration)
        } else {
            None
        }
    }

    fn apply(&self, quality: &mut StreamQuality) {
        quality.video_decision = non_empty(&self.video_decision);
        quality.audio_decision = non_empty(&self.audio_decision);
        if let Some(codec) = non_empty(&self.source_video_codec) {
            quality.video_codec = Some(codec);
        }
        if let Some(codec) = non_empty(&self.source_audio_codec) {
            quality.audio_codec = Some(codec);
        }

        quality.transcode_video_codec = non_empty(&self.video_codec);
        quality.transcode_audio_codec = non_empty(&self.audio_codec);
        quality.transcode_container = non_empty(&self.container);
        quality.transcode_video_width = positive(self.width);
        quality.transcode_video_height = positive(self.height);
        quality.transcode_bitrate = self.bitrate_kbps();

        quality.hw_requested = self.transcode_hw_requested;
        quality.hw_decode = non_empty(&self.transcode_hw_decoding);
        quality.hw_encode = non_empty(&self.transcode_hw_encoding);
        quality.hw_full_pipeline = self.transcode_hw_full_pipeline;
    }
}

/// External identifier such as `imdb://tt0133093`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PlexGuid {
    /// Identifier URI.
    pub id: String,
}

/// One entry of `/status/sessions`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlexSession {
    /// Session key, unique per active stream.
    #[serde(deserialize_with = "lenient_string")]
    pub session_key: String,
    /// Library key.
    pub key: String,
    /// Item rating key.
    #[serde(deserialize_with = "lenient_string")]
    pub rating_key: String,
    /// `movie`, `episode`, `track`, ...
    #[serde(rename = "type")]
    pub media_type: String,
    /// Item title.
    pub title: String,
    /// Season or album title.
    pub parent_title: String,
    /// Show or artist title.
    pub grandparent_title: String,
    /// Plex GUID.
    pub guid: String,
    /// Release year.
    pub year: Option<i32>,
    /// Episode or track number.
    pub index: Option<i32>,
    /// Season or disc number.
    pub parent_index: Option<i32>,
    /// Position in milliseconds.
    pub view_offset: i64,
    /// Runtime in milliseconds.
    pub duration: i64,
    /// Viewer.
    #[serde(rename = "User")]
    pub user: Option<PlexUser>,
    /// Client.
    #[serde(rename = "Player")]
    pub player: Option<PlexPlayer>,
    /// Source media files; the first is the one playing.
    #[serde(rename = "Media")]
    pub media: Vec<PlexMedia>,
    /// Transcoder details.
    #[serde(rename = "TranscodeSession")]
    pub transcode_session: Option<PlexTranscodeSession>,
    /// External identifiers.
    #[serde(rename = "Guid")]
    pub guids: Vec<PlexGuid>,
}

impl PlexSession {
    fn state(&self) -> Option<PlaybackState> {
        self.player
            .as_ref()
            .and_then(|p| PlaybackState::parse(&p.state))
    }

    fn external_guid(&self) -> Option<String> {
        ["imdb://", "tmdb://"]
            .iter()
            .find_map(|prefix| self.guids.iter().find(|g| g.id.starts_with(prefix)))
            .map(|g| g.id.clone())
            .or_else(|| non_empty(&self.guid))
    }

    fn quality(&self) -> StreamQuality {
        let mut quality = StreamQuality::default();
        if let Some(media) = self.media.first() {
            quality.video_codec = non_empty(&media.video_codec);
            quality.audio_codec = non_empty(&media.audio_codec);
            quality.video_resolution = non_empty(&media.video_resolution);
            quality.video_width = positive(media.width);
            quality.video_height = positive(media.height);
            quality.audio_channels = positive(media.audio_channels);
            quality.container = non_empty(&media.container);
            quality.bitrate = positive(media.bitrate);
        }
        if let Some(transcode) = &self.transcode_session {
            transcode.apply(&mut quality);
        }
        quality
    }
}

impl SessionIdentity for PlexSession {
    fn session_key(&self) -> &str {
        &self.session_key
    }

    fn has_active_playback(&self) -> bool {
        matches!(
            self.state(),
            Some(PlaybackState::Playing | PlaybackState::Paused | PlaybackState::Buffering)
        )
    }
}

impl ToPlaybackEvent for PlexSession {
    fn to_playback_event(&self) -> Option<CanonicalPlaybackEvent> {
        if !self.has_active_playback() {
            return None;
        }

        let mut event = CanonicalPlaybackEvent::new(Source::Plex, &self.session_key, &self.title);
        event.media_type.clone_from(&self.media_type);
        event.parent_title = non_empty(&self.parent_title);
        event.grandparent_title = non_empty(&self.grandparent_title);
        event.year = self.year;
        event.media_index = self.index;
        event.parent_media_index = self.parent_index;
        event.rating_key = non_empty(&self.rating_key);
        event.guid = self.external_guid();

        event.state = self.state();
        event.percent_complete = CanonicalPlaybackEvent::percent_of(self.view_offset, self.duration);
        event.transcode_decision = Some(
            self.transcode_session
                .as_ref()
                .map_or("direct play", PlexTranscodeSession::decision)
                .to_string(),
        );
        event.quality = self.quality();
        event.started_at = started_at(self.view_offset);

        if let Some(user) = &self.user {
            event.external_user_id = non_empty(&user.id);
            event.username.clone_from(&user.title);
            event.friendly_name = non_empty(&user.title);
        }
        if let Some(player) = &self.player {
            event.platform = non_empty(&player.platform);
            event.player = non_empty(&player.title).or_else(|| non_empty(&player.device));
            event.machine_id = non_empty(&player.machine_identifier);
            event.ip_address = non_empty(&player.address);
        }

        Some(event)
    }
}

/// Entry of a `playing` notification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlexPlayingNotification {
    /// Session key.
    #[serde(deserialize_with = "lenient_string")]
    pub session_key: String,
    /// Client identifier.
    pub client_identifier: String,
    /// `playing`, `paused`, `buffering` or `stopped`.
    pub state: String,
    /// Item rating key.
    #[serde(deserialize_with = "lenient_string")]
    pub rating_key: String,
    /// Position in milliseconds.
    pub view_offset: i64,
}

impl PlexPlayingNotification {
    /// Whether the notification describes ongoing playback.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(
            PlaybackState::parse(&self.state),
            Some(PlaybackState::Playing | PlaybackState::Paused | PlaybackState::Buffering)
        )
    }
}

// =============================================================================
// REST Client
// =============================================================================

/// Plex REST client.
#[derive(Debug, Clone)]
pub struct PlexClient {
    api: ApiClient,
    token: String,
}

impl PlexClient {
    /// Create a client for the server at `base_url`.
    pub fn new(
        base_url: &str,
        token: &str,
        settings: HttpSettings,
        cancel: CancellationToken,
    ) -> Result<Self, SourceError> {
        let api = ApiClient::new(
            base_url,
            &[("x-plex-token", token.to_string())],
            settings,
            cancel,
        )?;
        Ok(Self {
            api,
            token: token.to_string(),
        })
    }

    /// Authenticated notification feed URL.
    pub fn realtime_url(&self) -> Result<Url, RealtimeError> {
        websocket_url(
            self.api.base_url(),
            "/:/websockets/notifications",
            &[("X-Plex-Token", &self.token)],
        )
    }
}

#[async_trait]
impl SessionSource for PlexClient {
    type Session = PlexSession;

    fn name(&self) -> &str {
        Source::Plex.as_str()
    }

    async fn ping(&self) -> Result<(), SourceError> {
        self.api.get_ok("/identity").await
    }

    async fn active_sessions(&self) -> Result<Vec<PlexSession>, SourceError> {
        let response: SessionsResponse = self.api.get_json("/status/sessions").await?;
        Ok(response.container.metadata)
    }
}

// =============================================================================
// Realtime Feed
// =============================================================================

/// Plex notification feed.
#[derive(Debug)]
pub struct PlexRealtime {
    client: RealtimeClient,
}

impl PlexRealtime {
    /// Create a disconnected feed.
    #[must_use]
    pub fn new(config: RealtimeConfig, span: tracing::Span) -> Self {
        Self {
            client: RealtimeClient::new(Source::Plex, config, Arc::new(PlexCodec), span),
        }
    }

    fn callbacks(push: PushSender<PlexSession>) -> Callbacks {
        Callbacks::new()
            .on("playing", move |notifications: Vec<PlexPlayingNotification>| {
                let keys: Vec<String> = notifications
                    .into_iter()
                    .filter(PlexPlayingNotification::is_active)
                    .map(|n| n.session_key)
                    .collect();
                if !keys.is_empty() {
                    forward(&push, SessionPush::Refresh(keys));
                }
            })
            .ignore("timeline")
            .ignore("activity")
            .ignore("status")
            .ignore("reachability")
            .ignore("transcodeSession.update")
            .ignore("transcodeSession.end")
    }
}

#[async_trait]
impl RealtimeFeed for PlexRealtime {
    type Session = PlexSession;

    async fn connect(
        &self,
        cancel: &CancellationToken,
        push: PushSender<PlexSession>,
    ) -> Result<(), RealtimeError> {
        self.client.set_callbacks(Self::callbacks(push));
        self.client.connect(cancel).await
    }

    async fn close(&self) {
        self.client.close().await;
    }

    fn is_connected(&self) -> bool {
        self.client.is_connected()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::infrastructure::websocket::{Dispatch, Envelope};

    fn session_json() -> serde_json::Value {
        json!({
            "sessionKey": "42",
            "ratingKey": 1001,
            "type": "episode",
            "title": "Pilot",
            "parentTitle": "Season 1",
            "grandparentTitle": "Breaking Bad",
            "guid": "plex://episode/abc",
            "year": 2008,
            "index": 1,
            "parentIndex": 1,
            "viewOffset": 1_740_000,
            "duration": 3_480_000,
            "User": {"id": "7", "title": "walter"},
            "Player": {
                "address": "10.0.0.5",
                "machineIdentifier": "device-1",
                "platform": "Roku",
                "state": "paused",
                "title": "Living Room"
            },
            "Media": [{
                "videoCodec": "h264",
                "audioCodec": "ac3",
                "videoResolution": "1080",
                "bitrate": 10_617,
                "width": 1920,
                "height": 1080,
                "audioChannels": 6,
                "container": "mkv"
            }],
            "TranscodeSession": {
                "key": "/transcode/sessions/xyz",
                "videoDecision": "copy",
                "audioDecision": "transcode",
                "sourceAudioCodec": "eac3",
                "videoCodec": "h264",
                "audioCodec": "aac",
                "container": "mpegts",
                "width": 1920,
                "height": 1080,
                "size": 1_000_000,
                "duration": 2_000,
                "transcodeHwRequested": true,
                "transcodeHwEncoding": "vaapi"
            },
            "Guid": [{"id": "tmdb://1396"}, {"id": "imdb://tt0959621"}]
        })
    }

    #[test]
    fn test_decodes_sessions_response() {
        let body = json!({"MediaContainer": {"size": 1, "Metadata": [session_json()]}});
        let response: SessionsResponse = serde_json::from_value(body).unwrap();
        assert_eq!(response.container.metadata.len(), 1);
        assert_eq!(response.container.metadata[0].session_key, "42");
        assert_eq!(response.container.metadata[0].rating_key, "1001");
    }

    #[test]
    fn test_empty_container_has_no_sessions() {
        let response: SessionsResponse =
            serde_json::from_value(json!({"MediaContainer": {"size": 0}})).unwrap();
        assert!(response.container.metadata.is_empty());
    }

    #[test]
    fn test_converts_episode_session() {
        let session: PlexSession = serde_json::from_value(session_json()).unwrap();
        let event = session.to_playback_event().unwrap();

        assert_eq!(event.source, Source::Plex);
        assert_eq!(event.session_key, "42");
        assert_eq!(event.external_user_id.as_deref(), Some("7"));
        assert_eq!(event.username, "walter");
        assert_eq!(event.grandparent_title.as_deref(), Some("Breaking Bad"));
        assert_eq!(event.media_index, Some(1));
        assert_eq!(event.state, Some(PlaybackState::Paused));
        assert_eq!(event.percent_complete, 50);
        assert_eq!(event.transcode_decision.as_deref(), Some("transcode"));
        assert_eq!(event.guid.as_deref(), Some("imdb://tt0959621"));
        assert_eq!(event.player.as_deref(), Some("Living Room"));
        assert_eq!(event.ip_address.as_deref(), Some("10.0.0.5"));
    }

    #[test]
    fn test_quality_combines_media_and_transcoder() {
        let session: PlexSession = serde_json::from_value(session_json()).unwrap();
        let quality = session.to_playback_event().unwrap().quality;

        assert_eq!(quality.video_codec.as_deref(), Some("h264"));
        // The transcoder's source codec wins over the media entry.
        assert_eq!(quality.audio_codec.as_deref(), Some("eac3"));
        assert_eq!(quality.video_resolution.as_deref(), Some("1080"));
        assert_eq!(quality.video_height, Some(1080));
        assert_eq!(quality.audio_channels, Some(6));
        assert_eq!(quality.container.as_deref(), Some("mkv"));
        assert_eq!(quality.bitrate, Some(10_617));

        assert_eq!(quality.video_decision.as_deref(), Some("copy"));
        assert_eq!(quality.audio_decision.as_deref(), Some("transcode"));
        assert_eq!(quality.transcode_audio_codec.as_deref(), Some("aac"));
        assert_eq!(quality.transcode_container.as_deref(), Some("mpegts"));
        assert_eq!(quality.transcode_video_width, Some(1920));
        assert_eq!(quality.transcode_bitrate, Some(4_000));
        assert!(quality.hw_requested);
        assert_eq!(quality.hw_encode.as_deref(), Some("vaapi"));
        assert!(quality.hw_decode.is_none());
        assert!(!quality.hw_full_pipeline);
    }

    #[test]
    fn test_session_without_player_state_is_inactive() {
        let session = PlexSession {
            session_key: "1".to_string(),
            ..PlexSession::default()
        };
        assert!(!session.has_active_playback());
        assert!(session.to_playback_event().is_none());
    }

    #[test]
    fn test_direct_play_without_transcoder() {
        let mut session: PlexSession = serde_json::from_value(session_json()).unwrap();
        session.transcode_session = None;
        let event = session.to_playback_event().unwrap();
        assert_eq!(event.transcode_decision.as_deref(), Some("direct play"));
        assert_eq!(event.quality.audio_codec.as_deref(), Some("ac3"));
        assert!(event.quality.transcode_video_codec.is_none());
        assert!(!event.quality.hw_requested);
    }

    #[test]
    fn test_realtime_url_carries_token() {
        let client = PlexClient::new(
            "http://plex.local:32400",
            "tok",
            HttpSettings::default(),
            CancellationToken::new(),
        )
        .unwrap();
        assert_eq!(
            client.realtime_url().unwrap().as_str(),
            "ws://plex.local:32400/:/websockets/notifications?X-Plex-Token=tok"
        );
    }

    #[tokio::test]
    async fn test_playing_notification_requests_refresh() {
        let (tx, mut rx) = tokio::sync::mpsc::channel(4);
        let callbacks = PlexRealtime::callbacks(tx);

        let env = Envelope::new(
            "playing",
            Some(json!([
                {"sessionKey": "5", "state": "playing"},
                {"sessionKey": "6", "state": "stopped"}
            ])),
        );
        assert!(matches!(callbacks.dispatch(&env), Dispatch::Handled));
        assert_eq!(
            rx.recv().await,
            Some(SessionPush::Refresh(vec!["5".to_string()]))
        );
    }

    #[tokio::test]
    async fn test_stopped_notifications_are_not_forwarded() {
        let (tx, mut rx) = tokio::sync::mpsc::channel(4);
        let callbacks = PlexRealtime::callbacks(tx);

        let env = Envelope::new("playing", Some(json!([{"sessionKey": "6", "state": "stopped"}])));
        callbacks.dispatch(&env);
        assert!(rx.try_recv().is_err());
        assert!(matches!(
            callbacks.dispatch(&Envelope::new("timeline", None)),
            Dispatch::Ignored
        ));
    }
}
