//! Emby and Jellyfin Adapter
//!
//! Jellyfin forked from Emby and kept its session API, so one client serves
//! both. The flavors differ only in source tag and WebSocket path.
//!
//! - REST: `GET /System/Ping` and `GET /Sessions`, authenticated with
//!   `X-Emby-Token`.
//! - Realtime: after connecting, `SessionsStart` subscribes to `Sessions`
//!   pushes carrying the full session list.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Url;
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::{CLIENT_NAME, forward, started_at, websocket_url};
use crate::application::ports::{
    PushSender, RealtimeError, RealtimeFeed, SessionPush, SessionSource, SourceError,
};
use crate::domain::session::{non_empty, positive};
use crate::domain::{
    CanonicalPlaybackEvent, PlaybackState, SessionIdentity, Source, StreamQuality,
    ToPlaybackEvent,
};
use crate::infrastructure::http::{ApiClient, HttpSettings};
use crate::infrastructure::websocket::{
    Callbacks, Envelope, MessageTypeCodec, RealtimeClient, RealtimeConfig,
};

/// Position and runtime unit: 100ns ticks.
const TICKS_PER_MILLISECOND: i64 = 10_000;

/// Server flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbyFlavor {
    /// Emby Server.
    Emby,
    /// Jellyfin Server.
    Jellyfin,
}

impl EmbyFlavor {
    /// Source tag for this flavor.
    #[must_use]
    pub const fn source(self) -> Source {
        match self {
            Self::Emby => Source::Emby,
            Self::Jellyfin => Source::Jellyfin,
        }
    }

    /// WebSocket endpoint path.
    #[must_use]
    pub const fn websocket_path(self) -> &'static str {
        match self {
            Self::Emby => "/embywebsocket",
            Self::Jellyfin => "/socket",
        }
    }
}

// =============================================================================
// Models
// =============================================================================

/// Item being played.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct EmbyNowPlayingItem {
    /// Item ID.
    pub id: String,
    /// Item title.
    pub name: String,
    /// `Movie`, `Episode`, `Audio`, ...
    #[serde(rename = "Type")]
    pub item_type: String,
    /// Series title.
    pub series_name: String,
    /// Season title.
    pub season_name: String,
    /// Episode or track number.
    pub index_number: Option<i32>,
    /// Season or disc number.
    pub parent_index_number: Option<i32>,
    /// Album title.
    pub album: String,
    /// Album artist.
    pub album_artist: String,
    /// Runtime in ticks.
    pub run_time_ticks: i64,
    /// Release year.
    pub production_year: Option<i32>,
    /// External IDs keyed by provider (`Imdb`, `Tmdb`, ...).
    pub provider_ids: HashMap<String, String>,
    /// Container format.
    pub container: String,
    /// Video, audio and subtitle streams of the source file.
    pub media_streams: Vec<EmbyMediaStream>,
}

/// One stream of the source file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct EmbyMediaStream {
    /// `Video`, `Audio` or `Subtitle`.
    #[serde(rename = "Type")]
    pub stream_type: String,
    /// Codec name.
    pub codec: String,
    /// Frame width.
    pub width: i32,
    /// Frame height.
    pub height: i32,
    /// Bitrate in bits per second.
    pub bit_rate: i64,
    /// Audio channel count.
    pub channels: i32,
}

/// Transcoder details, present only while the server transcodes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct EmbyTranscodingInfo {
    /// Output video codec.
    pub video_codec: String,
    /// Output audio codec.
    pub audio_codec: String,
    /// Output container.
    pub container: String,
    /// Video passes through unchanged.
    pub is_video_direct: bool,
    /// Audio passes through unchanged.
    pub is_audio_direct: bool,
    /// Output bitrate in bits per second.
    pub bitrate: i64,
    /// Output width.
    pub width: i32,
    /// Output height.
    pub height: i32,
    /// Hardware acceleration (`vaapi`, `nvenc`, `qsv`, ...), empty for software.
    pub hardware_acceleration_type: String,
}

impl EmbyTranscodingInfo {
    fn apply(&self, quality: &mut StreamQuality) {
        let decision = |direct: bool| (if direct { "copy" } else { "transcode" }).to_string();
        quality.video_decision = Some(decision(self.is_video_direct));
        quality.audio_decision = Some(decision(self.is_audio_direct));

        quality.transcode_video_codec = non_empty(&self.video_codec);
        quality.transcode_audio_codec = non_empty(&self.audio_codec);
        quality.transcode_container = non_empty(&self.container);
        quality.transcode_video_width = positive(self.width);
        quality.transcode_video_height = positive(self.height);
        quality.transcode_bitrate = positive(self.bitrate / 1000);

        quality.hw_encode = non_empty(&self.hardware_acceleration_type);
        quality.hw_requested = quality.hw_encode.is_some();
    }
}

impl EmbyNowPlayingItem {
    fn provider_id(&self, provider: &str) -> Option<&str> {
        self.provider_ids
            .iter()
            .find(|(name, id)| name.eq_ignore_ascii_case(provider) && !id.is_empty())
            .map(|(_, id)| id.as_str())
    }

    fn external_guid(&self) -> Option<String> {
        self.provider_id("Imdb")
            .map(|id| format!("imdb://{id}"))
            .or_else(|| self.provider_id("Tmdb").map(|id| format!("tmdb://{id}")))
    }

    fn quality(&self) -> StreamQuality {
        let mut quality = StreamQuality {
            container: non_empty(&self.container),
            ..StreamQuality::default()
        };
        let first = |kind: &str| self.media_streams.iter().find(|s| s.stream_type == kind);
        if let Some(video) = first("Video") {
            quality.video_codec = non_empty(&video.codec);
            quality.video_width = positive(video.width);
            quality.video_height = positive(video.height);
            quality.video_resolution = quality
                .video_height
                .map(|h| StreamQuality::resolution_label(h).to_string());
            quality.bitrate = positive(video.bit_rate / 1000);
        }
        if let Some(audio) = first("Audio") {
            quality.audio_codec = non_empty(&audio.codec);
            quality.audio_channels = positive(audio.channels);
        }
        quality
    }

    fn media_type(&self) -> String {
        match self.item_type.as_str() {
            "Audio" => "track".to_string(),
            other => other.to_ascii_lowercase(),
        }
    }
}

/// Playback position and method.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct EmbyPlayState {
    /// Position in ticks.
    pub position_ticks: i64,
    /// Whether playback is paused.
    pub is_paused: bool,
    /// `DirectPlay`, `DirectStream` or `Transcode`.
    pub play_method: String,
}

impl EmbyPlayState {
    fn transcode_decision(&self) -> Option<String> {
        match self.play_method.as_str() {
            "Transcode" => Some("transcode".to_string()),
            "DirectStream" => Some("copy".to_string()),
            "DirectPlay" => Some("direct play".to_string()),
            _ => None,
        }
    }
}

/// One entry of `/Sessions`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct EmbySession {
    /// Session ID.
    pub id: String,
    /// Client application.
    pub client: String,
    /// Device ID.
    pub device_id: String,
    /// Device name.
    pub device_name: String,
    /// User ID.
    pub user_id: String,
    /// Username.
    pub user_name: String,
    /// Client address.
    pub remote_end_point: String,
    /// Current item, absent when idle.
    pub now_playing_item: Option<EmbyNowPlayingItem>,
    /// Playback state.
    pub play_state: Option<EmbyPlayState>,
    /// Transcoder details.
    pub transcoding_info: Option<EmbyTranscodingInfo>,
}

impl SessionIdentity for EmbySession {
    fn session_key(&self) -> &str {
        &self.id
    }

    fn has_active_playback(&self) -> bool {
        self.now_playing_item.is_some()
    }
}

impl EmbySession {
    /// Convert into a canonical event tagged with `source`.
    #[must_use]
    pub fn to_event(&self, source: Source) -> Option<CanonicalPlaybackEvent> {
        let item = self.now_playing_item.as_ref()?;
        let play_state = self.play_state.clone().unwrap_or_default();

        let mut event = CanonicalPlaybackEvent::new(source, &self.id, &item.name);
        event.external_user_id = non_empty(&self.user_id);
        event.username.clone_from(&self.user_name);
        event.friendly_name = non_empty(&self.user_name);

        event.media_type = item.media_type();
        event.year = item.production_year;
        event.rating_key = non_empty(&item.id);
        event.guid = item.external_guid();
        if item.series_name.is_empty() {
            event.parent_title = non_empty(&item.album);
            event.grandparent_title = non_empty(&item.album_artist);
        } else {
            event.parent_title = non_empty(&item.season_name);
            event.grandparent_title = non_empty(&item.series_name);
        }
        event.media_index = item.index_number;
        event.parent_media_index = item.parent_index_number;

        event.state = Some(if play_state.is_paused {
            PlaybackState::Paused
        } else {
            PlaybackState::Playing
        });
        event.percent_complete =
            CanonicalPlaybackEvent::percent_of(play_state.position_ticks, item.run_time_ticks);
        event.transcode_decision = play_state.transcode_decision();
        event.quality = item.quality();
        if let Some(transcoding) = &self.transcoding_info {
            transcoding.apply(&mut event.quality);
        }
        event.started_at = started_at(play_state.position_ticks / TICKS_PER_MILLISECOND);

        event.platform = non_empty(&self.client);
        event.player = non_empty(&self.device_name);
        event.machine_id = non_empty(&self.device_id);
        event.ip_address = non_empty(&self.remote_end_point);

        Some(event)
    }
}

/// Tagged as Emby. The source manager re-tags events with its configured
/// source, so Jellyfin sessions come out right.
impl ToPlaybackEvent for EmbySession {
    fn to_playback_event(&self) -> Option<CanonicalPlaybackEvent> {
        self.to_event(Source::Emby)
    }
}

// =============================================================================
// REST Client
// =============================================================================

/// Emby or Jellyfin REST client.
#[derive(Debug, Clone)]
pub struct EmbyClient {
    flavor: EmbyFlavor,
    api: ApiClient,
    api_key: String,
    device_id: String,
}

impl EmbyClient {
    /// Create a client for the server at `base_url`.
    ///
    /// `user_id` scopes the device ID so several instances can share a
    /// server.
    pub fn new(
        flavor: EmbyFlavor,
        base_url: &str,
        api_key: &str,
        user_id: Option<&str>,
        settings: HttpSettings,
        cancel: CancellationToken,
    ) -> Result<Self, SourceError> {
        let device_id = match user_id.filter(|id| !id.is_empty()) {
            Some(id) => format!("{CLIENT_NAME}-{id}"),
            None => CLIENT_NAME.to_string(),
        };
        let api = ApiClient::new(
            base_url,
            &[
                ("x-emby-token", api_key.to_string()),
                ("x-emby-client", CLIENT_NAME.to_string()),
                ("x-emby-device-name", CLIENT_NAME.to_string()),
                ("x-emby-device-id", device_id.clone()),
                ("x-emby-client-version", env!("CARGO_PKG_VERSION").to_string()),
            ],
            settings,
            cancel,
        )?;

        Ok(Self {
            flavor,
            api,
            api_key: api_key.to_string(),
            device_id,
        })
    }

    /// Server flavor.
    #[must_use]
    pub const fn flavor(&self) -> EmbyFlavor {
        self.flavor
    }

    /// Device ID sent to the server.
    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Authenticated WebSocket URL.
    pub fn realtime_url(&self) -> Result<Url, RealtimeError> {
        websocket_url(
            self.api.base_url(),
            self.flavor.websocket_path(),
            &[("api_key", &self.api_key), ("deviceId", &self.device_id)],
        )
    }

    /// Realtime configuration that subscribes to session pushes.
    pub fn realtime_config(&self) -> Result<RealtimeConfig, RealtimeError> {
        Ok(RealtimeConfig::new(self.realtime_url()?).with_initial_message(sessions_start()))
    }
}

/// Subscription request: initial delay 0ms, then every 1500ms.
fn sessions_start() -> Envelope {
    Envelope::new("SessionsStart", Some(json!("0,1500")))
}

#[async_trait]
impl SessionSource for EmbyClient {
    type Session = EmbySession;

    fn name(&self) -> &str {
        self.flavor.source().as_str()
    }

    async fn ping(&self) -> Result<(), SourceError> {
        self.api.get_ok("/System/Ping").await
    }

    async fn active_sessions(&self) -> Result<Vec<EmbySession>, SourceError> {
        let sessions: Vec<EmbySession> = self.api.get_json("/Sessions").await?;
        Ok(sessions
            .into_iter()
            .filter(EmbySession::has_active_playback)
            .collect())
    }
}

// =============================================================================
// Realtime Feed
// =============================================================================

/// Emby or Jellyfin session feed.
#[derive(Debug)]
pub struct EmbyRealtime {
    client: RealtimeClient,
}

impl EmbyRealtime {
    /// Create a disconnected feed. `config` should come from
    /// [`EmbyClient::realtime_config`].
    #[must_use]
    pub fn new(flavor: EmbyFlavor, config: RealtimeConfig, span: tracing::Span) -> Self {
        Self {
            client: RealtimeClient::new(flavor.source(), config, Arc::new(MessageTypeCodec), span),
        }
    }

    fn callbacks(push: PushSender<EmbySession>) -> Callbacks {
        Callbacks::new()
            .on("Sessions", move |sessions: Vec<EmbySession>| {
                let active: Vec<EmbySession> = sessions
                    .into_iter()
                    .filter(EmbySession::has_active_playback)
                    .collect();
                forward(&push, SessionPush::Sessions(active));
            })
            .ignore("KeepAlive")
            .ignore("ForceKeepAlive")
            .ignore("UserDataChanged")
            .ignore("Playstate")
    }
}

#[async_trait]
impl RealtimeFeed for EmbyRealtime {
    type Session = EmbySession;

    async fn connect(
        &self,
        cancel: &CancellationToken,
        push: PushSender<EmbySession>,
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
    use test_case::test_case;

    use super::*;
    use crate::infrastructure::websocket::Dispatch;

    fn client(flavor: EmbyFlavor, user_id: Option<&str>) -> EmbyClient {
        EmbyClient::new(
            flavor,
            "https://media.local:8920",
            "key",
            user_id,
            HttpSettings::default(),
            CancellationToken::new(),
        )
        .unwrap()
    }

    fn episode() -> EmbySession {
        serde_json::from_value(json!({
            "Id": "sess-1",
            "Client": "Emby Web",
            "DeviceId": "dev-1",
            "DeviceName": "Firefox",
            "UserId": "u-1",
            "UserName": "jesse",
            "RemoteEndPoint": "192.168.1.20",
            "NowPlayingItem": {
                "Id": "item-9",
                "Name": "Ozymandias",
                "Type": "Episode",
                "SeriesName": "Breaking Bad",
                "SeasonName": "Season 5",
                "IndexNumber": 14,
                "ParentIndexNumber": 5,
                "RunTimeTicks": 28_000_000_000_i64,
                "ProductionYear": 2013,
                "ProviderIds": {"Tmdb": "62161", "Imdb": "tt2301451"}
            },
            "PlayState": {"PositionTicks": 7_000_000_000_i64, "IsPaused": false, "PlayMethod": "DirectStream"}
        }))
        .unwrap()
    }

    #[test_case(EmbyFlavor::Emby, None, "wss://media.local:8920/embywebsocket?api_key=key&deviceId=session-sync" ; "emby")]
    #[test_case(EmbyFlavor::Jellyfin, Some("u1"), "wss://media.local:8920/socket?api_key=key&deviceId=session-sync-u1" ; "jellyfin with user")]
    fn test_realtime_url(flavor: EmbyFlavor, user_id: Option<&str>, expected: &str) {
        assert_eq!(client(flavor, user_id).realtime_url().unwrap().as_str(), expected);
    }

    #[test]
    fn test_realtime_config_subscribes_to_sessions() {
        let config = client(EmbyFlavor::Emby, None).realtime_config().unwrap();
        assert_eq!(config.initial_messages, vec![sessions_start()]);
    }

    #[test]
    fn test_converts_episode() {
        let event = episode().to_event(Source::Jellyfin).unwrap();

        assert_eq!(event.source, Source::Jellyfin);
        assert_eq!(event.session_key, "sess-1");
        assert_eq!(event.media_type, "episode");
        assert_eq!(event.grandparent_title.as_deref(), Some("Breaking Bad"));
        assert_eq!(event.parent_title.as_deref(), Some("Season 5"));
        assert_eq!(event.media_index, Some(14));
        assert_eq!(event.percent_complete, 25);
        assert_eq!(event.state, Some(PlaybackState::Playing));
        assert_eq!(event.transcode_decision.as_deref(), Some("copy"));
        assert_eq!(event.guid.as_deref(), Some("imdb://tt2301451"));
        assert_eq!(event.platform.as_deref(), Some("Emby Web"));
        assert_eq!(event.player.as_deref(), Some("Firefox"));
        assert_eq!(event.machine_id.as_deref(), Some("dev-1"));
        assert_eq!(event.ip_address.as_deref(), Some("192.168.1.20"));
        assert_eq!(event.external_user_id.as_deref(), Some("u-1"));
    }

    #[test]
    fn test_quality_from_streams_and_transcoder() {
        let session: EmbySession = serde_json::from_value(json!({
            "Id": "sess-3",
            "NowPlayingItem": {
                "Name": "Arrival",
                "Type": "Movie",
                "Container": "mkv",
                "MediaStreams": [
                    {"Type": "Subtitle", "Codec": "srt"},
                    {"Type": "Video", "Codec": "hevc", "Width": 3840, "Height": 2160, "BitRate": 40_000_000},
                    {"Type": "Audio", "Codec": "truehd", "Channels": 8}
                ]
            },
            "PlayState": {"PlayMethod": "Transcode"},
            "TranscodingInfo": {
                "VideoCodec": "h264",
                "AudioCodec": "aac",
                "Container": "ts",
                "IsVideoDirect": false,
                "IsAudioDirect": true,
                "Bitrate": 8_000_000,
                "Width": 1920,
                "Height": 1080,
                "HardwareAccelerationType": "nvenc"
            }
        }))
        .unwrap();
        let event = session.to_playback_event().unwrap();
        let quality = &event.quality;

        assert_eq!(event.transcode_decision.as_deref(), Some("transcode"));
        assert_eq!(quality.video_codec.as_deref(), Some("hevc"));
        assert_eq!(quality.video_resolution.as_deref(), Some("4K"));
        assert_eq!(quality.video_width, Some(3840));
        assert_eq!(quality.bitrate, Some(40_000));
        assert_eq!(quality.audio_codec.as_deref(), Some("truehd"));
        assert_eq!(quality.audio_channels, Some(8));
        assert_eq!(quality.container.as_deref(), Some("mkv"));

        assert_eq!(quality.video_decision.as_deref(), Some("transcode"));
        assert_eq!(quality.audio_decision.as_deref(), Some("copy"));
        assert_eq!(quality.transcode_video_codec.as_deref(), Some("h264"));
        assert_eq!(quality.transcode_container.as_deref(), Some("ts"));
        assert_eq!(quality.transcode_video_height, Some(1080));
        assert_eq!(quality.transcode_bitrate, Some(8_000));
        assert!(quality.hw_requested);
        assert_eq!(quality.hw_encode.as_deref(), Some("nvenc"));
    }

    #[test]
    fn test_converts_track_with_album_fields() {
        let session: EmbySession = serde_json::from_value(json!({
            "Id": "sess-2",
            "NowPlayingItem": {
                "Name": "Song",
                "Type": "Audio",
                "Album": "Album",
                "AlbumArtist": "Artist",
                "ProviderIds": {"Tmdb": "1"}
            },
            "PlayState": {"IsPaused": true}
        }))
        .unwrap();
        let event = session.to_playback_event().unwrap();

        assert_eq!(event.media_type, "track");
        assert_eq!(event.parent_title.as_deref(), Some("Album"));
        assert_eq!(event.grandparent_title.as_deref(), Some("Artist"));
        assert_eq!(event.state, Some(PlaybackState::Paused));
        assert_eq!(event.percent_complete, 0);
        assert_eq!(event.guid.as_deref(), Some("tmdb://1"));
        assert!(event.transcode_decision.is_none());
        assert_eq!(event.quality, StreamQuality::default());
    }

    #[test]
    fn test_idle_session_converts_to_nothing() {
        let session: EmbySession =
            serde_json::from_value(json!({"Id": "idle", "UserName": "x"})).unwrap();
        assert!(!session.has_active_playback());
        assert!(session.to_playback_event().is_none());
    }

    #[tokio::test]
    async fn test_sessions_push_keeps_active_sessions() {
        let (tx, mut rx) = tokio::sync::mpsc::channel(4);
        let callbacks = EmbyRealtime::callbacks(tx);

        let env = Envelope::new(
            "Sessions",
            Some(json!([
                {"Id": "sess-1", "NowPlayingItem": {"Name": "Ozymandias"}},
                {"Id": "idle"}
            ])),
        );
        assert!(matches!(callbacks.dispatch(&env), Dispatch::Handled));
        match rx.recv().await {
            Some(SessionPush::Sessions(sessions)) => {
                assert_eq!(sessions.len(), 1);
                assert_eq!(sessions[0].id, "sess-1");
            }
            other => panic!("unexpected push: {other:?}"),
        }
    }

    #[test]
    fn test_keepalives_are_ignored() {
        let (tx, _rx) = tokio::sync::mpsc::channel(1);
        let callbacks = EmbyRealtime::callbacks(tx);
        for message_type in ["KeepAlive", "ForceKeepAlive"] {
            assert!(matches!(
                callbacks.dispatch(&Envelope::new(message_type, None)),
                Dispatch::Ignored
            ));
        }
    }
}
