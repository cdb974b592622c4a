//! Media Server Adapters
//!
//! REST and realtime adapters for Plex, Emby and Jellyfin. Each adapter
//! implements [`SessionSource`](crate::application::ports::SessionSource)
//! for polling and [`RealtimeFeed`](crate::application::ports::RealtimeFeed)
//! for push notifications.

/// Emby and Jellyfin adapters.
pub mod emby;

/// Plex adapters.
pub mod plex;

pub use emby::{EmbyClient, EmbyFlavor, EmbyRealtime, EmbySession};
pub use plex::{PlexClient, PlexPlayingNotification, PlexRealtime, PlexSession};

use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::{Deserialize, Deserializer};

use crate::application::ports::{PushSender, RealtimeError, SessionPush};

/// Device name and client name sent to media servers.
pub const CLIENT_NAME: &str = "session-sync";

/// Build a `ws://` or `wss://` URL on the same host as `base`.
pub(crate) fn websocket_url(
    base: &Url,
    path: &str,
    query: &[(&str, &str)],
) -> Result<Url, RealtimeError> {
    let scheme = match base.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(RealtimeError::InvalidUrl {
                message: format!("unsupported scheme '{other}'"),
            });
        }
    };

    let mut url = base.clone();
    url.set_path(&format!("{}{path}", base.path().trim_end_matches('/')));
    url.set_scheme(scheme)
        .map_err(|()| RealtimeError::InvalidUrl {
            message: format!("cannot switch {base} to {scheme}"),
        })?;
    url.set_query(None);
    if !query.is_empty() {
        url.query_pairs_mut().extend_pairs(query);
    }
    Ok(url)
}

/// Forward a push without blocking the read loop.
pub(crate) fn forward<T>(push: &PushSender<T>, message: SessionPush<T>) {
    if let Err(e) = push.try_send(message) {
        tracing::debug!(error = %e, "Dropping realtime push");
    }
}

/// Playback start time estimated from the current position.
pub(crate) fn started_at(position_ms: i64) -> DateTime<Utc> {
    let now = Utc::now();
    if position_ms <= 0 {
        return now;
    }
    now - chrono::Duration::milliseconds(position_ms)
}

/// Accept a JSON string or number as a `String`. Null becomes empty.
pub(crate) fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Int(i64),
        Float(f64),
        Null(()),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(s) => s,
        Raw::Int(n) => n.to_string(),
        Raw::Float(n) => n.to_string(),
        Raw::Null(()) => String::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_websocket_url_switches_scheme() {
        let base = Url::parse("https://plex.local:32400").unwrap();
        let url = websocket_url(
            &base,
            "/:/websockets/notifications",
            &[("X-Plex-Token", "abc")],
        )
        .unwrap();
        assert_eq!(
            url.as_str(),
            "wss://plex.local:32400/:/websockets/notifications?X-Plex-Token=abc"
        );

        let base = Url::parse("http://emby.local:8096/").unwrap();
        let url = websocket_url(&base, "/socket", &[("api_key", "k"), ("deviceId", "d")]).unwrap();
        assert_eq!(url.as_str(), "ws://emby.local:8096/socket?api_key=k&deviceId=d");
    }

    #[test]
    fn test_websocket_url_keeps_base_path() {
        let base = Url::parse("https://media.example.com/jellyfin/").unwrap();
        let url = websocket_url(&base, "/socket", &[]).unwrap();
        assert_eq!(url.as_str(), "wss://media.example.com/jellyfin/socket");
    }

    #[test]
    fn test_websocket_url_rejects_other_schemes() {
        let base = Url::parse("ftp://files.local").unwrap();
        assert!(matches!(
            websocket_url(&base, "/socket", &[]),
            Err(RealtimeError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn test_lenient_string_accepts_numbers() {
        #[derive(Deserialize)]
        struct Item {
            #[serde(deserialize_with = "lenient_string")]
            id: String,
        }

        let item: Item = serde_json::from_str(r#"{"id": 42}"#).unwrap();
        assert_eq!(item.id, "42");
        let item: Item = serde_json::from_str(r#"{"id": "7"}"#).unwrap();
        assert_eq!(item.id, "7");
        let item: Item = serde_json::from_str(r#"{"id": null}"#).unwrap();
        assert_eq!(item.id, "");
    }

    #[test]
    fn test_started_at_is_in_the_past() {
        let now = Utc::now();
        assert!(started_at(60_000) <= now - chrono::Duration::seconds(59));
        assert!(started_at(0) >= now);
    }
}
