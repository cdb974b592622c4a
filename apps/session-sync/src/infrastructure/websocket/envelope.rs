//! Realtime Message Envelopes
//!
//! Every media server wraps its push notifications in a JSON envelope that
//! carries a message type and an opaque payload. The payload is decoded
//! later, into whatever type the registered handler expects.
//!
//! Two wire shapes are supported:
//!
//! ```text
//! Emby / Jellyfin:  {"MessageType": "Sessions", "Data": [...]}
//! Plex:             {"NotificationContainer": {"type": "playing",
//!                                              "PlaySessionStateNotification": [...]}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Decoded message type plus raw payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Message type used for dispatch.
    pub message_type: String,
    /// Payload, if the message carried one.
    pub data: Option<Value>,
}

impl Envelope {
    /// Create an envelope.
    #[must_use]
    pub fn new(message_type: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            message_type: message_type.into(),
            data,
        }
    }
}

/// Envelope codec errors.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    /// Frame was not valid JSON or did not match the envelope shape.
    #[error("invalid envelope: {0}")]
    Json(#[from] serde_json::Error),

    /// The wire format has no outbound representation.
    #[error("{codec} envelopes cannot be sent")]
    Unsupported {
        /// Codec name.
        codec: &'static str,
    },
}

/// Wire format of a server's realtime feed.
pub trait EnvelopeCodec: Send + Sync + std::fmt::Debug {
    /// Decode a text frame.
    fn decode(&self, text: &str) -> Result<Envelope, EnvelopeError>;

    /// Encode an outbound message.
    fn encode(&self, envelope: &Envelope) -> Result<String, EnvelopeError>;
}

// =============================================================================
// Emby / Jellyfin
// =============================================================================

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct MessageTypeWire {
    message_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

/// `{"MessageType": …, "Data": …}` envelopes used by Emby and Jellyfin.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageTypeCodec;

impl EnvelopeCodec for MessageTypeCodec {
    fn decode(&self, text: &str) -> Result<Envelope, EnvelopeError> {
        let wire: MessageTypeWire = serde_json::from_str(text)?;
        Ok(Envelope {
            message_type: wire.message_type,
            data: wire.data.filter(|v| !v.is_null()),
        })
    }

    fn encode(&self, envelope: &Envelope) -> Result<String, EnvelopeError> {
        let wire = MessageTypeWire {
            message_type: envelope.message_type.clone(),
            data: envelope.data.clone(),
        };
        Ok(serde_json::to_string(&wire)?)
    }
}

// =============================================================================
// Plex
// =============================================================================

#[derive(Debug, Deserialize)]
struct PlexWire {
    #[serde(rename = "NotificationContainer")]
    container: serde_json::Map<String, Value>,
}

/// `{"NotificationContainer": {"type": …, …}}` envelopes used by Plex.
///
/// The payload is the container's type-specific array, for example
/// `PlaySessionStateNotification` for `playing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlexCodec;

impl PlexCodec {
    /// Container field holding the payload for a notification type.
    #[must_use]
    pub fn payload_field(message_type: &str) -> Option<&'static str> {
        match message_type {
            "playing" => Some("PlaySessionStateNotification"),
            "timeline" => Some("TimelineEntry"),
            "activity" => Some("ActivityNotification"),
            "status" => Some("StatusNotification"),
            "reachability" => Some("ReachabilityNotification"),
            _ => None,
        }
    }
}

impl EnvelopeCodec for PlexCodec {
    fn decode(&self, text: &str) -> Result<Envelope, EnvelopeError> {
        let PlexWire { mut container } = serde_json::from_str(text)?;

        let message_type = container
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        let data = Self::payload_field(&message_type)
            .and_then(|field| container.remove(field))
            .filter(|v| !v.is_null());

        Ok(Envelope { message_type, data })
    }

    fn encode(&self, _envelope: &Envelope) -> Result<String, EnvelopeError> {
        Err(EnvelopeError::Unsupported { codec: "plex" })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_decodes_message_type_envelope() {
        let env = MessageTypeCodec
            .decode(r#"{"MessageType":"Sessions","Data":[{"Id":"abc"}]}"#)
            .unwrap();
        assert_eq!(env.message_type, "Sessions");
        assert_eq!(env.data, Some(json!([{"Id": "abc"}])));
    }

    #[test]
    fn test_keepalive_without_data_is_valid() {
        let env = MessageTypeCodec.decode(r#"{"MessageType":"KeepAlive"}"#).unwrap();
        assert_eq!(env.message_type, "KeepAlive");
        assert!(env.data.is_none());

        let env = MessageTypeCodec
            .decode(r#"{"MessageType":"ForceKeepAlive","Data":null}"#)
            .unwrap();
        assert!(env.data.is_none());
    }

    #[test]
    fn test_encodes_sessions_start() {
        let text = MessageTypeCodec
            .encode(&Envelope::new("SessionsStart", Some(json!("0,1500"))))
            .unwrap();
        assert_eq!(text, r#"{"MessageType":"SessionsStart","Data":"0,1500"}"#);
    }

    #[test]
    fn test_malformed_json_is_an_error() {
        assert!(MessageTypeCodec.decode("not json").is_err());
        assert!(MessageTypeCodec.decode(r#"{"Data":1}"#).is_err());
        assert!(PlexCodec.decode(r#"{"type":"playing"}"#).is_err());
    }

    #[test]
    fn test_decodes_plex_playing_notification() {
        let text = r#"{"NotificationContainer":{"type":"playing","size":1,
            "PlaySessionStateNotification":[{"sessionKey":"12","state":"playing"}]}}"#;
        let env = PlexCodec.decode(text).unwrap();
        assert_eq!(env.message_type, "playing");
        assert_eq!(
            env.data,
            Some(json!([{"sessionKey": "12", "state": "playing"}]))
        );
    }

    #[test]
    fn test_plex_unknown_type_has_no_payload() {
        let env = PlexCodec
            .decode(r#"{"NotificationContainer":{"type":"update.statechange"}}"#)
            .unwrap();
        assert_eq!(env.message_type, "update.statechange");
        assert!(env.data.is_none());
    }

    #[test]
    fn test_plex_cannot_encode() {
        let err = PlexCodec.encode(&Envelope::new("playing", None)).unwrap_err();
        assert!(matches!(err, EnvelopeError::Unsupported { codec: "plex" }));
    }
}
