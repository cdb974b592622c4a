//! Typed message handlers keyed by envelope message type.

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::de::DeserializeOwned;
use serde_json::Value;

use super::envelope::Envelope;

type Handler = Box<dyn Fn(Option<&Value>) -> Result<(), serde_json::Error> + Send + Sync>;

/// Result of dispatching one envelope.
#[derive(Debug)]
pub enum Dispatch {
    /// A handler ran.
    Handled,
    /// The type is known but deliberately ignored.
    Ignored,
    /// No handler is registered for the type.
    Unknown,
    /// The payload did not decode into the handler's type.
    DecodeFailed(serde_json::Error),
}

/// Handler registry for a realtime feed.
///
/// # Example
///
/// ```rust
/// use session_sync::infrastructure::websocket::Callbacks;
///
/// let callbacks = Callbacks::new()
///     .on("Sessions", |sessions: Vec<serde_json::Value>| {
///         println!("{} sessions", sessions.len());
///     })
///     .ignore("KeepAlive");
/// assert!(callbacks.handles("Sessions"));
/// ```
#[derive(Default)]
pub struct Callbacks {
    handlers: HashMap<String, Handler>,
    ignored: HashSet<String>,
}

impl Callbacks {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `message_type`, decoding the payload into `T`.
    ///
    /// A missing payload is decoded from `null`, so `T = Option<_>` or `()`
    /// accepts payload-less messages.
    #[must_use]
    pub fn on<T, F>(mut self, message_type: impl Into<String>, handler: F) -> Self
    where
        T: DeserializeOwned,
        F: Fn(T) + Send + Sync + 'static,
    {
        let handler: Handler = Box::new(move |data| {
            let payload = match data {
                Some(value) => T::deserialize(value)?,
                None => T::deserialize(&Value::Null)?,
            };
            handler(payload);
            Ok(())
        });
        self.handlers.insert(message_type.into(), handler);
        self
    }

    /// Accept `message_type` silently without a handler.
    #[must_use]
    pub fn ignore(mut self, message_type: impl Into<String>) -> Self {
        self.ignored.insert(message_type.into());
        self
    }

    /// Whether a handler is registered for `message_type`.
    #[must_use]
    pub fn handles(&self, message_type: &str) -> bool {
        self.handlers.contains_key(message_type)
    }

    /// Route an envelope to its handler.
    pub fn dispatch(&self, envelope: &Envelope) -> Dispatch {
        if let Some(handler) = self.handlers.get(&envelope.message_type) {
            return match handler(envelope.data.as_ref()) {
                Ok(()) => Dispatch::Handled,
                Err(e) => Dispatch::DecodeFailed(e),
            };
        }
        if self.ignored.contains(&envelope.message_type) {
            Dispatch::Ignored
        } else {
            Dispatch::Unknown
        }
    }
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .field("ignored", &self.ignored)
            .finish()
    }
}
