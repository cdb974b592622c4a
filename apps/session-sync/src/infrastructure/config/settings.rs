//! Session Sync Configuration Settings
//!
//! Configuration types for the sync service, loaded from environment
//! variables. Each media server is configured under its own prefix
//! (`PLEX_`, `EMBY_`, `JELLYFIN_`) and is skipped unless `*_ENABLED` is set.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::domain::Source;
use crate::infrastructure::http::{HttpSettings, RateLimitConfig};
use crate::infrastructure::resilience::CircuitBreakerConfig;
use crate::infrastructure::websocket::{RealtimeConfig, ReconnectConfig};

/// Shortest Plex polling interval accepted.
pub const PLEX_MIN_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Media server token or API key.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    token: String,
}

impl Credentials {
    /// Wrap a token.
    #[must_use]
    pub const fn new(token: String) -> Self {
        Self { token }
    }

    /// Get the token.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("token", &"[REDACTED]")
            .finish()
    }
}

/// One media server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSettings {
    /// Server family.
    pub source: Source,
    /// Base URL, e.g. `http://plex.local:32400`.
    pub url: String,
    /// Token or API key.
    pub credentials: Credentials,
    /// Identifier attached to events from this server.
    pub server_id: Option<String>,
    /// User scoping the device ID (Emby/Jellyfin only).
    pub user_id: Option<String>,
    /// Listen to the WebSocket feed.
    pub realtime_enabled: bool,
    /// Poll active sessions.
    pub polling_enabled: bool,
    /// Polling interval.
    pub polling_interval: Duration,
    /// Publish every session on every poll instead of only new ones.
    pub publish_all: bool,
    /// How long a seen session suppresses duplicates.
    pub seen_session_ttl: Duration,
}

/// Scheduled history sync settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSettings {
    /// Time between scheduled syncs.
    pub interval: Duration,
    /// Window of the first sync when no previous sync is recorded.
    pub lookback: Duration,
    /// Sync all history on the first run.
    pub sync_all: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            lookback: Duration::from_secs(24 * 3600),
            sync_all: false,
        }
    }
}

/// WebSocket connection settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WebSocketSettings {
    /// Keepalive ping interval.
    pub ping_interval: Duration,
    /// Silence allowed before reconnecting.
    pub read_timeout: Duration,
    /// Opening handshake limit.
    pub handshake_timeout: Duration,
    /// First reconnect delay.
    pub reconnect_initial: Duration,
    /// Reconnect delay cap.
    pub reconnect_max: Duration,
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            read_timeout: Duration::from_secs(60),
            handshake_timeout: Duration::from_secs(10),
            reconnect_initial: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(32),
        }
    }
}

impl WebSocketSettings {
    /// Apply these timings to a realtime client configuration.
    #[must_use]
    pub fn apply(&self, mut config: RealtimeConfig) -> RealtimeConfig {
        config.ping_interval = self.ping_interval;
        config.read_timeout = self.read_timeout;
        config.handshake_timeout = self.handshake_timeout;
        config.reconnect = ReconnectConfig {
            initial_delay: self.reconnect_initial,
            max_delay: self.reconnect_max,
            ..config.reconnect
        };
        config
    }
}

/// Server port settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerSettings {
    /// Health check HTTP port.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { health_port: 8083 }
    }
}

/// Complete service configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Plex server, when enabled.
    pub plex: Option<SourceSettings>,
    /// Emby server, when enabled.
    pub emby: Option<SourceSettings>,
    /// Jellyfin server, when enabled.
    pub jellyfin: Option<SourceSettings>,
    /// Circuit breaker applied to every server.
    pub circuit_breaker: CircuitBreakerConfig,
    /// HTTP transport settings.
    pub http: HttpSettings,
    /// History sync schedule.
    pub sync: SyncSettings,
    /// WebSocket timings.
    pub websocket: WebSocketSettings,
    /// Server ports.
    pub server: ServerSettings,
}

impl SyncConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if an enabled server lacks its URL or token, or if a
    /// value cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from a `.env`-style file, ignoring the process
    /// environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or the configuration is
    /// invalid.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let vars = dotenvy::from_path_iter(path)
            .and_then(Iterator::collect::<Result<HashMap<_, _>, _>>)
            .map_err(|e| ConfigError::InvalidValue {
                key: path.display().to_string(),
                message: e.to_string(),
            })?;
        Self::from_lookup(|key| vars.get(key).cloned())
    }

    /// Create configuration from an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Same as [`Self::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        let defaults = CircuitBreakerConfig::default();
        let circuit_breaker = CircuitBreakerConfig {
            max_requests: env.parse("CIRCUIT_BREAKER_MAX_REQUESTS", defaults.max_requests)?,
            interval: env.secs("CIRCUIT_BREAKER_INTERVAL_SECS", defaults.interval)?,
            timeout: env.secs("CIRCUIT_BREAKER_TIMEOUT_SECS", defaults.timeout)?,
            min_requests: env.parse("CIRCUIT_BREAKER_MIN_REQUESTS", defaults.min_requests)?,
            failure_ratio: env.parse("CIRCUIT_BREAKER_FAILURE_RATIO", defaults.failure_ratio)?,
        };
        if !(0.0..=1.0).contains(&circuit_breaker.failure_ratio) {
            return Err(ConfigError::InvalidValue {
                key: "CIRCUIT_BREAKER_FAILURE_RATIO".to_string(),
                message: "must be between 0 and 1".to_string(),
            });
        }

        let defaults = HttpSettings::default();
        let http = HttpSettings {
            timeout: env.secs("HTTP_TIMEOUT_SECS", defaults.timeout)?,
            rate_limit: RateLimitConfig {
                max_retries: env.parse("RATE_LIMIT_MAX_RETRIES", defaults.rate_limit.max_retries)?,
                base_delay: env.millis("RATE_LIMIT_BASE_DELAY_MS", defaults.rate_limit.base_delay)?,
            },
        };

        let defaults = SyncSettings::default();
        let sync = SyncSettings {
            interval: env.secs("SYNC_INTERVAL_SECS", defaults.interval)?,
            lookback: env
                .parse("SYNC_LOOKBACK_HOURS", defaults.lookback.as_secs() / 3600)
                .map(|hours: u64| Duration::from_secs(hours.saturating_mul(3600)))?,
            sync_all: env.flag("SYNC_ALL", defaults.sync_all)?,
        };

        let defaults = WebSocketSettings::default();
        let websocket = WebSocketSettings {
            ping_interval: env.secs("WEBSOCKET_PING_INTERVAL_SECS", defaults.ping_interval)?,
            read_timeout: env.secs("WEBSOCKET_READ_TIMEOUT_SECS", defaults.read_timeout)?,
            handshake_timeout: env.secs(
                "WEBSOCKET_HANDSHAKE_TIMEOUT_SECS",
                defaults.handshake_timeout,
            )?,
            reconnect_initial: env.millis(
                "WEBSOCKET_RECONNECT_INITIAL_MS",
                defaults.reconnect_initial,
            )?,
            reconnect_max: env.secs("WEBSOCKET_RECONNECT_MAX_SECS", defaults.reconnect_max)?,
        };

        let server = ServerSettings {
            health_port: env.parse("HEALTH_PORT", ServerSettings::default().health_port)?,
        };

        Ok(Self {
            plex: env.source(Source::Plex, "PLEX", "PLEX_TOKEN")?,
            emby: env.source(Source::Emby, "EMBY", "EMBY_API_KEY")?,
            jellyfin: env.source(Source::Jellyfin, "JELLYFIN", "JELLYFIN_API_KEY")?,
            circuit_breaker,
            http,
            sync,
            websocket,
            server,
        })
    }

    /// Enabled servers, in Plex, Emby, Jellyfin order.
    pub fn sources(&self) -> impl Iterator<Item = &SourceSettings> {
        [&self.plex, &self.emby, &self.jellyfin]
            .into_iter()
            .filter_map(Option::as_ref)
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable could not be parsed.
    #[error("invalid value for {key}: {message}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// Parse error.
        message: String,
    },
}

// =============================================================================
// Parsing
// =============================================================================

struct Env<F>(F);

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).map(|v| v.trim().to_string())
    }

    fn required(&self, key: &str) -> Result<String, ConfigError> {
        let value = self
            .get(key)
            .ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))?;
        if value.is_empty() {
            return Err(ConfigError::EmptyValue(key.to_string()));
        }
        Ok(value)
    }

    fn optional(&self, key: &str) -> Option<String> {
        self.get(key).filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.optional(key) {
            None => Ok(default),
            Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("'{raw}': {e}"),
            }),
        }
    }

    fn flag(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        let Some(raw) = self.optional(key) else {
            return Ok(default);
        };
        match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("'{raw}' is not a boolean"),
            }),
        }
    }

    fn secs(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        self.parse(key, default.as_secs()).map(Duration::from_secs)
    }

    fn millis(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        self.parse(key, default.as_millis() as u64)
            .map(Duration::from_millis)
    }

    fn source(
        &self,
        source: Source,
        prefix: &str,
        token_key: &str,
    ) -> Result<Option<SourceSettings>, ConfigError> {
        let key = |suffix: &str| format!("{prefix}_{suffix}");
        if !self.flag(&key("ENABLED"), false)? {
            return Ok(None);
        }

        let mut polling_interval =
            self.secs(&key("SESSION_POLLING_INTERVAL_SECS"), Duration::from_secs(30))?;
        if source == Source::Plex && polling_interval < PLEX_MIN_POLL_INTERVAL {
            tracing::warn!(
                configured_secs = polling_interval.as_secs(),
                "Plex polling interval raised to minimum"
            );
            polling_interval = PLEX_MIN_POLL_INTERVAL;
        }

        Ok(Some(SourceSettings {
            source,
            url: self.required(&key("URL"))?,
            credentials: Credentials::new(self.required(token_key)?),
            server_id: self.optional(&key("SERVER_ID")),
            user_id: self.optional(&key("USER_ID")),
            realtime_enabled: self.flag(&key("REALTIME_ENABLED"), true)?,
            polling_enabled: self.flag(&key("SESSION_POLLING_ENABLED"), true)?,
            polling_interval,
            publish_all: self.flag(&key("PUBLISH_ALL"), false)?,
            seen_session_ttl: self.secs(&key("SEEN_SESSION_TTL_SECS"), Duration::from_secs(3600))?,
        }))
    }
}
