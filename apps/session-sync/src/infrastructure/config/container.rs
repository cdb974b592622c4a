//! Source Wiring
//!
//! Builds one breaker-protected [`SourceManager`] per configured media
//! server and connects it to the shared event pipeline.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::settings::{SourceSettings, SyncConfig};
use crate::application::ports::{
    EventPublisherPort, RealtimeError, RealtimeFeed, SessionSource, SourceError, UserResolverPort,
};
use crate::application::services::{
    ManagedSource, PollerConfig, SourceManager, SourceManagerConfig,
};
use crate::domain::{DEFAULT_CAPACITY, Source, ToPlaybackEvent};
use crate::infrastructure::media::{
    EmbyClient, EmbyFlavor, EmbyRealtime, EmbySession, PlexClient, PlexRealtime, PlexSession,
};
use crate::infrastructure::resilience::CircuitBreakerClient;
use crate::infrastructure::websocket::RealtimeConfig;

/// Errors while building sources.
#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    /// REST client could not be built.
    #[error("{source_name} client: {error}")]
    Client {
        /// Server family.
        source_name: Source,
        /// Underlying error.
        error: SourceError,
    },

    /// Realtime feed could not be configured.
    #[error("{source_name} realtime feed: {error}")]
    Realtime {
        /// Server family.
        source_name: Source,
        /// Underlying error.
        error: RealtimeError,
    },
}

/// Downstream collaborators shared by every source.
#[derive(Clone)]
pub struct Pipeline {
    /// Receives canonical playback events.
    pub publisher: Arc<dyn EventPublisherPort>,
    /// Maps upstream users to internal IDs.
    pub resolver: Arc<dyn UserResolverPort>,
}

/// Build a manager for every enabled server in `config`.
///
/// # Errors
///
/// Returns an error if a server URL cannot be used.
pub fn build_sources(
    config: &SyncConfig,
    pipeline: &Pipeline,
    cancel: &CancellationToken,
) -> Result<Vec<Arc<dyn ManagedSource>>, ContainerError> {
    config
        .sources()
        .map(|settings| build_source(config, settings, pipeline, cancel))
        .collect()
}

fn build_source(
    config: &SyncConfig,
    settings: &SourceSettings,
    pipeline: &Pipeline,
    cancel: &CancellationToken,
) -> Result<Arc<dyn ManagedSource>, ContainerError> {
    let source = settings.source;
    let client_err = |error| ContainerError::Client {
        source_name: source,
        error,
    };
    let realtime_err = |error| ContainerError::Realtime {
        source_name: source,
        error,
    };
    let span = tracing::info_span!("source", source = %source);
    let token = settings.credentials.token();

    match source {
        Source::Plex => {
            let client = PlexClient::new(&settings.url, token, config.http, cancel.clone())
                .map_err(client_err)?;
            let feed = if settings.realtime_enabled {
                let url = client.realtime_url().map_err(realtime_err)?;
                let realtime = config.websocket.apply(RealtimeConfig::new(url));
                let feed: Arc<dyn RealtimeFeed<Session = PlexSession>> =
                    Arc::new(PlexRealtime::new(realtime, span.clone()));
                Some(feed)
            } else {
                None
            };
            Ok(assemble(config, settings, client, feed, pipeline, span))
        }
        Source::Emby | Source::Jellyfin => {
            let flavor = if source == Source::Emby {
                EmbyFlavor::Emby
            } else {
                EmbyFlavor::Jellyfin
            };
            let client = EmbyClient::new(
                flavor,
                &settings.url,
                token,
                settings.user_id.as_deref(),
                config.http,
                cancel.clone(),
            )
            .map_err(client_err)?;
            let feed = if settings.realtime_enabled {
                let realtime = config
                    .websocket
                    .apply(client.realtime_config().map_err(realtime_err)?);
                let feed: Arc<dyn RealtimeFeed<Session = EmbySession>> =
                    Arc::new(EmbyRealtime::new(flavor, realtime, span.clone()));
                Some(feed)
            } else {
                None
            };
            Ok(assemble(config, settings, client, feed, pipeline, span))
        }
    }
}

fn assemble<S>(
    config: &SyncConfig,
    settings: &SourceSettings,
    client: S,
    feed: Option<Arc<dyn RealtimeFeed<Session = S::Session>>>,
    pipeline: &Pipeline,
    span: tracing::Span,
) -> Arc<dyn ManagedSource>
where
    S: SessionSource + 'static,
    S::Session: ToPlaybackEvent,
{
    let client =
        CircuitBreakerClient::new(client, settings.source.as_str(), config.circuit_breaker);
    let manager_config = SourceManagerConfig {
        source: settings.source,
        server_id: settings.server_id.clone(),
        realtime_enabled: settings.realtime_enabled,
        polling_enabled: settings.polling_enabled,
        poller: PollerConfig {
            interval: settings.polling_interval,
            publish_all: settings.publish_all,
            seen_session_ttl: settings.seen_session_ttl,
            capacity: DEFAULT_CAPACITY,
        },
    };

    let mut manager = SourceManager::new(client, manager_config, span)
        .with_publisher(Arc::clone(&pipeline.publisher))
        .with_user_resolver(Arc::clone(&pipeline.resolver));
    if let Some(feed) = feed {
        manager = manager.with_realtime(feed);
    }
    Arc::new(manager)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::NoOpEventPublisher;
    use crate::infrastructure::publisher::InMemoryUserResolver;

    fn pipeline() -> Pipeline {
        Pipeline {
            publisher: Arc::new(NoOpEventPublisher),
            resolver: Arc::new(InMemoryUserResolver::new()),
        }
    }

    fn lookup(vars: &'static [(&'static str, &'static str)]) -> impl Fn(&str) -> Option<String> {
        move |key| {
            vars.iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| (*v).to_string())
        }
    }

    #[test]
    fn test_builds_every_enabled_source() {
        let config = SyncConfig::from_lookup(lookup(&[
            ("PLEX_ENABLED", "true"),
            ("PLEX_URL", "http://plex.local:32400"),
            ("PLEX_TOKEN", "plex-token"),
            ("JELLYFIN_ENABLED", "true"),
            ("JELLYFIN_URL", "https://jf.example.com/jellyfin"),
            ("JELLYFIN_API_KEY", "jf-key"),
            ("JELLYFIN_SERVER_ID", "jf-1"),
        ]))
        .unwrap();

        let sources = build_sources(&config, &pipeline(), &CancellationToken::new()).unwrap();
        let tags: Vec<Source> = sources.iter().map(|s| s.source()).collect();
        assert_eq!(tags, vec![Source::Plex, Source::Jellyfin]);

        let status = sources[1].status();
        assert_eq!(status.server_id.as_deref(), Some("jf-1"));
        assert_eq!(status.circuit_state.as_deref(), Some("closed"));
        assert!(!status.running);
        assert!(status.realtime_enabled);
    }

    #[test]
    fn test_rejects_unusable_url() {
        let config = SyncConfig::from_lookup(lookup(&[
            ("EMBY_ENABLED", "true"),
            ("EMBY_URL", "not a url"),
            ("EMBY_API_KEY", "key"),
        ]))
        .unwrap();

        let Err(err) = build_sources(&config, &pipeline(), &CancellationToken::new()) else {
            panic!("unusable URL should be rejected");
        };
        assert!(matches!(
            err,
            ContainerError::Client {
                source_name: Source::Emby,
                ..
            }
        ));
    }
}
