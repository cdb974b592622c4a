//! Session Sync Binary
//!
//! Starts the multi-source playback session synchronization service.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin session-sync
//! ```
//!
//! # Environment Variables
//!
//! ## Per server (`PLEX_`, `EMBY_`, `JELLYFIN_` prefixes)
//! - `<PREFIX>_ENABLED`: Enable the server (default: false)
//! - `<PREFIX>_URL`: Base URL (required when enabled)
//! - `PLEX_TOKEN` / `EMBY_API_KEY` / `JELLYFIN_API_KEY`: Credentials (required when enabled)
//! - `<PREFIX>_SERVER_ID`, `<PREFIX>_USER_ID`: Optional identifiers
//! - `<PREFIX>_REALTIME_ENABLED`, `<PREFIX>_SESSION_POLLING_ENABLED` (default: true)
//! - `<PREFIX>_SESSION_POLLING_INTERVAL_SECS` (default: 30, Plex minimum 10)
//! - `<PREFIX>_PUBLISH_ALL`, `<PREFIX>_SEEN_SESSION_TTL_SECS`
//!
//! ## Optional
//! - `SYNC_INTERVAL_SECS`, `SYNC_LOOKBACK_HOURS`, `SYNC_ALL`: History sync schedule
//! - `CIRCUIT_BREAKER_*`, `RATE_LIMIT_*`, `WEBSOCKET_*`: Resilience tuning
//! - `HEALTH_PORT`: Health check HTTP port (default: 8083)
//! - `OTEL_ENABLED`, `OTEL_EXPORTER_OTLP_ENDPOINT`, `OTEL_SERVICE_NAME`: Tracing export
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;

use anyhow::Context;
use session_sync::application::ports::NoOpHistorySync;
use session_sync::application::services::{SyncManager, SyncManagerConfig};
use session_sync::infrastructure::config::{Pipeline, SyncConfig, build_sources};
use session_sync::infrastructure::health::{HealthServer, HealthServerState};
use session_sync::infrastructure::publisher::{InMemoryUserResolver, LoggingEventPublisher};
use session_sync::infrastructure::telemetry;
use session_sync::init_metrics;
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        anyhow::bail!("failed to install rustls crypto provider");
    }

    load_dotenv();

    // Initialize telemetry (OpenTelemetry + tracing)
    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting session sync");

    // Initialize Prometheus metrics
    let _metrics_handle = init_metrics();

    let config = SyncConfig::from_env().context("failed to load configuration")?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    let pipeline = Pipeline {
        publisher: Arc::new(LoggingEventPublisher::new()),
        resolver: Arc::new(InMemoryUserResolver::new()),
    };
    let sources = build_sources(&config, &pipeline, &shutdown_token)
        .context("failed to build media server sources")?;
    if sources.is_empty() {
        tracing::warn!("No media servers enabled");
    }

    let sync_manager = Arc::new(SyncManager::new(
        SyncManagerConfig {
            interval: config.sync.interval,
            lookback: config.sync.lookback,
            sync_all: config.sync.sync_all,
        },
        Arc::new(NoOpHistorySync),
    ));
    for source in sources {
        sync_manager.add_source(source);
    }
    sync_manager.set_on_sync_complete(|new_records, duration_ms| {
        tracing::debug!(new_records, duration_ms, "Sync cycle finished");
    });

    // Spawn health server
    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        Arc::clone(&sync_manager),
    ));
    let health_server = HealthServer::new(
        config.server.health_port,
        health_state,
        shutdown_token.clone(),
    );
    let health_task = tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    sync_manager
        .start(&shutdown_token)
        .await
        .context("failed to start sync manager")?;

    tracing::info!("Session sync ready");

    await_shutdown(&shutdown_token).await;

    if let Err(e) = sync_manager.stop().await {
        tracing::warn!(error = %e, "Sync manager stop failed");
    }
    if let Err(e) = health_task.await {
        tracing::error!(error = %e, "Health server task panicked");
    }

    tracing::info!("Session sync stopped");
    Ok(())
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &SyncConfig) {
    for source in config.sources() {
        tracing::info!(
            source = %source.source,
            url = %source.url,
            server_id = source.server_id.as_deref().unwrap_or(""),
            realtime = source.realtime_enabled,
            polling = source.polling_enabled,
            polling_interval_secs = source.polling_interval.as_secs(),
            "Media server configured"
        );
    }
    tracing::info!(
        health_port = config.server.health_port,
        sync_interval_secs = config.sync.interval.as_secs(),
        sync_all = config.sync.sync_all,
        "Configuration loaded"
    );
}

/// Wait for shutdown signal (SIGTERM or SIGINT), then cancel `shutdown_token`.
async fn await_shutdown(shutdown_token: &CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Ctrl+C handler failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "SIGTERM handler installation failed");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();
    tracing::info!("Graceful shutdown started");
}
