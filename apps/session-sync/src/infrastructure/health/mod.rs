//! Health Check and Metrics Endpoint
//!
//! HTTP endpoint for health checks, per-source status reporting, and
//! Prometheus metrics.
//!
//! # Endpoints
//!
//! - `GET /health` - Returns JSON health status
//! - `GET /healthz` - Liveness check (simple OK)
//! - `GET /readyz` - Readiness check (sync manager running)
//! - `GET /metrics` - Prometheus metrics in text format

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::services::{SourceStatus, SyncManager};
use crate::infrastructure::metrics::get_metrics_handle;

// =============================================================================
// Health Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status: "healthy", "degraded", or "unhealthy".
    pub status: HealthStatus,
    /// Service version.
    pub version: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Start time of the last successful history sync.
    pub last_sync: Option<DateTime<Utc>>,
    /// One entry per registered source.
    pub sources: Vec<SourceHealth>,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Every source operational.
    Healthy,
    /// Some sources operational.
    Degraded,
    /// No source operational.
    Unhealthy,
}

/// Status of a single source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceHealth {
    /// Source tag.
    pub name: String,
    /// Configured server identifier.
    pub server_id: Option<String>,
    /// Whether the source manager is running.
    pub running: bool,
    /// Whether the realtime feed is connected.
    pub realtime_connected: bool,
    /// Sessions tracked by the dedup cache.
    pub tracked_sessions: usize,
    /// Circuit breaker state, when wrapped.
    pub circuit_state: Option<String>,
    /// Whether the source counts as operational.
    pub operational: bool,
}

impl From<&SourceStatus> for SourceHealth {
    fn from(status: &SourceStatus) -> Self {
        Self {
            name: status.source.to_string(),
            server_id: status.server_id.clone(),
            running: status.running,
            realtime_connected: status.realtime_connected,
            tracked_sessions: status.tracked_sessions,
            circuit_state: status.circuit_state.clone(),
            operational: status.is_operational(),
        }
    }
}

// =============================================================================
// Health Server State
// =============================================================================

/// Shared state for the health server.
pub struct HealthServerState {
    version: String,
    started_at: Instant,
    sync_manager: Arc<SyncManager>,
}

impl HealthServerState {
    /// Create new health server state.
    #[must_use]
    pub fn new(version: String, sync_manager: Arc<SyncManager>) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            sync_manager,
        }
    }
}

// =============================================================================
// Health Server
// =============================================================================

/// Health check HTTP server.
pub struct HealthServer {
    port: u16,
    state: Arc<HealthServerState>,
    cancel: CancellationToken,
}

impl HealthServer {
    /// Create a new health server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<HealthServerState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Run the health server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), HealthServerError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HealthServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "Health server listening");

        axum::serve(listener, router(self.state))
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HealthServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Health server stopped");
        Ok(())
    }
}

fn router(state: Arc<HealthServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let response = build_health_response(&state);
    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    if state.sync_manager.is_running() {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            let body = handle.render();
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                body,
            )
        },
    )
}

fn build_health_response(state: &HealthServerState) -> HealthResponse {
    let sources: Vec<SourceHealth> = state
        .sync_manager
        .sources_status()
        .iter()
        .map(SourceHealth::from)
        .collect();

    HealthResponse {
        status: determine_health_status(&sources),
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        last_sync: state.sync_manager.last_sync_time(),
        sources,
    }
}

fn determine_health_status(sources: &[SourceHealth]) -> HealthStatus {
    let operational = sources.iter().filter(|s| s.operational).count();

    if operational == sources.len() {
        HealthStatus::Healthy
    } else if operational > 0 {
        HealthStatus::Degraded
    } else {
        HealthStatus::Unhealthy
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Health server errors.
#[derive(Debug, thiserror::Error)]
pub enum HealthServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::application::ports::NoOpHistorySync;
    use crate::application::services::SyncManagerConfig;

    fn source(operational: bool) -> SourceHealth {
        SourceHealth {
            name: "plex".to_string(),
            server_id: None,
            running: operational,
            realtime_connected: operational,
            tracked_sessions: 0,
            circuit_state: Some("closed".to_string()),
            operational,
        }
    }

    fn state() -> Arc<HealthServerState> {
        let manager = SyncManager::new(SyncManagerConfig::default(), Arc::new(NoOpHistorySync));
        Arc::new(HealthServerState::new("0.1.0".to_string(), Arc::new(manager)))
    }

    async fn get(state: Arc<HealthServerState>, path: &str) -> (StatusCode, String) {
        let response = router(state)
            .oneshot(Request::get(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[test]
    fn test_health_status_serialization() {
        assert_eq!(
            serde_json::to_string(&HealthStatus::Healthy).unwrap(),
            "\"healthy\""
        );
        assert_eq!(
            serde_json::to_string(&HealthStatus::Degraded).unwrap(),
            "\"degraded\""
        );
        assert_eq!(
            serde_json::to_string(&HealthStatus::Unhealthy).unwrap(),
            "\"unhealthy\""
        );
    }

    #[test]
    fn test_determine_status() {
        assert_eq!(determine_health_status(&[]), HealthStatus::Healthy);
        assert_eq!(
            determine_health_status(&[source(true), source(true)]),
            HealthStatus::Healthy
        );
        assert_eq!(
            determine_health_status(&[source(true), source(false)]),
            HealthStatus::Degraded
        );
        assert_eq!(
            determine_health_status(&[source(false)]),
            HealthStatus::Unhealthy
        );
    }

    #[tokio::test]
    async fn test_health_without_sources_is_healthy() {
        let (status, body) = get(state(), "/health").await;
        assert_eq!(status, StatusCode::OK);

        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["version"], "0.1.0");
        assert!(json["sources"].as_array().unwrap().is_empty());
        assert!(json["last_sync"].is_null());
    }

    #[tokio::test]
    async fn test_liveness_and_readiness() {
        let state = state();
        assert_eq!(
            get(Arc::clone(&state), "/healthz").await,
            (StatusCode::OK, "OK".to_string())
        );
        assert_eq!(
            get(Arc::clone(&state), "/readyz").await.0,
            StatusCode::SERVICE_UNAVAILABLE
        );

        let cancel = CancellationToken::new();
        state.sync_manager.start(&cancel).await.unwrap();
        assert_eq!(
            get(Arc::clone(&state), "/readyz").await,
            (StatusCode::OK, "READY".to_string())
        );
        state.sync_manager.stop().await.unwrap();
    }
}
