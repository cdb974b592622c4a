//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer.

/// Configuration and source wiring.
pub mod config;

/// Health check HTTP endpoint.
pub mod health;

/// Rate-limit-aware HTTP client for media server REST APIs.
pub mod http;

/// Plex, Emby and Jellyfin adapters.
pub mod media;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Event publisher and user resolver adapters.
pub mod publisher;

/// Circuit breaker protection for upstream calls.
pub mod resilience;

/// OpenTelemetry tracing integration.
pub mod telemetry;

/// Auto-reconnecting WebSocket client.
pub mod websocket;
