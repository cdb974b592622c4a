//! HTTP plumbing shared by the media server adapters.

/// Authenticated JSON client for media server REST APIs.
pub mod api_client;

/// Retry-on-429 request executor.
pub mod rate_limit;

pub use api_client::{ApiClient, HttpSettings};
pub use rate_limit::{RateLimitConfig, RateLimitError, RateLimitedExecutor, parse_retry_after};
