//! User Resolver Port (Driven Port)
//!
//! Maps an upstream user identity to the internal numeric user ID.

use async_trait::async_trait;

use crate::domain::Source;

/// User resolution error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum UserResolveError {
    /// Backing store could not be reached.
    #[error("user store unavailable: {message}")]
    Unavailable {
        /// Error detail.
        message: String,
    },

    /// Lookup was rejected.
    #[error("user resolution failed: {message}")]
    Failed {
        /// Error detail.
        message: String,
    },
}

/// Upstream identity to resolve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserLookup {
    /// Server family.
    pub source: Source,
    /// Configured server identifier (empty when not configured).
    pub server_id: String,
    /// Upstream user identifier.
    pub external_user_id: String,
    /// Upstream username.
    pub username: Option<String>,
    /// Display name.
    pub friendly_name: Option<String>,
}

/// Port for resolving external user identifiers.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UserResolverPort: Send + Sync {
    /// Resolve (or create) the internal user ID for an upstream user.
    async fn resolve_user_id(&self, lookup: UserLookup) -> Result<i64, UserResolveError>;
}
