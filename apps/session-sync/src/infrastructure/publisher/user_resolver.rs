//! In-memory user resolver.
//!
//! Assigns internal IDs in first-seen order. IDs are not persisted, so a
//! restart renumbers users.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::application::ports::{UserLookup, UserResolveError, UserResolverPort};
use crate::domain::Source;

/// Resolves upstream users to sequential internal IDs starting at 1.
#[derive(Debug, Default)]
pub struct InMemoryUserResolver {
    users: Mutex<HashMap<(Source, String, String), i64>>,
}

impl InMemoryUserResolver {
    /// Create an empty resolver.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of known users.
    #[must_use]
    pub fn len(&self) -> usize {
        self.users.lock().len()
    }

    /// Check if no user has been resolved yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.users.lock().is_empty()
    }
}

#[async_trait]
impl UserResolverPort for InMemoryUserResolver {
    async fn resolve_user_id(&self, lookup: UserLookup) -> Result<i64, UserResolveError> {
        if lookup.external_user_id.is_empty() {
            return Err(UserResolveError::Failed {
                message: "empty external user id".to_string(),
            });
        }

        let mut users = self.users.lock();
        let next = i64::try_from(users.len()).unwrap_or(i64::MAX - 1) + 1;
        let id = *users
            .entry((lookup.source, lookup.server_id, lookup.external_user_id))
            .or_insert(next);
        Ok(id)
    }
}
