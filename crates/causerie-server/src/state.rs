use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;

use causerie_store::Database;

use crate::bus::Bus;
use crate::config::ServerConfig;
use crate::identity::TokenVerifier;
use crate::permissions::PermissionEngine;
use crate::presence::Presence;
use crate::rate_limit::RateLimiter;

/// The store behind one async mutex: SQLite is single-writer and every
/// gateway call is short.
pub type SharedDb = Arc<Mutex<Database>>;

/// Live WebSocket sessions per `(user, presence scope)`, for the
/// offline-publish debounce. A user flapping between connections inside
/// the grace window never emits a transient offline, and sessions in one
/// tenant scope never mask a disconnect in another.
#[derive(Default)]
pub struct SessionRegistry {
    counts: DashMap<(String, String), usize>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, user_id: &str, scope: &str) {
        *self
            .counts
            .entry((user_id.to_string(), scope.to_string()))
            .or_insert(0) += 1;
    }

    /// Returns true when this was the user's last session in this scope.
    pub fn unregister(&self, user_id: &str, scope: &str) -> bool {
        let key = (user_id.to_string(), scope.to_string());
        let Some(mut count) = self.counts.get_mut(&key) else {
            return true;
        };
        *count = count.saturating_sub(1);
        if *count == 0 {
            drop(count);
            self.counts.remove_if(&key, |_, c| *c == 0);
            true
        } else {
            false
        }
    }

    pub fn is_active(&self, user_id: &str, scope: &str) -> bool {
        self.counts
            .get(&(user_id.to_string(), scope.to_string()))
            .map(|c| *c > 0)
            .unwrap_or(false)
    }
}

#[derive(Clone)]
pub struct AppState {
    pub db: SharedDb,
    pub bus: Arc<Bus>,
    pub presence: Presence,
    pub sessions: Arc<SessionRegistry>,
    pub verifier: Arc<TokenVerifier>,
    pub engine: PermissionEngine,
    pub rate_limiter: RateLimiter,
    pub config: Arc<ServerConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_counts_sessions_per_scope() {
        let registry = SessionRegistry::new();
        assert!(!registry.is_active("u1", "t1"));

        registry.register("u1", "t1");
        registry.register("u1", "t1");
        assert!(registry.is_active("u1", "t1"));

        assert!(!registry.unregister("u1", "t1"), "one session remains");
        assert!(registry.is_active("u1", "t1"));

        assert!(registry.unregister("u1", "t1"), "last session gone");
        assert!(!registry.is_active("u1", "t1"));
    }

    #[test]
    fn scopes_do_not_mask_each_other() {
        let registry = SessionRegistry::new();
        registry.register("u1", "t1");
        registry.register("u1", "t2");

        // Dropping the t1 session is "last in scope" even though the t2
        // session is still open.
        assert!(registry.unregister("u1", "t1"));
        assert!(!registry.is_active("u1", "t1"));
        assert!(registry.is_active("u1", "t2"));
    }
}
