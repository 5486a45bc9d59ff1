//! Local view of last-known claim state per session handle.
//!
//! This is a cache, not an authority: it avoids redundant authority calls for
//! claim state and is dropped whenever a session is refreshed, revoked, or
//! flagged for theft. Revocation correctness is the authority's job, enforced
//! when the refresh token is next presented.

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

struct CachedClaims {
    claims: Map<String, Value>,
    cached_at: Instant,
}

pub struct HandleRegistry {
    ttl: Duration,
    entries: Mutex<HashMap<String, CachedClaims>>,
}

impl HandleRegistry {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Record the latest observed claim state for a handle.
    pub async fn record(&self, session_handle: &str, claims: Map<String, Value>) {
        let mut entries = self.entries.lock().await;
        entries.retain(|_, entry| entry.cached_at.elapsed() < self.ttl);
        entries.insert(
            session_handle.to_string(),
            CachedClaims {
                claims,
                cached_at: Instant::now(),
            },
        );
    }

    /// Last-known claims for a handle, if still fresh.
    pub async fn get(&self, session_handle: &str) -> Option<Map<String, Value>> {
        let entries = self.entries.lock().await;
        let entry = entries.get(session_handle)?;
        if entry.cached_at.elapsed() < self.ttl {
            Some(entry.claims.clone())
        } else {
            None
        }
    }

    pub async fn invalidate(&self, session_handle: &str) {
        let mut entries = self.entries.lock().await;
        entries.remove(session_handle);
    }

    pub async fn clear(&self) {
        let mut entries = self.entries.lock().await;
        entries.clear();
    }

    #[cfg(test)]
    pub(crate) async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn claims(value: i64) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("n".to_string(), json!(value));
        map
    }

    #[tokio::test]
    async fn records_and_invalidates() {
        let registry = HandleRegistry::new(Duration::from_secs(60));
        registry.record("h1", claims(1)).await;
        assert_eq!(registry.get("h1").await, Some(claims(1)));

        registry.record("h1", claims(2)).await;
        assert_eq!(registry.get("h1").await, Some(claims(2)));

        registry.invalidate("h1").await;
        assert_eq!(registry.get("h1").await, None);
    }

    #[tokio::test]
    async fn expired_entries_are_not_returned_and_get_swept() {
        let registry = HandleRegistry::new(Duration::from_millis(10));
        registry.record("h1", claims(1)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(registry.get("h1").await, None);

        // The next insert sweeps the dead entry out of the map.
        registry.record("h2", claims(2)).await;
        assert_eq!(registry.len().await, 1);
    }
}
