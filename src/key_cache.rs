//! TTL'd cache of the authority's signing keys.
//!
//! Readers take an `Arc` snapshot under a read lock and never block on a
//! refresh in flight; the swap to new key data is atomic. Concurrent forced
//! refreshes coalesce into one outbound call: whoever loses the race on the
//! refresh guard re-checks the cache generation and reuses the winner's
//! fetch.

use crate::authority::AuthorityClient;
use crate::error::SessionError;
use crate::keys::SigningKeySet;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

struct CachedKeys {
    set: Arc<SigningKeySet>,
    fetched_at: Instant,
}

#[derive(Default)]
struct CacheSlot {
    entry: Option<CachedKeys>,
    generation: u64,
}

pub struct KeyCache {
    authority: AuthorityClient,
    ttl: Duration,
    slot: RwLock<CacheSlot>,
    refresh_guard: tokio::sync::Mutex<()>,
}

impl KeyCache {
    #[must_use]
    pub fn new(authority: AuthorityClient, ttl: Duration) -> Self {
        Self {
            authority,
            ttl,
            slot: RwLock::new(CacheSlot::default()),
            refresh_guard: tokio::sync::Mutex::new(()),
        }
    }

    /// Current key set. On a cache miss, a stale entry, or `force_refresh`,
    /// the set is re-fetched from the authority; when a non-forced refresh
    /// fails and a stale set exists, the stale set is used optimistically.
    ///
    /// # Errors
    ///
    /// Propagates `AuthorityUnreachable`/`AuthorityProtocol` from the fetch
    /// when no cached set can stand in.
    pub async fn get(&self, force_refresh: bool) -> Result<Arc<SigningKeySet>, SessionError> {
        if !force_refresh {
            if let Some(set) = self.fresh_snapshot() {
                return Ok(set);
            }
        }

        match self.refresh().await {
            Ok(set) => Ok(set),
            Err(err) if !force_refresh => match self.any_snapshot() {
                Some(stale) => {
                    warn!("key refresh failed, using stale key set: {err}");
                    Ok(stale)
                }
                None => Err(err),
            },
            Err(err) => Err(err),
        }
    }

    fn fresh_snapshot(&self) -> Option<Arc<SigningKeySet>> {
        let slot = self.slot.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        let entry = slot.entry.as_ref()?;
        if entry.fetched_at.elapsed() <= self.ttl {
            Some(Arc::clone(&entry.set))
        } else {
            None
        }
    }

    fn any_snapshot(&self) -> Option<Arc<SigningKeySet>> {
        let slot = self.slot.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        slot.entry.as_ref().map(|entry| Arc::clone(&entry.set))
    }

    fn generation(&self) -> u64 {
        self.slot
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .generation
    }

    async fn refresh(&self) -> Result<Arc<SigningKeySet>, SessionError> {
        let generation_before = self.generation();
        let _guard = self.refresh_guard.lock().await;

        // Someone else refreshed while we waited on the guard; their fetch
        // counts as ours.
        if self.generation() != generation_before {
            if let Some(set) = self.any_snapshot() {
                return Ok(set);
            }
        }

        let keys = self.authority.signing_keys().await?;
        debug!("refreshed signing key set: {} keys", keys.len());
        let set = Arc::new(SigningKeySet::new(keys));

        let mut slot = self.slot.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        slot.entry = Some(CachedKeys {
            set: Arc::clone(&set),
            fetched_at: Instant::now(),
        });
        slot.generation += 1;
        Ok(set)
    }
}
