use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lru::LruCache;
use tracing::debug;

use rentflow_core::{CachePort, SharedClock, StoreError};

/// Cached value with its absolute expiry.
struct CacheEntry {
    value: serde_json::Value,
    expires_at: DateTime<Utc>,
}

/// In-memory TTL cache, bounded by an LRU.
///
/// Expiry is evaluated lazily against the injected clock: an entry is gone
/// once `now >= expires_at`. When the LRU is full the least recently used
/// key is dropped regardless of its TTL.
pub struct TtlCache {
    entries: Mutex<LruCache<String, CacheEntry>>,
    clock: SharedClock,
}

impl TtlCache {
    pub fn new(capacity: usize, clock: SharedClock) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            clock,
        }
    }

    /// Number of stored entries, expired ones included until purged.
    pub fn len(&self) -> usize {
        self.entries.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, LruCache<String, CacheEntry>>, StoreError> {
        self.entries
            .lock()
            .map_err(|e| StoreError::LockPoisoned(e.to_string()))
    }
}

#[async_trait]
impl CachePort for TtlCache {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
        let now = self.clock.now();
        let mut entries = self.lock()?;
        let expired = match entries.get(key) {
            None => return Ok(None),
            Some(entry) if now < entry.expires_at => return Ok(Some(entry.value.clone())),
            Some(_) => true,
        };
        if expired {
            entries.pop(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: serde_json::Value, ttl: Duration) -> Result<(), StoreError> {
        let mut entries = self.lock()?;
        if ttl.is_zero() {
            entries.pop(key);
            return Ok(());
        }
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| StoreError::Unavailable(format!("ttl out of range: {e}")))?;
        let expires_at = self.clock.now() + ttl;
        entries.put(key.to_string(), CacheEntry { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.lock()?.pop(key);
        Ok(())
    }

    async fn purge_expired(&self) -> Result<usize, StoreError> {
        let now = self.clock.now();
        let mut entries = self.lock()?;
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, e)| now >= e.expires_at)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            entries.pop(key);
        }
        if !expired.is_empty() {
            debug!(removed = expired.len(), "purged expired cache entries");
        }
        Ok(expired.len())
    }
}
