use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use rentflow_core::{CachePort, LookupError, LookupKey, LookupPort};

/// Read-through cache in front of a [`LookupPort`].
///
/// Successful results are stored under `lookup:<source>:<key>` for `ttl`.
/// Failures are never cached. A broken cache degrades to calling the
/// wrapped source directly.
pub struct CachedLookup<L> {
    inner: L,
    cache: Arc<dyn CachePort>,
    ttl: Duration,
}

impl<L> CachedLookup<L> {
    pub fn new(inner: L, cache: Arc<dyn CachePort>, ttl: Duration) -> Self {
        Self { inner, cache, ttl }
    }
}

#[async_trait]
impl<Q, R, L> LookupPort<Q, R> for CachedLookup<L>
where
    Q: LookupKey + Send + Sync,
    R: Serialize + DeserializeOwned + Send + 'static,
    L: LookupPort<Q, R>,
{
    fn source(&self) -> &str {
        self.inner.source()
    }

    async fn fetch(&self, query: &Q) -> Result<R, LookupError> {
        let key = format!("lookup:{}:{}", self.inner.source(), query.cache_key());

        match self.cache.get(&key).await {
            Ok(Some(raw)) => match serde_json::from_value::<R>(raw) {
                Ok(hit) => {
                    debug!(key = %key, "lookup cache hit");
                    return Ok(hit);
                }
                Err(e) => warn!(key = %key, error = %e, "discarding unreadable cached lookup"),
            },
            Ok(None) => {}
            Err(e) => warn!(key = %key, error = %e, "lookup cache read failed"),
        }

        let fresh = self.inner.fetch(query).await?;
        match serde_json::to_value(&fresh) {
            Ok(value) => {
                if let Err(e) = self.cache.set(&key, value, self.ttl).await {
                    warn!(key = %key, error = %e, "lookup cache write failed");
                }
            }
            Err(e) => warn!(key = %key, error = %e, "lookup result not cacheable"),
        }
        Ok(fresh)
    }
}
