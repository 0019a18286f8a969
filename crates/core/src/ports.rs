//! Collaborator interfaces consumed by the pipeline.
//!
//! Every method is an async boundary. Implementations live in
//! `rentflow-storage` (in-memory and file-backed) or are supplied by the
//! embedding process.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::artifact::DerivedArtifact;
use crate::change::UpsertOutcome;
use crate::error::{LookupError, StoreError};
use crate::listing::ListingSnapshot;

/// Shared TTL key-value store. No exclusive owner: every stage reads and
/// writes it.
#[async_trait]
pub trait CachePort: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError>;

    /// Store `value` for `ttl`. A zero TTL removes the key instead.
    async fn set(&self, key: &str, value: serde_json::Value, ttl: Duration) -> Result<(), StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Drop expired entries, returning how many went. Stores that expire
    /// keys on their own keep the default.
    async fn purge_expired(&self) -> Result<usize, StoreError> {
        Ok(0)
    }
}

/// Durable "last processed position" per source.
#[async_trait]
pub trait WatermarkStore: Send + Sync {
    async fn get_watermark(&self, source: &str) -> Result<Option<DateTime<Utc>>, StoreError>;

    async fn set_watermark(&self, source: &str, position: DateTime<Utc>) -> Result<(), StoreError>;
}

/// Read-only view of upstream entities. May be stale.
#[async_trait]
pub trait ReadPort: Send + Sync {
    async fn get_entity_snapshot(&self, id: &str) -> Result<Option<ListingSnapshot>, StoreError>;
}

/// Write side of the upstream entity store, used by the poller.
#[async_trait]
pub trait ListingRepository: Send + Sync {
    /// Store `snapshot` and report what changed relative to the stored copy.
    async fn upsert(&self, snapshot: ListingSnapshot) -> Result<UpsertOutcome, StoreError>;
}

/// Per-stage store of the current derived artifact for each entity.
#[async_trait]
pub trait ArtifactRepository<P>: Send + Sync
where
    P: Send + Sync + 'static,
{
    async fn get_by_entity_id(&self, entity_id: &str) -> Result<Option<DerivedArtifact<P>>, StoreError>;

    async fn upsert(&self, artifact: DerivedArtifact<P>) -> Result<(), StoreError>;
}

/// Cache key for a lookup query.
pub trait LookupKey {
    fn cache_key(&self) -> String;
}

impl LookupKey for String {
    fn cache_key(&self) -> String {
        self.clone()
    }
}

/// One external data source (priors, comps, geocoder, tax table, ...).
///
/// Sources are independently failable and independently cacheable.
#[async_trait]
pub trait LookupPort<Q, R>: Send + Sync
where
    Q: Send + Sync,
    R: Send,
{
    /// Short, stable name used in logs and cache keys.
    fn source(&self) -> &str;

    async fn fetch(&self, query: &Q) -> Result<R, LookupError>;
}

#[async_trait]
impl<Q, R, T> LookupPort<Q, R> for Arc<T>
where
    Q: Send + Sync,
    R: Send,
    T: LookupPort<Q, R> + ?Sized,
{
    fn source(&self) -> &str {
        (**self).source()
    }

    async fn fetch(&self, query: &Q) -> Result<R, LookupError> {
        (**self).fetch(query).await
    }
}
