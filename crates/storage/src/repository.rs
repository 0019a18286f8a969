use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use rentflow_core::listing::compare_snapshots;
use rentflow_core::{
    ArtifactRepository, DerivedArtifact, ListingRepository, ListingSnapshot, ReadPort, StoreError,
    UpsertOutcome,
};

/// Current derived artifact per entity, overwritten in place.
pub struct MemoryArtifactRepository<P> {
    artifacts: RwLock<HashMap<String, DerivedArtifact<P>>>,
    writes: AtomicUsize,
}

impl<P> Default for MemoryArtifactRepository<P> {
    fn default() -> Self {
        Self {
            artifacts: RwLock::new(HashMap::new()),
            writes: AtomicUsize::new(0),
        }
    }
}

impl<P> MemoryArtifactRepository<P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of `upsert` calls since creation.
    pub fn upserts(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    pub async fn len(&self) -> usize {
        self.artifacts.read().await.len()
    }
}

#[async_trait]
impl<P> ArtifactRepository<P> for MemoryArtifactRepository<P>
where
    P: Clone + Send + Sync + 'static,
{
    async fn get_by_entity_id(&self, entity_id: &str) -> Result<Option<DerivedArtifact<P>>, StoreError> {
        Ok(self.artifacts.read().await.get(entity_id).cloned())
    }

    async fn upsert(&self, artifact: DerivedArtifact<P>) -> Result<(), StoreError> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.artifacts
            .write()
            .await
            .insert(artifact.entity_id.clone(), artifact);
        Ok(())
    }
}

/// Upstream listing store. Serves reads to the stages and writes to the poller.
#[derive(Default)]
pub struct MemoryListingRepository {
    listings: RwLock<HashMap<String, ListingSnapshot>>,
}

impl MemoryListingRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove a listing; subsequent reads see it as not found.
    pub async fn remove(&self, id: &str) -> Option<ListingSnapshot> {
        self.listings.write().await.remove(id)
    }

    pub async fn len(&self) -> usize {
        self.listings.read().await.len()
    }
}

#[async_trait]
impl ReadPort for MemoryListingRepository {
    async fn get_entity_snapshot(&self, id: &str) -> Result<Option<ListingSnapshot>, StoreError> {
        Ok(self.listings.read().await.get(id).cloned())
    }
}

#[async_trait]
impl ListingRepository for MemoryListingRepository {
    async fn upsert(&self, snapshot: ListingSnapshot) -> Result<UpsertOutcome, StoreError> {
        let mut listings = self.listings.write().await;
        let outcome = compare_snapshots(listings.get(&snapshot.id), &snapshot);
        debug!(
            id = %snapshot.id,
            change = %outcome.change,
            dirty = outcome.dirty.len(),
            "listing upserted"
        );
        listings.insert(snapshot.id.clone(), snapshot);
        Ok(outcome)
    }
}
