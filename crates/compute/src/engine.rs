use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use rentflow_core::{ArtifactRepository, DerivedArtifact};
use rentflow_eisenbahn::PipelineEvent;

use crate::differ::Differ;
use crate::error::ComputeError;

/// Result of one recompute.
#[derive(Debug, Clone, PartialEq)]
pub struct RecomputeOutcome<P> {
    /// A new artifact was persisted and a follow-on event is due.
    pub changed: bool,
    /// The current artifact after this run, if any exists.
    pub artifact: Option<DerivedArtifact<P>>,
}

impl<P> RecomputeOutcome<P> {
    /// Entity is gone upstream; nothing to do.
    pub fn not_found() -> Self {
        Self {
            changed: false,
            artifact: None,
        }
    }
}

/// One derived-artifact stage: gather inputs, compute, diff, persist.
///
/// Implementations must be idempotent: running twice on unchanged inputs
/// reports `changed = false` the second time.
#[async_trait]
pub trait RecomputeEngine: Send + Sync {
    type Payload: Clone + Send + Sync + 'static;

    /// Stage name, used for logging and debounce namespacing.
    fn name(&self) -> &str;

    async fn recompute(&self, entity_id: &str) -> Result<RecomputeOutcome<Self::Payload>, ComputeError>;

    /// Event announcing a materially changed artifact.
    fn follow_on(&self, artifact: &DerivedArtifact<Self::Payload>) -> PipelineEvent;
}

/// Diff-then-upsert against a stage's own artifact repository.
pub struct ArtifactWriter<P> {
    repo: Arc<dyn ArtifactRepository<P>>,
    differ: Arc<dyn Differ<P>>,
}

impl<P> ArtifactWriter<P>
where
    P: Clone + Send + Sync + 'static,
{
    pub fn new(repo: Arc<dyn ArtifactRepository<P>>, differ: Arc<dyn Differ<P>>) -> Self {
        Self { repo, differ }
    }

    /// Persist `next` only if it differs from the stored artifact.
    pub async fn persist_if_changed(
        &self,
        next: DerivedArtifact<P>,
    ) -> Result<RecomputeOutcome<P>, ComputeError> {
        let previous = self.repo.get_by_entity_id(&next.entity_id).await?;
        if !self.differ.has_changed(previous.as_ref(), &next) {
            debug!(entity_id = %next.entity_id, "artifact unchanged");
            return Ok(RecomputeOutcome {
                changed: false,
                artifact: previous,
            });
        }
        self.repo.upsert(next.clone()).await?;
        debug!(entity_id = %next.entity_id, input_version = %next.input_version, "artifact persisted");
        Ok(RecomputeOutcome {
            changed: true,
            artifact: Some(next),
        })
    }
}

/// SHA-256 hex digest of an engine's inputs in their JSON form.
pub fn input_fingerprint<T: Serialize>(inputs: &T) -> Result<String, ComputeError> {
    let encoded = serde_json::to_string(inputs)?;
    let digest = Sha256::digest(encoded.as_bytes());
    Ok(format!("{digest:x}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::differ::StructuralDiffer;
    use chrono::Utc;
    use rentflow_storage::MemoryArtifactRepository;
    use serde_json::json;

    fn artifact(payload: serde_json::Value) -> DerivedArtifact<serde_json::Value> {
        DerivedArtifact {
            entity_id: "L1".into(),
            input_version: input_fingerprint(&payload).unwrap(),
            schema_version: 1,
            computed_at: Utc::now(),
            payload,
        }
    }

    #[tokio::test]
    async fn writer_persists_only_on_change() {
        let repo = Arc::new(MemoryArtifactRepository::new());
        let writer = ArtifactWriter::new(repo.clone(), Arc::new(StructuralDiffer::default()));

        let first = writer.persist_if_changed(artifact(json!({"a": 1}))).await.unwrap();
        assert!(first.changed);

        let again = writer.persist_if_changed(artifact(json!({"a": 1}))).await.unwrap();
        assert!(!again.changed);
        assert_eq!(again.artifact.unwrap().payload, json!({"a": 1}));
        assert_eq!(repo.upserts(), 1);

        let moved = writer.persist_if_changed(artifact(json!({"a": 2}))).await.unwrap();
        assert!(moved.changed);
        assert_eq!(repo.upserts(), 2);
    }

    #[test]
    fn fingerprint_tracks_inputs() {
        let a = input_fingerprint(&json!({"p50": 3000})).unwrap();
        let b = input_fingerprint(&json!({"p50": 3000})).unwrap();
        let c = input_fingerprint(&json!({"p50": 3001})).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn fingerprint_is_a_fixed_digest() {
        // Persisted as input_version, so it must not drift between builds.
        assert_eq!(
            input_fingerprint(&json!({"p50": 3000})).unwrap(),
            "1e1d35bd3b920cf96fd5be9cc66aa01c0a082577717f113c3726baab19a63df6"
        );
    }
}
