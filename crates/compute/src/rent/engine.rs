use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use rentflow_core::{DerivedArtifact, LookupPort, ReadPort, SharedClock};
use rentflow_eisenbahn::events::RentEstimated;
use rentflow_eisenbahn::PipelineEvent;

use super::combine::combine;
use super::types::{RentComp, RentEstimate, RentPriors, RentQuery};
use crate::engine::{input_fingerprint, ArtifactWriter, RecomputeEngine, RecomputeOutcome};
use crate::error::ComputeError;

pub const RENT_SCHEMA_VERSION: u32 = 1;

pub type PriorsLookup = Arc<dyn LookupPort<RentQuery, Option<RentPriors>>>;
pub type CompsLookup = Arc<dyn LookupPort<RentQuery, Vec<RentComp>>>;

pub struct RentEstimateEngine {
    listings: Arc<dyn ReadPort>,
    priors: PriorsLookup,
    comps: CompsLookup,
    writer: ArtifactWriter<RentEstimate>,
    clock: SharedClock,
    max_stored_comps: usize,
}

impl RentEstimateEngine {
    pub fn new(
        listings: Arc<dyn ReadPort>,
        priors: PriorsLookup,
        comps: CompsLookup,
        writer: ArtifactWriter<RentEstimate>,
        clock: SharedClock,
        max_stored_comps: usize,
    ) -> Self {
        Self {
            listings,
            priors,
            comps,
            writer,
            clock,
            max_stored_comps,
        }
    }
}

#[async_trait]
impl RecomputeEngine for RentEstimateEngine {
    type Payload = RentEstimate;

    fn name(&self) -> &str {
        "rent-estimate"
    }

    async fn recompute(&self, entity_id: &str) -> Result<RecomputeOutcome<RentEstimate>, ComputeError> {
        let Some(listing) = self.listings.get_entity_snapshot(entity_id).await? else {
            info!(entity_id, "listing gone upstream, skipping rent estimate");
            return Ok(RecomputeOutcome::not_found());
        };
        let query = RentQuery::from(&listing);

        let (priors, comps) = tokio::join!(self.priors.fetch(&query), self.comps.fetch(&query));
        let priors = priors.unwrap_or_else(|e| {
            warn!(entity_id, source = self.priors.source(), error = %e, "priors unavailable");
            None
        });
        let comps = comps.unwrap_or_else(|e| {
            warn!(entity_id, source = self.comps.source(), error = %e, "comps unavailable");
            Vec::new()
        });

        let estimate = combine(priors.as_ref(), &comps, self.max_stored_comps)
            .ok_or_else(|| ComputeError::NoEstimate(entity_id.to_string()))?;
        debug!(
            entity_id,
            method = estimate.method.as_str(),
            comps = estimate.comp_count,
            p50 = ?estimate.p50,
            "rent estimate computed"
        );

        let artifact = DerivedArtifact {
            entity_id: entity_id.to_string(),
            input_version: input_fingerprint(&(&query, &priors, &comps))?,
            schema_version: RENT_SCHEMA_VERSION,
            computed_at: self.clock.now(),
            payload: estimate,
        };
        self.writer.persist_if_changed(artifact).await
    }

    fn follow_on(&self, artifact: &DerivedArtifact<RentEstimate>) -> PipelineEvent {
        let estimate = &artifact.payload;
        PipelineEvent::RentEstimated(RentEstimated {
            id: artifact.entity_id.clone(),
            method: estimate.method.as_str().to_string(),
            p25: estimate.p25,
            p50: estimate.p50,
            p75: estimate.p75,
            comp_count: estimate.comp_count,
        })
    }
}
