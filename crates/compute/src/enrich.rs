//! Enrichment stage: attach location and carrying-cost facts to a listing.
//!
//! Every lookup is optional. A failed or empty lookup leaves its field unset
//! and names the source in `degraded`; it never fails the entity.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use rentflow_core::{DerivedArtifact, ListingSnapshot, LookupError, LookupKey, LookupPort, ReadPort, SharedClock};
use rentflow_eisenbahn::events::ListingEnriched;
use rentflow_eisenbahn::PipelineEvent;

use crate::engine::{input_fingerprint, ArtifactWriter, RecomputeEngine, RecomputeOutcome};
use crate::error::ComputeError;

pub const ENRICHMENT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

/// Geocoder query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressQuery {
    pub address: String,
    pub zip: Option<String>,
}

impl LookupKey for AddressQuery {
    fn cache_key(&self) -> String {
        format!("{}|{}", self.address, self.zip.as_deref().unwrap_or("-"))
    }
}

/// Query keyed by postal code (tax rates, location scores).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZipQuery(pub String);

impl LookupKey for ZipQuery {
    fn cache_key(&self) -> String {
        self.0.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedListing {
    /// Upper-cased, whitespace-collapsed street address.
    pub address: String,
    pub geo: Option<GeoPoint>,
    pub monthly_tax: Option<f64>,
    pub monthly_fees: Option<f64>,
    pub price_per_sqft: Option<f64>,
    /// 0..=100
    pub location_score: Option<u8>,
    pub photo_count: usize,
    /// Sources that failed or had no answer, sorted.
    pub degraded: Vec<String>,
}

impl EnrichedListing {
    pub fn monthly_cost(&self) -> Option<f64> {
        match (self.monthly_tax, self.monthly_fees) {
            (None, None) => None,
            (tax, fees) => Some(round_cents(tax.unwrap_or(0.0) + fees.unwrap_or(0.0))),
        }
    }
}

pub type GeocodeLookup = Arc<dyn LookupPort<AddressQuery, Option<GeoPoint>>>;
pub type TaxRateLookup = Arc<dyn LookupPort<ZipQuery, Option<f64>>>;
pub type LocationScoreLookup = Arc<dyn LookupPort<ZipQuery, Option<u8>>>;

pub struct EnrichmentEngine {
    listings: Arc<dyn ReadPort>,
    geocoder: GeocodeLookup,
    tax_rates: TaxRateLookup,
    location_scores: LocationScoreLookup,
    writer: ArtifactWriter<EnrichedListing>,
    clock: SharedClock,
}

impl EnrichmentEngine {
    pub fn new(
        listings: Arc<dyn ReadPort>,
        geocoder: GeocodeLookup,
        tax_rates: TaxRateLookup,
        location_scores: LocationScoreLookup,
        writer: ArtifactWriter<EnrichedListing>,
        clock: SharedClock,
    ) -> Self {
        Self {
            listings,
            geocoder,
            tax_rates,
            location_scores,
            writer,
            clock,
        }
    }

    async fn zip_lookup<R>(
        port: &dyn LookupPort<ZipQuery, Option<R>>,
        zip: Option<&str>,
    ) -> Result<Option<R>, LookupError>
    where
        R: Send,
    {
        match zip {
            Some(zip) => port.fetch(&ZipQuery(zip.to_string())).await,
            None => Ok(None),
        }
    }
}

/// Collapse whitespace and upper-case.
pub fn normalize_address(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase()
}

fn round_cents(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Unwrap a lookup result, recording the source as degraded when it yields nothing.
fn settle<T>(
    result: Result<Option<T>, LookupError>,
    source: &str,
    entity_id: &str,
    degraded: &mut BTreeSet<String>,
) -> Option<T> {
    match result {
        Ok(Some(v)) => Some(v),
        Ok(None) => {
            degraded.insert(source.to_string());
            None
        }
        Err(e) => {
            warn!(entity_id, source, error = %e, "lookup failed, enrichment degraded");
            degraded.insert(source.to_string());
            None
        }
    }
}

fn enrich(
    listing: &ListingSnapshot,
    geo: Option<GeoPoint>,
    tax_rate: Option<f64>,
    location_score: Option<u8>,
    degraded: BTreeSet<String>,
) -> EnrichedListing {
    let monthly_tax = match (listing.tax, listing.price, tax_rate) {
        (Some(annual), _, _) => Some(round_cents(annual / 12.0)),
        (None, Some(price), Some(rate)) => Some(round_cents(price * rate / 12.0)),
        _ => None,
    };
    let price_per_sqft = match (listing.price, listing.sqft) {
        (Some(price), Some(sqft)) if sqft > 0 => Some(round_cents(price / sqft as f64)),
        _ => None,
    };
    EnrichedListing {
        address: normalize_address(&listing.address),
        geo,
        monthly_tax,
        monthly_fees: listing.fees.map(round_cents),
        price_per_sqft,
        location_score: location_score.map(|s| s.min(100)),
        photo_count: listing.media.len(),
        degraded: degraded.into_iter().collect(),
    }
}

#[async_trait]
impl RecomputeEngine for EnrichmentEngine {
    type Payload = EnrichedListing;

    fn name(&self) -> &str {
        "enrichment"
    }

    async fn recompute(&self, entity_id: &str) -> Result<RecomputeOutcome<EnrichedListing>, ComputeError> {
        let Some(listing) = self.listings.get_entity_snapshot(entity_id).await? else {
            info!(entity_id, "listing gone upstream, skipping enrichment");
            return Ok(RecomputeOutcome::not_found());
        };

        let address = AddressQuery {
            address: normalize_address(&listing.address),
            zip: listing.zip.clone(),
        };
        // The rate is only needed when the listing carries no tax figure.
        let rate_zip = listing.tax.is_none().then_some(listing.zip.as_deref()).flatten();
        let (geo, tax_rate, score) = tokio::join!(
            self.geocoder.fetch(&address),
            Self::zip_lookup(self.tax_rates.as_ref(), rate_zip),
            Self::zip_lookup(self.location_scores.as_ref(), listing.zip.as_deref()),
        );

        let mut degraded = BTreeSet::new();
        let geo = settle(geo, self.geocoder.source(), entity_id, &mut degraded);
        let tax_rate = if listing.tax.is_some() {
            None
        } else {
            settle(tax_rate, self.tax_rates.source(), entity_id, &mut degraded)
        };
        let score = settle(score, self.location_scores.source(), entity_id, &mut degraded);

        let payload = enrich(&listing, geo, tax_rate, score, degraded);
        debug!(entity_id, degraded = payload.degraded.len(), "listing enriched");

        let inputs = (
            &address,
            listing.price,
            listing.tax,
            listing.fees,
            listing.sqft,
            &listing.media,
            geo,
            tax_rate,
            score,
        );
        let artifact = DerivedArtifact {
            entity_id: entity_id.to_string(),
            input_version: input_fingerprint(&inputs)?,
            schema_version: ENRICHMENT_SCHEMA_VERSION,
            computed_at: self.clock.now(),
            payload,
        };
        self.writer.persist_if_changed(artifact).await
    }

    fn follow_on(&self, artifact: &DerivedArtifact<EnrichedListing>) -> PipelineEvent {
        let enriched = &artifact.payload;
        PipelineEvent::ListingEnriched(ListingEnriched {
            id: artifact.entity_id.clone(),
            schema_version: artifact.schema_version,
            monthly_cost: enriched.monthly_cost(),
            location_score: enriched.location_score,
            degraded: enriched.degraded.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::differ::StructuralDiffer;
    use chrono::{TimeZone, Utc};
    use rentflow_core::{ListingRepository, ManualClock};
    use rentflow_storage::{MemoryArtifactRepository, MemoryListingRepository};

    struct Answer<R> {
        name: &'static str,
        value: Result<R, LookupError>,
    }

    #[async_trait]
    impl<Q: Send + Sync, R: Clone + Send + Sync> LookupPort<Q, R> for Answer<R> {
        fn source(&self) -> &str {
            self.name
        }

        async fn fetch(&self, _query: &Q) -> Result<R, LookupError> {
            self.value.clone()
        }
    }

    fn listing(media: usize) -> ListingSnapshot {
        ListingSnapshot {
            id: "L1".into(),
            status: "active".into(),
            price: Some(600_000.0),
            fees: Some(350.0),
            tax: None,
            address: "  12   Elm st ".into(),
            zip: Some("94110".into()),
            beds: Some(2.0),
            baths: Some(1.0),
            sqft: Some(1_000),
            media: (0..media).map(|i| format!("https://img/{i}.jpg")).collect(),
            updated_at: Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap(),
        }
    }

    struct Harness {
        engine: EnrichmentEngine,
        listings: Arc<MemoryListingRepository>,
        artifacts: Arc<MemoryArtifactRepository<EnrichedListing>>,
    }

    fn harness(geo: Result<Option<GeoPoint>, LookupError>) -> Harness {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
        ));
        let listings = Arc::new(MemoryListingRepository::new());
        let artifacts = Arc::new(MemoryArtifactRepository::new());
        let writer = ArtifactWriter::new(artifacts.clone(), Arc::new(StructuralDiffer::default()));
        let engine = EnrichmentEngine::new(
            listings.clone(),
            Arc::new(Answer { name: "geocoder", value: geo }),
            Arc::new(Answer { name: "tax-rates", value: Ok(Some(0.012_f64)) }),
            Arc::new(Answer { name: "location-scores", value: Ok(Some(88u8)) }),
            writer,
            clock,
        );
        Harness {
            engine,
            listings,
            artifacts,
        }
    }

    #[tokio::test]
    async fn enriches_with_all_inputs() {
        let h = harness(Ok(Some(GeoPoint { lat: 37.75, lon: -122.41 })));
        h.listings.upsert(listing(3)).await.unwrap();

        let outcome = h.engine.recompute("L1").await.unwrap();
        assert!(outcome.changed);
        let enriched = outcome.artifact.unwrap().payload;
        assert_eq!(enriched.address, "12 ELM ST");
        assert_eq!(enriched.monthly_tax, Some(600.0));
        assert_eq!(enriched.monthly_fees, Some(350.0));
        assert_eq!(enriched.price_per_sqft, Some(600.0));
        assert_eq!(enriched.location_score, Some(88));
        assert_eq!(enriched.photo_count, 3);
        assert!(enriched.degraded.is_empty());
        assert_eq!(enriched.monthly_cost(), Some(950.0));
    }

    #[tokio::test]
    async fn geocoder_outage_degrades_without_failing() {
        let h = harness(Err(LookupError::unavailable("geocoder", "502")));
        h.listings.upsert(listing(0)).await.unwrap();

        let enriched = h.engine.recompute("L1").await.unwrap().artifact.unwrap().payload;
        assert_eq!(enriched.geo, None);
        assert_eq!(enriched.degraded, vec!["geocoder".to_string()]);
        assert_eq!(enriched.location_score, Some(88));
    }

    #[tokio::test]
    async fn listing_tax_wins_over_rate_lookup() {
        let h = harness(Ok(None));
        let mut l = listing(0);
        l.tax = Some(7_200.0);
        h.listings.upsert(l).await.unwrap();

        let enriched = h.engine.recompute("L1").await.unwrap().artifact.unwrap().payload;
        assert_eq!(enriched.monthly_tax, Some(600.0));
        assert_eq!(enriched.degraded, vec!["geocoder".to_string()]);
    }

    #[tokio::test]
    async fn media_change_is_material_and_rerun_is_not() {
        let h = harness(Ok(None));
        h.listings.upsert(listing(1)).await.unwrap();
        assert!(h.engine.recompute("L1").await.unwrap().changed);
        assert!(!h.engine.recompute("L1").await.unwrap().changed);

        h.listings.upsert(listing(2)).await.unwrap();
        let outcome = h.engine.recompute("L1").await.unwrap();
        assert!(outcome.changed);
        assert_eq!(h.artifacts.upserts(), 2);

        let PipelineEvent::ListingEnriched(event) = h.engine.follow_on(outcome.artifact.as_ref().unwrap()) else {
            panic!("expected listing.enriched");
        };
        assert_eq!(event.id, "L1");
        assert_eq!(event.schema_version, ENRICHMENT_SCHEMA_VERSION);
    }

    #[test]
    fn address_normalization() {
        assert_eq!(normalize_address(" 1  Main\tSt  Apt 4 "), "1 MAIN ST APT 4");
    }
}
