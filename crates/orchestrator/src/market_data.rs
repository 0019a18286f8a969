//! File-backed market data for the lookup ports.
//!
//! One JSON document holds every reference table the stages consult:
//!
//! ```json
//! {
//!   "priors":          { "94110:2": {"p25": 3100, "p50": 3400, "p75": 3800}, "94110": {...} },
//!   "comps":           { "94110:2": [{"rent": 3350, "distance_km": 0.4, "days_old": 12}] },
//!   "tax_rates":       { "94110": 0.0118 },
//!   "location_scores": { "94110": 91 },
//!   "geocodes":        { "12 Elm St": {"lat": 37.75, "lon": -122.41} }
//! }
//! ```
//!
//! Rent tables are keyed `zip:beds` with a plain `zip` fallback. Geocode
//! keys are matched after address normalization.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use rentflow_compute::enrich::normalize_address;
use rentflow_compute::{AddressQuery, GeoPoint, RentComp, RentPriors, RentQuery, ZipQuery};
use rentflow_core::{LookupError, LookupPort, StoreError};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarketData {
    #[serde(default)]
    pub priors: HashMap<String, RentPriors>,
    #[serde(default)]
    pub comps: HashMap<String, Vec<RentComp>>,
    #[serde(default)]
    pub tax_rates: HashMap<String, f64>,
    #[serde(default)]
    pub location_scores: HashMap<String, u8>,
    #[serde(default)]
    pub geocodes: HashMap<String, GeoPoint>,
}

/// The five lookup ports backed by one [`MarketData`] document.
pub struct MarketLookups {
    pub priors: Arc<dyn LookupPort<RentQuery, Option<RentPriors>>>,
    pub comps: Arc<dyn LookupPort<RentQuery, Vec<RentComp>>>,
    pub geocoder: Arc<dyn LookupPort<AddressQuery, Option<GeoPoint>>>,
    pub tax_rates: Arc<dyn LookupPort<ZipQuery, Option<f64>>>,
    pub location_scores: Arc<dyn LookupPort<ZipQuery, Option<u8>>>,
}

impl MarketData {
    pub fn from_json(raw: &str) -> Result<Self, StoreError> {
        let mut data: Self = serde_json::from_str(raw)?;
        data.geocodes = data
            .geocodes
            .into_iter()
            .map(|(address, point)| (normalize_address(&address), point))
            .collect();
        Ok(data)
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path).await?;
        let data = Self::from_json(&raw)?;
        info!(
            path = %path.display(),
            priors = data.priors.len(),
            comps = data.comps.len(),
            tax_rates = data.tax_rates.len(),
            location_scores = data.location_scores.len(),
            geocodes = data.geocodes.len(),
            "market data loaded"
        );
        Ok(data)
    }

    pub fn lookups(self) -> MarketLookups {
        let data = Arc::new(self);
        let table = |source: &'static str| {
            Arc::new(MarketTable {
                source,
                data: data.clone(),
            })
        };
        MarketLookups {
            priors: table("market-priors"),
            comps: table("market-comps"),
            geocoder: table("market-geocoder"),
            tax_rates: table("market-tax-rates"),
            location_scores: table("market-location-scores"),
        }
    }

    /// `zip:beds` first, then `zip`.
    fn rent_keys(query: &RentQuery) -> Vec<String> {
        let Some(zip) = query.zip.as_deref() else {
            return Vec::new();
        };
        let mut keys = Vec::with_capacity(2);
        if let Some(beds) = query.beds {
            keys.push(format!("{zip}:{}", beds.round() as i64));
        }
        keys.push(zip.to_string());
        keys
    }
}

/// One named view over the shared document.
struct MarketTable {
    source: &'static str,
    data: Arc<MarketData>,
}

#[async_trait]
impl LookupPort<RentQuery, Option<RentPriors>> for MarketTable {
    fn source(&self) -> &str {
        self.source
    }

    async fn fetch(&self, query: &RentQuery) -> Result<Option<RentPriors>, LookupError> {
        Ok(MarketData::rent_keys(query)
            .iter()
            .find_map(|k| self.data.priors.get(k))
            .copied())
    }
}

#[async_trait]
impl LookupPort<RentQuery, Vec<RentComp>> for MarketTable {
    fn source(&self) -> &str {
        self.source
    }

    async fn fetch(&self, query: &RentQuery) -> Result<Vec<RentComp>, LookupError> {
        Ok(MarketData::rent_keys(query)
            .iter()
            .find_map(|k| self.data.comps.get(k))
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl LookupPort<AddressQuery, Option<GeoPoint>> for MarketTable {
    fn source(&self) -> &str {
        self.source
    }

    async fn fetch(&self, query: &AddressQuery) -> Result<Option<GeoPoint>, LookupError> {
        Ok(self
            .data
            .geocodes
            .get(&normalize_address(&query.address))
            .copied())
    }
}

#[async_trait]
impl LookupPort<ZipQuery, Option<f64>> for MarketTable {
    fn source(&self) -> &str {
        self.source
    }

    async fn fetch(&self, query: &ZipQuery) -> Result<Option<f64>, LookupError> {
        Ok(self.data.tax_rates.get(&query.0).copied())
    }
}

#[async_trait]
impl LookupPort<ZipQuery, Option<u8>> for MarketTable {
    fn source(&self) -> &str {
        self.source
    }

    async fn fetch(&self, query: &ZipQuery) -> Result<Option<u8>, LookupError> {
        Ok(self.data.location_scores.get(&query.0).copied())
    }
}
