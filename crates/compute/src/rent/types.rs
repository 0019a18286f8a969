use serde::{Deserialize, Serialize};

use rentflow_core::{ListingSnapshot, LookupKey};

use crate::differ::HasMedian;

/// Baseline rent percentiles for a market segment. Each may be missing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RentPriors {
    pub p25: Option<f64>,
    pub p50: Option<f64>,
    pub p75: Option<f64>,
}

impl RentPriors {
    pub fn is_empty(&self) -> bool {
        self.p25.is_none() && self.p50.is_none() && self.p75.is_none()
    }
}

/// One observed rental.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RentComp {
    pub rent: f64,
    #[serde(default)]
    pub distance_km: Option<f64>,
    #[serde(default)]
    pub days_old: Option<f64>,
}

impl RentComp {
    pub fn new(rent: f64) -> Self {
        Self {
            rent,
            distance_km: None,
            days_old: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimateMethod {
    Priors,
    Comps,
    /// Reserved for a fitted model; never produced.
    Model,
}

impl EstimateMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Priors => "priors",
            Self::Comps => "comps",
            Self::Model => "model",
        }
    }
}

/// Payload of the rent-estimate artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RentEstimate {
    pub method: EstimateMethod,
    pub p25: Option<f64>,
    pub p50: Option<f64>,
    pub p75: Option<f64>,
    /// Sample standard deviation of comp rents (n-1), absent below two comps.
    pub stdev: Option<f64>,
    pub comp_count: usize,
    /// Weight given to the comps when blending with priors.
    pub alpha: f64,
    /// The comps used, truncated for storage.
    pub comps: Vec<RentComp>,
}

impl HasMedian for RentEstimate {
    fn median(&self) -> Option<f64> {
        self.p50
    }
}

/// Market segment a listing's rent is looked up by.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RentQuery {
    pub zip: Option<String>,
    pub beds: Option<f32>,
    pub baths: Option<f32>,
    pub sqft: Option<u32>,
}

impl From<&ListingSnapshot> for RentQuery {
    fn from(listing: &ListingSnapshot) -> Self {
        Self {
            zip: listing.zip.clone(),
            beds: listing.beds,
            baths: listing.baths,
            sqft: listing.sqft,
        }
    }
}

impl LookupKey for RentQuery {
    fn cache_key(&self) -> String {
        fn part<T: ToString>(v: &Option<T>) -> String {
            v.as_ref().map(ToString::to_string).unwrap_or_else(|| "-".into())
        }
        format!(
            "{}|{}|{}|{}",
            part(&self.zip),
            part(&self.beds),
            part(&self.baths),
            part(&self.sqft)
        )
    }
}
