//! Domain event payloads.
//!
//! These are the inner payloads carried by [`Message`](crate::Message) envelopes.
//! On the wire each event is a JSON object tagged by `type`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use rentflow_core::{ChangeKind, DirtyField};

use crate::error::EisenbahnError;
use crate::messages::topics;

/// Every event that travels over the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PipelineEvent {
    #[serde(rename = "listing.changed")]
    ListingChanged(ListingChanged),
    #[serde(rename = "listing.enriched")]
    ListingEnriched(ListingEnriched),
    #[serde(rename = "rent.estimated")]
    RentEstimated(RentEstimated),
    #[serde(rename = "worker.health")]
    WorkerHealth(WorkerHealth),
}

impl PipelineEvent {
    /// Routing topic, identical to the wire `type` tag.
    pub fn topic(&self) -> &'static str {
        match self {
            Self::ListingChanged(_) => topics::LISTING_CHANGED,
            Self::ListingEnriched(_) => topics::LISTING_ENRICHED,
            Self::RentEstimated(_) => topics::RENT_ESTIMATED,
            Self::WorkerHealth(_) => topics::WORKER_HEALTH,
        }
    }

    /// The entity this event is about, if any.
    pub fn entity_id(&self) -> Option<&str> {
        match self {
            Self::ListingChanged(e) => Some(&e.id),
            Self::ListingEnriched(e) => Some(&e.id),
            Self::RentEstimated(e) => Some(&e.id),
            Self::WorkerHealth(_) => None,
        }
    }

    /// Decode a raw JSON event, rejecting unknown `type` tags explicitly.
    pub fn from_json(raw: &str) -> Result<Self, EisenbahnError> {
        let value: serde_json::Value = serde_json::from_str(raw)?;
        Self::from_value(value)
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self, EisenbahnError> {
        let kind = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| EisenbahnError::Malformed("missing string field 'type'".into()))?;
        if !topics::KNOWN.contains(&kind) {
            return Err(EisenbahnError::UnknownEvent(kind.to_string()));
        }
        serde_json::from_value(value).map_err(|e| EisenbahnError::Malformed(e.to_string()))
    }
}

/// Change notification for one upstream listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingChanged {
    pub id: String,
    /// Source timestamp of the change.
    pub updated_at: DateTime<Utc>,
    pub change: ChangeKind,
    #[serde(default)]
    pub dirty: Vec<DirtyField>,
}

/// Follow-on event: the enrichment artifact materially changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingEnriched {
    pub id: String,
    pub schema_version: u32,
    #[serde(default)]
    pub monthly_cost: Option<f64>,
    #[serde(default)]
    pub location_score: Option<u8>,
    /// Inputs that were unavailable when the artifact was computed.
    #[serde(default)]
    pub degraded: Vec<String>,
}

/// Follow-on event: the rent estimate materially changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RentEstimated {
    pub id: String,
    pub method: String,
    pub p25: Option<f64>,
    pub p50: Option<f64>,
    pub p75: Option<f64>,
    pub comp_count: usize,
}

/// Worker health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Periodic heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerHealth {
    pub worker_id: String,
    pub status: WorkerStatus,
    pub uptime_secs: u64,
}
