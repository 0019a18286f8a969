use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Name of the volatile timestamp field, stripped before structural diffs.
pub const COMPUTED_AT_FIELD: &str = "computed_at";

/// The current derived fact for one entity. Overwritten in place, no history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedArtifact<P> {
    pub entity_id: String,
    /// Fingerprint of the inputs the payload was computed from.
    pub input_version: String,
    pub schema_version: u32,
    /// Volatile: never part of equality.
    pub computed_at: DateTime<Utc>,
    pub payload: P,
}
