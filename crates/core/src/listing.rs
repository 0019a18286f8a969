use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::change::{ChangeKind, DirtyField, UpsertOutcome};

/// Dirty tag for physical facts (beds, baths, sqft). Not part of the core
/// vocabulary, so it travels as [`DirtyField::Other`].
pub const DETAILS_TAG: &str = "details";

/// Normalized upstream listing, the read-side view every stage starts from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingSnapshot {
    pub id: String,
    /// Lower-cased status string (`active`, `pending`, `sold`, ...).
    pub status: String,
    pub price: Option<f64>,
    /// Monthly association / HOA fees.
    pub fees: Option<f64>,
    /// Annual property tax.
    pub tax: Option<f64>,
    pub address: String,
    pub zip: Option<String>,
    pub beds: Option<f32>,
    pub baths: Option<f32>,
    pub sqft: Option<u32>,
    /// Photo URLs.
    #[serde(default)]
    pub media: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

/// Field-by-field comparison between the stored and incoming snapshot.
///
/// A status change labels the outcome even when other fields changed too.
/// `updated_at` alone never makes an entity dirty.
pub fn compare_snapshots(previous: Option<&ListingSnapshot>, next: &ListingSnapshot) -> UpsertOutcome {
    let Some(prev) = previous else {
        return UpsertOutcome {
            change: ChangeKind::Create,
            dirty: BTreeSet::new(),
        };
    };

    let mut dirty = BTreeSet::new();
    if prev.price != next.price {
        dirty.insert(DirtyField::Price);
    }
    if prev.status != next.status {
        dirty.insert(DirtyField::Status);
    }
    if prev.fees != next.fees {
        dirty.insert(DirtyField::Fees);
    }
    if prev.tax != next.tax {
        dirty.insert(DirtyField::Tax);
    }
    if prev.media != next.media {
        dirty.insert(DirtyField::Media);
    }
    if prev.address != next.address || prev.zip != next.zip {
        dirty.insert(DirtyField::Address);
    }
    if prev.beds != next.beds || prev.baths != next.baths || prev.sqft != next.sqft {
        dirty.insert(DirtyField::Other(DETAILS_TAG.to_string()));
    }

    let change = if dirty.is_empty() {
        ChangeKind::Noop
    } else if dirty.contains(&DirtyField::Status) {
        ChangeKind::StatusChange
    } else {
        ChangeKind::Update
    };

    UpsertOutcome { change, dirty }
}
