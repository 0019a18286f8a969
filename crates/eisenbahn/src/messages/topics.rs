//! Topic constants for bus routing.
//!
//! The topic of a message always equals the `type` tag of the event it
//! carries, so decoding and routing agree.

/// An upstream listing was created, updated or changed status.
pub const LISTING_CHANGED: &str = "listing.changed";

/// The enrichment artifact for a listing materially changed.
pub const LISTING_ENRICHED: &str = "listing.enriched";

/// The rent estimate for a listing materially changed.
pub const RENT_ESTIMATED: &str = "rent.estimated";

/// Periodic worker health heartbeat.
pub const WORKER_HEALTH: &str = "worker.health";

/// Every event type the bus accepts.
pub const KNOWN: &[&str] = &[LISTING_CHANGED, LISTING_ENRICHED, RENT_ESTIMATED, WORKER_HEALTH];
