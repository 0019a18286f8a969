pub mod debounce;
pub mod differ;
pub mod engine;
pub mod enrich;
pub mod error;
pub mod lookup;
pub mod rent;

pub use debounce::{DebounceDecision, DebouncePolicy, DebounceReason, DebounceState, Debouncer};
pub use differ::{Differ, HasMedian, StructuralDiffer, ToleranceDiffer};
pub use engine::{input_fingerprint, ArtifactWriter, RecomputeEngine, RecomputeOutcome};
pub use enrich::{AddressQuery, EnrichedListing, EnrichmentEngine, GeoPoint, ZipQuery};
pub use error::ComputeError;
pub use lookup::CachedLookup;
pub use rent::{
    EstimateMethod, RentComp, RentEstimate, RentEstimateEngine, RentPriors, RentQuery,
};
