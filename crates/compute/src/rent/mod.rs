//! Rent-estimate stage: combine prior percentiles with weighted comps.

pub mod combine;
pub mod engine;
pub mod stats;
pub mod types;

pub use combine::combine;
pub use engine::RentEstimateEngine;
pub use types::{EstimateMethod, RentComp, RentEstimate, RentPriors, RentQuery};
