pub mod artifact;
pub mod backoff;
pub mod change;
pub mod clock;
pub mod config;
pub mod error;
pub mod listing;
pub mod ports;

pub use artifact::DerivedArtifact;
pub use backoff::Backoff;
pub use change::{ChangeKind, DirtyField, UpsertOutcome};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::RentflowConfig;
pub use error::*;
pub use listing::ListingSnapshot;
pub use ports::*;
