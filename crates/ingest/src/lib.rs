//! Pull-side ingestion: a watermark-gated poller over a paginated listing feed.

pub mod error;
pub mod normalize;
pub mod poll_loop;
pub mod poller;
pub mod source;

pub use error::{NormalizeError, PollError, SourceError};
pub use normalize::normalize_listing;
pub use poll_loop::PollLoop;
pub use poller::{PollSummary, Poller};
pub use source::{FileFeedSource, ListingSource, SourcePage};
