//! Reference implementations of the shared stores.
//!
//! Everything here is in-process: an LRU-bounded TTL cache, watermark stores
//! (memory and JSON file) and memory-backed repositories. Production
//! deployments can swap any of them for an external backend behind the same
//! `rentflow_core` port traits.

pub mod cache;
pub mod repository;
pub mod watermark;

pub use cache::TtlCache;
pub use repository::{MemoryArtifactRepository, MemoryListingRepository};
pub use watermark::{FileWatermarkStore, MemoryWatermarkStore};
