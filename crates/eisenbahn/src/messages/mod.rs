//! Domain-specific message types for the eisenbahn messaging layer.
//!
//! This module provides:
//! - **Event payloads** (`events`): the tagged [`PipelineEvent`] union and its variants
//! - **Topic constants** (`topics`): canonical topic strings for routing

pub mod events;
pub mod topics;

pub use events::*;
