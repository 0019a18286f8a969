pub mod market_data;
pub mod runtime;
pub mod stage;

pub use market_data::{MarketData, MarketLookups};
pub use runtime::{FeedDeps, Pipeline, PipelineDeps, PipelineWorker};
pub use stage::{RecomputeStage, StageStats};
