//! rentflow-worker: polls a listing feed and keeps enrichment and rent
//! estimates current.
//!
//! Flow: feed → poller → `listing.changed` → enrichment / rent stages →
//! `listing.enriched` / `rent.estimated`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::Notify;
use tracing::{info, warn};

use rentflow_compute::{EnrichedListing, RentEstimate};
use rentflow_core::config::load_dotenv;
use rentflow_core::{RentflowConfig, SharedClock, SystemClock, WatermarkStore};
use rentflow_eisenbahn::WorkerRunner;
use rentflow_ingest::FileFeedSource;
use rentflow_orchestrator::{FeedDeps, MarketData, Pipeline, PipelineDeps, PipelineWorker};
use rentflow_storage::{
    FileWatermarkStore, MemoryArtifactRepository, MemoryListingRepository, MemoryWatermarkStore,
    TtlCache,
};

// ── CLI ─────────────────────────────────────────────────────────────

/// Rentflow worker: incremental listing enrichment and rent estimation.
#[derive(Parser, Debug)]
#[command(name = "rentflow-worker", version, about)]
struct Cli {
    /// Path to rentflow.toml. A missing file means defaults plus env overrides.
    #[arg(long, env = "RENTFLOW_CONFIG", default_value = "config/rentflow.toml")]
    config: PathBuf,

    /// JSON listing feed to poll. Without it the worker only sweeps.
    #[arg(long, env = "RENTFLOW_FEED")]
    feed: Option<PathBuf>,

    /// JSON market data (priors, comps, tax rates, location scores, geocodes).
    #[arg(long, env = "RENTFLOW_MARKET_DATA")]
    market_data: Option<PathBuf>,

    /// Feed items per page.
    #[arg(long, env = "RENTFLOW_FEED_PAGE_SIZE", default_value_t = 100)]
    page_size: usize,
}

fn load_config(path: &PathBuf) -> anyhow::Result<RentflowConfig> {
    if path.exists() {
        let config = RentflowConfig::from_file(path)
            .with_context(|| format!("invalid config {}", path.display()))?;
        info!(path = %path.display(), "loaded rentflow config");
        Ok(config)
    } else {
        warn!(path = %path.display(), "config file not found, using defaults");
        Ok(RentflowConfig::from_toml("")?)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    config.log_summary();

    let clock: SharedClock = Arc::new(SystemClock);
    let cache = Arc::new(TtlCache::new(config.cache.capacity, clock.clone()));
    let listings = Arc::new(MemoryListingRepository::new());

    let market = match &cli.market_data {
        Some(path) => MarketData::load(path)
            .await
            .with_context(|| format!("failed to load market data {}", path.display()))?,
        None => {
            warn!("no market data given, estimates will be empty");
            MarketData::default()
        }
    };

    let feed = match &cli.feed {
        Some(path) => {
            let watermarks: Arc<dyn WatermarkStore> = match &config.watermark.path {
                Some(wm_path) => Arc::new(FileWatermarkStore::open(wm_path).await?),
                None => Arc::new(MemoryWatermarkStore::new()),
            };
            info!(feed = %path.display(), page_size = cli.page_size, "polling file feed");
            Some(FeedDeps {
                source: Arc::new(FileFeedSource::new(path, cli.page_size)),
                repo: listings.clone(),
                watermarks,
            })
        }
        None => None,
    };

    let pipeline = Arc::new(Pipeline::build(
        &config,
        PipelineDeps {
            clock,
            cache,
            listings,
            enrichment_artifacts: Arc::new(MemoryArtifactRepository::<EnrichedListing>::new()),
            rent_artifacts: Arc::new(MemoryArtifactRepository::<RentEstimate>::new()),
            lookups: market.lookups(),
            feed,
        },
    ));

    let fatal = Arc::new(Notify::new());
    let worker = Arc::new(PipelineWorker::new(
        "rentflow-worker",
        pipeline.clone(),
        &config,
        fatal.clone(),
    ));

    WorkerRunner::new(worker.clone(), pipeline.bus(), &config.worker)
        .run(Some(fatal))
        .await?;

    if let Some(reason) = worker.failure() {
        anyhow::bail!("worker halted: {reason}");
    }
    info!(
        enrichment = ?pipeline.enrichment().stats(),
        rent = ?pipeline.rent().stats(),
        "rentflow-worker exiting"
    );
    Ok(())
}
