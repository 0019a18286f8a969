//! Wiring: one bus, two recompute stages, an optional poller, and the
//! worker that keeps the poll loop and debounce sweep running.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use rentflow_compute::{
    AddressQuery, ArtifactWriter, CachedLookup, DebouncePolicy, Debouncer, EnrichedListing,
    EnrichmentEngine, GeoPoint, RecomputeEngine, RentComp, RentEstimate, RentEstimateEngine,
    RentPriors, RentQuery, StructuralDiffer, ToleranceDiffer, ZipQuery,
};
use rentflow_core::config::{DebounceConfig, PollerConfig};
use rentflow_core::{
    ArtifactRepository, CachePort, ListingRepository, LookupPort, ReadPort, RentflowConfig,
    SharedClock, WatermarkStore,
};
use rentflow_eisenbahn::events::WorkerStatus;
use rentflow_eisenbahn::{topics, EisenbahnError, EventBus, Worker};
use rentflow_ingest::{ListingSource, PollLoop, Poller};

use crate::market_data::MarketLookups;
use crate::stage::RecomputeStage;

/// Everything the pipeline reads from or writes to.
pub struct PipelineDeps {
    pub clock: SharedClock,
    pub cache: Arc<dyn CachePort>,
    pub listings: Arc<dyn ReadPort>,
    pub enrichment_artifacts: Arc<dyn ArtifactRepository<EnrichedListing>>,
    pub rent_artifacts: Arc<dyn ArtifactRepository<RentEstimate>>,
    /// Uncached sources; the pipeline puts the shared cache in front of each.
    pub lookups: MarketLookups,
    pub feed: Option<FeedDeps>,
}

/// The polled feed and the stores the poller writes.
pub struct FeedDeps {
    pub source: Arc<dyn ListingSource>,
    pub repo: Arc<dyn ListingRepository>,
    pub watermarks: Arc<dyn WatermarkStore>,
}

pub struct Pipeline {
    bus: Arc<EventBus>,
    cache: Arc<dyn CachePort>,
    enrichment: Arc<RecomputeStage<EnrichmentEngine>>,
    rent: Arc<RecomputeStage<RentEstimateEngine>>,
    poller: Option<Arc<Poller>>,
}

fn cached<Q, R>(
    inner: Arc<dyn LookupPort<Q, R>>,
    cache: &Arc<dyn CachePort>,
    ttl: Duration,
) -> Arc<dyn LookupPort<Q, R>>
where
    Q: rentflow_core::LookupKey + Send + Sync + 'static,
    R: serde::Serialize + serde::de::DeserializeOwned + Send + 'static,
{
    Arc::new(CachedLookup::new(inner, cache.clone(), ttl))
}

fn debouncer(
    config: &DebounceConfig,
    stage: &str,
    cache: &Arc<dyn CachePort>,
    clock: &SharedClock,
) -> Debouncer {
    Debouncer::new(DebouncePolicy::from(config), stage, cache.clone(), clock.clone())
}

impl Pipeline {
    /// Build the stages and subscribe both to `listing.changed`.
    ///
    /// Rent reads only the snapshot and market tables, so `listing.enriched`
    /// is left to downstream consumers.
    #[instrument(skip_all)]
    pub fn build(config: &RentflowConfig, deps: PipelineDeps) -> Self {
        let bus = Arc::new(EventBus::new());
        let ttl = Duration::from_secs(config.cache.lookup_ttl_secs);
        let cache = &deps.cache;

        let geocoder: Arc<dyn LookupPort<AddressQuery, Option<GeoPoint>>> =
            cached(deps.lookups.geocoder, cache, ttl);
        let tax_rates: Arc<dyn LookupPort<ZipQuery, Option<f64>>> =
            cached(deps.lookups.tax_rates, cache, ttl);
        let location_scores: Arc<dyn LookupPort<ZipQuery, Option<u8>>> =
            cached(deps.lookups.location_scores, cache, ttl);
        let priors: Arc<dyn LookupPort<RentQuery, Option<RentPriors>>> =
            cached(deps.lookups.priors, cache, ttl);
        let comps: Arc<dyn LookupPort<RentQuery, Vec<RentComp>>> =
            cached(deps.lookups.comps, cache, ttl);

        let enrichment_engine = Arc::new(EnrichmentEngine::new(
            deps.listings.clone(),
            geocoder,
            tax_rates,
            location_scores,
            ArtifactWriter::new(
                deps.enrichment_artifacts,
                Arc::new(StructuralDiffer::new(config.enrichment.volatile_fields.iter().cloned())),
            ),
            deps.clock.clone(),
        ));
        let rent_engine = Arc::new(RentEstimateEngine::new(
            deps.listings.clone(),
            priors,
            comps,
            ArtifactWriter::new(
                deps.rent_artifacts,
                Arc::new(ToleranceDiffer::new(config.rent.material_change_threshold)),
            ),
            deps.clock.clone(),
            config.rent.max_stored_comps,
        ));

        let enrichment = Arc::new(RecomputeStage::new(
            enrichment_engine.clone(),
            debouncer(config.enrichment_debounce(), enrichment_engine.name(), cache, &deps.clock),
            bus.clone(),
            &config.worker,
        ));
        let rent = Arc::new(RecomputeStage::new(
            rent_engine.clone(),
            debouncer(config.rent_debounce(), rent_engine.name(), cache, &deps.clock),
            bus.clone(),
            &config.worker,
        ));

        bus.subscribe(topics::LISTING_CHANGED, enrichment.clone());
        bus.subscribe(topics::LISTING_CHANGED, rent.clone());

        let poller = deps.feed.map(|feed| {
            Arc::new(Poller::new(
                &config.poller,
                feed.source,
                feed.repo,
                feed.watermarks,
                bus.clone(),
                deps.clock.clone(),
            ))
        });

        info!(polling = poller.is_some(), "pipeline wired");
        Self {
            bus,
            cache: deps.cache,
            enrichment,
            rent,
            poller,
        }
    }

    pub fn bus(&self) -> Arc<EventBus> {
        self.bus.clone()
    }

    pub fn enrichment(&self) -> &Arc<RecomputeStage<EnrichmentEngine>> {
        &self.enrichment
    }

    pub fn rent(&self) -> &Arc<RecomputeStage<RentEstimateEngine>> {
        &self.rent
    }

    pub fn poller(&self) -> Option<Arc<Poller>> {
        self.poller.clone()
    }

    /// Flush due debounce windows in every stage, then drop expired cache
    /// entries. Returns the number of swept recomputes.
    pub async fn sweep(&self) -> usize {
        let processed = self.enrichment.sweep().await + self.rent.sweep().await;
        match self.cache.purge_expired().await {
            Ok(0) => {}
            Ok(removed) => debug!(removed, "expired cache entries purged"),
            Err(e) => warn!(error = %e, "cache purge failed"),
        }
        processed
    }
}

/// Runs the poll loop and the debounce sweep until stopped.
///
/// An open poll circuit is fatal: the worker records the reason and fires
/// `fatal` so the runner shuts the process down. Short of that, failing poll
/// cycles or new stage failures since the last health sample report the
/// worker as degraded.
pub struct PipelineWorker {
    name: String,
    pipeline: Arc<Pipeline>,
    poller_config: PollerConfig,
    sweep_interval: Duration,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    fatal: Arc<Notify>,
    failure: Arc<std::sync::Mutex<Option<String>>>,
    poll_failures: Arc<AtomicU32>,
    stage_failures_seen: AtomicU64,
}

impl PipelineWorker {
    pub fn new(
        name: impl Into<String>,
        pipeline: Arc<Pipeline>,
        config: &RentflowConfig,
        fatal: Arc<Notify>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            name: name.into(),
            pipeline,
            poller_config: config.poller.clone(),
            sweep_interval: Duration::from_secs(config.worker.sweep_interval_secs.max(1)),
            shutdown,
            tasks: Mutex::new(Vec::new()),
            fatal,
            failure: Arc::new(std::sync::Mutex::new(None)),
            poll_failures: Arc::new(AtomicU32::new(0)),
            stage_failures_seen: AtomicU64::new(0),
        }
    }

    /// Why the worker gave up, if it did.
    pub fn failure(&self) -> Option<String> {
        self.failure
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

#[async_trait]
impl Worker for PipelineWorker {
    async fn start(&self) -> Result<(), EisenbahnError> {
        let mut tasks = self.tasks.lock().await;

        match self.pipeline.poller() {
            Some(poller) => {
                let poll_loop = PollLoop::new(poller, &self.poller_config)
                    .with_failure_gauge(self.poll_failures.clone());
                let shutdown = self.shutdown.subscribe();
                let fatal = self.fatal.clone();
                let failure = self.failure.clone();
                tasks.push(tokio::spawn(async move {
                    if let Err(e) = poll_loop.run(shutdown).await {
                        error!(error = %e, "poll loop halted");
                        *failure.lock().unwrap_or_else(|p| p.into_inner()) = Some(e.to_string());
                        fatal.notify_one();
                    }
                }));
            }
            None => info!("no feed configured, processing bus events only"),
        }

        let pipeline = self.pipeline.clone();
        let mut shutdown = self.shutdown.subscribe();
        let interval = self.sweep_interval;
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        pipeline.sweep().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        }));

        info!(worker = %self.name, sweep_interval = ?self.sweep_interval, "pipeline tasks spawned");
        Ok(())
    }

    async fn stop(&self) -> Result<(), EisenbahnError> {
        self.shutdown.send_replace(true);
        let handles: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(worker = %self.name, error = %e, "pipeline task ended abnormally");
            }
        }
        let open = self.pipeline.enrichment().debouncer().open_windows()
            + self.pipeline.rent().debouncer().open_windows();
        if open > 0 {
            warn!(worker = %self.name, open, "stopping with debounce windows still open");
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn status(&self) -> WorkerStatus {
        if self.failure().is_some() {
            return WorkerStatus::Unhealthy;
        }
        let failed =
            self.pipeline.enrichment().stats().failed + self.pipeline.rent().stats().failed;
        let seen = self.stage_failures_seen.swap(failed, Ordering::Relaxed);
        let polling = self.poll_failures.load(Ordering::Relaxed);
        if failed > seen || polling > 0 {
            warn!(worker = %self.name, new_stage_failures = failed.saturating_sub(seen), poll_failures = polling, "worker degraded");
            return WorkerStatus::Degraded;
        }
        WorkerStatus::Healthy
    }
}
