//! Full pipeline runs: bus, both stages, debounce and the poller together.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;
use tokio::sync::{Mutex, Notify};

use rentflow_compute::{EnrichedListing, RentEstimate};
use rentflow_core::{
    ArtifactRepository, ChangeKind, Clock, DirtyField, ListingRepository, ListingSnapshot,
    ManualClock, RentflowConfig, WatermarkStore,
};
use rentflow_eisenbahn::events::{ListingChanged, WorkerStatus};
use rentflow_eisenbahn::{
    handler_fn, topics, EventBus, EventPublisher, Message, PipelineEvent, Worker,
};
use rentflow_ingest::FileFeedSource;
use rentflow_orchestrator::{FeedDeps, MarketData, Pipeline, PipelineDeps, PipelineWorker};
use rentflow_storage::{
    MemoryArtifactRepository, MemoryListingRepository, MemoryWatermarkStore, TtlCache,
};

const MARKET: &str = r#"{
    "priors": {"94110:2": {"p25": 3100, "p50": 3400, "p75": 3800}},
    "comps": {"94110:2": [
        {"rent": 3300, "distance_km": 0.5, "days_old": 10},
        {"rent": 3500, "distance_km": 1.0, "days_old": 20},
        {"rent": 3450, "distance_km": 0.2, "days_old": 5}
    ]},
    "tax_rates": {"94110": 0.012},
    "location_scores": {"94110": 88},
    "geocodes": {"12 Elm St": {"lat": 37.75, "lon": -122.41}}
}"#;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

fn listing(price: f64, media: &[&str], at: DateTime<Utc>) -> ListingSnapshot {
    ListingSnapshot {
        id: "L1".into(),
        status: "active".into(),
        price: Some(price),
        fees: Some(300.0),
        tax: None,
        address: "12 Elm St".into(),
        zip: Some("94110".into()),
        beds: Some(2.0),
        baths: Some(1.0),
        sqft: Some(1000),
        media: media.iter().map(|m| m.to_string()).collect(),
        updated_at: at,
    }
}

fn changed(kind: ChangeKind, dirty: Vec<DirtyField>, at: DateTime<Utc>) -> Message {
    Message::new(PipelineEvent::ListingChanged(ListingChanged {
        id: "L1".into(),
        updated_at: at,
        change: kind,
        dirty,
    }))
}

struct Harness {
    clock: Arc<ManualClock>,
    cache: Arc<TtlCache>,
    listings: Arc<MemoryListingRepository>,
    enriched: Arc<MemoryArtifactRepository<EnrichedListing>>,
    estimates: Arc<MemoryArtifactRepository<RentEstimate>>,
    pipeline: Arc<Pipeline>,
    follow_ons: Arc<Mutex<Vec<Message>>>,
}

impl Harness {
    fn new(config: &RentflowConfig, feed: Option<FeedDeps>) -> Self {
        Self::with_listings(config, Arc::new(MemoryListingRepository::new()), feed)
    }

    fn with_listings(
        config: &RentflowConfig,
        listings: Arc<MemoryListingRepository>,
        feed: Option<FeedDeps>,
    ) -> Self {
        let clock = Arc::new(ManualClock::new(t0()));
        let cache = Arc::new(TtlCache::new(1_000, clock.clone()));
        let enriched = Arc::new(MemoryArtifactRepository::<EnrichedListing>::new());
        let estimates = Arc::new(MemoryArtifactRepository::<RentEstimate>::new());
        let pipeline = Arc::new(Pipeline::build(
            config,
            PipelineDeps {
                clock: clock.clone(),
                cache: cache.clone(),
                listings: listings.clone(),
                enrichment_artifacts: enriched.clone(),
                rent_artifacts: estimates.clone(),
                lookups: MarketData::from_json(MARKET).unwrap().lookups(),
                feed,
            },
        ));

        let follow_ons = Arc::new(Mutex::new(Vec::new()));
        let bus = pipeline.bus();
        for topic in [topics::LISTING_ENRICHED, topics::RENT_ESTIMATED] {
            let sink = follow_ons.clone();
            bus.subscribe(
                topic,
                handler_fn("recorder", move |msg| {
                    let sink = sink.clone();
                    async move {
                        sink.lock().await.push(msg);
                        Ok(())
                    }
                }),
            );
        }

        Self {
            clock,
            cache,
            listings,
            enriched,
            estimates,
            pipeline,
            follow_ons,
        }
    }

    async fn publish(&self, message: Message) {
        let report = self.pipeline.bus().publish(message).await.unwrap();
        assert!(report.all_delivered(), "handlers failed: {:?}", report.failed);
    }

    async fn topics_seen(&self) -> Vec<String> {
        self.follow_ons
            .lock()
            .await
            .iter()
            .map(|m| m.topic.clone())
            .collect()
    }
}

#[tokio::test]
async fn creation_produces_both_artifacts() {
    let h = Harness::new(&RentflowConfig::default(), None);
    h.listings.upsert(listing(700_000.0, &["a.jpg"], t0())).await.unwrap();

    let create = changed(ChangeKind::Create, vec![], t0());
    let correlation = create.correlation_id;
    h.publish(create).await;

    // Stages run in subscription order: enrichment first, then rent.
    assert_eq!(
        h.topics_seen().await,
        vec![topics::LISTING_ENRICHED.to_string(), topics::RENT_ESTIMATED.to_string()]
    );
    // Every follow-on traces back to the originating change.
    assert!(h
        .follow_ons
        .lock()
        .await
        .iter()
        .all(|m| m.correlation_id == correlation));

    let enriched = h.enriched.get_by_entity_id("L1").await.unwrap().unwrap();
    assert_eq!(enriched.payload.photo_count, 1);
    assert_eq!(enriched.payload.price_per_sqft, Some(700.0));
    assert_eq!(enriched.payload.location_score, Some(88));
    assert!(enriched.payload.geo.is_some());

    let estimate = h.estimates.get_by_entity_id("L1").await.unwrap().unwrap();
    assert_eq!(estimate.payload.comp_count, 3);
}

#[tokio::test]
async fn media_then_price_coalesces_into_one_enrichment() {
    let h = Harness::new(&RentflowConfig::default(), None);
    h.listings.upsert(listing(700_000.0, &["a.jpg"], t0())).await.unwrap();
    h.publish(changed(ChangeKind::Create, vec![], t0())).await;
    h.follow_ons.lock().await.clear();
    let rent_writes = h.estimates.upserts();

    // Photos added: low priority, held by both stages.
    h.clock.advance_secs(5);
    h.listings
        .upsert(listing(700_000.0, &["a.jpg", "b.jpg"], h.clock.now()))
        .await
        .unwrap();
    h.publish(changed(ChangeKind::Update, vec![DirtyField::Media], h.clock.now()))
        .await;

    assert!(h.topics_seen().await.is_empty());
    assert_eq!(h.pipeline.enrichment().stats().debounced, 1);
    assert_eq!(h.pipeline.rent().stats().debounced, 1);
    let held = h.enriched.get_by_entity_id("L1").await.unwrap().unwrap();
    assert_eq!(held.payload.photo_count, 1);

    // Price cut inside the window: processed at once, with the photos folded in.
    h.clock.advance_secs(10);
    h.listings
        .upsert(listing(680_000.0, &["a.jpg", "b.jpg"], h.clock.now()))
        .await
        .unwrap();
    h.publish(changed(ChangeKind::Update, vec![DirtyField::Price], h.clock.now()))
        .await;

    assert_eq!(h.topics_seen().await, vec![topics::LISTING_ENRICHED.to_string()]);
    let enriched = h.enriched.get_by_entity_id("L1").await.unwrap().unwrap();
    assert_eq!(enriched.payload.photo_count, 2);
    assert_eq!(enriched.payload.price_per_sqft, Some(680.0));

    // Rent inputs did not move, so the estimate was left alone.
    assert_eq!(h.estimates.upserts(), rent_writes);
    // One recompute per stage for the create, one for the merged burst.
    assert_eq!(h.pipeline.rent().stats().recomputed, 2);
    assert_eq!(h.pipeline.enrichment().stats().recomputed, 2);

    // Nothing is left for the sweep once the window would have closed.
    h.clock.advance_secs(30);
    assert_eq!(h.pipeline.sweep().await, 0);
    assert_eq!(h.pipeline.enrichment().debouncer().open_windows(), 0);
}

#[tokio::test]
async fn quiet_window_is_flushed_by_the_sweep() {
    let h = Harness::new(&RentflowConfig::default(), None);
    h.listings.upsert(listing(700_000.0, &["a.jpg"], t0())).await.unwrap();
    h.publish(changed(ChangeKind::Create, vec![], t0())).await;
    h.follow_ons.lock().await.clear();

    h.listings
        .upsert(listing(700_000.0, &["a.jpg", "b.jpg", "c.jpg"], t0()))
        .await
        .unwrap();
    h.publish(changed(ChangeKind::Update, vec![DirtyField::Media], t0()))
        .await;

    h.clock.advance_secs(29);
    assert_eq!(h.pipeline.sweep().await, 0);

    h.clock.advance_secs(1);
    assert_eq!(h.pipeline.sweep().await, 2);
    assert_eq!(h.topics_seen().await, vec![topics::LISTING_ENRICHED.to_string()]);
    let enriched = h.enriched.get_by_entity_id("L1").await.unwrap().unwrap();
    assert_eq!(enriched.payload.photo_count, 3);
}

#[tokio::test]
async fn sweep_purges_expired_lookups() {
    let h = Harness::new(&RentflowConfig::default(), None);
    h.listings.upsert(listing(700_000.0, &["a.jpg"], t0())).await.unwrap();
    h.publish(changed(ChangeKind::Create, vec![], t0())).await;
    assert!(!h.cache.is_empty());

    h.clock.advance_secs(60);
    h.pipeline.sweep().await;
    assert!(!h.cache.is_empty());

    h.clock.advance_secs(3_600);
    h.pipeline.sweep().await;
    assert!(h.cache.is_empty());
}

#[tokio::test]
async fn duplicate_delivery_is_harmless() {
    let h = Harness::new(&RentflowConfig::default(), None);
    h.listings.upsert(listing(700_000.0, &["a.jpg"], t0())).await.unwrap();

    let create = changed(ChangeKind::Create, vec![], t0());
    h.publish(create.clone()).await;
    h.publish(create).await;

    assert_eq!(h.follow_ons.lock().await.len(), 2);
    assert_eq!(h.enriched.upserts(), 1);
    assert_eq!(h.estimates.upserts(), 1);
}

#[tokio::test]
async fn poll_cycle_drives_the_stages() {
    let dir = tempfile::tempdir().unwrap();
    let feed_path = dir.path().join("feed.json");
    std::fs::write(
        &feed_path,
        json!([{
            "id": "L1",
            "status": "active",
            "price": 700000,
            "hoa": 300,
            "address": "12 Elm St",
            "zip": "94110",
            "beds": 2,
            "baths": 1,
            "sqft": 1000,
            "photos": ["a.jpg"],
            "updatedAt": "2024-03-01T11:30:00Z"
        }])
        .to_string(),
    )
    .unwrap();

    let listings = Arc::new(MemoryListingRepository::new());
    let watermarks = Arc::new(MemoryWatermarkStore::new());
    let feed = FeedDeps {
        source: Arc::new(FileFeedSource::new(&feed_path, 10)),
        repo: listings.clone(),
        watermarks: watermarks.clone(),
    };
    let config = RentflowConfig::default();
    let h = Harness::with_listings(&config, listings, Some(feed));

    let summary = h.pipeline.poller().unwrap().poll_once().await.unwrap();

    assert_eq!(summary.changed, 1);
    assert_eq!(
        watermarks.get_watermark(&config.poller.source_name).await.unwrap(),
        Some(Utc.with_ymd_and_hms(2024, 3, 1, 11, 30, 0).unwrap())
    );
    assert!(h.enriched.get_by_entity_id("L1").await.unwrap().is_some());
    assert!(h.estimates.get_by_entity_id("L1").await.unwrap().is_some());

    // Same feed again: nothing new, nothing recomputed.
    h.pipeline.poller().unwrap().poll_once().await.unwrap();
    assert_eq!(h.enriched.upserts(), 1);
}

#[tokio::test(start_paused = true)]
async fn worker_sweeps_until_stopped() {
    let mut config = RentflowConfig::default();
    config.worker.sweep_interval_secs = 5;
    let h = Harness::new(&config, None);
    h.listings.upsert(listing(700_000.0, &["a.jpg"], t0())).await.unwrap();
    h.publish(changed(ChangeKind::Create, vec![], t0())).await;
    h.listings
        .upsert(listing(700_000.0, &["a.jpg", "b.jpg"], t0()))
        .await
        .unwrap();
    h.publish(changed(ChangeKind::Update, vec![DirtyField::Media], t0()))
        .await;

    let worker = PipelineWorker::new("test-worker", h.pipeline.clone(), &config, Arc::new(Notify::new()));
    worker.start().await.unwrap();

    h.clock.advance_secs(30);
    tokio::time::sleep(Duration::from_secs(6)).await;

    let enriched = h.enriched.get_by_entity_id("L1").await.unwrap().unwrap();
    assert_eq!(enriched.payload.photo_count, 2);

    worker.stop().await.unwrap();
    assert_eq!(worker.failure(), None);
    assert_eq!(worker.name(), "test-worker");
}

fn unreadable_feed(listings: Arc<MemoryListingRepository>, dir: &tempfile::TempDir) -> FeedDeps {
    FeedDeps {
        source: Arc::new(FileFeedSource::new(dir.path().join("missing.json"), 10)),
        repo: listings,
        watermarks: Arc::new(MemoryWatermarkStore::new()),
    }
}

async fn wait_for_status(worker: &PipelineWorker, wanted: WorkerStatus) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while worker.status() != wanted {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("worker never reported {wanted:?}"));
}

#[tokio::test]
async fn failing_polls_degrade_the_worker() {
    let dir = tempfile::tempdir().unwrap();
    let listings = Arc::new(MemoryListingRepository::new());
    let mut config = RentflowConfig::default();
    config.poller.max_consecutive_failures = 100;
    let h = Harness::with_listings(&config, listings.clone(), Some(unreadable_feed(listings, &dir)));
    let worker = PipelineWorker::new("feed-worker", h.pipeline.clone(), &config, Arc::new(Notify::new()));
    assert_eq!(worker.status(), WorkerStatus::Healthy);

    worker.start().await.unwrap();
    wait_for_status(&worker, WorkerStatus::Degraded).await;

    worker.stop().await.unwrap();
    assert_eq!(worker.failure(), None);
}

#[tokio::test]
async fn open_circuit_marks_the_worker_unhealthy() {
    let dir = tempfile::tempdir().unwrap();
    let listings = Arc::new(MemoryListingRepository::new());
    let mut config = RentflowConfig::default();
    config.poller.max_consecutive_failures = 1;
    let h = Harness::with_listings(&config, listings.clone(), Some(unreadable_feed(listings, &dir)));
    let fatal = Arc::new(Notify::new());
    let worker = PipelineWorker::new("feed-worker", h.pipeline.clone(), &config, fatal.clone());

    worker.start().await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), fatal.notified())
        .await
        .unwrap();

    assert_eq!(worker.status(), WorkerStatus::Unhealthy);
    assert!(worker.failure().unwrap().contains("circuit"));
    worker.stop().await.unwrap();
}

#[tokio::test]
async fn inbound_json_reaches_the_stages() {
    let h = Harness::new(&RentflowConfig::default(), None);
    h.listings.upsert(listing(700_000.0, &["a.jpg"], t0())).await.unwrap();

    let raw = changed(ChangeKind::Create, vec![], t0()).to_json().unwrap();
    let bus: Arc<EventBus> = h.pipeline.bus();
    bus.publish_json(&raw).await.unwrap();

    assert_eq!(h.follow_ons.lock().await.len(), 2);
}
