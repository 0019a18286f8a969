//! Bus-facing wrapper around one [`RecomputeEngine`].
//!
//! A stage receives change events, asks its debouncer whether to act now,
//! runs the engine (retrying transient store failures) and announces
//! materially changed artifacts with a follow-on event that keeps the
//! triggering correlation id.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use rentflow_compute::{ComputeError, Debouncer, RecomputeEngine, RecomputeOutcome};
use rentflow_core::config::WorkerSettings;
use rentflow_core::{Backoff, ChangeKind, DirtyField};
use rentflow_eisenbahn::{EisenbahnError, EventHandler, EventPublisher, Message, PipelineEvent};

/// Point-in-time copy of a stage's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageStats {
    pub received: u64,
    /// Events absorbed into an open debounce window.
    pub debounced: u64,
    pub recomputed: u64,
    /// Recomputes that persisted a new artifact.
    pub changed: u64,
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    debounced: AtomicU64,
    recomputed: AtomicU64,
    changed: AtomicU64,
    failed: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct RecomputeStage<E: RecomputeEngine> {
    engine: Arc<E>,
    debouncer: Debouncer,
    publisher: Arc<dyn EventPublisher>,
    retry: Backoff,
    retry_attempts: u32,
    counters: Counters,
}

impl<E: RecomputeEngine + 'static> RecomputeStage<E> {
    pub fn new(
        engine: Arc<E>,
        debouncer: Debouncer,
        publisher: Arc<dyn EventPublisher>,
        settings: &WorkerSettings,
    ) -> Self {
        Self {
            engine,
            debouncer,
            publisher,
            retry: settings.retry_backoff(),
            retry_attempts: settings.retry_attempts.max(1),
            counters: Counters::default(),
        }
    }

    pub fn name(&self) -> &str {
        self.engine.name()
    }

    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    pub fn debouncer(&self) -> &Debouncer {
        &self.debouncer
    }

    pub fn stats(&self) -> StageStats {
        let c = &self.counters;
        StageStats {
            received: c.received.load(Ordering::Relaxed),
            debounced: c.debounced.load(Ordering::Relaxed),
            recomputed: c.recomputed.load(Ordering::Relaxed),
            changed: c.changed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
        }
    }

    /// Route one bus message. Topics this stage does not react to are ignored.
    pub async fn on_message(&self, message: &Message) -> Result<(), EisenbahnError> {
        let correlation_id = Some(message.correlation_id);
        match &message.event {
            PipelineEvent::ListingChanged(changed) => {
                Counters::bump(&self.counters.received);
                if changed.change == ChangeKind::Create {
                    return self.run(&changed.id, correlation_id, "created").await;
                }
                let dirty: BTreeSet<DirtyField> = changed.dirty.iter().cloned().collect();
                let decision = match self.debouncer.should_process(&changed.id, &dirty).await {
                    Ok(decision) => decision,
                    Err(e) => {
                        // Without the gate the worst case is an extra recompute.
                        warn!(stage = self.name(), entity_id = %changed.id, error = %e, "debounce unavailable, processing now");
                        return self.run(&changed.id, correlation_id, "debounce_unavailable").await;
                    }
                };
                if !decision.proceed {
                    Counters::bump(&self.counters.debounced);
                    debug!(stage = self.name(), entity_id = %changed.id, reason = %decision.reason, "change held");
                    return Ok(());
                }
                self.run(&changed.id, correlation_id, &decision.reason.to_string())
                    .await
            }
            _ => Ok(()),
        }
    }

    /// Recompute every entity whose debounce window ran out without a
    /// trigger. Returns how many were processed.
    pub async fn sweep(&self) -> usize {
        let due = self.debouncer.flush_due().await;
        let mut processed = 0;
        for decision in due {
            let Some(state) = decision.state else { continue };
            if let Err(e) = self.run(&state.entity_id, None, &decision.reason.to_string()).await {
                warn!(stage = self.name(), entity_id = %state.entity_id, error = %e, "swept recompute failed");
            }
            processed += 1;
        }
        if processed > 0 {
            info!(stage = self.name(), processed, "debounce sweep complete");
        }
        processed
    }

    async fn run(
        &self,
        entity_id: &str,
        correlation_id: Option<Uuid>,
        trigger: &str,
    ) -> Result<(), EisenbahnError> {
        Counters::bump(&self.counters.recomputed);
        let outcome = match self.recompute_with_retry(entity_id).await {
            Ok(outcome) => outcome,
            Err(ComputeError::NoEstimate(reason)) => {
                info!(stage = self.name(), entity_id, reason = %reason, "nothing to compute");
                return Ok(());
            }
            Err(e) => {
                Counters::bump(&self.counters.failed);
                error!(stage = self.name(), entity_id, trigger, error = %e, "recompute failed");
                return Err(EisenbahnError::handler(self.name(), e.to_string()));
            }
        };

        let Some(artifact) = outcome.artifact.as_ref().filter(|_| outcome.changed) else {
            debug!(stage = self.name(), entity_id, trigger, "no material change");
            return Ok(());
        };
        Counters::bump(&self.counters.changed);

        let event = self.engine.follow_on(artifact);
        let message = match correlation_id {
            Some(id) => Message::with_correlation(event, id),
            None => Message::new(event),
        };
        let topic = message.topic.clone();
        match self.publisher.publish(message).await {
            Ok(report) if !report.all_delivered() => {
                warn!(stage = self.name(), entity_id, topic = %topic, failed = ?report.failed, "follow-on partly delivered");
            }
            Ok(_) => {
                info!(stage = self.name(), entity_id, topic = %topic, trigger, "artifact updated");
            }
            Err(e) => {
                warn!(stage = self.name(), entity_id, topic = %topic, error = %e, "follow-on publish failed");
            }
        }
        Ok(())
    }

    async fn recompute_with_retry(
        &self,
        entity_id: &str,
    ) -> Result<RecomputeOutcome<E::Payload>, ComputeError> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.engine.recompute(entity_id).await {
                Err(e) if e.is_transient() && attempt < self.retry_attempts => {
                    let delay = self.retry.delay(attempt);
                    warn!(stage = self.name(), entity_id, attempt, retry_in = ?delay, error = %e, "transient recompute failure");
                    tokio::time::sleep(delay).await;
                }
                result => return result,
            }
        }
    }
}

#[async_trait]
impl<E: RecomputeEngine + 'static> EventHandler for RecomputeStage<E> {
    fn name(&self) -> &str {
        self.engine.name()
    }

    async fn handle(&self, message: &Message) -> Result<(), EisenbahnError> {
        self.on_message(message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use chrono::{TimeZone, Utc};
    use rentflow_compute::DebouncePolicy;
    use rentflow_core::{DerivedArtifact, ManualClock, StoreError};
    use rentflow_eisenbahn::events::{ListingChanged, RentEstimated};
    use rentflow_eisenbahn::PublishReport;
    use rentflow_storage::TtlCache;

    /// Engine that replays a script of results and counts calls.
    struct Scripted {
        results: Mutex<Vec<Result<bool, ComputeError>>>,
        calls: AtomicU64,
    }

    impl Scripted {
        fn new(results: Vec<Result<bool, ComputeError>>) -> Self {
            Self {
                results: Mutex::new(results),
                calls: AtomicU64::new(0),
            }
        }

        fn calls(&self) -> u64 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RecomputeEngine for Scripted {
        type Payload = u32;

        fn name(&self) -> &str {
            "scripted"
        }

        async fn recompute(&self, entity_id: &str) -> Result<RecomputeOutcome<u32>, ComputeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = {
                let mut results = self.results.lock().unwrap();
                if results.is_empty() { Ok(false) } else { results.remove(0) }
            };
            let changed = next?;
            Ok(RecomputeOutcome {
                changed,
                artifact: Some(DerivedArtifact {
                    entity_id: entity_id.to_string(),
                    input_version: "v".into(),
                    schema_version: 1,
                    computed_at: Utc::now(),
                    payload: 7,
                }),
            })
        }

        fn follow_on(&self, artifact: &DerivedArtifact<u32>) -> PipelineEvent {
            PipelineEvent::RentEstimated(RentEstimated {
                id: artifact.entity_id.clone(),
                method: "comps".into(),
                p25: None,
                p50: Some(artifact.payload as f64),
                p75: None,
                comp_count: 0,
            })
        }
    }

    #[derive(Default)]
    struct Recorder(tokio::sync::Mutex<Vec<Message>>);

    #[async_trait]
    impl EventPublisher for Recorder {
        async fn publish(&self, message: Message) -> Result<PublishReport, EisenbahnError> {
            let topic = message.topic.clone();
            self.0.lock().await.push(message);
            Ok(PublishReport {
                topic,
                delivered: 1,
                failed: vec![],
            })
        }
    }

    struct Fixture {
        engine: Arc<Scripted>,
        recorder: Arc<Recorder>,
        clock: Arc<ManualClock>,
        stage: RecomputeStage<Scripted>,
    }

    fn fixture(results: Vec<Result<bool, ComputeError>>) -> Fixture {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()));
        let cache = Arc::new(TtlCache::new(100, clock.clone()));
        let engine = Arc::new(Scripted::new(results));
        let recorder = Arc::new(Recorder::default());
        let debouncer = Debouncer::new(DebouncePolicy::default(), "scripted", cache, clock.clone());
        let stage = RecomputeStage::new(
            engine.clone(),
            debouncer,
            recorder.clone(),
            &WorkerSettings::default(),
        );
        Fixture {
            engine,
            recorder,
            clock,
            stage,
        }
    }

    fn changed(kind: ChangeKind, dirty: Vec<DirtyField>) -> Message {
        Message::new(PipelineEvent::ListingChanged(ListingChanged {
            id: "L1".into(),
            updated_at: Utc::now(),
            change: kind,
            dirty,
        }))
    }

    #[tokio::test]
    async fn immediate_change_recomputes_and_keeps_correlation() {
        let f = fixture(vec![Ok(true)]);
        let msg = changed(ChangeKind::Update, vec![DirtyField::Price]);

        f.stage.on_message(&msg).await.unwrap();

        assert_eq!(f.engine.calls(), 1);
        let sent = f.recorder.0.lock().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].correlation_id, msg.correlation_id);
        assert_eq!(sent[0].topic, "rent.estimated");
    }

    #[tokio::test]
    async fn low_priority_change_waits_for_sweep() {
        let f = fixture(vec![Ok(true)]);

        f.stage
            .on_message(&changed(ChangeKind::Update, vec![DirtyField::Media]))
            .await
            .unwrap();
        assert_eq!(f.engine.calls(), 0);
        assert_eq!(f.stage.sweep().await, 0);

        f.clock.advance_secs(30);
        assert_eq!(f.stage.sweep().await, 1);
        assert_eq!(f.engine.calls(), 1);
        assert_eq!(f.recorder.0.lock().await.len(), 1);
        assert_eq!(f.stage.stats().debounced, 1);
    }

    #[tokio::test]
    async fn creation_skips_debounce() {
        let f = fixture(vec![Ok(true)]);
        f.stage
            .on_message(&changed(ChangeKind::Create, vec![]))
            .await
            .unwrap();
        assert_eq!(f.engine.calls(), 1);
    }

    #[tokio::test]
    async fn follow_on_events_are_ignored() {
        let f = fixture(vec![Ok(true)]);
        let follow_on = Message::new(PipelineEvent::RentEstimated(RentEstimated {
            id: "L1".into(),
            method: "comps".into(),
            p25: None,
            p50: Some(3400.0),
            p75: None,
            comp_count: 3,
        }));
        f.stage.on_message(&follow_on).await.unwrap();
        assert_eq!(f.engine.calls(), 0);
        assert_eq!(f.stage.stats().received, 0);
    }

    #[tokio::test]
    async fn unchanged_artifact_publishes_nothing() {
        let f = fixture(vec![Ok(false)]);
        f.stage
            .on_message(&changed(ChangeKind::Update, vec![DirtyField::Tax]))
            .await
            .unwrap();
        assert_eq!(f.engine.calls(), 1);
        assert!(f.recorder.0.lock().await.is_empty());
        assert_eq!(f.stage.stats().changed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let f = fixture(vec![
            Err(ComputeError::Transient(StoreError::Unavailable("blip".into()))),
            Ok(true),
        ]);
        f.stage
            .on_message(&changed(ChangeKind::Update, vec![DirtyField::Price]))
            .await
            .unwrap();
        assert_eq!(f.engine.calls(), 2);
        assert_eq!(f.recorder.0.lock().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_failure_surfaces_to_the_bus() {
        let f = fixture(vec![
            Err(ComputeError::Transient(StoreError::Unavailable("down".into()))),
            Err(ComputeError::Transient(StoreError::Unavailable("down".into()))),
            Err(ComputeError::Transient(StoreError::Unavailable("down".into()))),
        ]);
        let err = f
            .stage
            .on_message(&changed(ChangeKind::Update, vec![DirtyField::Price]))
            .await
            .unwrap_err();
        assert!(matches!(err, EisenbahnError::Handler { .. }));
        assert_eq!(f.engine.calls(), 3);
        assert_eq!(f.stage.stats().failed, 1);
    }

    #[tokio::test]
    async fn missing_inputs_are_not_an_error() {
        let f = fixture(vec![Err(ComputeError::NoEstimate("no comps".into()))]);
        f.stage
            .on_message(&changed(ChangeKind::Update, vec![DirtyField::Price]))
            .await
            .unwrap();
        assert!(f.recorder.0.lock().await.is_empty());
        assert_eq!(f.stage.stats().failed, 0);
    }
}
