//! Watermark-gated poller.
//!
//! One cycle reads every page updated since the stored watermark, upserts
//! each item and announces real changes on the bus. The watermark moves only
//! when the whole cycle fetched cleanly and only forward.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use rentflow_core::config::PollerConfig;
use rentflow_core::{ListingRepository, SharedClock, WatermarkStore};
use rentflow_eisenbahn::events::ListingChanged;
use rentflow_eisenbahn::{EventPublisher, Message, PipelineEvent};

use crate::error::PollError;
use crate::normalize::normalize_listing;
use crate::source::ListingSource;

/// What one poll cycle did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PollSummary {
    /// Raw items read across all pages.
    pub processed: usize,
    /// Items that changed upstream state and were announced.
    pub changed: usize,
    /// Items dropped by a per-item error.
    pub skipped: usize,
    pub pages: usize,
    /// Watermark after the cycle (unchanged if nothing newer was seen).
    pub new_watermark: Option<DateTime<Utc>>,
    pub advanced: bool,
}

pub struct Poller {
    source_name: String,
    fetch_timeout: Duration,
    lookback: chrono::Duration,
    source: Arc<dyn ListingSource>,
    repo: Arc<dyn ListingRepository>,
    watermarks: Arc<dyn WatermarkStore>,
    publisher: Arc<dyn EventPublisher>,
    clock: SharedClock,
}

enum ItemOutcome {
    Changed,
    Unchanged,
    Skipped,
}

impl Poller {
    pub fn new(
        config: &PollerConfig,
        source: Arc<dyn ListingSource>,
        repo: Arc<dyn ListingRepository>,
        watermarks: Arc<dyn WatermarkStore>,
        publisher: Arc<dyn EventPublisher>,
        clock: SharedClock,
    ) -> Self {
        Self {
            source_name: config.source_name.clone(),
            fetch_timeout: config.fetch_timeout(),
            lookback: config.lookback(),
            source,
            repo,
            watermarks,
            publisher,
            clock,
        }
    }

    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    /// Run one full cycle.
    #[instrument(skip_all, fields(source = %self.source_name))]
    pub async fn poll_once(&self) -> Result<PollSummary, PollError> {
        let stored = self.watermarks.get_watermark(&self.source_name).await?;
        let since = stored.unwrap_or_else(|| self.clock.now() - self.lookback);
        debug!(%since, resumed = stored.is_some(), "poll cycle starting");

        let mut summary = PollSummary::default();
        let mut high_water = since;
        let mut page_token: Option<String> = None;

        loop {
            let page = tokio::time::timeout(
                self.fetch_timeout,
                self.source.fetch_updated_since(since, page_token.as_deref()),
            )
            .await
            .map_err(|_| PollError::Timeout(self.fetch_timeout))??;
            summary.pages += 1;

            for item in page.items {
                summary.processed += 1;
                let (outcome, seen_at) = self.process_item(item).await;
                if let Some(ts) = seen_at {
                    high_water = high_water.max(ts);
                }
                match outcome {
                    ItemOutcome::Changed => summary.changed += 1,
                    ItemOutcome::Unchanged => {}
                    ItemOutcome::Skipped => summary.skipped += 1,
                }
            }

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        if high_water > since {
            self.watermarks
                .set_watermark(&self.source_name, high_water)
                .await?;
            summary.advanced = true;
            summary.new_watermark = Some(high_water);
        } else {
            summary.new_watermark = stored;
        }

        info!(
            pages = summary.pages,
            processed = summary.processed,
            changed = summary.changed,
            skipped = summary.skipped,
            advanced = summary.advanced,
            "poll cycle complete"
        );
        Ok(summary)
    }

    /// Normalize, upsert and announce one item. Every failure here is
    /// item-local. The timestamp is returned for any item that normalized.
    async fn process_item(&self, raw: Value) -> (ItemOutcome, Option<DateTime<Utc>>) {
        let listing = match normalize_listing(&raw) {
            Ok(listing) => listing,
            Err(e) => {
                warn!(error = %e, "skipping malformed feed item");
                return (ItemOutcome::Skipped, None);
            }
        };
        let id = listing.id.clone();
        let updated_at = listing.updated_at;

        let outcome = match self.repo.upsert(listing).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(listing_id = %id, error = %e, "listing upsert failed");
                return (ItemOutcome::Skipped, Some(updated_at));
            }
        };
        if outcome.is_noop() {
            return (ItemOutcome::Unchanged, Some(updated_at));
        }

        let event = PipelineEvent::ListingChanged(ListingChanged {
            id: id.clone(),
            updated_at,
            change: outcome.change,
            dirty: outcome.dirty.into_iter().collect(),
        });
        match self.publisher.publish(Message::new(event)).await {
            Ok(report) => {
                if !report.all_delivered() {
                    warn!(listing_id = %id, failed = ?report.failed, "some handlers failed");
                }
                (ItemOutcome::Changed, Some(updated_at))
            }
            Err(e) => {
                warn!(listing_id = %id, error = %e, "publishing listing change failed");
                (ItemOutcome::Skipped, Some(updated_at))
            }
        }
    }
}
