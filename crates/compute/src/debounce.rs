//! Per-entity debounce gate.
//!
//! Bursts of low-priority changes for one entity are coalesced into a single
//! recompute at most one window after the first event. Changes touching an
//! immediate field skip the window. State lives in the shared cache with a
//! TTL equal to the remaining window, so the gate works across processes;
//! a process-local index of open windows backs the periodic [`Debouncer::flush_due`]
//! sweep and the expiry check once the cache entry has lapsed.
//!
//! The cache is used as a throttle, not a lock: two concurrent deciders may
//! both proceed, which costs one extra recompute and never loses one.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use rentflow_core::config::DebounceConfig;
use rentflow_core::{CachePort, DirtyField, SharedClock, StoreError};

use crate::error::ComputeError;

/// Window length plus the fields that bypass it.
#[derive(Debug, Clone, PartialEq)]
pub struct DebouncePolicy {
    pub window: Duration,
    pub immediate_fields: BTreeSet<DirtyField>,
}

impl From<&DebounceConfig> for DebouncePolicy {
    fn from(config: &DebounceConfig) -> Self {
        Self {
            window: config.window(),
            immediate_fields: config.immediate_set(),
        }
    }
}

impl Default for DebouncePolicy {
    fn default() -> Self {
        Self::from(&DebounceConfig::default())
    }
}

/// An open debounce window for one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebounceState {
    pub entity_id: String,
    pub window_start_at: DateTime<Utc>,
    pub last_event_at: DateTime<Utc>,
    pub accumulated_dirty_fields: BTreeSet<DirtyField>,
    pub event_count: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DebounceReason {
    ImmediateField(DirtyField),
    Started,
    Extended,
    Expired,
    Flushed,
}

impl fmt::Display for DebounceReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ImmediateField(field) => write!(f, "immediate_field: {field}"),
            Self::Started => f.write_str("debounce_started"),
            Self::Extended => f.write_str("debounce_extended"),
            Self::Expired => f.write_str("debounce_expired"),
            Self::Flushed => f.write_str("debounce_flushed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DebounceDecision {
    pub proceed: bool,
    pub reason: DebounceReason,
    /// The window as it stands after this event. On `proceed`, this is the
    /// merged context for the single recompute.
    pub state: Option<DebounceState>,
}

impl DebounceDecision {
    /// Every dirty field seen in the window, the triggering event included.
    pub fn dirty_fields(&self) -> BTreeSet<DirtyField> {
        self.state
            .as_ref()
            .map(|s| s.accumulated_dirty_fields.clone())
            .unwrap_or_default()
    }
}

pub struct Debouncer {
    policy: DebouncePolicy,
    namespace: String,
    cache: Arc<dyn CachePort>,
    clock: SharedClock,
    pending: Mutex<HashMap<String, DebounceState>>,
}

impl Debouncer {
    /// `namespace` keeps stages that share a cache from seeing each other's windows.
    pub fn new(
        policy: DebouncePolicy,
        namespace: impl Into<String>,
        cache: Arc<dyn CachePort>,
        clock: SharedClock,
    ) -> Self {
        Self {
            policy,
            namespace: namespace.into(),
            cache,
            clock,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &DebouncePolicy {
        &self.policy
    }

    fn key(&self, entity_id: &str) -> String {
        format!("debounce:{}:{}", self.namespace, entity_id)
    }

    /// Decide whether a change for `entity_id` should be processed now.
    pub async fn should_process(
        &self,
        entity_id: &str,
        dirty_fields: &BTreeSet<DirtyField>,
    ) -> Result<DebounceDecision, ComputeError> {
        let now = self.clock.now();
        let key = self.key(entity_id);
        let existing = self.load(entity_id, &key).await?;

        let immediate = dirty_fields
            .iter()
            .find(|f| self.policy.immediate_fields.contains(*f))
            .cloned();
        if let Some(field) = immediate {
            let state = merge(existing, entity_id, dirty_fields, now);
            self.clear(entity_id, &key).await?;
            debug!(entity_id, field = %field, "immediate field bypasses debounce");
            return Ok(DebounceDecision {
                proceed: true,
                reason: DebounceReason::ImmediateField(field),
                state: Some(state),
            });
        }

        let Some(current) = existing else {
            let state = merge(None, entity_id, dirty_fields, now);
            self.store(&key, &state, self.policy.window).await?;
            debug!(entity_id, "debounce window started");
            return Ok(DebounceDecision {
                proceed: false,
                reason: DebounceReason::Started,
                state: Some(state),
            });
        };

        let elapsed = now - current.window_start_at;
        let state = merge(Some(current), entity_id, dirty_fields, now);

        if elapsed >= self.policy.window {
            self.clear(entity_id, &key).await?;
            debug!(entity_id, events = state.event_count, "debounce window expired");
            return Ok(DebounceDecision {
                proceed: true,
                reason: DebounceReason::Expired,
                state: Some(state),
            });
        }

        // The window is never reset: re-persist with whatever is left of it.
        self.store(&key, &state, self.policy.window - elapsed).await?;
        debug!(entity_id, events = state.event_count, "debounce window extended");
        Ok(DebounceDecision {
            proceed: false,
            reason: DebounceReason::Extended,
            state: Some(state),
        })
    }

    /// Close every window that has run its full length without a trigger.
    ///
    /// Every due window is returned even when the cache cannot be cleared.
    pub async fn flush_due(&self) -> Vec<DebounceDecision> {
        let now = self.clock.now();
        let due: Vec<DebounceState> = {
            let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
            let ids: Vec<String> = pending
                .values()
                .filter(|s| now - s.window_start_at >= self.policy.window)
                .map(|s| s.entity_id.clone())
                .collect();
            ids.iter().filter_map(|id| pending.remove(id)).collect()
        };

        let mut decisions = Vec::with_capacity(due.len());
        for state in due {
            // The window is closed either way; a stale entry lapses by TTL.
            if let Err(e) = self.cache.delete(&self.key(&state.entity_id)).await {
                warn!(entity_id = %state.entity_id, error = %e, "could not clear flushed debounce state");
            }
            debug!(entity_id = %state.entity_id, events = state.event_count, "debounce window flushed");
            decisions.push(DebounceDecision {
                proceed: true,
                reason: DebounceReason::Flushed,
                state: Some(state),
            });
        }
        decisions
    }

    /// Number of windows this process currently has open.
    pub fn open_windows(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    async fn load(&self, entity_id: &str, key: &str) -> Result<Option<DebounceState>, ComputeError> {
        if let Some(raw) = self.cache.get(key).await? {
            match serde_json::from_value::<DebounceState>(raw) {
                Ok(state) => return Ok(Some(state)),
                Err(e) => warn!(entity_id, error = %e, "discarding unreadable debounce state"),
            }
        }
        // The cache entry lapses exactly at window end; the local index still
        // knows about the window so it can be closed instead of restarted.
        let pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
        Ok(pending.get(entity_id).cloned())
    }

    async fn store(&self, key: &str, state: &DebounceState, ttl: Duration) -> Result<(), ComputeError> {
        let ttl = ttl
            .to_std()
            .map_err(|e| StoreError::Unavailable(format!("invalid debounce ttl: {e}")))?;
        self.cache.set(key, serde_json::to_value(state)?, ttl).await?;
        self.pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(state.entity_id.clone(), state.clone());
        Ok(())
    }

    async fn clear(&self, entity_id: &str, key: &str) -> Result<(), ComputeError> {
        self.pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(entity_id);
        self.cache.delete(key).await?;
        Ok(())
    }
}

fn merge(
    existing: Option<DebounceState>,
    entity_id: &str,
    dirty_fields: &BTreeSet<DirtyField>,
    now: DateTime<Utc>,
) -> DebounceState {
    match existing {
        Some(mut state) => {
            state.accumulated_dirty_fields.extend(dirty_fields.iter().cloned());
            state.last_event_at = now;
            state.event_count += 1;
            state
        }
        None => DebounceState {
            entity_id: entity_id.to_string(),
            window_start_at: now,
            last_event_at: now,
            accumulated_dirty_fields: dirty_fields.clone(),
            event_count: 1,
        },
    }
}
