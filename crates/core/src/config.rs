//! Pipeline configuration.
//!
//! Parsed from `rentflow.toml`, then overridden by `RENTFLOW_*` environment
//! variables (a `.env` file is honoured via [`load_dotenv`]). Every field has
//! a default so an empty file is a valid config.

use std::collections::BTreeSet;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::Backoff;
use crate::change::DirtyField;
use crate::error::ConfigError;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Longest accepted debounce window: one day.
pub const MAX_DEBOUNCE_WINDOW_SECS: u64 = 86_400;

/// Longest accepted first-poll lookback: one year.
pub const MAX_LOOKBACK_HOURS: u64 = 8_760;

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RentflowConfig {
    /// Debounce policy shared by every stage unless overridden.
    #[serde(default)]
    pub debounce: DebounceConfig,
    #[serde(default)]
    pub rent: RentConfig,
    #[serde(default)]
    pub enrichment: EnrichmentConfig,
    #[serde(default)]
    pub poller: PollerConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub watermark: WatermarkConfig,
    #[serde(default)]
    pub worker: WorkerSettings,
}

// ── Section configs ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebounceConfig {
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// Fields that bypass the window entirely.
    #[serde(default = "default_immediate_fields")]
    pub immediate_fields: Vec<DirtyField>,
}

fn default_window_secs() -> u64 {
    30
}

fn default_immediate_fields() -> Vec<DirtyField> {
    vec![
        DirtyField::Price,
        DirtyField::Fees,
        DirtyField::Tax,
        DirtyField::Address,
    ]
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            immediate_fields: default_immediate_fields(),
        }
    }
}

impl DebounceConfig {
    pub fn window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.window_secs.min(MAX_DEBOUNCE_WINDOW_SECS) as i64)
    }

    pub fn immediate_set(&self) -> BTreeSet<DirtyField> {
        self.immediate_fields.iter().cloned().collect()
    }
}

/// Rent-estimate stage policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RentConfig {
    /// Relative p50 move that counts as a material change (inclusive).
    #[serde(default = "default_material_change_threshold")]
    pub material_change_threshold: f64,
    /// Comps kept on the stored artifact for auditability.
    #[serde(default = "default_max_stored_comps")]
    pub max_stored_comps: usize,
    /// Stage-specific debounce override.
    #[serde(default)]
    pub debounce: Option<DebounceConfig>,
}

fn default_material_change_threshold() -> f64 {
    0.03
}

fn default_max_stored_comps() -> usize {
    15
}

impl Default for RentConfig {
    fn default() -> Self {
        Self {
            material_change_threshold: default_material_change_threshold(),
            max_stored_comps: default_max_stored_comps(),
            debounce: None,
        }
    }
}

/// Enrichment stage policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentConfig {
    /// Keys stripped (at any depth) before the structural diff.
    #[serde(default = "default_volatile_fields")]
    pub volatile_fields: Vec<String>,
    #[serde(default)]
    pub debounce: Option<DebounceConfig>,
}

fn default_volatile_fields() -> Vec<String> {
    vec![crate::artifact::COMPUTED_AT_FIELD.to_string()]
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            volatile_fields: default_volatile_fields(),
            debounce: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollerConfig {
    /// Watermark key for the polled feed.
    #[serde(default = "default_source_name")]
    pub source_name: String,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Deadline for a single page fetch.
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    /// How far back the first cycle looks when no watermark exists.
    #[serde(default = "default_lookback_hours")]
    pub lookback_hours: u64,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Consecutive failed cycles before the poller halts.
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
}

fn default_source_name() -> String {
    "listings-feed".into()
}

fn default_interval_secs() -> u64 {
    60
}

fn default_fetch_timeout_secs() -> u64 {
    30
}

fn default_lookback_hours() -> u64 {
    24
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_max_ms() -> u64 {
    300_000
}

fn default_max_consecutive_failures() -> u32 {
    5
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            source_name: default_source_name(),
            interval_secs: default_interval_secs(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            lookback_hours: default_lookback_hours(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            max_consecutive_failures: default_max_consecutive_failures(),
        }
    }
}

impl PollerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn lookback(&self) -> chrono::Duration {
        chrono::Duration::hours(self.lookback_hours.min(MAX_LOOKBACK_HOURS) as i64)
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_max_ms),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of live keys before LRU eviction.
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
    /// TTL for cached external lookups.
    #[serde(default = "default_lookup_ttl_secs")]
    pub lookup_ttl_secs: u64,
}

fn default_cache_capacity() -> usize {
    10_000
}

fn default_lookup_ttl_secs() -> u64 {
    3_600
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
            lookup_ttl_secs: default_lookup_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WatermarkConfig {
    /// JSON file holding watermarks. `None` keeps them in memory only.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSettings {
    #[serde(default = "default_health_interval_secs")]
    pub health_interval_secs: u64,
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
    /// Tick that force-flushes debounce windows with no further input.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Attempts per recompute when the stores fail transiently.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
}

fn default_health_interval_secs() -> u64 {
    30
}

fn default_shutdown_timeout_secs() -> u64 {
    10
}

fn default_sweep_interval_secs() -> u64 {
    5
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_base_ms() -> u64 {
    200
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            health_interval_secs: default_health_interval_secs(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            retry_attempts: default_retry_attempts(),
            retry_base_ms: default_retry_base_ms(),
        }
    }
}

impl WorkerSettings {
    pub fn retry_backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.retry_base_ms),
            Duration::from_millis(self.retry_base_ms.saturating_mul(16)),
        )
    }
}

// ── Loading & Validation ──────────────────────────────────────

impl RentflowConfig {
    /// Parse config from a TOML string, apply env overrides and validate.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Debounce policy for the rent-estimate stage.
    pub fn rent_debounce(&self) -> &DebounceConfig {
        self.rent.debounce.as_ref().unwrap_or(&self.debounce)
    }

    /// Debounce policy for the enrichment stage.
    pub fn enrichment_debounce(&self) -> &DebounceConfig {
        self.enrichment.debounce.as_ref().unwrap_or(&self.debounce)
    }

    /// Apply `RENTFLOW_SECTION_KEY` environment overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(env_opt);
    }

    /// Apply overrides from an arbitrary key lookup.
    ///
    /// - `RENTFLOW_DEBOUNCE_WINDOW_SECS` → `debounce.window_secs`
    /// - `RENTFLOW_RENT_MATERIAL_CHANGE_THRESHOLD` → `rent.material_change_threshold`
    /// - `RENTFLOW_POLLER_SOURCE_NAME` → `poller.source_name`
    /// - `RENTFLOW_POLLER_INTERVAL_SECS` → `poller.interval_secs`
    /// - `RENTFLOW_POLLER_FETCH_TIMEOUT_SECS` → `poller.fetch_timeout_secs`
    /// - `RENTFLOW_WATERMARK_PATH` → `watermark.path`
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("RENTFLOW_DEBOUNCE_WINDOW_SECS").and_then(|v| v.parse().ok()) {
            self.debounce.window_secs = v;
        }
        if let Some(v) =
            lookup("RENTFLOW_RENT_MATERIAL_CHANGE_THRESHOLD").and_then(|v| v.parse().ok())
        {
            self.rent.material_change_threshold = v;
        }
        if let Some(v) = lookup("RENTFLOW_POLLER_SOURCE_NAME") {
            self.poller.source_name = v;
        }
        if let Some(v) = lookup("RENTFLOW_POLLER_INTERVAL_SECS").and_then(|v| v.parse().ok()) {
            self.poller.interval_secs = v;
        }
        if let Some(v) =
            lookup("RENTFLOW_POLLER_FETCH_TIMEOUT_SECS").and_then(|v| v.parse().ok())
        {
            self.poller.fetch_timeout_secs = v;
        }
        if let Some(v) = lookup("RENTFLOW_WATERMARK_PATH") {
            self.watermark.path = Some(PathBuf::from(v));
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (stage, debounce) in [
            ("rent", self.rent_debounce()),
            ("enrichment", self.enrichment_debounce()),
        ] {
            if debounce.window_secs == 0 {
                return Err(ConfigError::Invalid(format!(
                    "{stage}: debounce window_secs must be > 0"
                )));
            }
            if debounce.window_secs > MAX_DEBOUNCE_WINDOW_SECS {
                return Err(ConfigError::Invalid(format!(
                    "{stage}: debounce window_secs must be <= {MAX_DEBOUNCE_WINDOW_SECS}"
                )));
            }
        }
        let threshold = self.rent.material_change_threshold;
        if !(threshold.is_finite() && threshold >= 0.0) {
            return Err(ConfigError::Invalid(format!(
                "rent.material_change_threshold must be a non-negative number, got {threshold}"
            )));
        }
        if self.poller.source_name.trim().is_empty() {
            return Err(ConfigError::Invalid("poller.source_name is empty".into()));
        }
        if self.poller.lookback_hours > MAX_LOOKBACK_HOURS {
            return Err(ConfigError::Invalid(format!(
                "poller.lookback_hours must be <= {MAX_LOOKBACK_HOURS}"
            )));
        }
        if self.poller.fetch_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "poller.fetch_timeout_secs must be > 0".into(),
            ));
        }
        if self.poller.max_consecutive_failures == 0 {
            return Err(ConfigError::Invalid(
                "poller.max_consecutive_failures must be > 0".into(),
            ));
        }
        if self.cache.capacity == 0 {
            return Err(ConfigError::Invalid("cache.capacity must be > 0".into()));
        }
        if self.worker.retry_attempts == 0 {
            return Err(ConfigError::Invalid(
                "worker.retry_attempts must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded:");
        tracing::info!(
            "  debounce:    window={}s, immediate={:?}",
            self.debounce.window_secs,
            self.debounce.immediate_fields
        );
        tracing::info!(
            "  rent:        threshold={}, max_stored_comps={}",
            self.rent.material_change_threshold,
            self.rent.max_stored_comps
        );
        tracing::info!(
            "  poller:      source={}, interval={}s, timeout={}s",
            self.poller.source_name,
            self.poller.interval_secs,
            self.poller.fetch_timeout_secs
        );
        tracing::info!(
            "  watermark:   {}",
            self.watermark
                .path
                .as_ref()
                .map_or_else(|| "(memory)".to_string(), |p| p.display().to_string())
        );
    }
}
