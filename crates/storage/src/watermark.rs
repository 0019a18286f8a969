//! Watermark stores.
//!
//! A watermark only moves forward: a `set_watermark` older than the stored
//! position is ignored and logged.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use rentflow_core::{StoreError, WatermarkStore};

#[derive(Default)]
pub struct MemoryWatermarkStore {
    positions: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl MemoryWatermarkStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WatermarkStore for MemoryWatermarkStore {
    async fn get_watermark(&self, source: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self.positions.lock().await.get(source).copied())
    }

    async fn set_watermark(&self, source: &str, position: DateTime<Utc>) -> Result<(), StoreError> {
        let mut positions = self.positions.lock().await;
        match positions.get(source) {
            Some(current) if *current > position => {
                warn!(source, %current, attempted = %position, "ignoring watermark regression");
            }
            _ => {
                positions.insert(source.to_string(), position);
            }
        }
        Ok(())
    }
}

/// Watermarks persisted as a single JSON object `{source: rfc3339}`.
///
/// Writes go to a sibling temp file which is then renamed over the target,
/// so a crash never leaves a half-written file behind.
pub struct FileWatermarkStore {
    path: PathBuf,
    positions: Mutex<BTreeMap<String, DateTime<Utc>>>,
}

impl FileWatermarkStore {
    /// Open (or lazily create) the store at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let positions = match tokio::fs::read_to_string(&path).await {
            Ok(raw) if raw.trim().is_empty() => BTreeMap::new(),
            Ok(raw) => serde_json::from_str(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), sources = positions.len(), "opened watermark store");
        Ok(Self {
            path,
            positions: Mutex::new(positions),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, positions: &BTreeMap<String, DateTime<Utc>>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let body = serde_json::to_vec_pretty(positions)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &body).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl WatermarkStore for FileWatermarkStore {
    async fn get_watermark(&self, source: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self.positions.lock().await.get(source).copied())
    }

    async fn set_watermark(&self, source: &str, position: DateTime<Utc>) -> Result<(), StoreError> {
        let mut positions = self.positions.lock().await;
        if let Some(current) = positions.get(source) {
            if *current > position {
                warn!(source, %current, attempted = %position, "ignoring watermark regression");
                return Ok(());
            }
        }
        let mut next = positions.clone();
        next.insert(source.to_string(), position);
        self.persist(&next).await?;
        *positions = next;
        debug!(source, %position, "watermark persisted");
        Ok(())
    }
}
