use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

use crate::error::SourceError;
use crate::normalize::updated_at_of;

/// One page of raw feed items.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourcePage {
    pub items: Vec<Value>,
    /// Present when more pages follow.
    pub next_page_token: Option<String>,
}

/// A time-ordered upstream feed that can be read incrementally.
#[async_trait]
pub trait ListingSource: Send + Sync {
    fn name(&self) -> &str;

    /// Items updated at or after `since`. Pass the previous page's token to
    /// continue; `None` starts from the first page.
    async fn fetch_updated_since(
        &self,
        since: DateTime<Utc>,
        page_token: Option<&str>,
    ) -> Result<SourcePage, SourceError>;
}

/// Feed backed by a local JSON file.
///
/// The file is either an array of items or an object with a `listings`
/// array. It is re-read on every fetch, so edits show up on the next cycle.
/// Page tokens are offsets into the filtered, time-ordered item list.
pub struct FileFeedSource {
    path: PathBuf,
    page_size: usize,
}

impl FileFeedSource {
    pub fn new(path: impl AsRef<Path>, page_size: usize) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            page_size: page_size.max(1),
        }
    }

    async fn load(&self) -> Result<Vec<Value>, SourceError> {
        let raw = tokio::fs::read_to_string(&self.path).await?;
        let parsed: Value = serde_json::from_str(&raw)
            .map_err(|e| SourceError::Parse(format!("{}: {e}", self.path.display())))?;
        match parsed {
            Value::Array(items) => Ok(items),
            Value::Object(mut obj) => match obj.remove("listings") {
                Some(Value::Array(items)) => Ok(items),
                _ => Err(SourceError::Parse(format!(
                    "{}: expected an array or an object with 'listings'",
                    self.path.display()
                ))),
            },
            _ => Err(SourceError::Parse(format!(
                "{}: expected an array or an object with 'listings'",
                self.path.display()
            ))),
        }
    }
}

#[async_trait]
impl ListingSource for FileFeedSource {
    fn name(&self) -> &str {
        "file-feed"
    }

    async fn fetch_updated_since(
        &self,
        since: DateTime<Utc>,
        page_token: Option<&str>,
    ) -> Result<SourcePage, SourceError> {
        let offset = match page_token {
            None => 0,
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| SourceError::BadPageToken(token.to_string()))?,
        };

        // Items without a readable timestamp are passed through so the
        // poller can report them.
        let mut items: Vec<(Option<DateTime<Utc>>, Value)> = self
            .load()
            .await?
            .into_iter()
            .map(|item| (updated_at_of(&item), item))
            .filter(|(ts, _)| ts.map_or(true, |ts| ts >= since))
            .collect();
        items.sort_by_key(|(ts, _)| *ts);

        let total = items.len();
        let page: Vec<Value> = items
            .into_iter()
            .skip(offset)
            .take(self.page_size)
            .map(|(_, item)| item)
            .collect();
        let next = offset + page.len();
        debug!(path = %self.path.display(), offset, returned = page.len(), total, "feed page read");

        Ok(SourcePage {
            items: page,
            next_page_token: (next < total).then(|| next.to_string()),
        })
    }
}
