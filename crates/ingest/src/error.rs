use std::time::Duration;

use thiserror::Error;

use rentflow_core::StoreError;

/// Failure fetching a page from the upstream feed.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid page token: {0}")]
    BadPageToken(String),

    #[error("Source unavailable: {0}")]
    Unavailable(String),
}

/// A raw feed item that cannot become a listing snapshot.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NormalizeError {
    #[error("item is not a JSON object")]
    NotAnObject,

    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error("invalid value for '{field}': {message}")]
    Invalid { field: &'static str, message: String },
}

/// Cycle-level poll failure. The watermark is never advanced on any of these.
#[derive(Error, Debug)]
pub enum PollError {
    #[error("page fetch failed: {0}")]
    Fetch(#[from] SourceError),

    #[error("page fetch timed out after {0:?}")]
    Timeout(Duration),

    #[error("watermark store failed: {0}")]
    Store(#[from] StoreError),

    /// Too many consecutive failed cycles. Fatal to the poll loop.
    #[error("circuit open after {failures} consecutive failures (last: {last})")]
    CircuitOpen { failures: u32, last: String },
}
