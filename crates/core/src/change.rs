//! Change vocabulary shared by the poller, the bus and the debouncer.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A dirty-field tag carried on change events.
///
/// The known vocabulary is fixed; anything else is preserved verbatim in
/// [`DirtyField::Other`] so newer producers never get their tags dropped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DirtyField {
    Price,
    Status,
    Fees,
    Tax,
    Media,
    Address,
    Other(String),
}

impl DirtyField {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Price => "price",
            Self::Status => "status",
            Self::Fees => "fees",
            Self::Tax => "tax",
            Self::Media => "media",
            Self::Address => "address",
            Self::Other(tag) => tag,
        }
    }
}

impl From<&str> for DirtyField {
    fn from(tag: &str) -> Self {
        match tag {
            "price" => Self::Price,
            "status" => Self::Status,
            "fees" => Self::Fees,
            "tax" => Self::Tax,
            "media" => Self::Media,
            "address" => Self::Address,
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<String> for DirtyField {
    fn from(tag: String) -> Self {
        match Self::from(tag.as_str()) {
            Self::Other(_) => Self::Other(tag),
            known => known,
        }
    }
}

impl From<DirtyField> for String {
    fn from(field: DirtyField) -> Self {
        match field {
            DirtyField::Other(tag) => tag,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for DirtyField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an upsert did to the stored entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Create,
    Update,
    StatusChange,
    Noop,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::StatusChange => "status_change",
            Self::Noop => "noop",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of writing a normalized entity to its repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub change: ChangeKind,
    pub dirty: BTreeSet<DirtyField>,
}

impl UpsertOutcome {
    pub fn noop() -> Self {
        Self {
            change: ChangeKind::Noop,
            dirty: BTreeSet::new(),
        }
    }

    pub fn is_noop(&self) -> bool {
        self.change == ChangeKind::Noop
    }
}
