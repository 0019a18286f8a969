use rentflow_core::StoreError;

/// Error type for a single entity's recompute.
#[derive(Debug, thiserror::Error)]
pub enum ComputeError {
    /// Not enough input to produce any artifact. Fails this entity only.
    #[error("No estimate possible for {0}")]
    NoEstimate(String),
    /// Cache or repository failure. Worth retrying.
    #[error("Transient store failure: {0}")]
    Transient(#[from] StoreError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ComputeError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}
