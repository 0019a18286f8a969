use thiserror::Error;

/// Failures from the shared stores (cache, repositories, watermarks).
///
/// Every variant is treated as transient by callers: the orchestrator
/// retries with backoff, a poll cycle aborts without advancing.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),
}

/// Failures from an external lookup (priors, comps, geocoder, tax table).
///
/// Lookups degrade: callers log these and continue with the input missing.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LookupError {
    #[error("{source_name} unavailable: {message}")]
    Unavailable { source_name: String, message: String },

    #[error("{source_name} timed out after {timeout_ms}ms")]
    Timeout { source_name: String, timeout_ms: u64 },

    #[error("{source_name} returned malformed data: {message}")]
    Malformed { source_name: String, message: String },
}

impl LookupError {
    pub fn unavailable(source_name: &str, message: impl Into<String>) -> Self {
        Self::Unavailable {
            source_name: source_name.to_string(),
            message: message.into(),
        }
    }
}

/// Startup configuration failures. Always fatal.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}
