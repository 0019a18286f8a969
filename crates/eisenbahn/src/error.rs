use thiserror::Error;

/// Errors that can occur in the eisenbahn messaging layer.
#[derive(Debug, Error)]
pub enum EisenbahnError {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("unknown event type: {0}")]
    UnknownEvent(String),

    #[error("malformed event: {0}")]
    Malformed(String),

    #[error("topic mismatch: envelope says '{envelope}', event is '{event}'")]
    TopicMismatch { envelope: String, event: String },

    #[error("handler '{handler}' failed: {message}")]
    Handler { handler: String, message: String },

    #[error("handler '{0}' panicked")]
    HandlerPanicked(String),

    #[error("timeout after {0:?}")]
    Timeout(std::time::Duration),
}

impl EisenbahnError {
    pub fn handler(handler: &str, message: impl Into<String>) -> Self {
        Self::Handler {
            handler: handler.to_string(),
            message: message.into(),
        }
    }
}
