use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EisenbahnError;
use crate::messages::PipelineEvent;

/// Envelope for everything published on the bus.
///
/// The `topic` is derived from the event and used for routing, while
/// `correlation_id` ties a follow-on event back to the change that caused it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Routing topic (e.g. "listing.changed", "rent.estimated").
    pub topic: String,

    /// Typed payload.
    pub event: PipelineEvent,

    /// When this message was created.
    pub timestamp: DateTime<Utc>,

    /// Correlation ID for tracing a change through the stage chain.
    pub correlation_id: Uuid,

    /// Schema version for forward-compatible evolution.
    #[serde(default = "default_version")]
    pub version: u16,
}

/// Default version for messages that omit the field (backward compat).
fn default_version() -> u16 {
    1
}

impl Message {
    /// Wrap an event in a fresh envelope.
    pub fn new(event: PipelineEvent) -> Self {
        Self::with_correlation(event, Uuid::new_v4())
    }

    /// Create a message with an explicit correlation ID (for follow-on events).
    pub fn with_correlation(event: PipelineEvent, correlation_id: Uuid) -> Self {
        Self {
            topic: event.topic().to_string(),
            event,
            timestamp: Utc::now(),
            correlation_id,
            version: 1,
        }
    }

    /// Serialize this envelope to JSON.
    pub fn to_json(&self) -> Result<String, EisenbahnError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode an envelope at the bus boundary.
    ///
    /// Unknown event types are rejected with [`EisenbahnError::UnknownEvent`]
    /// and an envelope whose topic disagrees with its event is refused.
    pub fn from_json(raw: &str) -> Result<Self, EisenbahnError> {
        let mut value: serde_json::Value = serde_json::from_str(raw)?;
        let event_value = value
            .get_mut("event")
            .map(serde_json::Value::take)
            .ok_or_else(|| EisenbahnError::Malformed("envelope has no 'event'".into()))?;
        let event = PipelineEvent::from_value(event_value)?;

        #[derive(Deserialize)]
        struct Header {
            topic: String,
            timestamp: DateTime<Utc>,
            correlation_id: Uuid,
            #[serde(default = "default_version")]
            version: u16,
        }
        let header: Header =
            serde_json::from_value(value).map_err(|e| EisenbahnError::Malformed(e.to_string()))?;

        if header.topic != event.topic() {
            return Err(EisenbahnError::TopicMismatch {
                envelope: header.topic,
                event: event.topic().to_string(),
            });
        }

        Ok(Self {
            topic: header.topic,
            event,
            timestamp: header.timestamp,
            correlation_id: header.correlation_id,
            version: header.version,
        })
    }
}
