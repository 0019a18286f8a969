//! In-process publish/subscribe bus.
//!
//! One explicit [`EventBus`] instance holds `topic → ordered handler list`
//! and is injected wherever events are produced or consumed.
//!
//! Delivery semantics:
//! - every handler subscribed to the topic runs, in subscription order,
//!   before `publish` returns;
//! - a handler that errors or panics is logged and skipped, siblings still run;
//! - there is no exactly-once guarantee, so handlers must be idempotent.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures::FutureExt;
use tracing::{debug, error, warn};

use crate::error::EisenbahnError;
use crate::message::Message;
use crate::traits::{EventHandler, EventPublisher};

/// Outcome of a single publish.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub topic: String,
    /// Handlers that completed successfully.
    pub delivered: usize,
    /// Names of handlers that returned an error or panicked.
    pub failed: Vec<String>,
}

impl PublishReport {
    pub fn all_delivered(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Default)]
pub struct EventBus {
    handlers: RwLock<HashMap<String, Vec<Arc<dyn EventHandler>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `topic`. Handlers fire in registration order.
    pub fn subscribe(&self, topic: impl Into<String>, handler: Arc<dyn EventHandler>) {
        let topic = topic.into();
        debug!(topic = %topic, handler = handler.name(), "subscribed handler");
        let mut handlers = self.handlers.write().unwrap_or_else(|p| p.into_inner());
        handlers.entry(topic).or_default().push(handler);
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        let handlers = self.handlers.read().unwrap_or_else(|p| p.into_inner());
        handlers.get(topic).map_or(0, Vec::len)
    }

    /// Decode a raw JSON envelope at the boundary, then publish it.
    ///
    /// Unknown or malformed events are logged and returned as errors;
    /// nothing is delivered for them.
    pub async fn publish_json(&self, raw: &str) -> Result<PublishReport, EisenbahnError> {
        match Message::from_json(raw) {
            Ok(message) => self.deliver(message).await,
            Err(e) => {
                warn!(error = %e, "rejected inbound message");
                Err(e)
            }
        }
    }

    async fn deliver(&self, message: Message) -> Result<PublishReport, EisenbahnError> {
        // Snapshot the list so no lock is held across handler awaits.
        let targets: Vec<Arc<dyn EventHandler>> = {
            let handlers = self.handlers.read().unwrap_or_else(|p| p.into_inner());
            handlers.get(&message.topic).cloned().unwrap_or_default()
        };

        let mut report = PublishReport {
            topic: message.topic.clone(),
            ..PublishReport::default()
        };

        if targets.is_empty() {
            debug!(topic = %message.topic, "no subscribers for topic");
            return Ok(report);
        }

        for handler in targets {
            let outcome = AssertUnwindSafe(handler.handle(&message))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(e)) => {
                    warn!(
                        topic = %message.topic,
                        handler = handler.name(),
                        correlation_id = %message.correlation_id,
                        error = %e,
                        "handler failed"
                    );
                    report.failed.push(handler.name().to_string());
                }
                Err(_) => {
                    error!(
                        topic = %message.topic,
                        handler = handler.name(),
                        correlation_id = %message.correlation_id,
                        "handler panicked"
                    );
                    report.failed.push(handler.name().to_string());
                }
            }
        }

        debug!(
            topic = %report.topic,
            delivered = report.delivered,
            failed = report.failed.len(),
            "published message"
        );
        Ok(report)
    }
}

#[async_trait]
impl EventPublisher for EventBus {
    async fn publish(&self, message: Message) -> Result<PublishReport, EisenbahnError> {
        self.deliver(message).await
    }
}
