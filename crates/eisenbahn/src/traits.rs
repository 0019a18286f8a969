use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;

use crate::bus::PublishReport;
use crate::error::EisenbahnError;
use crate::message::Message;

/// Publishes messages to every handler subscribed to the message's topic.
///
/// Producers (the poller, recompute stages, the worker runner) depend on this
/// trait rather than on a concrete bus.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a message. Returns once every subscribed handler has run.
    async fn publish(&self, message: Message) -> Result<PublishReport, EisenbahnError>;
}

/// Blanket implementation so `Arc<dyn EventPublisher>` can be used directly.
#[async_trait]
impl<T: EventPublisher + ?Sized> EventPublisher for Arc<T> {
    async fn publish(&self, message: Message) -> Result<PublishReport, EisenbahnError> {
        (**self).publish(message).await
    }
}

/// A subscriber callback. Must tolerate duplicate and out-of-order delivery.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Name used when logging handler failures.
    fn name(&self) -> &str;

    async fn handle(&self, message: &Message) -> Result<(), EisenbahnError>;
}

// ── Closure handlers ─────────────────────────────────────────────────

/// Boxed async function that handles an incoming message.
pub type MessageHandler = Box<
    dyn Fn(Message) -> Pin<Box<dyn Future<Output = Result<(), EisenbahnError>> + Send>>
        + Send
        + Sync,
>;

/// [`EventHandler`] backed by a closure.
pub struct FnHandler {
    name: String,
    handler: MessageHandler,
}

#[async_trait]
impl EventHandler for FnHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, message: &Message) -> Result<(), EisenbahnError> {
        (self.handler)(message.clone()).await
    }
}

/// Wrap a closure as a shareable handler.
///
/// ```ignore
/// bus.subscribe(topics::RENT_ESTIMATED, handler_fn("audit", |msg| async move {
///     println!("got: {}", msg.topic);
///     Ok(())
/// }));
/// ```
pub fn handler_fn<F, Fut>(name: impl Into<String>, handler: F) -> Arc<dyn EventHandler>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), EisenbahnError>> + Send + 'static,
{
    Arc::new(FnHandler {
        name: name.into(),
        handler: Box::new(move |msg| Box::pin(handler(msg))),
    })
}
