pub mod bus;
pub mod error;
pub mod message;
pub mod messages;
pub mod traits;
pub mod worker;

pub use bus::{EventBus, PublishReport};
pub use error::EisenbahnError;
pub use message::Message;
pub use messages::events;
pub use messages::topics;
pub use messages::PipelineEvent;
pub use traits::{handler_fn, EventHandler, EventPublisher, FnHandler};
pub use worker::{Worker, WorkerRunner};
