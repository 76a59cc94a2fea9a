//! Durable fan-out for published events.
//!
//! The in-process [`EventBus`](crate::events::EventBus) only reaches handlers
//! living in the same process. When other processes need the same events, a
//! [`MessageQueue`] can be attached to the bus: every published event is then
//! also written to the `playbook.events` topic as a JSON
//! [`EventEnvelope`](crate::events::EventEnvelope).
//!
//! Forwarding is additive. A failing queue is logged and counted by the bus
//! and never blocks or fails in-process dispatch.
//!
//! # Implementations
//!
//! - [`InMemoryMessageQueue`]: keeps messages in memory, for tests and local runs.
//! - Streams backed by Redis, Kafka and the like live outside this crate and
//!   only need to implement the trait.

pub mod error;
pub mod memory;
pub mod types;

pub use error::{MessageQueueError, MessageQueueResult};
pub use memory::InMemoryMessageQueue;
pub use types::{Message, MessageId, QueueHealth};

use async_trait::async_trait;

/// A durable, multi-process message stream.
///
/// Implementations must be `Send + Sync` so they can be shared as
/// `Arc<dyn MessageQueue>` between the bus and its forwarding tasks.
#[async_trait]
pub trait MessageQueue: Send + Sync + 'static {
    /// Appends `payload` to `topic` and returns the backend's message id.
    async fn publish(&self, topic: &str, payload: &[u8]) -> MessageQueueResult<MessageId>;

    /// Reports connectivity and backlog.
    async fn health_check(&self) -> MessageQueueResult<QueueHealth>;
}
