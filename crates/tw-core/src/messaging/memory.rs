//! In-memory [`MessageQueue`] used by tests and single-process deployments.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::trace;

use super::error::{MessageQueueError, MessageQueueResult};
use super::types::{Message, MessageId, QueueHealth};
use super::MessageQueue;

/// Stores every published message per topic.
///
/// The queue can be switched into a failing state with
/// [`set_failing`](Self::set_failing) to exercise the bus's degraded path.
#[derive(Default)]
pub struct InMemoryMessageQueue {
    topics: Arc<RwLock<HashMap<String, Vec<Message>>>>,
    counter: AtomicU64,
    failing: AtomicBool,
}

impl InMemoryMessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent publishes fail with a connection error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Returns a copy of the messages published to `topic`, oldest first.
    pub async fn messages(&self, topic: &str) -> Vec<Message> {
        self.topics
            .read()
            .await
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    /// Total number of messages accepted across all topics.
    pub fn published_count(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageQueue for InMemoryMessageQueue {
    async fn publish(&self, topic: &str, payload: &[u8]) -> MessageQueueResult<MessageId> {
        if topic.is_empty() {
            return Err(MessageQueueError::InvalidTopic("topic is empty".to_string()));
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(MessageQueueError::Connection(
                "in-memory queue marked as failing".to_string(),
            ));
        }

        let seq = self.counter.fetch_add(1, Ordering::SeqCst);
        let id = MessageId::new(format!("mem-{}", seq));
        let message = Message {
            id: id.clone(),
            topic: topic.to_string(),
            payload: payload.to_vec(),
            timestamp: Utc::now(),
        };

        self.topics
            .write()
            .await
            .entry(topic.to_string())
            .or_default()
            .push(message);
        trace!(topic, message_id = %id, "Stored message");

        Ok(id)
    }

    async fn health_check(&self) -> MessageQueueResult<QueueHealth> {
        if self.failing.load(Ordering::SeqCst) {
            return Ok(QueueHealth::disconnected());
        }
        let pending = self
            .topics
            .read()
            .await
            .values()
            .map(|messages| messages.len() as u64)
            .sum();
        Ok(QueueHealth::healthy(pending))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_stores_message() {
        let queue = InMemoryMessageQueue::new();
        let id = queue.publish("playbook.events", b"{}").await.unwrap();

        let messages = queue.messages("playbook.events").await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, id);
        assert_eq!(messages[0].payload, b"{}");
        assert_eq!(queue.published_count(), 1);
    }

    #[tokio::test]
    async fn test_failing_queue_rejects_publish() {
        let queue = InMemoryMessageQueue::new();
        queue.set_failing(true);

        let result = queue.publish("playbook.events", b"{}").await;
        assert!(matches!(result, Err(MessageQueueError::Connection(_))));
        assert!(!queue.health_check().await.unwrap().connected);
    }

    #[tokio::test]
    async fn test_empty_topic_rejected() {
        let queue = InMemoryMessageQueue::new();
        let result = queue.publish("", b"{}").await;
        assert!(matches!(result, Err(MessageQueueError::InvalidTopic(_))));
    }

    #[tokio::test]
    async fn test_health_reports_backlog() {
        let queue = InMemoryMessageQueue::new();
        queue.publish("a", b"1").await.unwrap();
        queue.publish("b", b"2").await.unwrap();

        let health = queue.health_check().await.unwrap();
        assert!(health.is_healthy());
        assert_eq!(health.pending_messages, 2);
    }
}
