//! Event bus for Triage Warden playbooks.
//!
//! Domain events (a new alert, an incident status change) are published on
//! the [`EventBus`] and delivered to every handler subscribed to the event's
//! type, in subscription order. Handlers subscribed to [`WILDCARD`] receive
//! every event.
//!
//! ## Subscriber list
//!
//! The list is copy-on-write. `publish` takes a snapshot (`Arc<Vec<_>>`) and
//! releases the lock before invoking handlers, so a handler unsubscribed
//! mid-dispatch still sees the current pass and subscribe/unsubscribe never
//! invalidate an iteration in progress.
//!
//! ## Durable fan-out
//!
//! When a [`MessageQueue`] is attached, each event is also wrapped in an
//! [`EventEnvelope`] and forwarded to the `playbook.events` topic:
//!
//! ```text
//! ┌─────────────┐    ┌─────────────┐    ┌──────────────────┐
//! │  Publisher  │───▶│  EventBus   │───▶│ In-process       │
//! └─────────────┘    │             │    │ handlers         │
//!                    │             │    └──────────────────┘
//!                    │             │    ┌──────────────────┐
//!                    │             │───▶│  MessageQueue    │
//!                    └─────────────┘    │  (spawned task)  │
//!                                       └──────────────────┘
//! ```
//!
//! Forwarding runs in a spawned task; queue failures are logged and counted
//! and never affect in-process delivery.

use crate::messaging::MessageQueue;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Topic used for durable fan-out.
pub const PLAYBOOK_EVENTS_TOPIC: &str = "playbook.events";

/// Schema version written into every [`EventEnvelope`].
pub const EVENT_SCHEMA_VERSION: u8 = 1;

/// Subscribing to this type receives every event.
pub const WILDCARD: &str = "*";

/// Default number of events kept in the history buffer.
pub const DEFAULT_HISTORY_SIZE: usize = 1000;

/// Errors that can occur around the event bus.
#[derive(Error, Debug)]
pub enum EventBusError {
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Message queue error: {0}")]
    MessageQueue(#[from] crate::messaging::MessageQueueError),
}

/// A domain event. Immutable once published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique event id, used for correlation.
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    /// Dotted event type, e.g. `alert.created`.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Kind of entity the event is about (`alert`, `incident`).
    pub entity_type: String,
    /// Identifier of that entity.
    pub entity_id: String,
    /// Tenant the event belongs to.
    pub organization_id: Uuid,
    /// When the event happened.
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    /// Arbitrary JSON payload.
    #[serde(default)]
    pub data: serde_json::Map<String, serde_json::Value>,
}

impl Event {
    pub fn new(
        event_type: impl Into<String>,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        organization_id: Uuid,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            organization_id,
            timestamp: Utc::now(),
            data: serde_json::Map::new(),
        }
    }

    /// Replaces the payload. Non-object values are ignored.
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        if let serde_json::Value::Object(map) = data {
            self.data = map;
        }
        self
    }

    /// Sets one payload field.
    pub fn with_field(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    /// The part of the type before the first dot (`alert.created` → `alert`).
    pub fn category(&self) -> &str {
        self.event_type
            .split_once('.')
            .map(|(category, _)| category)
            .unwrap_or(&self.event_type)
    }
}

/// Envelope used when forwarding an event to a [`MessageQueue`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Id of the wrapped event, for consumer-side deduplication.
    pub event_id: Uuid,
    pub schema_version: u8,
    /// When the envelope was created.
    pub timestamp: DateTime<Utc>,
    /// Instance that published the event.
    pub source_instance: Option<String>,
    pub event: Event,
}

impl EventEnvelope {
    pub fn new(event: Event, source_instance: Option<String>) -> Self {
        Self {
            event_id: event.id,
            schema_version: EVENT_SCHEMA_VERSION,
            timestamp: Utc::now(),
            source_instance,
            event,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, EventBusError> {
        serde_json::to_vec(self).map_err(|e| EventBusError::Serialization(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EventBusError> {
        serde_json::from_slice(bytes).map_err(|e| EventBusError::Serialization(e.to_string()))
    }
}

/// Receives published events.
///
/// Handlers run on the publisher's task and must not block; anything slow
/// should be spawned. A panicking handler is logged and skipped.
pub trait EventHandler: Send + Sync + 'static {
    fn handle(&self, event: &Arc<Event>);
}

impl<F> EventHandler for F
where
    F: Fn(&Arc<Event>) + Send + Sync + 'static,
{
    fn handle(&self, event: &Arc<Event>) {
        self(event)
    }
}

#[derive(Clone)]
struct Subscriber {
    id: u64,
    event_type: String,
    handler: Arc<dyn EventHandler>,
}

impl Subscriber {
    fn accepts(&self, event_type: &str) -> bool {
        self.event_type == WILDCARD || self.event_type == event_type
    }
}

type SubscriberList = Arc<Vec<Subscriber>>;

/// Handle returned by [`EventBus::subscribe`].
///
/// Dropping the handle does not unsubscribe; call
/// [`unsubscribe`](Self::unsubscribe).
#[derive(Debug)]
pub struct SubscriptionHandle {
    id: u64,
    event_type: String,
    subscribers: Weak<RwLock<SubscriberList>>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// Removes the handler. Returns `false` if it was already gone or the
    /// bus has been dropped.
    pub async fn unsubscribe(self) -> bool {
        match self.subscribers.upgrade() {
            Some(subscribers) => remove_subscriber(&subscribers, self.id).await,
            None => false,
        }
    }
}

async fn remove_subscriber(subscribers: &RwLock<SubscriberList>, id: u64) -> bool {
    let mut guard = subscribers.write().await;
    if !guard.iter().any(|s| s.id == id) {
        return false;
    }
    let remaining: Vec<Subscriber> = guard.iter().filter(|s| s.id != id).cloned().collect();
    *guard = Arc::new(remaining);
    true
}

/// Counters kept by the bus.
#[derive(Debug, Default)]
pub struct EventBusMetrics {
    pub events_published: AtomicU64,
    pub handler_deliveries: AtomicU64,
    pub handler_panics: AtomicU64,
    pub queue_published: AtomicU64,
    pub queue_failures: AtomicU64,
}

impl EventBusMetrics {
    pub fn snapshot(&self) -> EventBusMetricsSnapshot {
        EventBusMetricsSnapshot {
            events_published: self.events_published.load(Ordering::Relaxed),
            handler_deliveries: self.handler_deliveries.load(Ordering::Relaxed),
            handler_panics: self.handler_panics.load(Ordering::Relaxed),
            queue_published: self.queue_published.load(Ordering::Relaxed),
            queue_failures: self.queue_failures.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`EventBusMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventBusMetricsSnapshot {
    pub events_published: u64,
    pub handler_deliveries: u64,
    pub handler_panics: u64,
    pub queue_published: u64,
    pub queue_failures: u64,
}

/// In-process publish/subscribe router for domain events.
pub struct EventBus {
    subscribers: Arc<RwLock<SubscriberList>>,
    next_subscriber_id: AtomicU64,
    history: RwLock<VecDeque<Arc<Event>>>,
    history_size: usize,
    message_queue: Option<Arc<dyn MessageQueue>>,
    instance_id: String,
    metrics: Arc<EventBusMetrics>,
}

impl EventBus {
    /// Creates a bus with default history size and no durable fan-out.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> EventBusBuilder {
        EventBusBuilder::new()
    }

    /// Instance id written into forwarded envelopes.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Whether events are forwarded to a message queue.
    pub fn is_distributed(&self) -> bool {
        self.message_queue.is_some()
    }

    pub fn metrics_snapshot(&self) -> EventBusMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Registers `handler` for events of `event_type` (or [`WILDCARD`]).
    pub async fn subscribe(
        &self,
        event_type: impl Into<String>,
        handler: impl EventHandler,
    ) -> SubscriptionHandle {
        let event_type = event_type.into();
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let subscriber = Subscriber {
            id,
            event_type: event_type.clone(),
            handler: Arc::new(handler),
        };

        {
            let mut guard = self.subscribers.write().await;
            let mut next: Vec<Subscriber> = guard.as_ref().clone();
            next.push(subscriber);
            *guard = Arc::new(next);
        }
        info!(subscriber_id = id, event_type = %event_type, "Registered event subscriber");

        SubscriptionHandle {
            id,
            event_type,
            subscribers: Arc::downgrade(&self.subscribers),
        }
    }

    /// Removes a subscriber by id.
    pub async fn unsubscribe(&self, subscriber_id: u64) -> bool {
        let removed = remove_subscriber(&self.subscribers, subscriber_id).await;
        if removed {
            info!(subscriber_id, "Unregistered event subscriber");
        }
        removed
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    /// Delivers `event` to every matching handler and returns how many
    /// handlers were invoked.
    #[instrument(skip(self, event), fields(event_type = %event.event_type, event_id = %event.id))]
    pub async fn publish(&self, event: Event) -> usize {
        let event = Arc::new(event);
        debug!("Publishing event");

        {
            let mut history = self.history.write().await;
            if self.history_size > 0 {
                if history.len() >= self.history_size {
                    history.pop_front();
                }
                history.push_back(Arc::clone(&event));
            }
        }

        self.metrics.events_published.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("playbook_events_published_total").increment(1);

        let snapshot: SubscriberList = Arc::clone(&*self.subscribers.read().await);
        let mut delivered = 0;

        for subscriber in snapshot.iter().filter(|s| s.accepts(&event.event_type)) {
            let handler = Arc::clone(&subscriber.handler);
            let outcome = catch_unwind(AssertUnwindSafe(|| handler.handle(&event)));
            match outcome {
                Ok(()) => {
                    delivered += 1;
                    self.metrics
                        .handler_deliveries
                        .fetch_add(1, Ordering::Relaxed);
                }
                Err(_) => {
                    self.metrics.handler_panics.fetch_add(1, Ordering::Relaxed);
                    error!(
                        subscriber_id = subscriber.id,
                        "Event handler panicked; continuing with remaining handlers"
                    );
                }
            }
        }
        debug!(delivered, "Event dispatched to handlers");

        if let Some(queue) = &self.message_queue {
            self.forward(Arc::clone(queue), event.as_ref().clone());
        }

        delivered
    }

    fn forward(&self, queue: Arc<dyn MessageQueue>, event: Event) {
        let envelope = EventEnvelope::new(event, Some(self.instance_id.clone()));
        let metrics = Arc::clone(&self.metrics);

        tokio::spawn(async move {
            let payload = match envelope.to_bytes() {
                Ok(payload) => payload,
                Err(e) => {
                    error!("Failed to serialize event envelope: {}", e);
                    metrics.queue_failures.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            };

            match queue.publish(PLAYBOOK_EVENTS_TOPIC, &payload).await {
                Ok(message_id) => {
                    debug!(
                        %message_id,
                        event_id = %envelope.event_id,
                        "Event forwarded to message queue"
                    );
                    metrics.queue_published.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    warn!(
                        event_id = %envelope.event_id,
                        "Failed to forward event to message queue: {}", e
                    );
                    metrics.queue_failures.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("playbook_event_queue_failures_total").increment(1);
                }
            }
        });
    }

    /// Recent events. With a limit, newest first; without, oldest first.
    pub async fn recent_events(&self, limit: Option<usize>) -> Vec<Arc<Event>> {
        let history = self.history.read().await;
        match limit {
            Some(n) => history.iter().rev().take(n).cloned().collect(),
            None => history.iter().cloned().collect(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for an [`EventBus`].
///
/// ```ignore
/// let queue = Arc::new(InMemoryMessageQueue::new());
/// let bus = EventBus::builder()
///     .with_message_queue(queue)
///     .with_instance_id("engine-1")
///     .with_history_size(500)
///     .build();
/// ```
pub struct EventBusBuilder {
    history_size: usize,
    message_queue: Option<Arc<dyn MessageQueue>>,
    instance_id: Option<String>,
}

impl EventBusBuilder {
    pub fn new() -> Self {
        Self {
            history_size: DEFAULT_HISTORY_SIZE,
            message_queue: None,
            instance_id: None,
        }
    }

    /// Sets the history buffer size; `0` disables history.
    pub fn with_history_size(mut self, size: usize) -> Self {
        self.history_size = size;
        self
    }

    pub fn with_message_queue(mut self, queue: Arc<dyn MessageQueue>) -> Self {
        self.message_queue = Some(queue);
        self
    }

    pub fn with_instance_id(mut self, id: impl Into<String>) -> Self {
        self.instance_id = Some(id.into());
        self
    }

    pub fn build(self) -> EventBus {
        EventBus {
            subscribers: Arc::new(RwLock::new(Arc::new(Vec::new()))),
            next_subscriber_id: AtomicU64::new(1),
            history: RwLock::new(VecDeque::with_capacity(self.history_size.min(4096))),
            history_size: self.history_size,
            message_queue: self.message_queue,
            instance_id: self.instance_id.unwrap_or_else(default_instance_id),
            metrics: Arc::new(EventBusMetrics::default()),
        }
    }
}

impl Default for EventBusBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// `<hostname>-<pid>`, falling back to `unknown` for the hostname.
pub fn default_instance_id() -> String {
    let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
    format!("{}-{}", hostname, std::process::id())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::InMemoryMessageQueue;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    fn alert_event() -> Event {
        Event::new("alert.created", "alert", "alert-1", Uuid::new_v4())
            .with_data(json!({"severity": "critical", "hostname": "ws01"}))
    }

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) -> Box<dyn Fn(&Arc<Event>) + Send + Sync>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_clone = Arc::clone(&log);
        let make = move |label: &str| -> Box<dyn Fn(&Arc<Event>) + Send + Sync> {
            let log = Arc::clone(&log_clone);
            let label = label.to_string();
            Box::new(move |event: &Arc<Event>| {
                log.lock()
                    .unwrap()
                    .push(format!("{}:{}", label, event.event_type));
            })
        };
        (log, make)
    }

    #[test]
    fn test_event_category() {
        assert_eq!(alert_event().category(), "alert");
        let bare = Event::new("manual", "playbook", "p", Uuid::new_v4());
        assert_eq!(bare.category(), "manual");
    }

    #[test]
    fn test_event_deserializes_with_defaults() {
        let org = Uuid::new_v4();
        let event: Event = serde_json::from_value(json!({
            "type": "incident.status_changed",
            "entity_type": "incident",
            "entity_id": "inc-7",
            "organization_id": org,
        }))
        .unwrap();
        assert_eq!(event.event_type, "incident.status_changed");
        assert_eq!(event.organization_id, org);
        assert!(event.data.is_empty());
    }

    #[tokio::test]
    async fn test_publish_delivers_in_subscription_order() {
        let bus = EventBus::new();
        let (log, make) = recorder();

        bus.subscribe("alert.created", make("first")).await;
        bus.subscribe(WILDCARD, make("wild")).await;
        bus.subscribe("alert.created", make("second")).await;
        bus.subscribe("incident.updated", make("other")).await;

        let delivered = bus.publish(alert_event()).await;

        assert_eq!(delivered, 3);
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "first:alert.created",
                "wild:alert.created",
                "second:alert.created"
            ]
        );
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = EventBus::new();
        assert_eq!(bus.publish(alert_event()).await, 0);
        assert_eq!(bus.metrics_snapshot().events_published, 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let (log, make) = recorder();

        let handle = bus.subscribe("alert.created", make("a")).await;
        bus.publish(alert_event()).await;
        assert!(handle.unsubscribe().await);
        bus.publish(alert_event()).await;

        assert_eq!(log.lock().unwrap().len(), 1);
        assert_eq!(bus.subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_twice_returns_false() {
        let bus = EventBus::new();
        let handle = bus.subscribe("alert.created", |_: &Arc<Event>| {}).await;
        let id = handle.id();
        assert!(handle.unsubscribe().await);
        assert!(!bus.unsubscribe(id).await);
    }

    #[tokio::test]
    async fn test_unsubscribe_during_dispatch_keeps_current_pass() {
        let bus = Arc::new(EventBus::new());
        let (log, make) = recorder();
        let second_id = Arc::new(AtomicU64::new(0));

        // The first handler removes the second one before the walk reaches it.
        let weak_bus = Arc::downgrade(&bus);
        let id_for_first = Arc::clone(&second_id);
        let log_for_first = Arc::clone(&log);
        bus.subscribe("alert.created", move |_: &Arc<Event>| {
            let Some(bus) = weak_bus.upgrade() else {
                return;
            };
            let id = id_for_first.load(Ordering::SeqCst);
            if futures::executor::block_on(bus.unsubscribe(id)) {
                log_for_first.lock().unwrap().push("removed".to_string());
            }
        })
        .await;

        let handle = bus.subscribe("alert.created", make("second")).await;
        second_id.store(handle.id(), Ordering::SeqCst);

        let delivered = bus.publish(alert_event()).await;

        assert_eq!(delivered, 2);
        assert_eq!(*log.lock().unwrap(), vec!["removed", "second:alert.created"]);
        assert_eq!(bus.subscriber_count().await, 1);

        bus.publish(alert_event()).await;
        assert_eq!(*log.lock().unwrap(), vec!["removed", "second:alert.created"]);
    }

    #[tokio::test]
    async fn test_panicking_handler_is_isolated() {
        let bus = EventBus::new();
        let (log, make) = recorder();

        bus.subscribe("alert.created", |_: &Arc<Event>| panic!("handler bug"))
            .await;
        bus.subscribe("alert.created", make("after")).await;

        let delivered = bus.publish(alert_event()).await;

        assert_eq!(delivered, 1);
        assert_eq!(log.lock().unwrap().len(), 1);
        assert_eq!(bus.metrics_snapshot().handler_panics, 1);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let bus = EventBus::builder().with_history_size(2).build();
        for i in 0..3 {
            bus.publish(Event::new(format!("alert.e{}", i), "alert", "a", Uuid::new_v4()))
                .await;
        }

        let all = bus.recent_events(None).await;
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].event_type, "alert.e1");

        let newest = bus.recent_events(Some(1)).await;
        assert_eq!(newest[0].event_type, "alert.e2");
    }

    #[tokio::test]
    async fn test_durable_fan_out() {
        let queue = Arc::new(InMemoryMessageQueue::new());
        let bus = EventBus::builder()
            .with_message_queue(queue.clone())
            .with_instance_id("engine-1")
            .build();
        assert!(bus.is_distributed());

        let event = alert_event();
        let event_id = event.id;
        bus.publish(event).await;

        tokio::time::sleep(Duration::from_millis(50)).await;

        let messages = queue.messages(PLAYBOOK_EVENTS_TOPIC).await;
        assert_eq!(messages.len(), 1);
        let envelope = EventEnvelope::from_bytes(&messages[0].payload).unwrap();
        assert_eq!(envelope.event_id, event_id);
        assert_eq!(envelope.schema_version, EVENT_SCHEMA_VERSION);
        assert_eq!(envelope.source_instance.as_deref(), Some("engine-1"));
        assert_eq!(bus.metrics_snapshot().queue_published, 1);
    }

    #[tokio::test]
    async fn test_queue_failure_does_not_affect_dispatch() {
        let queue = Arc::new(InMemoryMessageQueue::new());
        queue.set_failing(true);
        let bus = EventBus::builder().with_message_queue(queue).build();
        let (log, make) = recorder();
        bus.subscribe("alert.created", make("local")).await;

        assert_eq!(bus.publish(alert_event()).await, 1);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(log.lock().unwrap().len(), 1);
        assert_eq!(bus.metrics_snapshot().queue_failures, 1);
    }
}
