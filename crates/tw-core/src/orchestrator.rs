//! Playbook engine for Triage Warden.
//!
//! The engine subscribes to every event on the [`EventBus`], matches each
//! event against the active playbooks of its organization and runs every
//! match as an independent task.
//!
//! ## Concurrency
//!
//! Bus handlers must not block, so the subscription only spawns a task per
//! event. Running executions are bounded by a semaphore
//! (`max_concurrent_executions`); tasks beyond the limit wait for a permit.
//! In-flight tasks are tracked in a `JoinSet` so callers can wait for the
//! engine to go idle and shutdown can drain it.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::action::ActionDispatcher;
use crate::events::{Event, EventBus, SubscriptionHandle, DEFAULT_HISTORY_SIZE, WILDCARD};
use crate::playbook::{
    ExecutionRecord, ExecutionStatus, ExecutionStore, ExecutorConfig, InMemoryExecutionStore,
    PlaybookDefinition, PlaybookExecutor, PlaybookSource, TriggerError, TriggerMatcher,
};

/// Errors that can occur in the engine.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Trigger error: {0}")]
    Trigger(#[from] TriggerError),

    #[error("Playbook not found: {0}")]
    PlaybookNotFound(Uuid),

    #[error("Engine is shutting down")]
    ShuttingDown,

    #[error("Internal error: {0}")]
    Internal(String),
}

fn default_max_concurrent_executions() -> usize {
    50
}

fn default_event_history_size() -> usize {
    DEFAULT_HISTORY_SIZE
}

/// Engine configuration, as found under `engine:` in the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum executions running at once.
    #[serde(default = "default_max_concurrent_executions")]
    pub max_concurrent_executions: usize,
    /// Timeout for steps that do not set their own.
    #[serde(default)]
    pub default_step_timeout_ms: Option<u64>,
    /// Delay between retry attempts.
    #[serde(default)]
    pub retry_backoff_ms: u64,
    /// Event history kept by the bus.
    #[serde(default = "default_event_history_size")]
    pub event_history_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_executions: default_max_concurrent_executions(),
            default_step_timeout_ms: None,
            retry_backoff_ms: 0,
            event_history_size: default_event_history_size(),
        }
    }
}

impl From<&EngineConfig> for ExecutorConfig {
    fn from(config: &EngineConfig) -> Self {
        ExecutorConfig {
            default_step_timeout: config.default_step_timeout_ms.map(Duration::from_millis),
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
        }
    }
}

/// Counters for the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Events received from the bus or `handle_event`.
    pub events_received: u64,
    pub executions_started: u64,
    pub executions_completed: u64,
    pub executions_failed: u64,
}

#[derive(Default)]
struct EngineCounters {
    events_received: AtomicU64,
    executions_started: AtomicU64,
    executions_completed: AtomicU64,
    executions_failed: AtomicU64,
}

struct EngineInner {
    config: EngineConfig,
    source: Arc<dyn PlaybookSource>,
    matcher: TriggerMatcher,
    executor: PlaybookExecutor,
    permits: Arc<Semaphore>,
    tasks: Mutex<JoinSet<()>>,
    counters: EngineCounters,
    accepting: AtomicBool,
}

impl EngineInner {
    async fn handle_event(
        self: Arc<Self>,
        event: Arc<Event>,
    ) -> Result<Vec<ExecutionRecord>, EngineError> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(EngineError::ShuttingDown);
        }
        self.counters.events_received.fetch_add(1, Ordering::Relaxed);

        let matched = self.matcher.match_event(&event).await?;
        if matched.is_empty() {
            debug!(event_type = %event.event_type, "No playbooks matched event");
            return Ok(Vec::new());
        }
        info!(
            event_type = %event.event_type,
            event_id = %event.id,
            matched = matched.len(),
            "Event matched playbooks"
        );

        let mut runs = JoinSet::new();
        for (index, playbook) in matched.into_iter().enumerate() {
            let inner = Arc::clone(&self);
            let event = Arc::clone(&event);
            runs.spawn(async move { (index, inner.run(playbook, event).await) });
        }

        let mut records = Vec::new();
        while let Some(joined) = runs.join_next().await {
            match joined {
                Ok((index, Ok(record))) => records.push((index, record)),
                Ok((_, Err(e))) => warn!("Execution not started: {}", e),
                Err(e) => {
                    self.counters
                        .executions_failed
                        .fetch_add(1, Ordering::Relaxed);
                    error!("Execution task failed: {}", e);
                }
            }
        }
        records.sort_by_key(|(index, _)| *index);
        Ok(records.into_iter().map(|(_, record)| record).collect())
    }

    async fn run(
        &self,
        playbook: PlaybookDefinition,
        event: Arc<Event>,
    ) -> Result<ExecutionRecord, EngineError> {
        let _permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| EngineError::ShuttingDown)?;

        self.counters
            .executions_started
            .fetch_add(1, Ordering::Relaxed);
        let record = self.executor.execute(&playbook, event).await;

        match record.status {
            ExecutionStatus::Completed => self
                .counters
                .executions_completed
                .fetch_add(1, Ordering::Relaxed),
            _ => self
                .counters
                .executions_failed
                .fetch_add(1, Ordering::Relaxed),
        };
        Ok(record)
    }

    fn spawn_event(self: &Arc<Self>, event: Arc<Event>) {
        if !self.accepting.load(Ordering::SeqCst) {
            debug!(event_id = %event.id, "Engine shutting down, dropping event");
            return;
        }
        let inner = Arc::clone(self);
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            let event_id = event.id;
            if let Err(e) = inner.handle_event(event).await {
                warn!(%event_id, "Failed to handle event: {}", e);
            }
        });
    }

    fn take_tasks(&self) -> JoinSet<()> {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *tasks)
    }
}

/// Event-driven playbook engine.
pub struct PlaybookEngine {
    inner: Arc<EngineInner>,
    bus: Arc<EventBus>,
    subscription: tokio::sync::Mutex<Option<SubscriptionHandle>>,
}

impl PlaybookEngine {
    pub fn builder(
        bus: Arc<EventBus>,
        source: Arc<dyn PlaybookSource>,
        dispatcher: Arc<dyn ActionDispatcher>,
    ) -> PlaybookEngineBuilder {
        PlaybookEngineBuilder {
            bus,
            source,
            dispatcher,
            store: None,
            config: EngineConfig::default(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn event_bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.bus)
    }

    pub fn store(&self) -> Arc<dyn ExecutionStore> {
        Arc::clone(self.inner.executor.store())
    }

    /// Subscribes to the bus. Calling `start` twice is a no-op.
    #[instrument(skip(self))]
    pub async fn start(&self) {
        let mut subscription = self.subscription.lock().await;
        if subscription.is_some() {
            return;
        }
        self.inner.accepting.store(true, Ordering::SeqCst);

        let weak: Weak<EngineInner> = Arc::downgrade(&self.inner);
        let handle = self
            .bus
            .subscribe(WILDCARD, move |event: &Arc<Event>| {
                if let Some(inner) = weak.upgrade() {
                    inner.spawn_event(Arc::clone(event));
                }
            })
            .await;
        *subscription = Some(handle);
        info!(
            max_concurrent_executions = self.inner.config.max_concurrent_executions,
            "Playbook engine started"
        );
    }

    pub async fn is_running(&self) -> bool {
        self.subscription.lock().await.is_some()
    }

    /// Matches `event` and runs every matching playbook, returning the
    /// records in match order.
    #[instrument(skip(self, event), fields(event_type = %event.event_type, event_id = %event.id))]
    pub async fn handle_event(&self, event: Event) -> Result<Vec<ExecutionRecord>, EngineError> {
        Arc::clone(&self.inner).handle_event(Arc::new(event)).await
    }

    /// Runs one playbook by id, regardless of its trigger.
    pub async fn run_playbook(
        &self,
        playbook_id: Uuid,
        event: Event,
    ) -> Result<ExecutionRecord, EngineError> {
        if !self.inner.accepting.load(Ordering::SeqCst) {
            return Err(EngineError::ShuttingDown);
        }
        let playbook = self
            .inner
            .source
            .get(playbook_id)
            .await?
            .ok_or(EngineError::PlaybookNotFound(playbook_id))?;
        self.inner.run(playbook, Arc::new(event)).await
    }

    /// Waits until every execution spawned from bus events has finished.
    pub async fn wait_idle(&self) {
        loop {
            let mut tasks = self.inner.take_tasks();
            if tasks.is_empty() {
                return;
            }
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    error!("Event task failed: {}", e);
                }
            }
        }
    }

    /// Unsubscribes from the bus, refuses new work and drains in-flight
    /// executions.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        info!("Shutting down playbook engine");
        if let Some(handle) = self.subscription.lock().await.take() {
            handle.unsubscribe().await;
        }
        self.wait_idle().await;
        self.inner.accepting.store(false, Ordering::SeqCst);
        info!("Playbook engine stopped");
    }

    pub fn stats(&self) -> EngineStats {
        let counters = &self.inner.counters;
        EngineStats {
            events_received: counters.events_received.load(Ordering::Relaxed),
            executions_started: counters.executions_started.load(Ordering::Relaxed),
            executions_completed: counters.executions_completed.load(Ordering::Relaxed),
            executions_failed: counters.executions_failed.load(Ordering::Relaxed),
        }
    }
}

/// Builder for a [`PlaybookEngine`].
pub struct PlaybookEngineBuilder {
    bus: Arc<EventBus>,
    source: Arc<dyn PlaybookSource>,
    dispatcher: Arc<dyn ActionDispatcher>,
    store: Option<Arc<dyn ExecutionStore>>,
    config: EngineConfig,
}

impl PlaybookEngineBuilder {
    /// Sets the execution store. Defaults to an in-memory store.
    pub fn with_store(mut self, store: Arc<dyn ExecutionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> PlaybookEngine {
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryExecutionStore::new()));
        let executor = PlaybookExecutor::new(self.dispatcher, store)
            .with_config(ExecutorConfig::from(&self.config));
        let permits = Arc::new(Semaphore::new(self.config.max_concurrent_executions.max(1)));

        PlaybookEngine {
            inner: Arc::new(EngineInner {
                matcher: TriggerMatcher::new(Arc::clone(&self.source)),
                source: self.source,
                executor,
                permits,
                tasks: Mutex::new(JoinSet::new()),
                counters: EngineCounters::default(),
                accepting: AtomicBool::new(true),
                config: self.config,
            }),
            bus: self.bus,
            subscription: tokio::sync::Mutex::new(None),
        }
    }
}
