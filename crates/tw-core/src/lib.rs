//! # tw-core
//!
//! Core playbook engine for Triage Warden.
//!
//! This crate provides the event bus, playbook definitions, trigger
//! matching, the template and condition mini-languages, the sequential step
//! executor and the engine that ties them together. Concrete actions live
//! in `tw-actions` behind the [`ActionDispatcher`] seam.

pub mod action;
pub mod events;
pub mod messaging;
pub mod orchestrator;
pub mod playbook;

pub use action::{
    ActionContext, ActionDispatcher, ActionError, ActionResult, LogLevel, ParamMap, StepLogEntry,
    StepLogger,
};
pub use events::{
    Event, EventBus, EventBusBuilder, EventBusError, EventBusMetricsSnapshot, EventEnvelope,
    EventHandler, SubscriptionHandle, PLAYBOOK_EVENTS_TOPIC, WILDCARD,
};
pub use messaging::{InMemoryMessageQueue, MessageQueue, MessageQueueError};
pub use orchestrator::{
    EngineConfig, EngineError, EngineStats, PlaybookEngine, PlaybookEngineBuilder,
};
pub use playbook::{
    ErrorPolicy, ExecutionRecord, ExecutionStatus, ExecutionStore, InMemoryExecutionStore,
    InMemoryPlaybookSource, PlaybookDefinition, PlaybookExecutor, PlaybookSource, Step, StepState,
    StepStatus, TriggerType,
};
