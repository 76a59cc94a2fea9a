//! Action execution contract shared by the playbook executor and action
//! implementations.
//!
//! The executor never talks to concrete actions. It hands a step's resolved
//! parameters to an [`ActionDispatcher`] (the action registry in
//! `tw-actions`) together with an [`ActionContext`] describing the execution
//! the call belongs to.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::events::Event;

/// Parameters handed to an action: the step's resolved `with` block.
pub type ParamMap = serde_json::Map<String, serde_json::Value>;

/// Errors surfaced by action dispatch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ActionError {
    /// No action is registered under the requested name.
    #[error("Action not found: {0}")]
    NotFound(String),

    /// Parameters failed the action's declared schema. Raised before the
    /// action body runs.
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    /// The action body failed or reported `success = false`.
    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    /// The action did not finish within its time budget.
    #[error("Timeout: action did not complete within {0} ms")]
    Timeout(u64),
}

impl ActionError {
    /// Whether another attempt could succeed.
    ///
    /// Unknown actions and schema failures are deterministic, so retrying
    /// them is pointless.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ActionError::ExecutionFailed(_) | ActionError::Timeout(_)
        )
    }

    /// Converts a caught panic payload into an execution failure.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(message) = payload.downcast_ref::<&str>() {
            (*message).to_string()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            "unknown panic".to_string()
        };
        ActionError::ExecutionFailed(format!("action panicked: {}", message))
    }
}

/// Outcome of one action invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    /// Whether the action succeeded.
    pub success: bool,
    /// Human-readable outcome.
    pub message: String,
    /// Output merged into execution variables under the step id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<ParamMap>,
}

impl ActionResult {
    /// Creates a successful result without data.
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: None,
        }
    }

    /// Creates a failed result.
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
        }
    }

    /// Attaches output data.
    pub fn with_data(mut self, data: ParamMap) -> Self {
        self.data = Some(data);
        self
    }

    /// Adds a single output field.
    pub fn with_field(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.data
            .get_or_insert_with(ParamMap::new)
            .insert(key.into(), value);
        self
    }
}

/// Severity of a step log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// One line written by an action through its [`StepLogger`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepLogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

/// Audit logger handed to actions.
///
/// Every entry is emitted as a tracing event carrying the execution's
/// identifiers and is also kept so the executor can attach it to the step's
/// state. Clones share the same buffer.
#[derive(Clone)]
pub struct StepLogger {
    playbook_id: Uuid,
    execution_id: Uuid,
    organization_id: Uuid,
    step_id: Arc<str>,
    entries: Arc<Mutex<Vec<StepLogEntry>>>,
}

impl StepLogger {
    pub fn new(
        playbook_id: Uuid,
        execution_id: Uuid,
        organization_id: Uuid,
        step_id: impl Into<Arc<str>>,
    ) -> Self {
        Self {
            playbook_id,
            execution_id,
            organization_id,
            step_id: step_id.into(),
            entries: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Records `message` at `level`.
    pub fn log(&self, message: impl Into<String>, level: LogLevel) {
        let message = message.into();
        let step_id: &str = &self.step_id;

        match level {
            LogLevel::Trace => trace!(
                playbook_id = %self.playbook_id,
                execution_id = %self.execution_id,
                organization_id = %self.organization_id,
                step_id,
                "{}",
                message
            ),
            LogLevel::Debug => debug!(
                playbook_id = %self.playbook_id,
                execution_id = %self.execution_id,
                organization_id = %self.organization_id,
                step_id,
                "{}",
                message
            ),
            LogLevel::Info => info!(
                playbook_id = %self.playbook_id,
                execution_id = %self.execution_id,
                organization_id = %self.organization_id,
                step_id,
                "{}",
                message
            ),
            LogLevel::Warn => warn!(
                playbook_id = %self.playbook_id,
                execution_id = %self.execution_id,
                organization_id = %self.organization_id,
                step_id,
                "{}",
                message
            ),
            LogLevel::Error => error!(
                playbook_id = %self.playbook_id,
                execution_id = %self.execution_id,
                organization_id = %self.organization_id,
                step_id,
                "{}",
                message
            ),
        }

        let entry = StepLogEntry {
            timestamp: Utc::now(),
            level,
            message,
        };
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(message, LogLevel::Info);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(message, LogLevel::Warn);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(message, LogLevel::Error);
    }

    /// Returns a copy of everything logged so far.
    pub fn entries(&self) -> Vec<StepLogEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl std::fmt::Debug for StepLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepLogger")
            .field("execution_id", &self.execution_id)
            .field("step_id", &self.step_id)
            .finish()
    }
}

/// Context provided to an action invocation.
#[derive(Debug, Clone)]
pub struct ActionContext {
    /// Playbook the step belongs to.
    pub playbook_id: Uuid,
    /// Execution the step belongs to.
    pub execution_id: Uuid,
    /// Tenant the triggering event belongs to.
    pub organization_id: Uuid,
    /// Id of the step being executed.
    pub step_id: String,
    /// 1-based attempt number.
    pub attempt: u32,
    /// The event that triggered the execution.
    pub event: Arc<Event>,
    /// Snapshot of execution variables at dispatch time.
    pub variables: ParamMap,
    /// Audit logger for this step.
    pub logger: StepLogger,
}

impl ActionContext {
    /// Creates a context for the first attempt of `step_id`.
    pub fn new(
        playbook_id: Uuid,
        execution_id: Uuid,
        event: Arc<Event>,
        step_id: impl Into<String>,
    ) -> Self {
        let step_id = step_id.into();
        let organization_id = event.organization_id;
        Self {
            playbook_id,
            execution_id,
            organization_id,
            logger: StepLogger::new(
                playbook_id,
                execution_id,
                organization_id,
                step_id.as_str(),
            ),
            step_id,
            attempt: 1,
            event,
            variables: ParamMap::new(),
        }
    }

    /// Replaces the logger, used to share one buffer across retries.
    pub fn with_logger(mut self, logger: StepLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn with_variables(mut self, variables: ParamMap) -> Self {
        self.variables = variables;
        self
    }

    /// Shorthand for `self.logger.log(..)`.
    pub fn log(&self, message: impl Into<String>, level: LogLevel) {
        self.logger.log(message, level);
    }
}

/// Dispatches a named action.
///
/// Implemented by the action registry; the executor only depends on this
/// seam.
#[async_trait]
pub trait ActionDispatcher: Send + Sync {
    async fn dispatch(
        &self,
        name: &str,
        params: ParamMap,
        context: ActionContext,
    ) -> Result<ActionResult, ActionError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_event() -> Arc<Event> {
        Arc::new(Event::new("alert.created", "alert", "a-1", Uuid::new_v4()))
    }

    #[test]
    fn test_retryable_errors() {
        assert!(ActionError::ExecutionFailed("boom".into()).is_retryable());
        assert!(ActionError::Timeout(100).is_retryable());
        assert!(!ActionError::NotFound("x".into()).is_retryable());
        assert!(!ActionError::InvalidParameters("x".into()).is_retryable());
    }

    #[test]
    fn test_from_panic() {
        let caught = std::panic::catch_unwind(|| panic!("disk {} full", 3)).unwrap_err();
        assert_eq!(
            ActionError::from_panic(caught),
            ActionError::ExecutionFailed("action panicked: disk 3 full".into())
        );

        let caught = std::panic::catch_unwind(|| panic!("static")).unwrap_err();
        assert!(ActionError::from_panic(caught).is_retryable());
    }

    #[test]
    fn test_action_result_with_field() {
        let result = ActionResult::success("ok").with_field("rule_id", json!("fw-42"));
        assert!(result.success);
        assert_eq!(result.data.unwrap().get("rule_id"), Some(&json!("fw-42")));
    }

    #[test]
    fn test_action_result_serialization_skips_empty_data() {
        let json = serde_json::to_value(ActionResult::failure("nope")).unwrap();
        assert_eq!(json, json!({"success": false, "message": "nope"}));
    }

    #[test]
    fn test_logger_clones_share_entries() {
        let ctx = ActionContext::new(Uuid::new_v4(), Uuid::new_v4(), test_event(), "notify");
        let cloned = ctx.clone();

        ctx.log("sending", LogLevel::Info);
        cloned.logger.warn("slow webhook");

        let entries = ctx.logger.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].message, "sending");
        assert_eq!(entries[1].level, LogLevel::Warn);
    }

    #[test]
    fn test_context_takes_organization_from_event() {
        let event = test_event();
        let org = event.organization_id;
        let ctx = ActionContext::new(Uuid::new_v4(), Uuid::new_v4(), event, "s1");
        assert_eq!(ctx.organization_id, org);
        assert_eq!(ctx.attempt, 1);
    }
}
