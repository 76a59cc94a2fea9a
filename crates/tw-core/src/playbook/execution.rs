//! Execution records and per-step state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

use super::model::PlaybookDefinition;
use crate::action::{ParamMap, StepLogEntry};
use crate::events::Event;

/// Errors raised by execution state changes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    /// A rollback step failed and there was nothing to restore.
    #[error("rollback failed: {0}")]
    RollbackFailure(String),

    #[error("step '{step_id}' cannot move from {from} to {to}")]
    InvalidTransition {
        step_id: String,
        from: StepStatus,
        to: StepStatus,
    },

    #[error("unknown step '{0}'")]
    UnknownStep(String),
}

/// Status of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped
        )
    }

    /// Allowed moves: pending → running → {completed, failed, skipped}.
    pub fn can_transition_to(&self, next: StepStatus) -> bool {
        matches!(
            (self, next),
            (StepStatus::Pending, StepStatus::Running)
                | (StepStatus::Running, StepStatus::Completed)
                | (StepStatus::Running, StepStatus::Failed)
                | (StepStatus::Running, StepStatus::Skipped)
        )
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Overall status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runtime state of one step within an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepState {
    pub status: StepStatus,
    /// Number of times the action was invoked.
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Serialized action result on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Entries written by the action through its step logger.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<StepLogEntry>,
}

impl Default for StepState {
    fn default() -> Self {
        Self {
            status: StepStatus::Pending,
            attempts: 0,
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            logs: Vec::new(),
        }
    }
}

impl StepState {
    fn transition(&mut self, step_id: &str, next: StepStatus) -> Result<(), ExecutionError> {
        if !self.status.can_transition_to(next) {
            return Err(ExecutionError::InvalidTransition {
                step_id: step_id.to_string(),
                from: self.status,
                to: next,
            });
        }
        let now = Utc::now();
        if next == StepStatus::Running {
            self.started_at = Some(now);
        } else {
            self.completed_at = Some(now);
        }
        self.status = next;
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Snapshot of execution variables taken before a rollback-policy step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub step_id: String,
    pub timestamp: DateTime<Utc>,
    pub variables: ParamMap,
}

/// One run of a playbook against one event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub playbook_id: Uuid,
    pub organization_id: Uuid,
    /// Event that triggered the run.
    pub event_id: Uuid,
    pub event_type: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Per-step state keyed by step id.
    pub steps: HashMap<String, StepState>,
    /// Step outputs keyed by step id.
    pub variables: ParamMap,
    pub checkpoints: Vec<Checkpoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl ExecutionRecord {
    /// Creates a running record with every step pending.
    pub fn new(playbook: &PlaybookDefinition, event: &Event) -> Self {
        Self {
            id: Uuid::new_v4(),
            playbook_id: playbook.id,
            organization_id: event.organization_id,
            event_id: event.id,
            event_type: event.event_type.clone(),
            status: ExecutionStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            steps: playbook
                .steps
                .iter()
                .map(|step| (step.id.clone(), StepState::default()))
                .collect(),
            variables: ParamMap::new(),
            checkpoints: Vec::new(),
            failure_reason: None,
        }
    }

    pub fn step(&self, step_id: &str) -> Option<&StepState> {
        self.steps.get(step_id)
    }

    pub fn step_mut(&mut self, step_id: &str) -> Result<&mut StepState, ExecutionError> {
        self.steps
            .get_mut(step_id)
            .ok_or_else(|| ExecutionError::UnknownStep(step_id.to_string()))
    }

    /// Moves a step to `next`, stamping the relevant timestamp.
    pub fn transition_step(
        &mut self,
        step_id: &str,
        next: StepStatus,
    ) -> Result<&mut StepState, ExecutionError> {
        let state = self.step_mut(step_id)?;
        state.transition(step_id, next)?;
        Ok(state)
    }

    /// Records a checkpoint of the current variables.
    pub fn push_checkpoint(&mut self, step_id: &str) -> Checkpoint {
        let checkpoint = Checkpoint {
            step_id: step_id.to_string(),
            timestamp: Utc::now(),
            variables: self.variables.clone(),
        };
        self.checkpoints.push(checkpoint.clone());
        checkpoint
    }

    /// Restores variables from the most recent checkpoint.
    pub fn restore_checkpoint(&mut self) -> Result<&Checkpoint, ExecutionError> {
        let checkpoint = self.checkpoints.last().ok_or_else(|| {
            ExecutionError::RollbackFailure("no checkpoint available".to_string())
        })?;
        self.variables = checkpoint.variables.clone();
        Ok(checkpoint)
    }

    /// Marks the execution terminal.
    pub fn finish(&mut self, status: ExecutionStatus, failure_reason: Option<String>) {
        self.status = status;
        self.failure_reason = failure_reason;
        self.completed_at = Some(Utc::now());
    }

    pub fn is_terminal(&self) -> bool {
        self.status != ExecutionStatus::Running
    }

    /// Wall-clock duration, if the execution has finished.
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.completed_at.map(|end| end - self.started_at)
    }

    /// Number of steps currently in `status`.
    pub fn count_steps(&self, status: StepStatus) -> usize {
        self.steps.values().filter(|s| s.status == status).count()
    }
}
