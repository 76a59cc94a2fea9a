//! Playbook data structures for Triage Warden.
//!
//! A playbook is an ordered list of steps run in response to a matching
//! event. Definitions are read-only to the engine.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;
use uuid::Uuid;

use super::conditions::{self, ConditionError};
use crate::action::ParamMap;

/// Kind of event that activates a playbook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Alert,
    Incident,
    Manual,
    Scheduled,
}

impl TriggerType {
    /// Maps an event type to the trigger type it can activate.
    ///
    /// `alert.*` → alert, `incident.*` → incident, `manual.*` and
    /// `playbook.manual` → manual, `scheduled.*` → scheduled.
    pub fn from_event_type(event_type: &str) -> Option<Self> {
        if event_type == "playbook.manual" {
            return Some(TriggerType::Manual);
        }
        let category = event_type
            .split_once('.')
            .map(|(category, _)| category)
            .unwrap_or(event_type);
        match category {
            "alert" => Some(TriggerType::Alert),
            "incident" => Some(TriggerType::Incident),
            "manual" => Some(TriggerType::Manual),
            "scheduled" => Some(TriggerType::Scheduled),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Alert => "alert",
            TriggerType::Incident => "incident",
            TriggerType::Manual => "manual",
            TriggerType::Scheduled => "scheduled",
        }
    }
}

impl std::fmt::Display for TriggerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happens when a step fails after exhausting its retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Fail the execution and stop.
    #[default]
    Abort,
    /// Record the failure and move on to the next step.
    Continue,
    /// Restore variables from the last checkpoint, fail the execution and stop.
    Rollback,
}

/// A single step in a playbook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Identifier, unique within the playbook. Output data is stored under it.
    pub id: String,
    /// Optional display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Name of the action to invoke.
    pub uses: String,
    /// Parameter template, resolved against the execution context.
    #[serde(default, rename = "with")]
    pub params: ParamMap,
    /// Condition that must hold for the step to run.
    #[serde(default, rename = "if", skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Per-attempt timeout in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Additional attempts after the first failure.
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub error_policy: ErrorPolicy,
}

impl Step {
    /// Creates a step that invokes `uses`.
    pub fn new(id: impl Into<String>, uses: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            uses: uses.into(),
            params: ParamMap::new(),
            condition: None,
            timeout_ms: None,
            retries: 0,
            error_policy: ErrorPolicy::default(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the parameter template. Non-object values are ignored.
    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        if let serde_json::Value::Object(map) = params {
            self.params = map;
        }
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }
}

/// A playbook definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybookDefinition {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    /// Tenant that owns the playbook.
    pub organization_id: Uuid,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Inactive playbooks never match.
    #[serde(default = "default_true")]
    pub is_active: bool,
    pub trigger_type: TriggerType,
    /// Optional condition evaluated against the event context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_condition: Option<String>,
    /// Steps, run strictly in this order.
    #[serde(default)]
    pub steps: Vec<Step>,
}

fn default_true() -> bool {
    true
}

impl PlaybookDefinition {
    /// Creates an active playbook with no steps.
    pub fn new(name: impl Into<String>, organization_id: Uuid, trigger_type: TriggerType) -> Self {
        Self {
            id: Uuid::new_v4(),
            organization_id,
            name: name.into(),
            description: None,
            is_active: true,
            trigger_type,
            trigger_condition: None,
            steps: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_trigger_condition(mut self, condition: impl Into<String>) -> Self {
        self.trigger_condition = Some(condition.into());
        self
    }

    pub fn with_step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_steps(mut self, steps: Vec<Step>) -> Self {
        self.steps = steps;
        self
    }

    pub fn with_active(mut self, is_active: bool) -> Self {
        self.is_active = is_active;
        self
    }

    /// Looks up a step by id.
    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Step id problems that leave per-step state ambiguous. The executor
    /// refuses to run a definition that has any.
    pub fn step_id_errors(&self) -> Vec<PlaybookValidationError> {
        let mut errors = Vec::new();
        let mut seen = HashSet::new();
        for (index, step) in self.steps.iter().enumerate() {
            if step.id.trim().is_empty() {
                errors.push(PlaybookValidationError::EmptyStepId { index });
            } else if !seen.insert(step.id.as_str()) {
                errors.push(PlaybookValidationError::DuplicateStepId(step.id.clone()));
            }
        }
        errors
    }

    /// Checks the definition for structural problems, returning every one
    /// found.
    pub fn validate(&self) -> Result<(), Vec<PlaybookValidationError>> {
        let mut errors = Vec::new();

        if self.name.trim().is_empty() {
            errors.push(PlaybookValidationError::EmptyName);
        }

        if let Some(condition) = &self.trigger_condition {
            if let Err(source) = conditions::parse(condition) {
                errors.push(PlaybookValidationError::InvalidTriggerCondition(source));
            }
        }

        errors.extend(self.step_id_errors());

        for step in &self.steps {
            if step.uses.trim().is_empty() {
                errors.push(PlaybookValidationError::EmptyAction {
                    step_id: step.id.clone(),
                });
            }

            if let Some(condition) = &step.condition {
                if let Err(source) = conditions::parse(condition) {
                    errors.push(PlaybookValidationError::InvalidStepCondition {
                        step_id: step.id.clone(),
                        source,
                    });
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Structural problems found by [`PlaybookDefinition::validate`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlaybookValidationError {
    #[error("playbook name is empty")]
    EmptyName,

    #[error("step at index {index} has an empty id")]
    EmptyStepId { index: usize },

    #[error("duplicate step id '{0}'")]
    DuplicateStepId(String),

    #[error("step '{step_id}' does not name an action")]
    EmptyAction { step_id: String },

    #[error("step '{step_id}' has an invalid condition: {source}")]
    InvalidStepCondition {
        step_id: String,
        source: ConditionError,
    },

    #[error("invalid trigger condition: {0}")]
    InvalidTriggerCondition(ConditionError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_playbook() -> PlaybookDefinition {
        PlaybookDefinition::new("Isolate host", Uuid::new_v4(), TriggerType::Alert)
            .with_description("Contain compromised endpoints")
            .with_step(
                Step::new("notify", "notify_channel")
                    .with_param("message", json!("Alert on {{ hostname }}")),
            )
            .with_step(
                Step::new("isolate", "isolate_host")
                    .with_condition("severity == 'critical'")
                    .with_retries(2)
                    .with_error_policy(ErrorPolicy::Rollback),
            )
    }

    #[test]
    fn test_trigger_type_from_event_type() {
        assert_eq!(
            TriggerType::from_event_type("alert.created"),
            Some(TriggerType::Alert)
        );
        assert_eq!(
            TriggerType::from_event_type("incident.status_changed"),
            Some(TriggerType::Incident)
        );
        assert_eq!(
            TriggerType::from_event_type("playbook.manual"),
            Some(TriggerType::Manual)
        );
        assert_eq!(
            TriggerType::from_event_type("manual.run"),
            Some(TriggerType::Manual)
        );
        assert_eq!(
            TriggerType::from_event_type("scheduled.hourly"),
            Some(TriggerType::Scheduled)
        );
        assert_eq!(TriggerType::from_event_type("playbook.completed"), None);
        assert_eq!(TriggerType::from_event_type("unknown"), None);
    }

    #[test]
    fn test_step_defaults() {
        let step = Step::new("s1", "log_message");
        assert_eq!(step.retries, 0);
        assert_eq!(step.error_policy, ErrorPolicy::Abort);
        assert!(step.condition.is_none());
        assert!(step.timeout_ms.is_none());
    }

    #[test]
    fn test_playbook_yaml_deserialization() {
        let yaml = r#"
organization_id: 7f1b3c2e-9a4d-4e8f-b6a1-2c3d4e5f6a7b
name: Critical alert response
trigger_type: alert
trigger_condition: severity == "critical"
steps:
  - id: notify
    uses: notify_channel
    with:
      message: "Alert on {{ hostname }}"
  - id: ticket
    uses: create_ticket
    if: severity === "critical"
    timeout_ms: 5000
    retries: 2
    error_policy: continue
"#;
        let playbook: PlaybookDefinition = serde_yaml::from_str(yaml).unwrap();

        assert!(playbook.is_active);
        assert_eq!(playbook.trigger_type, TriggerType::Alert);
        assert_eq!(playbook.steps.len(), 2);
        assert_eq!(
            playbook.steps[0].params.get("message"),
            Some(&json!("Alert on {{ hostname }}"))
        );
        let ticket = playbook.step("ticket").unwrap();
        assert_eq!(ticket.condition.as_deref(), Some("severity === \"critical\""));
        assert_eq!(ticket.timeout_ms, Some(5000));
        assert_eq!(ticket.retries, 2);
        assert_eq!(ticket.error_policy, ErrorPolicy::Continue);
    }

    #[test]
    fn test_step_serializes_reserved_names() {
        let step = Step::new("s1", "log_message")
            .with_condition("true")
            .with_param("message", json!("hi"));
        let value = serde_json::to_value(&step).unwrap();
        assert_eq!(value["if"], json!("true"));
        assert_eq!(value["with"]["message"], json!("hi"));
        assert_eq!(value["error_policy"], json!("abort"));
    }

    #[test]
    fn test_validate_accepts_well_formed_playbook() {
        assert!(sample_playbook().validate().is_ok());
    }

    #[test]
    fn test_validate_reports_every_problem() {
        let playbook = PlaybookDefinition::new(" ", Uuid::new_v4(), TriggerType::Incident)
            .with_trigger_condition("severity ==")
            .with_step(Step::new("a", "log_message"))
            .with_step(Step::new("a", ""))
            .with_step(Step::new("", "log_message").with_condition("(x"));

        let errors = playbook.validate().unwrap_err();

        assert!(errors.contains(&PlaybookValidationError::EmptyName));
        assert!(errors.contains(&PlaybookValidationError::DuplicateStepId("a".into())));
        assert!(errors.contains(&PlaybookValidationError::EmptyAction {
            step_id: "a".into()
        }));
        assert!(errors.contains(&PlaybookValidationError::EmptyStepId { index: 2 }));
        assert!(errors
            .iter()
            .any(|e| matches!(e, PlaybookValidationError::InvalidTriggerCondition(_))));
        assert!(errors
            .iter()
            .any(|e| matches!(e, PlaybookValidationError::InvalidStepCondition { .. })));
    }

    #[test]
    fn test_step_id_errors() {
        assert!(sample_playbook().step_id_errors().is_empty());

        let playbook = PlaybookDefinition::new("p", Uuid::new_v4(), TriggerType::Alert)
            .with_step(Step::new("a", "log_message").with_condition("(x"))
            .with_step(Step::new("a", "log_message"))
            .with_step(Step::new(" ", "log_message"));

        assert_eq!(
            playbook.step_id_errors(),
            vec![
                PlaybookValidationError::DuplicateStepId("a".into()),
                PlaybookValidationError::EmptyStepId { index: 2 },
            ]
        );
    }
}
