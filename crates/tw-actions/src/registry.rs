//! Action registry for playbook steps.
//!
//! This module provides the [`Action`] trait implemented by every pluggable
//! action and the [`ActionRegistry`] that validates parameters against each
//! action's declared contract before dispatching to it.
//!
//! Registration happens once at startup. After that the registry is shared
//! read-only behind an `Arc` and handed to the executor as its
//! [`ActionDispatcher`].

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

pub use tw_core::action::{ActionContext, ActionDispatcher, ActionError, ActionResult, ParamMap};

/// Trait for pluggable actions.
#[async_trait]
pub trait Action: Send + Sync {
    /// Returns the default name the action is registered under.
    fn name(&self) -> &str;

    /// Returns a description of the action.
    fn description(&self) -> &str;

    /// Returns the parameter contract of the action.
    fn required_parameters(&self) -> Vec<ParameterDef>;

    /// Validates parameters against [`Action::required_parameters`].
    ///
    /// Checks that every required parameter is present and that every
    /// declared parameter that is present has the declared JSON type.
    fn validate(&self, params: &ParamMap) -> Result<(), ActionError> {
        for def in self.required_parameters() {
            match params.get(&def.name) {
                None | Some(serde_json::Value::Null) if def.required => {
                    return Err(ActionError::InvalidParameters(format!(
                        "Missing required parameter: {}",
                        def.name
                    )));
                }
                Some(value) if !value.is_null() && !def.param_type.accepts(value) => {
                    return Err(ActionError::InvalidParameters(format!(
                        "Parameter '{}' must be of type {}, got {}",
                        def.name,
                        def.param_type,
                        json_type_name(value)
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Executes the action with validated parameters.
    async fn execute(
        &self,
        params: ParamMap,
        context: ActionContext,
    ) -> Result<ActionResult, ActionError>;
}

/// Definition of an action parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDef {
    /// Parameter name.
    pub name: String,
    /// Parameter description.
    pub description: String,
    /// Parameter type.
    pub param_type: ParameterType,
    /// Whether the parameter is required.
    pub required: bool,
    /// Default value (if any).
    pub default: Option<serde_json::Value>,
}

impl ParameterDef {
    /// Creates a new required parameter definition.
    pub fn required(name: &str, description: &str, param_type: ParameterType) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            param_type,
            required: true,
            default: None,
        }
    }

    /// Creates a new optional parameter definition.
    pub fn optional(
        name: &str,
        description: &str,
        param_type: ParameterType,
        default: serde_json::Value,
    ) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            param_type,
            required: false,
            default: Some(default),
        }
    }
}

/// Types of action parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterType {
    String,
    Integer,
    Number,
    Boolean,
    List,
    Object,
    /// Any JSON value.
    Any,
}

impl ParameterType {
    /// Returns true if `value` has this JSON type.
    pub fn accepts(&self, value: &serde_json::Value) -> bool {
        match self {
            ParameterType::String => value.is_string(),
            ParameterType::Integer => value.is_i64() || value.is_u64(),
            ParameterType::Number => value.is_number(),
            ParameterType::Boolean => value.is_boolean(),
            ParameterType::List => value.is_array(),
            ParameterType::Object => value.is_object(),
            ParameterType::Any => true,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ParameterType::String => "string",
            ParameterType::Integer => "integer",
            ParameterType::Number => "number",
            ParameterType::Boolean => "boolean",
            ParameterType::List => "list",
            ParameterType::Object => "object",
            ParameterType::Any => "any",
        }
    }
}

impl std::fmt::Display for ParameterType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "list",
        serde_json::Value::Object(_) => "object",
    }
}

/// Metadata describing a registered action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionInfo {
    /// Name the action is registered under.
    pub name: String,
    pub description: String,
    pub parameters: Vec<ParameterDef>,
}

/// Registry for managing available actions.
#[derive(Default)]
pub struct ActionRegistry {
    actions: HashMap<String, Arc<dyn Action>>,
    /// When set, parameters are validated but no action body runs.
    dry_run: bool,
}

impl ActionRegistry {
    /// Creates a new empty action registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables or disables dry-run mode.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Registers an action under its own name.
    pub fn register(&mut self, action: Arc<dyn Action>) {
        let name = action.name().to_string();
        self.register_as(name, action);
    }

    /// Registers an action under `name`, replacing any previous entry.
    pub fn register_as(&mut self, name: impl Into<String>, action: Arc<dyn Action>) {
        let name = name.into();
        info!("Registering action: {}", name);
        if self.actions.insert(name.clone(), action).is_some() {
            warn!(action = %name, "Replaced previously registered action");
        }
    }

    /// Gets an action by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Action>> {
        self.actions.get(name).cloned()
    }

    /// Returns true if an action is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    /// Lists all registered action names, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.actions.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Returns metadata for the action registered under `name`.
    pub fn action_info(&self, name: &str) -> Option<ActionInfo> {
        self.actions.get(name).map(|action| ActionInfo {
            name: name.to_string(),
            description: action.description().to_string(),
            parameters: action.required_parameters(),
        })
    }

    /// Executes an action by name.
    ///
    /// Parameters are validated against the action's contract and missing
    /// optional parameters are filled with their declared defaults before the
    /// action body runs. A result with `success = false` is returned as-is.
    /// A panicking action body is reported as [`ActionError::ExecutionFailed`].
    #[instrument(
        skip(self, params, context),
        fields(action = %name, execution_id = %context.execution_id, step_id = %context.step_id)
    )]
    pub async fn execute(
        &self,
        name: &str,
        params: ParamMap,
        context: ActionContext,
    ) -> Result<ActionResult, ActionError> {
        let action = self
            .get(name)
            .ok_or_else(|| ActionError::NotFound(name.to_string()))?;

        action.validate(&params)?;
        let params = apply_defaults(params, &action.required_parameters());

        if self.dry_run {
            info!("Dry run - skipping action body");
            return Ok(ActionResult::success(format!(
                "Dry run - action '{}' would be executed",
                name
            )));
        }

        let start = Instant::now();
        let result = AssertUnwindSafe(action.execute(params, context))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(ActionError::from_panic(panic)));
        let duration_ms = start.elapsed().as_millis() as u64;

        match &result {
            Ok(r) if r.success => debug!(duration_ms, "Action completed: {}", r.message),
            Ok(r) => warn!(duration_ms, "Action reported failure: {}", r.message),
            Err(e) => warn!(duration_ms, "Action failed: {}", e),
        }

        result
    }
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("actions", &self.list())
            .field("dry_run", &self.dry_run)
            .finish()
    }
}

#[async_trait]
impl ActionDispatcher for ActionRegistry {
    async fn dispatch(
        &self,
        name: &str,
        params: ParamMap,
        context: ActionContext,
    ) -> Result<ActionResult, ActionError> {
        self.execute(name, params, context).await
    }
}

fn apply_defaults(mut params: ParamMap, defs: &[ParameterDef]) -> ParamMap {
    for def in defs {
        if let Some(default) = &def.default {
            let missing = params.get(&def.name).map_or(true, |v| v.is_null());
            if missing {
                params.insert(def.name.clone(), default.clone());
            }
        }
    }
    params
}
