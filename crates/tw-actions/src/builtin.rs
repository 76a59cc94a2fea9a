//! Built-in actions that need no external system.
//!
//! `log_message` writes to the step's audit log and `set_variables` publishes
//! values into the execution variables under the step id. [`SimulatedAction`]
//! stands in for vendor actions when running playbooks offline.

use crate::registry::{
    Action, ActionContext, ActionError, ActionRegistry, ActionResult, ParamMap, ParameterDef,
    ParameterType,
};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, instrument};
use tw_core::action::LogLevel;

/// Registers every built-in action.
pub fn register_builtins(registry: &mut ActionRegistry) {
    registry.register(Arc::new(LogMessageAction::new()));
    registry.register(Arc::new(SetVariablesAction::new()));
}

/// Action that writes a message to the step log.
#[derive(Debug, Default)]
pub struct LogMessageAction;

impl LogMessageAction {
    pub fn new() -> Self {
        Self
    }
}

fn parse_level(level: &str) -> Option<LogLevel> {
    match level.to_ascii_lowercase().as_str() {
        "trace" => Some(LogLevel::Trace),
        "debug" => Some(LogLevel::Debug),
        "info" => Some(LogLevel::Info),
        "warn" | "warning" => Some(LogLevel::Warn),
        "error" => Some(LogLevel::Error),
        _ => None,
    }
}

#[async_trait]
impl Action for LogMessageAction {
    fn name(&self) -> &str {
        "log_message"
    }

    fn description(&self) -> &str {
        "Writes a message to the execution audit log"
    }

    fn required_parameters(&self) -> Vec<ParameterDef> {
        vec![
            ParameterDef::required("message", "The message to log", ParameterType::String),
            ParameterDef::optional(
                "level",
                "Log level (trace, debug, info, warn, error)",
                ParameterType::String,
                json!("info"),
            ),
        ]
    }

    #[instrument(skip_all, fields(step_id = %context.step_id))]
    async fn execute(
        &self,
        params: ParamMap,
        context: ActionContext,
    ) -> Result<ActionResult, ActionError> {
        let message = params
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let level_name = params
            .get("level")
            .and_then(|v| v.as_str())
            .unwrap_or("info");
        let level = parse_level(level_name).ok_or_else(|| {
            ActionError::InvalidParameters(format!("Unknown log level: {}", level_name))
        })?;

        context.log(message.clone(), level);

        Ok(ActionResult::success("Message logged").with_field("message", json!(message)))
    }
}

/// Action that exposes its `variables` object as step output.
///
/// The executor stores the output under the step id, so later steps read the
/// values as `{{<step id>.<name>}}`.
#[derive(Debug, Default)]
pub struct SetVariablesAction;

impl SetVariablesAction {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Action for SetVariablesAction {
    fn name(&self) -> &str {
        "set_variables"
    }

    fn description(&self) -> &str {
        "Publishes the given values as step output"
    }

    fn required_parameters(&self) -> Vec<ParameterDef> {
        vec![ParameterDef::required(
            "variables",
            "Object of values to publish",
            ParameterType::Object,
        )]
    }

    async fn execute(
        &self,
        mut params: ParamMap,
        context: ActionContext,
    ) -> Result<ActionResult, ActionError> {
        let variables = match params.remove("variables") {
            Some(serde_json::Value::Object(map)) => map,
            _ => {
                return Err(ActionError::InvalidParameters(
                    "Parameter 'variables' must be an object".to_string(),
                ))
            }
        };

        debug!(step_id = %context.step_id, count = variables.len(), "Setting variables");
        let message = format!("Set {} variable(s)", variables.len());
        Ok(ActionResult::success(message).with_data(variables))
    }
}

/// Stand-in for an action that is not available locally.
///
/// Accepts any parameters, records them in the step log and succeeds,
/// echoing the parameters back as output.
#[derive(Debug, Clone)]
pub struct SimulatedAction {
    name: String,
}

impl SimulatedAction {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Action for SimulatedAction {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Simulated action"
    }

    fn required_parameters(&self) -> Vec<ParameterDef> {
        Vec::new()
    }

    async fn execute(
        &self,
        params: ParamMap,
        context: ActionContext,
    ) -> Result<ActionResult, ActionError> {
        context.log(
            format!("Simulated '{}' with {} parameter(s)", self.name, params.len()),
            LogLevel::Info,
        );
        Ok(ActionResult::success(format!("Simulated action '{}'", self.name))
            .with_field("simulated", json!(true))
            .with_field("params", serde_json::Value::Object(params)))
    }
}

/// Registers a [`SimulatedAction`] for every name in `names` that has no
/// registered action yet. Returns the names that were stubbed.
pub fn register_simulated<'a, I>(registry: &mut ActionRegistry, names: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut stubbed = Vec::new();
    for name in names {
        if !registry.contains(name) {
            registry.register_as(name, Arc::new(SimulatedAction::new(name)));
            stubbed.push(name.to_string());
        }
    }
    stubbed
}

#[cfg(test)]
mod tests {
    use super::*;
    use tw_core::Event;
    use uuid::Uuid;

    fn test_context() -> ActionContext {
        let event = Arc::new(Event::new("alert.created", "alert", "a-1", Uuid::new_v4()));
        ActionContext::new(Uuid::new_v4(), Uuid::new_v4(), event, "step-1")
    }

    fn builtins() -> ActionRegistry {
        let mut registry = ActionRegistry::new();
        register_builtins(&mut registry);
        registry
    }

    #[tokio::test]
    async fn test_log_message_writes_step_log() {
        let registry = builtins();
        let context = test_context();
        let logger = context.logger.clone();

        let params = json!({"message": "isolating host", "level": "warn"})
            .as_object()
            .cloned()
            .unwrap();
        let result = registry.execute("log_message", params, context).await.unwrap();

        assert!(result.success);
        let entries = logger.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].message, "isolating host");
        assert_eq!(entries[0].level, LogLevel::Warn);
    }

    #[tokio::test]
    async fn test_log_message_default_level() {
        let registry = builtins();
        let context = test_context();
        let logger = context.logger.clone();

        let params = json!({"message": "hello"}).as_object().cloned().unwrap();
        registry.execute("log_message", params, context).await.unwrap();

        assert_eq!(logger.entries()[0].level, LogLevel::Info);
    }

    #[tokio::test]
    async fn test_log_message_unknown_level() {
        let registry = builtins();
        let params = json!({"message": "hi", "level": "loud"})
            .as_object()
            .cloned()
            .unwrap();
        let result = registry.execute("log_message", params, test_context()).await;
        assert!(matches!(result, Err(ActionError::InvalidParameters(_))));
    }

    #[tokio::test]
    async fn test_set_variables_returns_data() {
        let registry = builtins();
        let params = json!({"variables": {"ticket": "T-1", "count": 2}})
            .as_object()
            .cloned()
            .unwrap();
        let result = registry
            .execute("set_variables", params, test_context())
            .await
            .unwrap();

        let data = result.data.unwrap();
        assert_eq!(data["ticket"], json!("T-1"));
        assert_eq!(data["count"], json!(2));
    }

    #[tokio::test]
    async fn test_set_variables_requires_object() {
        let registry = builtins();
        let params = json!({"variables": [1, 2]}).as_object().cloned().unwrap();
        let result = registry.execute("set_variables", params, test_context()).await;
        assert!(matches!(result, Err(ActionError::InvalidParameters(_))));
    }

    #[tokio::test]
    async fn test_register_simulated_skips_known_names() {
        let mut registry = builtins();
        let stubbed = register_simulated(&mut registry, ["log_message", "block_ip"]);
        assert_eq!(stubbed, vec!["block_ip".to_string()]);

        let params = json!({"ip": "10.0.0.1"}).as_object().cloned().unwrap();
        let result = registry
            .execute("block_ip", params, test_context())
            .await
            .unwrap();
        assert!(result.success);
        let data = result.data.unwrap();
        assert_eq!(data["simulated"], json!(true));
        assert_eq!(data["params"]["ip"], json!("10.0.0.1"));
    }
}
