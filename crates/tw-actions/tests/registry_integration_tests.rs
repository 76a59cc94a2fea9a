//! Integration tests for the action registry behind the playbook executor.
//!
//! These tests run real playbooks through `tw-core`'s executor and engine
//! with the registry as dispatcher and cover:
//! - Built-in actions producing variables for later steps
//! - Parameter contract failures surfacing as non-retryable step errors
//! - Simulated stand-ins for vendor actions
//! - Dry-run registries
//!
//! # Running these tests
//!
//! ```bash
//! cargo test --package tw-actions --test registry_integration_tests
//! ```

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use uuid::Uuid;

use tw_actions::registry::{ActionContext, ParamMap};
use tw_actions::{
    register_builtins, register_simulated, Action, ActionError, ActionRegistry, ActionResult,
    ParameterDef, ParameterType,
};
use tw_core::events::{Event, EventBus};
use tw_core::orchestrator::PlaybookEngine;
use tw_core::playbook::{
    ErrorPolicy, ExecutionStatus, ExecutionStore, InMemoryExecutionStore, InMemoryPlaybookSource,
    PlaybookDefinition, PlaybookExecutor, Step, StepStatus, TriggerType,
};

// ============================================================================
// Test Harness
// ============================================================================

/// Counts invocations and echoes the `ip` parameter.
#[derive(Default)]
struct BlockIpAction {
    invocations: AtomicU32,
}

#[async_trait]
impl Action for BlockIpAction {
    fn name(&self) -> &str {
        "block_ip"
    }

    fn description(&self) -> &str {
        "Blocks an IP address"
    }

    fn required_parameters(&self) -> Vec<ParameterDef> {
        vec![
            ParameterDef::required("ip", "Address to block", ParameterType::String),
            ParameterDef::optional(
                "duration_minutes",
                "Block duration",
                ParameterType::Integer,
                json!(60),
            ),
        ]
    }

    async fn execute(
        &self,
        params: ParamMap,
        context: ActionContext,
    ) -> Result<ActionResult, ActionError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        context.logger.info(format!("blocking {}", params["ip"]));
        Ok(ActionResult::success("blocked")
            .with_field("ip", params["ip"].clone())
            .with_field("duration_minutes", params["duration_minutes"].clone()))
    }
}

fn registry_with(block_ip: Arc<BlockIpAction>) -> Arc<ActionRegistry> {
    let mut registry = ActionRegistry::new();
    register_builtins(&mut registry);
    registry.register(block_ip);
    Arc::new(registry)
}

fn alert(org: Uuid) -> Event {
    Event::new("alert.created", "alert", "alert-7", org)
        .with_field("severity", json!("critical"))
        .with_field("source_ip", json!("203.0.113.9"))
}

// ============================================================================
// Executor with the registry
// ============================================================================

#[tokio::test]
async fn test_builtins_feed_later_steps() {
    let org = Uuid::new_v4();
    let block_ip = Arc::new(BlockIpAction::default());
    let store = Arc::new(InMemoryExecutionStore::new());
    let executor = PlaybookExecutor::new(registry_with(block_ip.clone()), store.clone());

    let playbook = PlaybookDefinition::new("contain", org, TriggerType::Alert)
        .with_step(Step::new("vars", "set_variables").with_param(
            "variables",
            json!({"target": "{{ source_ip }}", "ticket": "SEC-1"}),
        ))
        .with_step(Step::new("block", "block_ip").with_param("ip", json!("{{ vars.target }}")))
        .with_step(
            Step::new("note", "log_message")
                .with_param("message", json!("blocked {{ block.ip }} for {{ vars.ticket }}")),
        );

    let record = executor.execute(&playbook, Arc::new(alert(org))).await;

    assert_eq!(record.status, ExecutionStatus::Completed);
    assert_eq!(block_ip.invocations.load(Ordering::SeqCst), 1);
    assert_eq!(record.variables["vars"]["target"], json!("203.0.113.9"));
    assert_eq!(record.variables["block"]["duration_minutes"], json!(60));
    assert_eq!(
        record.variables["note"]["message"],
        json!("blocked 203.0.113.9 for SEC-1")
    );

    let note = record.step("note").unwrap();
    assert_eq!(note.logs.len(), 1);
    assert_eq!(note.logs[0].message, "blocked 203.0.113.9 for SEC-1");

    let stored = store.load(record.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ExecutionStatus::Completed);
}

#[tokio::test]
async fn test_invalid_parameters_are_not_retried() {
    let org = Uuid::new_v4();
    let block_ip = Arc::new(BlockIpAction::default());
    let executor = PlaybookExecutor::new(
        registry_with(block_ip.clone()),
        Arc::new(InMemoryExecutionStore::new()),
    );

    let playbook = PlaybookDefinition::new("bad", org, TriggerType::Alert)
        .with_step(Step::new("block", "block_ip").with_retries(3))
        .with_step(Step::new("after", "log_message").with_param("message", json!("unreachable")));

    let record = executor.execute(&playbook, Arc::new(alert(org))).await;

    assert_eq!(record.status, ExecutionStatus::Failed);
    let block = record.step("block").unwrap();
    assert_eq!(block.status, StepStatus::Failed);
    assert_eq!(block.attempts, 1);
    assert!(block.error.as_deref().unwrap().contains("Missing required parameter: ip"));
    assert_eq!(record.step("after").unwrap().status, StepStatus::Pending);
    assert_eq!(block_ip.invocations.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_unknown_action_with_continue_policy() {
    let org = Uuid::new_v4();
    let executor = PlaybookExecutor::new(
        registry_with(Arc::new(BlockIpAction::default())),
        Arc::new(InMemoryExecutionStore::new()),
    );

    let playbook = PlaybookDefinition::new("partial", org, TriggerType::Alert)
        .with_step(
            Step::new("page", "page_oncall")
                .with_retries(2)
                .with_error_policy(ErrorPolicy::Continue),
        )
        .with_step(Step::new("log", "log_message").with_param("message", json!("done")));

    let record = executor.execute(&playbook, Arc::new(alert(org))).await;

    assert_eq!(record.status, ExecutionStatus::Completed);
    let page = record.step("page").unwrap();
    assert_eq!(page.status, StepStatus::Failed);
    assert_eq!(page.attempts, 1);
    assert_eq!(record.step("log").unwrap().status, StepStatus::Completed);
}

#[tokio::test]
async fn test_simulated_actions_stand_in_for_vendors() {
    let org = Uuid::new_v4();
    let playbook = PlaybookDefinition::new("vendor", org, TriggerType::Alert)
        .with_step(
            Step::new("isolate", "isolate_host").with_param("host", json!("{{ event.entity_id }}")),
        )
        .with_step(
            Step::new("ticket", "create_ticket")
                .with_condition("isolate.simulated == true")
                .with_param("title", json!("Isolated {{ isolate.params.host }}")),
        );

    let mut registry = ActionRegistry::new();
    register_builtins(&mut registry);
    let stubbed = register_simulated(
        &mut registry,
        playbook.steps.iter().map(|s| s.uses.as_str()),
    );
    assert_eq!(stubbed, vec!["isolate_host", "create_ticket"]);

    let executor =
        PlaybookExecutor::new(Arc::new(registry), Arc::new(InMemoryExecutionStore::new()));
    let record = executor.execute(&playbook, Arc::new(alert(org))).await;

    assert_eq!(record.status, ExecutionStatus::Completed);
    assert_eq!(record.variables["isolate"]["params"]["host"], json!("alert-7"));
    assert_eq!(
        record.variables["ticket"]["params"]["title"],
        json!("Isolated alert-7")
    );
}

#[tokio::test]
async fn test_dry_run_registry_skips_action_bodies() {
    let org = Uuid::new_v4();
    let block_ip = Arc::new(BlockIpAction::default());
    let mut registry = ActionRegistry::new().with_dry_run(true);
    registry.register(block_ip.clone());

    let executor =
        PlaybookExecutor::new(Arc::new(registry), Arc::new(InMemoryExecutionStore::new()));
    let playbook = PlaybookDefinition::new("dry", org, TriggerType::Alert)
        .with_step(Step::new("block", "block_ip").with_param("ip", json!("{{ source_ip }}")));

    let record = executor.execute(&playbook, Arc::new(alert(org))).await;

    assert_eq!(record.status, ExecutionStatus::Completed);
    assert_eq!(block_ip.invocations.load(Ordering::SeqCst), 0);
    let result = record.step("block").unwrap().result.clone().unwrap();
    assert!(result["message"].as_str().unwrap().starts_with("Dry run"));
    assert!(record.variables.get("block").is_none());
}

// ============================================================================
// Engine with the registry
// ============================================================================

#[tokio::test]
async fn test_engine_dispatches_through_registry() {
    let org = Uuid::new_v4();
    let block_ip = Arc::new(BlockIpAction::default());
    let bus = Arc::new(EventBus::new());

    let playbook = PlaybookDefinition::new("auto-block", org, TriggerType::Alert)
        .with_trigger_condition("severity == 'critical' && source_ip != ''")
        .with_step(Step::new("block", "block_ip").with_param("ip", json!("{{ source_ip }}")));
    let source = Arc::new(InMemoryPlaybookSource::with_playbooks(vec![playbook.clone()]));
    let store = Arc::new(InMemoryExecutionStore::new());

    let engine = PlaybookEngine::builder(bus.clone(), source, registry_with(block_ip.clone()))
        .with_store(store.clone())
        .build();
    engine.start().await;

    bus.publish(alert(org)).await;
    bus.publish(alert(org).with_field("severity", json!("low")))
        .await;
    engine.wait_idle().await;
    engine.shutdown().await;

    assert_eq!(block_ip.invocations.load(Ordering::SeqCst), 1);
    let records = store.list_for_playbook(playbook.id).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].variables["block"]["ip"], json!("203.0.113.9"));
}
