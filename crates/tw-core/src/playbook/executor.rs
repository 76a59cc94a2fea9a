//! Sequential playbook executor.
//!
//! Drives one [`ExecutionRecord`] through a playbook's steps in list order:
//! evaluate the step's `if`, resolve its parameters, dispatch the action
//! with timeout and retries, then apply the step's error policy. Step
//! failures never escape as errors; they become step and execution state.

use futures::FutureExt;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

use super::conditions::ConditionEvaluator;
use super::context::ExecutionContext;
use super::execution::{ExecutionRecord, ExecutionStatus, StepState, StepStatus};
use super::model::{ErrorPolicy, PlaybookDefinition, Step};
use super::store::ExecutionStore;
use super::template::TemplateResolver;
use crate::action::{
    ActionContext, ActionDispatcher, ActionError, ActionResult, ParamMap, StepLogger,
};
use crate::events::Event;

/// Executor tuning.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Timeout applied to steps that do not set `timeout_ms`.
    pub default_step_timeout: Option<Duration>,
    /// Delay between a failed attempt and its retry.
    pub retry_backoff: Duration,
}

enum StepOutcome {
    Proceed,
    Stop(String),
}

/// Runs playbooks against events.
pub struct PlaybookExecutor {
    dispatcher: Arc<dyn ActionDispatcher>,
    store: Arc<dyn ExecutionStore>,
    resolver: TemplateResolver,
    config: ExecutorConfig,
}

impl PlaybookExecutor {
    pub fn new(dispatcher: Arc<dyn ActionDispatcher>, store: Arc<dyn ExecutionStore>) -> Self {
        Self {
            dispatcher,
            store,
            resolver: TemplateResolver::new(),
            config: ExecutorConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.store
    }

    /// Runs `playbook` for `event` and returns the terminal record.
    #[instrument(skip_all, fields(playbook_id = %playbook.id, event_id = %event.id))]
    pub async fn execute(
        &self,
        playbook: &PlaybookDefinition,
        event: Arc<Event>,
    ) -> ExecutionRecord {
        let mut record = ExecutionRecord::new(playbook, &event);
        let started = Instant::now();
        info!(
            execution_id = %record.id,
            playbook = %playbook.name,
            steps = playbook.steps.len(),
            "Starting playbook execution"
        );
        self.save(&record).await;

        let id_errors = playbook.step_id_errors();
        let mut failure = None;
        if !id_errors.is_empty() {
            let details: Vec<String> = id_errors.iter().map(ToString::to_string).collect();
            failure = Some(format!("invalid playbook: {}", details.join("; ")));
        } else {
            for step in &playbook.steps {
                if let StepOutcome::Stop(reason) =
                    self.run_step(playbook, step, &event, &mut record).await
                {
                    failure = Some(reason);
                    break;
                }
            }
        }

        match failure {
            Some(reason) => {
                warn!(execution_id = %record.id, reason = %reason, "Playbook execution failed");
                record.finish(ExecutionStatus::Failed, Some(reason));
            }
            None => {
                info!(execution_id = %record.id, "Playbook execution completed");
                record.finish(ExecutionStatus::Completed, None);
            }
        }
        self.save(&record).await;

        metrics::counter!("playbook_executions_total", "status" => record.status.as_str())
            .increment(1);
        metrics::histogram!("playbook_execution_duration_seconds")
            .record(started.elapsed().as_secs_f64());

        record
    }

    async fn run_step(
        &self,
        playbook: &PlaybookDefinition,
        step: &Step,
        event: &Arc<Event>,
        record: &mut ExecutionRecord,
    ) -> StepOutcome {
        let step_id = step.id.as_str();
        if !self
            .transition(record, step_id, StepStatus::Running, |_| {})
            .await
        {
            return StepOutcome::Stop(format!("step '{}' could not be started", step_id));
        }

        let context = ExecutionContext::build(event, &record.variables, playbook.id, record.id);

        if let Some(condition) = &step.condition {
            let should_run = match ConditionEvaluator::try_evaluate(condition, &context) {
                Ok(result) => result,
                Err(e) => {
                    warn!(
                        step_id,
                        condition = %condition,
                        "Step condition could not be evaluated: {}",
                        e
                    );
                    false
                }
            };
            if !should_run {
                debug!(step_id, "Step condition false, skipping");
                self.transition(record, step_id, StepStatus::Skipped, |_| {})
                    .await;
                return StepOutcome::Proceed;
            }
        }

        let params = self.resolver.resolve_params(&step.params, &context);

        if step.error_policy == ErrorPolicy::Rollback {
            let checkpoint = record.push_checkpoint(step_id);
            if let Err(e) = self.store.append_checkpoint(record.id, &checkpoint).await {
                warn!(execution_id = %record.id, step_id, "Failed to persist checkpoint: {}", e);
            }
        }

        let logger = StepLogger::new(playbook.id, record.id, record.organization_id, step_id);
        let timeout = step
            .timeout_ms
            .map(Duration::from_millis)
            .or(self.config.default_step_timeout);

        let outcome = loop {
            let attempt = match record.step_mut(step_id) {
                Ok(state) => {
                    state.attempts += 1;
                    state.attempts
                }
                Err(e) => break Err(ActionError::ExecutionFailed(e.to_string())),
            };

            let action_context =
                ActionContext::new(playbook.id, record.id, Arc::clone(event), step_id)
                    .with_attempt(attempt)
                    .with_variables(record.variables.clone())
                    .with_logger(logger.clone());

            debug!(step_id, action = %step.uses, attempt, "Dispatching action");
            match self
                .invoke(&step.uses, params.clone(), action_context, timeout)
                .await
            {
                Ok(result) => break Ok(result),
                Err(e) if e.is_retryable() && attempt <= step.retries => {
                    warn!(
                        step_id,
                        attempt,
                        retries = step.retries,
                        "Action failed, retrying: {}",
                        e
                    );
                    metrics::counter!("playbook_action_retries_total").increment(1);
                    if !self.config.retry_backoff.is_zero() {
                        tokio::time::sleep(self.config.retry_backoff).await;
                    }
                }
                Err(e) => break Err(e),
            }
        };

        let logs = logger.entries();

        match outcome {
            Ok(result) => {
                if let Some(data) = &result.data {
                    record
                        .variables
                        .insert(step.id.clone(), Value::Object(data.clone()));
                }
                let result_value = serde_json::to_value(&result).ok();
                self.transition(record, step_id, StepStatus::Completed, |state| {
                    state.result = result_value;
                    state.logs = logs;
                })
                .await;
                info!(step_id, action = %step.uses, "Step completed");
                StepOutcome::Proceed
            }
            Err(e) => {
                let error = match e {
                    ActionError::Timeout(_) => "timeout".to_string(),
                    other => other.to_string(),
                };
                warn!(step_id, action = %step.uses, error = %error, "Step failed");
                let error_for_state = error.clone();
                self.transition(record, step_id, StepStatus::Failed, |state| {
                    state.error = Some(error_for_state);
                    state.logs = logs;
                })
                .await;

                let reason = format!("step '{}' failed: {}", step_id, error);
                match step.error_policy {
                    ErrorPolicy::Continue => StepOutcome::Proceed,
                    ErrorPolicy::Abort => StepOutcome::Stop(reason),
                    ErrorPolicy::Rollback => match record.restore_checkpoint() {
                        Ok(checkpoint) => {
                            info!(
                                step_id,
                                checkpoint_step = %checkpoint.step_id,
                                "Variables restored from checkpoint"
                            );
                            StepOutcome::Stop(reason)
                        }
                        Err(e) => StepOutcome::Stop(e.to_string()),
                    },
                }
            }
        }
    }

    /// Dispatches one attempt, racing it against `timeout`. A panic in the
    /// action becomes a retryable execution failure.
    async fn invoke(
        &self,
        action: &str,
        params: ParamMap,
        context: ActionContext,
        timeout: Option<Duration>,
    ) -> Result<ActionResult, ActionError> {
        let dispatch = async {
            AssertUnwindSafe(self.dispatcher.dispatch(action, params, context))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    let e = ActionError::from_panic(panic);
                    error!(action, "Action panicked: {}", e);
                    Err(e)
                })
        };
        let result = match timeout {
            Some(limit) => match tokio::time::timeout(limit, dispatch).await {
                Ok(result) => result,
                Err(_) => return Err(ActionError::Timeout(whole_millis(limit))),
            },
            None => dispatch.await,
        }?;

        if result.success {
            Ok(result)
        } else {
            Err(ActionError::ExecutionFailed(result.message))
        }
    }

    async fn transition(
        &self,
        record: &mut ExecutionRecord,
        step_id: &str,
        next: StepStatus,
        update: impl FnOnce(&mut StepState),
    ) -> bool {
        let execution_id = record.id;
        let snapshot = match record.transition_step(step_id, next) {
            Ok(state) => {
                update(state);
                state.clone()
            }
            Err(e) => {
                warn!(%execution_id, "Rejected step transition: {}", e);
                return false;
            }
        };

        if next.is_terminal() {
            metrics::counter!("playbook_steps_total", "status" => next.as_str()).increment(1);
        }
        if let Err(e) = self
            .store
            .update_step_state(execution_id, step_id, &snapshot)
            .await
        {
            warn!(%execution_id, step_id, "Failed to persist step state: {}", e);
        }
        true
    }

    async fn save(&self, record: &ExecutionRecord) {
        if let Err(e) = self.store.save(record).await {
            warn!(execution_id = %record.id, "Failed to persist execution record: {}", e);
        }
    }
}

/// Milliseconds in `duration`, saturating at `u64::MAX`.
fn whole_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
