//! Metrics for the playbook engine.
//!
//! The engine crates record through the `metrics` facade directly. This
//! module registers descriptions for those metrics and provides a
//! [`MetricsCollector`] that aggregates execution KPIs from finished
//! execution records.

use chrono::Duration;
use metrics::{describe_counter, describe_histogram};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tw_core::playbook::{ExecutionRecord, ExecutionStatus, StepStatus};

/// Registers descriptions for every metric the engine emits.
pub fn describe_metrics() {
    describe_counter!(
        "playbook_events_published_total",
        "Total number of events published on the event bus"
    );
    describe_counter!(
        "playbook_event_queue_failures_total",
        "Total number of failed durable event fan-outs"
    );
    describe_counter!(
        "playbook_executions_total",
        "Total number of finished playbook executions by status"
    );
    describe_counter!(
        "playbook_steps_total",
        "Total number of step state transitions by status"
    );
    describe_counter!(
        "playbook_action_retries_total",
        "Total number of action retries"
    );
    describe_histogram!(
        "playbook_execution_duration_seconds",
        "Wall-clock duration of playbook executions"
    );
}

/// Key performance indicators over a set of executions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionKpis {
    /// Total executions recorded.
    pub total_executions: u64,
    /// Executions by final status.
    pub executions_by_status: BTreeMap<String, u64>,
    /// Steps by final status.
    pub steps_by_status: BTreeMap<String, u64>,
    /// Action invocations beyond the first attempt.
    pub retries: u64,
    /// Mean execution duration.
    #[serde(with = "duration_millis")]
    pub mean_duration: Option<Duration>,
    /// Fraction of executions that completed.
    pub success_rate: f64,
}

mod duration_millis {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        value.map(|d| d.num_milliseconds()).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<i64>::deserialize(d)?.map(Duration::milliseconds))
    }
}

#[derive(Debug, Default)]
struct Totals {
    executions: u64,
    by_status: BTreeMap<String, u64>,
    steps: BTreeMap<String, u64>,
    retries: u64,
    duration_ms_sum: i64,
    timed: u64,
}

/// Aggregates KPIs over finished executions.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector {
    totals: Arc<RwLock<Totals>>,
}

impl MetricsCollector {
    /// Creates a new metrics collector and registers metric descriptions.
    pub fn new() -> Self {
        describe_metrics();
        Self::default()
    }

    /// Records one execution. Non-terminal records are ignored.
    pub async fn record_execution(&self, record: &ExecutionRecord) {
        if !record.is_terminal() {
            return;
        }

        let mut totals = self.totals.write().await;
        totals.executions += 1;
        *totals
            .by_status
            .entry(record.status.as_str().to_string())
            .or_default() += 1;

        for state in record.steps.values() {
            *totals
                .steps
                .entry(state.status.as_str().to_string())
                .or_default() += 1;
            totals.retries += u64::from(state.attempts.saturating_sub(1));
        }

        if let Some(duration) = record.duration() {
            totals.duration_ms_sum += duration.num_milliseconds();
            totals.timed += 1;
        }
    }

    /// Number of steps recorded with `status`.
    pub async fn step_count(&self, status: StepStatus) -> u64 {
        self.totals
            .read()
            .await
            .steps
            .get(status.as_str())
            .copied()
            .unwrap_or(0)
    }

    /// Calculates current KPIs.
    pub async fn calculate_kpis(&self) -> ExecutionKpis {
        let totals = self.totals.read().await;

        let mean_duration = if totals.timed > 0 {
            Some(Duration::milliseconds(
                totals.duration_ms_sum / totals.timed as i64,
            ))
        } else {
            None
        };

        let completed = totals
            .by_status
            .get(ExecutionStatus::Completed.as_str())
            .copied()
            .unwrap_or(0);
        let success_rate = if totals.executions > 0 {
            completed as f64 / totals.executions as f64
        } else {
            0.0
        };

        ExecutionKpis {
            total_executions: totals.executions,
            executions_by_status: totals.by_status.clone(),
            steps_by_status: totals.steps.clone(),
            retries: totals.retries,
            mean_duration,
            success_rate,
        }
    }

    /// Clears all recorded data.
    pub async fn reset(&self) {
        *self.totals.write().await = Totals::default();
    }
}
