//! Persistence seam for execution records.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::execution::{Checkpoint, ExecutionRecord, StepState};

/// Errors returned by an [`ExecutionStore`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Storage connection error: {0}")]
    Connection(String),

    #[error("Execution not found: {0}")]
    NotFound(Uuid),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Durable storage for execution records.
///
/// The executor saves the record when it is created and again when it
/// terminates, and reports every step transition and checkpoint in between.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Inserts or replaces a record.
    async fn save(&self, record: &ExecutionRecord) -> Result<(), StoreError>;

    /// Replaces the state of one step.
    async fn update_step_state(
        &self,
        execution_id: Uuid,
        step_id: &str,
        state: &StepState,
    ) -> Result<(), StoreError>;

    async fn append_checkpoint(
        &self,
        execution_id: Uuid,
        checkpoint: &Checkpoint,
    ) -> Result<(), StoreError>;

    async fn load(&self, execution_id: Uuid) -> Result<Option<ExecutionRecord>, StoreError>;

    /// Records for a playbook, oldest first.
    async fn list_for_playbook(&self, playbook_id: Uuid)
        -> Result<Vec<ExecutionRecord>, StoreError>;
}

/// In-memory [`ExecutionStore`].
pub struct InMemoryExecutionStore {
    records: Arc<RwLock<HashMap<Uuid, ExecutionRecord>>>,
    failing: AtomicBool,
}

impl Default for InMemoryExecutionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
            failing: AtomicBool::new(false),
        }
    }

    /// Makes every call fail with a connection error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Gets a snapshot of all records.
    pub async fn snapshot(&self) -> Vec<ExecutionRecord> {
        self.records.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(StoreError::Connection("store unavailable".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn save(&self, record: &ExecutionRecord) -> Result<(), StoreError> {
        self.check()?;
        self.records.write().await.insert(record.id, record.clone());
        Ok(())
    }

    async fn update_step_state(
        &self,
        execution_id: Uuid,
        step_id: &str,
        state: &StepState,
    ) -> Result<(), StoreError> {
        self.check()?;
        let mut records = self.records.write().await;
        let record = records
            .get_mut(&execution_id)
            .ok_or(StoreError::NotFound(execution_id))?;
        record.steps.insert(step_id.to_string(), state.clone());
        Ok(())
    }

    async fn append_checkpoint(
        &self,
        execution_id: Uuid,
        checkpoint: &Checkpoint,
    ) -> Result<(), StoreError> {
        self.check()?;
        let mut records = self.records.write().await;
        let record = records
            .get_mut(&execution_id)
            .ok_or(StoreError::NotFound(execution_id))?;
        record.checkpoints.push(checkpoint.clone());
        Ok(())
    }

    async fn load(&self, execution_id: Uuid) -> Result<Option<ExecutionRecord>, StoreError> {
        self.check()?;
        Ok(self.records.read().await.get(&execution_id).cloned())
    }

    async fn list_for_playbook(
        &self,
        playbook_id: Uuid,
    ) -> Result<Vec<ExecutionRecord>, StoreError> {
        self.check()?;
        let records = self.records.read().await;
        let mut result: Vec<ExecutionRecord> = records
            .values()
            .filter(|r| r.playbook_id == playbook_id)
            .cloned()
            .collect();
        result.sort_by_key(|r| r.started_at);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Event;
    use crate::playbook::execution::{ExecutionStatus, StepStatus};
    use crate::playbook::model::{PlaybookDefinition, Step, TriggerType};

    fn record() -> ExecutionRecord {
        let org = Uuid::new_v4();
        let playbook = PlaybookDefinition::new("pb", org, TriggerType::Alert)
            .with_step(Step::new("s1", "log_message"));
        ExecutionRecord::new(&playbook, &Event::new("alert.created", "alert", "a", org))
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let store = InMemoryExecutionStore::new();
        let record = record();

        store.save(&record).await.unwrap();

        let loaded = store.load(record.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, record.id);
        assert_eq!(loaded.status, ExecutionStatus::Running);
        assert!(store.load(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_step_state() {
        let store = InMemoryExecutionStore::new();
        let mut record = record();
        store.save(&record).await.unwrap();

        let state = record
            .transition_step("s1", StepStatus::Running)
            .unwrap()
            .clone();
        store.update_step_state(record.id, "s1", &state).await.unwrap();

        let loaded = store.load(record.id).await.unwrap().unwrap();
        assert_eq!(loaded.steps["s1"].status, StepStatus::Running);
    }

    #[tokio::test]
    async fn test_update_unknown_execution() {
        let store = InMemoryExecutionStore::new();
        let id = Uuid::new_v4();
        let err = store
            .update_step_state(id, "s1", &StepState::default())
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::NotFound(id));
    }

    #[tokio::test]
    async fn test_append_checkpoint() {
        let store = InMemoryExecutionStore::new();
        let mut record = record();
        store.save(&record).await.unwrap();

        let checkpoint = record.push_checkpoint("s1");
        store
            .append_checkpoint(record.id, &checkpoint)
            .await
            .unwrap();

        let loaded = store.load(record.id).await.unwrap().unwrap();
        assert_eq!(loaded.checkpoints, vec![checkpoint]);
    }

    #[tokio::test]
    async fn test_list_for_playbook() {
        let store = InMemoryExecutionStore::new();
        let first = record();
        let mut second = first.clone();
        second.id = Uuid::new_v4();
        second.started_at = first.started_at + chrono::Duration::seconds(1);
        let other = record();

        store.save(&second).await.unwrap();
        store.save(&first).await.unwrap();
        store.save(&other).await.unwrap();

        let listed = store.list_for_playbook(first.playbook_id).await.unwrap();
        assert_eq!(
            listed.iter().map(|r| r.id).collect::<Vec<_>>(),
            vec![first.id, second.id]
        );
    }

    #[tokio::test]
    async fn test_failing_store() {
        let store = InMemoryExecutionStore::new();
        store.set_failing(true);
        assert!(matches!(
            store.save(&record()).await,
            Err(StoreError::Connection(_))
        ));
    }
}
