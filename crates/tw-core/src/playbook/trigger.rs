//! Selects the playbooks an event should start.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use super::conditions::ConditionEvaluator;
use super::context::ExecutionContext;
use super::model::{PlaybookDefinition, TriggerType};
use crate::events::Event;

/// Errors raised while matching triggers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TriggerError {
    #[error("Playbook source error: {0}")]
    Source(String),
}

/// Filter for listing playbooks.
#[derive(Debug, Clone, Default)]
pub struct PlaybookFilter {
    /// Filter by owning organization.
    pub organization_id: Option<Uuid>,
    /// Filter by active status.
    pub is_active: Option<bool>,
    /// Filter by trigger type.
    pub trigger_type: Option<TriggerType>,
}

impl PlaybookFilter {
    pub fn matches(&self, playbook: &PlaybookDefinition) -> bool {
        self.organization_id
            .map_or(true, |org| playbook.organization_id == org)
            && self.is_active.map_or(true, |active| playbook.is_active == active)
            && self
                .trigger_type
                .map_or(true, |trigger| playbook.trigger_type == trigger)
    }
}

/// Read-only source of playbook definitions.
#[async_trait]
pub trait PlaybookSource: Send + Sync {
    /// Lists playbooks matching `filter`.
    async fn list(&self, filter: &PlaybookFilter) -> Result<Vec<PlaybookDefinition>, TriggerError>;

    /// Gets a playbook by id.
    async fn get(&self, id: Uuid) -> Result<Option<PlaybookDefinition>, TriggerError>;
}

/// In-memory [`PlaybookSource`]. Listing preserves insertion order.
#[derive(Default)]
pub struct InMemoryPlaybookSource {
    playbooks: Arc<RwLock<Vec<PlaybookDefinition>>>,
}

impl InMemoryPlaybookSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a source pre-populated with playbooks.
    pub fn with_playbooks(playbooks: Vec<PlaybookDefinition>) -> Self {
        Self {
            playbooks: Arc::new(RwLock::new(playbooks)),
        }
    }

    /// Adds a playbook, replacing any existing one with the same id.
    pub async fn insert(&self, playbook: PlaybookDefinition) {
        let mut playbooks = self.playbooks.write().await;
        match playbooks.iter_mut().find(|p| p.id == playbook.id) {
            Some(existing) => *existing = playbook,
            None => playbooks.push(playbook),
        }
    }

    pub async fn remove(&self, id: Uuid) -> bool {
        let mut playbooks = self.playbooks.write().await;
        let before = playbooks.len();
        playbooks.retain(|p| p.id != id);
        playbooks.len() != before
    }
}

#[async_trait]
impl PlaybookSource for InMemoryPlaybookSource {
    async fn list(&self, filter: &PlaybookFilter) -> Result<Vec<PlaybookDefinition>, TriggerError> {
        let playbooks = self.playbooks.read().await;
        Ok(playbooks
            .iter()
            .filter(|p| filter.matches(p))
            .cloned()
            .collect())
    }

    async fn get(&self, id: Uuid) -> Result<Option<PlaybookDefinition>, TriggerError> {
        let playbooks = self.playbooks.read().await;
        Ok(playbooks.iter().find(|p| p.id == id).cloned())
    }
}

/// Maps events to the active playbooks they trigger.
pub struct TriggerMatcher {
    source: Arc<dyn PlaybookSource>,
}

impl TriggerMatcher {
    pub fn new(source: Arc<dyn PlaybookSource>) -> Self {
        Self { source }
    }

    /// Returns every active playbook of the event's organization whose
    /// trigger type matches the event category and whose trigger condition,
    /// if any, holds.
    pub async fn match_event(
        &self,
        event: &Event,
    ) -> Result<Vec<PlaybookDefinition>, TriggerError> {
        let Some(trigger_type) = TriggerType::from_event_type(&event.event_type) else {
            debug!(event_type = %event.event_type, "No trigger type for event");
            return Ok(Vec::new());
        };

        let filter = PlaybookFilter {
            organization_id: Some(event.organization_id),
            is_active: Some(true),
            trigger_type: Some(trigger_type),
        };
        let candidates = self.source.list(&filter).await?;
        let context = ExecutionContext::for_event(event);

        let matched: Vec<PlaybookDefinition> = candidates
            .into_iter()
            .filter(|playbook| match &playbook.trigger_condition {
                None => true,
                Some(condition) => match ConditionEvaluator::try_evaluate(condition, &context) {
                    Ok(result) => result,
                    Err(e) => {
                        warn!(
                            playbook_id = %playbook.id,
                            "Trigger condition could not be evaluated: {}", e
                        );
                        false
                    }
                },
            })
            .collect();

        debug!(
            event_type = %event.event_type,
            matched = matched.len(),
            "Matched playbooks for event"
        );
        Ok(matched)
    }
}
