//! Execution context: the JSON document that templates and conditions read.
//!
//! The context is rebuilt before each step so it reflects the variables
//! produced by earlier steps. Its shape:
//!
//! ```text
//! {
//!   <event data keys>,          // `severity`, `hostname`, ...
//!   <variable keys>,            // `enrich.score`, ... (override event data)
//!   "event": { id, type, entity_type, entity_id, organization_id, timestamp, data },
//!   "variables": { ... },
//!   "playbook_id": "...",
//!   "execution_id": "...",
//!   "organization_id": "..."
//! }
//! ```

use serde_json::{Map, Value};
use uuid::Uuid;

use crate::events::Event;

/// Read-only view used for template and condition evaluation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionContext {
    root: Value,
}

impl ExecutionContext {
    /// Wraps an existing JSON value.
    pub fn from_value(root: Value) -> Self {
        Self { root }
    }

    /// Builds the context for one step of an execution.
    pub fn build(
        event: &Event,
        variables: &Map<String, Value>,
        playbook_id: Uuid,
        execution_id: Uuid,
    ) -> Self {
        let mut root = Map::new();

        for (key, value) in &event.data {
            root.insert(key.clone(), value.clone());
        }
        for (key, value) in variables {
            root.insert(key.clone(), value.clone());
        }

        root.insert("event".to_string(), event_value(event));
        root.insert("variables".to_string(), Value::Object(variables.clone()));
        root.insert(
            "playbook_id".to_string(),
            Value::String(playbook_id.to_string()),
        );
        root.insert(
            "execution_id".to_string(),
            Value::String(execution_id.to_string()),
        );
        root.insert(
            "organization_id".to_string(),
            Value::String(event.organization_id.to_string()),
        );

        Self {
            root: Value::Object(root),
        }
    }

    /// Builds a context from an event alone, as used for trigger conditions.
    pub fn for_event(event: &Event) -> Self {
        let mut root = event.data.clone();
        root.insert("event".to_string(), event_value(event));
        root.insert(
            "organization_id".to_string(),
            Value::String(event.organization_id.to_string()),
        );
        Self {
            root: Value::Object(root),
        }
    }

    /// Looks up a dotted path. Numeric segments index arrays.
    pub fn get(&self, path: &str) -> Option<&Value> {
        lookup(&self.root, path)
    }

    pub fn as_value(&self) -> &Value {
        &self.root
    }
}

fn event_value(event: &Event) -> Value {
    serde_json::json!({
        "id": event.id.to_string(),
        "type": event.event_type,
        "entity_type": event.entity_type,
        "entity_id": event.entity_id,
        "organization_id": event.organization_id.to_string(),
        "timestamp": event.timestamp.to_rfc3339(),
        "data": Value::Object(event.data.clone()),
    })
}

/// Resolves a dotted path against `root`.
///
/// Returns `None` for an empty path, an empty segment, or any segment that
/// does not exist.
pub fn lookup<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return None;
    }

    let mut current = root;
    for segment in path.split('.') {
        if segment.is_empty() {
            return None;
        }
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => {
                let index: usize = segment.parse().ok()?;
                items.get(index)?
            }
            _ => return None,
        };
    }
    Some(current)
}
