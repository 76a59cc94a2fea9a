//! Value types shared by message queue implementations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Backend-assigned identifier of a published message.
///
/// The format is implementation specific (a stream offset, a delivery tag,
/// a counter).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message as stored by a queue.
#[derive(Debug, Clone)]
pub struct Message {
    /// Identifier assigned at publish time.
    pub id: MessageId,
    /// Topic the message was published to.
    pub topic: String,
    /// Raw payload, JSON for event envelopes.
    pub payload: Vec<u8>,
    /// When the queue accepted the message.
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Deserializes the payload as JSON.
    pub fn deserialize<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

/// Health report of a queue backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueHealth {
    /// Whether the backend is reachable.
    pub connected: bool,
    /// Messages accepted but not yet consumed.
    pub pending_messages: u64,
}

impl QueueHealth {
    pub fn healthy(pending_messages: u64) -> Self {
        Self {
            connected: true,
            pending_messages,
        }
    }

    pub fn disconnected() -> Self {
        Self {
            connected: false,
            pending_messages: 0,
        }
    }

    /// Connected and not lagging badly.
    pub fn is_healthy(&self) -> bool {
        self.connected && self.pending_messages < 10_000
    }
}

impl Default for QueueHealth {
    fn default() -> Self {
        Self::disconnected()
    }
}
