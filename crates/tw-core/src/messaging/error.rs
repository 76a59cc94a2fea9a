//! Error types for the durable fan-out queue.

use thiserror::Error;

/// Errors returned by [`MessageQueue`](super::MessageQueue) implementations.
///
/// `Connection` and `Timeout` are transient; `InvalidTopic` and
/// `Serialization` indicate a problem with the caller's input.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessageQueueError {
    /// Failed to reach the queue backend.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The backend did not answer in time.
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Topic name rejected by the backend.
    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    /// Payload could not be encoded or was rejected.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Convenience alias for queue results.
pub type MessageQueueResult<T> = Result<T, MessageQueueError>;
