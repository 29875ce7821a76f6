//! Error types for the store and its event stream.

use crate::types::{Index, Topic};
use thiserror::Error;

/// Main error type for store and streaming operations.
///
/// The enum is `Clone` because a failed snapshot build is cached and handed
/// to every subscriber that was waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("Unknown topic: {0}")]
    UnknownTopic(Topic),

    #[error("Invalid subject for topic {topic}: {reason}")]
    InvalidSubject { topic: Topic, reason: String },

    #[error("Snapshot build failed: {0}")]
    SnapshotBuildFailed(String),

    #[error("Subscription was reset by the server, resubscribe to continue")]
    ForcedReset,

    #[error("Subscription cancelled")]
    Cancelled,

    #[error("Deadline exceeded")]
    DeadlineExceeded,

    #[error("subscription was closed by unsubscribe")]
    Unsubscribed,

    #[error("Event publisher is shutting down")]
    ShuttingDown,

    #[error("Failed to start event publisher: {0}")]
    PublisherStart(String),

    #[error("Handler already registered for topic: {0}")]
    DuplicateHandler(Topic),

    #[error("Table not found: {0}")]
    UnknownTable(String),

    #[error("Invalid index: {index:?} (last committed is {current:?})")]
    InvalidIndex { index: Index, current: Index },

    #[error("Event derivation failed for topic {topic}: {reason}")]
    EventDerivation { topic: Topic, reason: String },

    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("ACL resolution failed: {0}")]
    AclResolution(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),
}

impl StoreError {
    /// Whether a subscriber should come back after seeing this error.
    ///
    /// A forced reset asks for an immediate resubscribe, a failed snapshot
    /// for a retry with backoff. Cancellation is final.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::ForcedReset | StoreError::SnapshotBuildFailed(_)
        )
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
