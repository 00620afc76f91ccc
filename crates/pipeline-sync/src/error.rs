//! Error types for the sync engine.

use pipeline_proto::{EntityKey, EntityKind, ProtoError};
use thiserror::Error;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur while synchronizing entities.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    /// Network-level failure of a query or mutation.
    #[error("transport error: {0}")]
    Transport(String),

    /// The push channel disconnected or could not be opened.
    #[error("push channel error: {0}")]
    Channel(String),

    /// The server returned a snapshot flagged as incomplete.
    #[error("partial {kind} snapshot: {received} records received")]
    Partial {
        /// Kind that was polled.
        kind: EntityKind,
        /// Number of records in the incomplete snapshot.
        received: usize,
    },

    /// Another mutation on the same entity is still in flight.
    #[error("{kind} {key} already has a mutation in flight")]
    Conflict {
        /// Entity kind.
        kind: EntityKind,
        /// Entity key.
        key: EntityKey,
    },

    /// Malformed push message or mutation payload.
    #[error("validation error: {0}")]
    Validation(String),

    /// The server refused a mutation.
    #[error("{kind} {key} mutation rejected: {reason}")]
    Rejected {
        /// Entity kind.
        kind: EntityKind,
        /// Entity key.
        key: EntityKey,
        /// Reason given by the server.
        reason: String,
    },

    /// A poll was abandoned because the viewed filter changed.
    #[error("{0} poll cancelled by filter change")]
    Cancelled(EntityKind),
}

impl SyncError {
    /// Whether retrying the same operation later may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Channel(_) | Self::Partial { .. } | Self::Cancelled(_)
        )
    }
}

impl From<ProtoError> for SyncError {
    fn from(err: ProtoError) -> Self {
        Self::Validation(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        Self::Validation(err.to_string())
    }
}
