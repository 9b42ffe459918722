//! Error types for the coordination store.

use thiserror::Error;

/// Result type alias for coordination store operations.
pub type CoordResult<T> = Result<T, CoordError>;

/// Errors that can occur against the coordination store.
#[derive(Debug, Error)]
pub enum CoordError {
    /// The backing store could not be reached, opened or written.
    #[error("coordination store unavailable: {0}")]
    Connection(String),

    #[error("no node at {0}")]
    NotFound(String),

    #[error("node already exists: {0}")]
    NodeExists(String),

    #[error("node has children: {0}")]
    NotEmpty(String),

    #[error("invalid path {path:?}: {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("session {0} is closed")]
    SessionClosed(u64),

    #[error("timed out waiting for lock {0}")]
    LockTimeout(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),
}

impl CoordError {
    pub(crate) fn invalid(path: &str, reason: &str) -> Self {
        Self::InvalidPath {
            path: path.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
