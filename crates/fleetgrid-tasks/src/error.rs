//! Error taxonomy surfaced to RPC callers.

use fleetgrid_coord::CoordError;
use fleetgrid_model::ModelError;
use thiserror::Error;

/// Result type alias for task operations.
pub type TaskResult<T> = Result<T, TaskError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    PermissionDenied(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    CapacityExhausted(String),

    #[error("{0}")]
    Conflict(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("manager is in maintenance mode")]
    MaintenanceMode,

    #[error("{0}")]
    NotSupported(String),

    /// A polled task is still executing.
    #[error("{0}")]
    Pending(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl TaskError {
    /// Stable machine-readable name of the variant.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::PermissionDenied(_) => "permission_denied",
            Self::NotFound(_) => "not_found",
            Self::CapacityExhausted(_) => "capacity_exhausted",
            Self::Conflict(_) => "conflict",
            Self::Connection(_) => "connection",
            Self::MaintenanceMode => "maintenance_mode",
            Self::NotSupported(_) => "not_supported",
            Self::Pending(_) => "pending",
            Self::Internal(_) => "internal",
        }
    }

    /// Validation error for an empty required field.
    pub fn missing(field: &str) -> Self {
        Self::Validation(format!("please specify a {field}"))
    }
}

impl From<ModelError> for TaskError {
    fn from(e: ModelError) -> Self {
        let message = e.to_string();
        match e {
            ModelError::NotFound { .. } => Self::NotFound(message),
            ModelError::Validation(_) => Self::Validation(message),
            ModelError::CapacityExhausted { .. } => Self::CapacityExhausted(message),
            ModelError::ImmutableField(_) | ModelError::Conflict(_) => Self::Conflict(message),
            ModelError::Crypto(_) => Self::Internal(message),
            ModelError::Coord(e) => e.into(),
        }
    }
}

impl From<CoordError> for TaskError {
    fn from(e: CoordError) -> Self {
        let message = e.to_string();
        match e {
            CoordError::NotFound(_) => Self::NotFound(message),
            CoordError::NodeExists(_) | CoordError::NotEmpty(_) => Self::Conflict(message),
            CoordError::InvalidPath { .. } => Self::Validation(message),
            CoordError::Connection(_)
            | CoordError::SessionClosed(_)
            | CoordError::LockTimeout(_) => Self::Connection(message),
            CoordError::Serialize(_) | CoordError::Deserialize(_) => Self::Internal(message),
        }
    }
}
