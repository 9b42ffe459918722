//! Error types for the data model.

use fleetgrid_coord::CoordError;
use thiserror::Error;

use crate::layout::Scope;

/// Result type alias for data model operations.
pub type ModelResult<T> = Result<T, ModelError>;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("{0}")]
    Validation(String),

    #[error("no free router port in {scope} range [{min}, {max}]")]
    CapacityExhausted { scope: Scope, min: u16, max: u16 },

    #[error("{0}")]
    ImmutableField(String),

    #[error("{0}")]
    Conflict(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error(transparent)]
    Coord(#[from] CoordError),
}

impl ModelError {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Coord(e) => e.is_not_found(),
            _ => false,
        }
    }
}
