//! Error types for the detiler state store.

use detiler_core::GeometryError;
use thiserror::Error;

/// Result type alias for state store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Malformed request input, rejected before touching the engine.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Tile write for a kit that was never registered.
    #[error("kit not found: {0}")]
    KitNotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// A watched key changed between the watch and the commit.
    #[error("write conflict on key {key}")]
    WriteConflict { key: String },

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),
}

impl StoreError {
    /// Whether a caller may retry the same call with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Upstream(_))
    }
}

impl From<GeometryError> for StoreError {
    fn from(e: GeometryError) -> Self {
        StoreError::Validation(e.to_string())
    }
}
