//! Geometry validation errors.

use thiserror::Error;

/// Errors raised while validating or normalizing geographic input.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GeometryError {
    #[error("invalid bounding box: {0}")]
    BoundingBox(String),

    #[error("invalid geometry: {0}")]
    Geometry(String),

    #[error("invalid tile: {0}")]
    Tile(String),

    #[error("wkt parse error: {0}")]
    Wkt(String),
}
