//! detiler-core — shared vocabulary for the detiler crates.
//!
//! Holds the wire/domain types (tile records, kits, cooldowns, query
//! parameters), the tile geometry derivation and area normalization used by
//! the store, and the `detiler.toml` configuration model.

pub mod config;
pub mod error;
pub mod geometry;
pub mod types;

pub use config::DetilerConfig;
pub use error::GeometryError;
pub use geometry::{BoundingBox, GeoJsonGeometry};
pub use types::*;
