//! Domain types shared by the store, the HTTP surface, and the client.
//!
//! Field names follow the JSON documents persisted by the store
//! (`camelCase`), so the same types travel over the wire unchanged.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::GeometryError;
use crate::geometry::{self, BoundingBox, GeoJsonGeometry, METATILE_SIZE};

/// State recorded when a writer does not supply one.
pub const UNSPECIFIED_STATE: i64 = -1;

pub type KitName = String;

// ── Tiles ──────────────────────────────────────────────────────────

/// A tile coordinate on the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileParams {
    pub z: u32,
    pub x: u32,
    pub y: u32,
}

/// Composite identity of a tile record: `(kit, z, x, y)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileKey {
    pub kit: KitName,
    pub z: u32,
    pub x: u32,
    pub y: u32,
}

impl TileKey {
    pub fn new(kit: impl Into<KitName>, z: u32, x: u32, y: u32) -> Self {
        Self {
            kit: kit.into(),
            z,
            x,
            y,
        }
    }

    pub fn tile(&self) -> TileParams {
        TileParams {
            z: self.z,
            x: self.x,
            y: self.y,
        }
    }
}

/// Processing outcome reported alongside a state update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Rendered,
    Skipped,
    Cooled,
}

/// Body of a tile write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileDetailsPayload {
    /// Caller clock, stored verbatim.
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<i64>,
    #[serde(
        default,
        rename = "status",
        alias = "outcome",
        skip_serializing_if = "Option::is_none"
    )]
    pub outcome: Option<Outcome>,
}

impl TileDetailsPayload {
    pub fn new(timestamp: u64) -> Self {
        Self {
            timestamp,
            state: None,
            outcome: None,
        }
    }

    pub fn with_state(mut self, state: i64) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_outcome(mut self, outcome: Outcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    /// The state to record, falling back to [`UNSPECIFIED_STATE`].
    pub fn effective_state(&self) -> i64 {
        self.state.unwrap_or(UNSPECIFIED_STATE)
    }
}

/// Result of an upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertStatus {
    Inserted,
    Updated,
}

/// Processing lifecycle of one tile for one kit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TileRecord {
    pub kit: KitName,
    pub z: u32,
    pub x: u32,
    pub y: u32,
    pub state: i64,
    /// Every state ever assigned, in write order.
    pub states: Vec<i64>,
    pub created_at: u64,
    pub updated_at: u64,
    pub rendered_at: u64,
    pub update_count: u64,
    pub render_count: u64,
    pub skip_count: u64,
    pub cool_count: u64,
    geoshape: String,
    coordinates: String,
}

impl TileRecord {
    /// Build the initial record for a key on its first write.
    ///
    /// This is the only place the footprint and centroid are derived.
    pub fn new(key: &TileKey, payload: &TileDetailsPayload) -> Result<Self, GeometryError> {
        let footprint = geometry::tile_footprint(key.z, key.x, key.y, METATILE_SIZE)?;
        let (lon, lat) = footprint.center();
        let state = payload.effective_state();
        let outcome = payload.outcome;
        let count_if = |o: Outcome| u64::from(outcome == Some(o));

        Ok(Self {
            kit: key.kit.clone(),
            z: key.z,
            x: key.x,
            y: key.y,
            state,
            states: vec![state],
            created_at: payload.timestamp,
            updated_at: payload.timestamp,
            rendered_at: payload.timestamp,
            update_count: 0,
            render_count: count_if(Outcome::Rendered),
            skip_count: count_if(Outcome::Skipped),
            cool_count: count_if(Outcome::Cooled),
            geoshape: footprint.to_wkt(),
            coordinates: geometry::format_coordinates(lon, lat),
        })
    }

    pub fn key(&self) -> TileKey {
        TileKey::new(self.kit.clone(), self.z, self.x, self.y)
    }

    /// WKT polygon of the metatile footprint.
    pub fn geoshape(&self) -> &str {
        &self.geoshape
    }

    /// Footprint centroid, `"lon, lat"`.
    pub fn coordinates(&self) -> &str {
        &self.coordinates
    }
}

/// Structured tile search request.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TileQuery {
    pub min_zoom: u32,
    pub max_zoom: u32,
    pub min_state: Option<i64>,
    pub max_state: Option<i64>,
    /// Match the current state instead of the whole state history.
    pub match_current_state_only: bool,
    pub kits: Vec<KitName>,
    pub area: Option<BoundingBox>,
    pub size: Option<usize>,
}

/// One page of a tile search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileQueryResponse {
    pub tiles: Vec<TileRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<u64>,
}

// ── Kits ───────────────────────────────────────────────────────────

/// Registered rendering kit plus its string-valued attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KitMetadata {
    pub name: KitName,
    #[serde(flatten)]
    pub attributes: BTreeMap<String, String>,
}

impl KitMetadata {
    pub fn new(name: impl Into<KitName>) -> Self {
        Self {
            name: name.into(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

// ── Cooldowns ──────────────────────────────────────────────────────

/// Persisted suppression window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cooldown {
    pub kits: Vec<KitName>,
    pub min_zoom: u32,
    pub max_zoom: u32,
    pub enabled: bool,
    pub duration: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub geoshape: String,
    pub created_at: u64,
    pub updated_at: u64,
}

/// Area of a cooldown: `[west, south, east, north]` or a GeoJSON polygon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Area {
    BoundingBox([f64; 4]),
    Geometry(GeoJsonGeometry),
}

impl Area {
    pub fn validate(&self) -> Result<(), GeometryError> {
        match self {
            Area::BoundingBox(values) => BoundingBox::from_slice(values)?.validate_web_mercator(),
            Area::Geometry(geometry) => geometry.validate(),
        }
    }

    pub fn to_wkt(&self) -> Result<String, GeometryError> {
        match self {
            Area::BoundingBox(values) => Ok(BoundingBox::from_slice(values)?.to_wkt()),
            Area::Geometry(geometry) => geometry.to_wkt(),
        }
    }
}

/// Body of a cooldown creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CooldownCreationRequest {
    pub kits: Vec<KitName>,
    pub min_zoom: u32,
    pub max_zoom: u32,
    pub enabled: bool,
    pub duration: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area: Option<Area>,
}

/// Cooldown search request.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CooldownQuery {
    pub enabled: Option<bool>,
    pub kits: Vec<KitName>,
    pub min_zoom: Option<u32>,
    pub max_zoom: Option<u32>,
    pub area: Option<BoundingBox>,
    pub from: Option<usize>,
    pub size: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_record_without_outcome() {
        let key = TileKey::new("k1", 1, 0, 0);
        let record = TileRecord::new(&key, &TileDetailsPayload::new(1000)).unwrap();

        assert_eq!(record.state, UNSPECIFIED_STATE);
        assert_eq!(record.states, vec![UNSPECIFIED_STATE]);
        assert_eq!(record.update_count, 0);
        assert_eq!(record.render_count + record.skip_count + record.cool_count, 0);
        assert_eq!(record.rendered_at, 1000);
        assert_eq!(record.created_at, 1000);
        assert_eq!(record.key(), key);
        assert!(record.geoshape().starts_with("POLYGON (("));
    }

    #[test]
    fn new_record_counts_initial_outcome() {
        let key = TileKey::new("k1", 5, 1, 1);
        let payload = TileDetailsPayload::new(42)
            .with_state(7)
            .with_outcome(Outcome::Rendered);
        let record = TileRecord::new(&key, &payload).unwrap();

        assert_eq!(record.states, vec![7]);
        assert_eq!(record.render_count, 1);
        assert_eq!(record.skip_count, 0);
        assert_eq!(record.rendered_at, 42);
        assert_eq!(record.coordinates(), "-112.500000, 22.500000");
    }

    #[test]
    fn payload_accepts_status_field() {
        let payload: TileDetailsPayload =
            serde_json::from_str(r#"{"timestamp":1,"state":3,"status":"skipped"}"#).unwrap();
        assert_eq!(payload.outcome, Some(Outcome::Skipped));

        let payload: TileDetailsPayload = serde_json::from_str(r#"{"timestamp":1}"#).unwrap();
        assert_eq!(payload.effective_state(), UNSPECIFIED_STATE);
        assert!(payload.outcome.is_none());
    }

    #[test]
    fn tile_record_json_is_camel_case() {
        let key = TileKey::new("k1", 5, 0, 0);
        let record = TileRecord::new(&key, &TileDetailsPayload::new(1)).unwrap();
        let value = serde_json::to_value(&record).unwrap();
        assert!(value.get("updateCount").is_some());
        assert!(value.get("geoshape").is_some());
        assert_eq!(value["renderedAt"], 1);

        let back: TileRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn kit_metadata_flattens_attributes() {
        let kit = KitMetadata::new("kit1").with_attribute("maxState", "0");
        let value = serde_json::to_value(&kit).unwrap();
        assert_eq!(value["name"], "kit1");
        assert_eq!(value["maxState"], "0");
    }

    #[test]
    fn area_accepts_bbox_or_geometry() {
        let bbox: Area = serde_json::from_str("[1, 2, 3, 4]").unwrap();
        assert_eq!(bbox.to_wkt().unwrap(), "POLYGON ((1 4, 1 2, 3 2, 3 4, 1 4))");

        let polygon: Area = serde_json::from_str(
            r#"{"type":"Polygon","coordinates":[[[0,0],[1,0],[1,1],[0,1],[0,0]]]}"#,
        )
        .unwrap();
        assert!(matches!(polygon, Area::Geometry(_)));
        assert!(polygon.validate().is_ok());
    }
}
