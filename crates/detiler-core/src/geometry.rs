//! Tile footprints and area normalization.
//!
//! Tiles are laid out on the WorldCRS84 grid (two tiles at zoom 0, origin at
//! the top-left corner) and grouped into metatiles before their footprint is
//! computed. Every area that reaches the index engine is serialized as a WKT
//! polygon; bounding boxes use the fixed ring order
//! `(west north, west south, east south, east north, west north)`.

use std::str::FromStr;

use geo_types::{Geometry, LineString, MultiPolygon, Polygon};
use serde::{Deserialize, Serialize};
use wkt::ToWkt;

use crate::error::GeometryError;

/// Number of tiles grouped on each axis when deriving a footprint.
pub const METATILE_SIZE: u32 = 8;

/// Decimal digits kept when formatting a tile centroid.
pub const COORDINATES_FRACTION_DIGITS: usize = 6;

/// Latitude limit of the web-mercator tile grid.
pub const WEB_MERCATOR_MAX_LAT: f64 = 85.051_128_779_806_59;

/// Default cooldown area. The geoshape index rejects a strict global box,
/// so the default covers half the globe in longitude.
pub const HALF_GLOBE_BBOX: BoundingBox = BoundingBox {
    west: -90.0,
    south: -WEB_MERCATOR_MAX_LAT,
    east: 90.0,
    north: WEB_MERCATOR_MAX_LAT,
};

const CRS84_WEST: f64 = -180.0;
const CRS84_EAST: f64 = 180.0;
const CRS84_SOUTH: f64 = -90.0;
const CRS84_NORTH: f64 = 90.0;
/// Degrees covered by one zoom-0 tile of the WorldCRS84 grid.
const CRS84_ZOOM0_TILE_DEGREES: f64 = 180.0;

/// Axis-aligned bounding box in lon/lat degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

impl BoundingBox {
    pub const fn new(west: f64, south: f64, east: f64, north: f64) -> Self {
        Self {
            west,
            south,
            east,
            north,
        }
    }

    /// Build from a `[west, south, east, north]` slice.
    pub fn from_slice(values: &[f64]) -> Result<Self, GeometryError> {
        match values {
            [west, south, east, north] => Ok(Self::new(*west, *south, *east, *north)),
            other => Err(GeometryError::BoundingBox(format!(
                "expected 4 values [west, south, east, north], got {}",
                other.len()
            ))),
        }
    }

    pub fn to_array(&self) -> [f64; 4] {
        [self.west, self.south, self.east, self.north]
    }

    /// Validate against the web-mercator tile grid extent.
    pub fn validate_web_mercator(&self) -> Result<(), GeometryError> {
        let values = self.to_array();
        if values.iter().any(|v| !v.is_finite()) {
            return Err(GeometryError::BoundingBox(format!(
                "non-finite coordinate in {values:?}"
            )));
        }
        if self.west >= self.east || self.south >= self.north {
            return Err(GeometryError::BoundingBox(format!(
                "west must be less than east and south less than north, got {values:?}"
            )));
        }
        if self.west < CRS84_WEST || self.east > CRS84_EAST {
            return Err(GeometryError::BoundingBox(format!(
                "longitude out of range [-180, 180] in {values:?}"
            )));
        }
        if self.south < -WEB_MERCATOR_MAX_LAT || self.north > WEB_MERCATOR_MAX_LAT {
            return Err(GeometryError::BoundingBox(format!(
                "latitude out of web-mercator range in {values:?}"
            )));
        }
        Ok(())
    }

    /// Serialize as a closed WKT polygon.
    pub fn to_wkt(&self) -> String {
        let Self {
            west,
            south,
            east,
            north,
        } = self;
        format!(
            "POLYGON (({west} {north}, {west} {south}, {east} {south}, {east} {north}, {west} {north}))"
        )
    }

    /// Midpoint of the box as `(lon, lat)`.
    pub fn center(&self) -> (f64, f64) {
        ((self.west + self.east) / 2.0, (self.north + self.south) / 2.0)
    }
}

/// Compute the clamped WorldCRS84 footprint of the metatile containing
/// `(z, x, y)`, where `x`/`y` are expressed in metatile units.
pub fn tile_footprint(z: u32, x: u32, y: u32, metatile: u32) -> Result<BoundingBox, GeometryError> {
    if z > 30 {
        return Err(GeometryError::Tile(format!("zoom {z} exceeds 30")));
    }
    let span = CRS84_ZOOM0_TILE_DEGREES / 2f64.powi(z as i32) * f64::from(metatile.max(1));
    let west = CRS84_WEST + f64::from(x) * span;
    let north = CRS84_NORTH - f64::from(y) * span;
    if west >= CRS84_EAST || north <= CRS84_SOUTH {
        return Err(GeometryError::Tile(format!(
            "tile {z}/{x}/{y} lies outside the grid"
        )));
    }
    Ok(BoundingBox {
        west,
        south: (north - span).max(CRS84_SOUTH),
        east: (west + span).min(CRS84_EAST),
        north,
    })
}

/// Format a centroid as `"lon, lat"` with fixed precision.
pub fn format_coordinates(lon: f64, lat: f64) -> String {
    format!(
        "{lon:.prec$}, {lat:.prec$}",
        prec = COORDINATES_FRACTION_DIGITS
    )
}

/// GeoJSON area accepted for cooldowns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum GeoJsonGeometry {
    Polygon { coordinates: Vec<Vec<Vec<f64>>> },
    MultiPolygon { coordinates: Vec<Vec<Vec<Vec<f64>>>> },
}

impl GeoJsonGeometry {
    /// Check ring closure, arity and coordinate ranges.
    pub fn validate(&self) -> Result<(), GeometryError> {
        match self {
            GeoJsonGeometry::Polygon { coordinates } => validate_polygon(coordinates),
            GeoJsonGeometry::MultiPolygon { coordinates } => {
                if coordinates.is_empty() {
                    return Err(GeometryError::Geometry("empty multipolygon".to_string()));
                }
                coordinates.iter().try_for_each(|p| validate_polygon(p))
            }
        }
    }

    pub fn to_geometry(&self) -> Result<Geometry<f64>, GeometryError> {
        self.validate()?;
        Ok(match self {
            GeoJsonGeometry::Polygon { coordinates } => Geometry::Polygon(to_polygon(coordinates)),
            GeoJsonGeometry::MultiPolygon { coordinates } => Geometry::MultiPolygon(MultiPolygon(
                coordinates.iter().map(|p| to_polygon(p)).collect(),
            )),
        })
    }

    pub fn to_wkt(&self) -> Result<String, GeometryError> {
        Ok(self.to_geometry()?.wkt_string())
    }
}

fn validate_polygon(rings: &[Vec<Vec<f64>>]) -> Result<(), GeometryError> {
    if rings.is_empty() {
        return Err(GeometryError::Geometry("polygon has no rings".to_string()));
    }
    for ring in rings {
        if ring.len() < 4 {
            return Err(GeometryError::Geometry(format!(
                "ring needs at least 4 positions, got {}",
                ring.len()
            )));
        }
        for position in ring {
            match position.as_slice() {
                [lon, lat] | [lon, lat, _] => {
                    if !lon.is_finite() || !lat.is_finite() {
                        return Err(GeometryError::Geometry("non-finite position".to_string()));
                    }
                    if !(CRS84_WEST..=CRS84_EAST).contains(lon)
                        || !(CRS84_SOUTH..=CRS84_NORTH).contains(lat)
                    {
                        return Err(GeometryError::Geometry(format!(
                            "position [{lon}, {lat}] out of range"
                        )));
                    }
                }
                other => {
                    return Err(GeometryError::Geometry(format!(
                        "position must have 2 or 3 values, got {}",
                        other.len()
                    )));
                }
            }
        }
        let (first, last) = (&ring[0], &ring[ring.len() - 1]);
        if first[..2] != last[..2] {
            return Err(GeometryError::Geometry("ring is not closed".to_string()));
        }
    }
    Ok(())
}

fn to_polygon(rings: &[Vec<Vec<f64>>]) -> Polygon<f64> {
    let mut rings = rings.iter().map(|ring| {
        LineString::from(ring.iter().map(|p| (p[0], p[1])).collect::<Vec<_>>())
    });
    let exterior = rings.next().unwrap_or_else(|| LineString::new(Vec::new()));
    Polygon::new(exterior, rings.collect())
}

/// Parse a WKT string into a geometry.
pub fn parse_wkt(input: &str) -> Result<Geometry<f64>, GeometryError> {
    wkt::Wkt::from_str(input)
        .map_err(|e| GeometryError::Wkt(format!("{e:?}")))
        .and_then(|w| {
            w.try_into()
                .map_err(|e: wkt::conversion::Error| GeometryError::Wkt(format!("{e:?}")))
        })
}
