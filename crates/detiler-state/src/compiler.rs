//! Structured queries compiled to index query strings.
//!
//! Output is consumed by [`crate::query`], so every string produced here
//! must parse there. Validation happens up front; a compiled query never
//! needs the store to reject it.

use std::collections::BTreeMap;
use std::fmt::Display;

use detiler_core::{CooldownQuery, TileParams, TileQuery};

use crate::error::{StoreError, StoreResult};
use crate::keys::validate_kit_name;
use crate::query::escape_tag;

/// Name of the WKT parameter bound by area predicates.
pub const GEOSHAPE_PARAM: &str = "geoshape";

/// Query matching every document of an index.
pub const WILDCARD: &str = "*";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledQuery {
    pub query: String,
    pub params: BTreeMap<String, String>,
}

impl CompiledQuery {
    fn from_parts(parts: Vec<String>, params: BTreeMap<String, String>) -> Self {
        let query = if parts.is_empty() {
            WILDCARD.to_string()
        } else {
            parts.join(" ")
        };
        Self { query, params }
    }
}

fn bound(value: Option<impl Display>, unbounded: &str) -> String {
    value.map_or_else(|| unbounded.to_string(), |v| v.to_string())
}

fn range(field: &str, min: Option<impl Display>, max: Option<impl Display>) -> String {
    format!("@{field}:[{} {}]", bound(min, "-inf"), bound(max, "+inf"))
}

fn validate_kits(kits: &[String]) -> StoreResult<()> {
    kits.iter().try_for_each(|kit| validate_kit_name(kit))
}

fn tag_list(kits: &[String]) -> String {
    kits.iter().map(|kit| escape_tag(kit)).collect::<Vec<_>>().join("|")
}

pub struct QueryCompiler;

impl QueryCompiler {
    /// Compile a tile search:
    /// `@z:[min max] [@state(s):[lo hi]] @kit:(a|b) [@geoshape:[WITHIN $geoshape]]`.
    pub fn tiles(query: &TileQuery) -> StoreResult<CompiledQuery> {
        if query.min_zoom > query.max_zoom {
            return Err(StoreError::Validation(format!(
                "minZoom {} is greater than maxZoom {}",
                query.min_zoom, query.max_zoom
            )));
        }
        if let (Some(min), Some(max)) = (query.min_state, query.max_state) {
            if min > max {
                return Err(StoreError::Validation(format!(
                    "minState {min} is greater than maxState {max}"
                )));
            }
        }
        if query.kits.is_empty() {
            return Err(StoreError::Validation(
                "at least one kit is required".to_string(),
            ));
        }
        validate_kits(&query.kits)?;

        let mut parts = vec![range("z", Some(query.min_zoom), Some(query.max_zoom))];
        if query.min_state.is_some() || query.max_state.is_some() {
            let field = if query.match_current_state_only {
                "state"
            } else {
                "states"
            };
            parts.push(range(field, query.min_state, query.max_state));
        }
        parts.push(format!("@kit:({})", tag_list(&query.kits)));

        let mut params = BTreeMap::new();
        if let Some(area) = &query.area {
            area.validate_web_mercator()?;
            parts.push(format!("@geoshape:[WITHIN ${GEOSHAPE_PARAM}]"));
            params.insert(GEOSHAPE_PARAM.to_string(), area.to_wkt());
        }
        Ok(CompiledQuery::from_parts(parts, params))
    }

    /// Every kit's record for one tile.
    pub fn tile_at(tile: TileParams) -> CompiledQuery {
        let parts = vec![
            range("z", Some(tile.z), Some(tile.z)),
            range("x", Some(tile.x), Some(tile.x)),
            range("y", Some(tile.y), Some(tile.y)),
        ];
        CompiledQuery::from_parts(parts, BTreeMap::new())
    }

    /// Compile a cooldown search. Matches cooldowns whose area contains the
    /// requested box, whose kits intersect the requested kits, and whose zoom
    /// band covers `[minZoom, maxZoom]`.
    pub fn cooldowns(query: &CooldownQuery) -> StoreResult<CompiledQuery> {
        if let (Some(min), Some(max)) = (query.min_zoom, query.max_zoom) {
            if min > max {
                return Err(StoreError::Validation(format!(
                    "minZoom {min} is greater than maxZoom {max}"
                )));
            }
        }
        validate_kits(&query.kits)?;

        let mut parts = Vec::new();
        let mut params = BTreeMap::new();
        if let Some(area) = &query.area {
            area.validate_web_mercator()?;
            parts.push(format!("@geoshape:[CONTAINS ${GEOSHAPE_PARAM}]"));
            params.insert(GEOSHAPE_PARAM.to_string(), area.to_wkt());
        }
        if !query.kits.is_empty() {
            parts.push(format!("@kits:{{{}}}", tag_list(&query.kits)));
        }
        if let Some(min_zoom) = query.min_zoom {
            parts.push(range("minZoom", None::<u32>, Some(min_zoom)));
        }
        if let Some(max_zoom) = query.max_zoom {
            parts.push(range("maxZoom", Some(max_zoom), None::<u32>));
        }
        if let Some(enabled) = query.enabled {
            parts.push(format!("@enabled:{{{enabled}}}"));
        }
        Ok(CompiledQuery::from_parts(parts, params))
    }
}
