//! Geofenced, zoom-bounded suppression windows.
//!
//! A cooldown is content addressed: its key is the SHA-256 of the
//! normalized request, so creating the same cooldown twice lands on the
//! same key.

use std::sync::Arc;

use detiler_core::config::QueryConfig;
use detiler_core::geometry::HALF_GLOBE_BBOX;
use detiler_core::{Cooldown, CooldownCreationRequest, CooldownQuery, KitName};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::compiler::QueryCompiler;
use crate::engine::{Engine, IndexField, IndexSchema, Transaction, unix_millis};
use crate::error::{StoreError, StoreResult};
use crate::keys::{COOLDOWN_INDEX_NAME, COOLDOWN_KEY_PREFIX, cooldown_key, validate_kit_name};
use crate::paginator::Paginator;

/// Source of `createdAt`/`updatedAt`, unix milliseconds.
pub type Clock = Arc<dyn Fn() -> u64 + Send + Sync>;

pub fn cooldown_index_schema() -> IndexSchema {
    IndexSchema {
        name: COOLDOWN_INDEX_NAME.to_string(),
        prefix: format!("{COOLDOWN_KEY_PREFIX}:"),
        fields: vec![
            IndexField::tag("kits"),
            IndexField::numeric("minZoom"),
            IndexField::numeric("maxZoom"),
            IndexField::tag("enabled"),
            IndexField::numeric("duration"),
            IndexField::geoshape("geoshape"),
        ],
    }
}

/// Hashed part of a cooldown: everything except the timestamps.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Identity<'a> {
    kits: &'a [KitName],
    min_zoom: u32,
    max_zoom: u32,
    enabled: bool,
    duration: u64,
    ttl: Option<u64>,
    description: Option<&'a str>,
    geoshape: &'a str,
}

#[derive(Clone)]
pub struct CooldownStore {
    engine: Engine,
    paginator: Paginator,
    default_page_size: usize,
    clock: Clock,
}

impl CooldownStore {
    pub fn new(engine: Engine, config: &QueryConfig) -> StoreResult<Self> {
        engine.create_index(cooldown_index_schema())?;
        Ok(Self {
            paginator: Paginator::new(engine.clone(), COOLDOWN_INDEX_NAME),
            engine,
            default_page_size: config.default_page_size,
            clock: Arc::new(unix_millis),
        })
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Persist a cooldown and return its key.
    pub fn create(&self, request: &CooldownCreationRequest) -> StoreResult<String> {
        if request.min_zoom > request.max_zoom {
            return Err(StoreError::Validation(format!(
                "minZoom {} is greater than maxZoom {}",
                request.min_zoom, request.max_zoom
            )));
        }
        if request.ttl == Some(0) {
            return Err(StoreError::Validation("ttl must be positive".to_string()));
        }
        request
            .kits
            .iter()
            .try_for_each(|kit| validate_kit_name(kit))?;

        let geoshape = match &request.area {
            Some(area) => {
                area.validate()?;
                area.to_wkt()?
            }
            None => HALF_GLOBE_BBOX.to_wkt(),
        };
        let mut kits = request.kits.clone();
        kits.sort();
        kits.dedup();

        let identity = Identity {
            kits: &kits,
            min_zoom: request.min_zoom,
            max_zoom: request.max_zoom,
            enabled: request.enabled,
            duration: request.duration,
            ttl: request.ttl,
            description: request.description.as_deref(),
            geoshape: &geoshape,
        };
        let bytes = serde_json::to_vec(&identity).map_err(|e| StoreError::Serialize(e.to_string()))?;
        let key = cooldown_key(&hex::encode(Sha256::digest(&bytes)));

        let now = (self.clock)();
        let cooldown = Cooldown {
            kits,
            min_zoom: request.min_zoom,
            max_zoom: request.max_zoom,
            enabled: request.enabled,
            duration: request.duration,
            ttl: request.ttl,
            description: request.description.clone(),
            geoshape,
            created_at: now,
            updated_at: now,
        };
        let value =
            serde_json::to_value(&cooldown).map_err(|e| StoreError::Serialize(e.to_string()))?;

        let mut txn = Transaction::new();
        txn.json_set(&key, value);
        if let Some(ttl) = cooldown.ttl {
            txn.expire(&key, ttl);
        }
        self.engine.exec(txn)?;
        info!(%key, kits = ?cooldown.kits, ttl = ?cooldown.ttl, "cooldown created");
        Ok(key)
    }

    pub fn query(&self, query: &CooldownQuery) -> StoreResult<Vec<Cooldown>> {
        let compiled = QueryCompiler::cooldowns(query)?;
        let from = query.from.unwrap_or(0);
        let size = query.size.unwrap_or(self.default_page_size);
        debug!(query = %compiled.query, from, size, "cooldown search");
        let page = self.paginator.offset(&compiled, from, size)?;
        Ok(page.items)
    }
}
