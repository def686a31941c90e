//! Per-(kit, tile) processing records.
//!
//! Upserts run watch-then-commit on the tile key: the existence check and
//! the write are only applied together if nothing touched the key between
//! them. Conflicts surface as [`StoreError::WriteConflict`] and are never
//! retried here.

use detiler_core::config::QueryConfig;
use detiler_core::{
    KitName, Outcome, TileDetailsPayload, TileKey, TileParams, TileQuery, TileQueryResponse,
    TileRecord, UpsertStatus,
};
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::compiler::QueryCompiler;
use crate::engine::{Engine, IndexField, IndexSchema, Transaction};
use crate::error::{StoreError, StoreResult};
use crate::keys::{TILE_INDEX_NAME, TILE_KEY_PREFIX, tile_key};
use crate::kits::KitRegistry;
use crate::paginator::Paginator;

pub fn tile_index_schema() -> IndexSchema {
    IndexSchema {
        name: TILE_INDEX_NAME.to_string(),
        prefix: format!("{TILE_KEY_PREFIX}:"),
        fields: vec![
            IndexField::tag("kit"),
            IndexField::numeric("z"),
            IndexField::numeric("x"),
            IndexField::numeric("y"),
            IndexField::numeric("state"),
            IndexField::numeric("states"),
            IndexField::numeric("updatedAt"),
            IndexField::geoshape("geoshape"),
        ],
    }
}

#[derive(Clone)]
pub struct TileStateStore {
    engine: Engine,
    kits: KitRegistry,
    paginator: Paginator,
    default_page_size: usize,
    lookup_limit: usize,
}

impl TileStateStore {
    pub fn new(engine: Engine, kits: KitRegistry, config: &QueryConfig) -> StoreResult<Self> {
        engine.create_index(tile_index_schema())?;
        Ok(Self {
            paginator: Paginator::new(engine.clone(), TILE_INDEX_NAME),
            engine,
            kits,
            default_page_size: config.default_page_size,
            lookup_limit: config.tile_lookup_limit,
        })
    }

    /// Record one processing event for a tile. Any kit that is not
    /// registered, whatever its name, is reported as not found.
    pub fn upsert(&self, key: &TileKey, payload: &TileDetailsPayload) -> StoreResult<UpsertStatus> {
        if !self.kits.exists(&key.kit)? {
            return Err(StoreError::KitNotFound(key.kit.clone()));
        }

        let doc_key = tile_key(key);
        let state = payload.effective_state();

        let mut session = self.engine.isolated();
        session.watch(&doc_key)?;
        let exists = session.exists(&doc_key)?;

        let mut txn = Transaction::new();
        let status = if exists {
            txn.arr_append(&doc_key, "states", json!(state))
                .set_field(&doc_key, "state", json!(state))
                .set_field(&doc_key, "updatedAt", json!(payload.timestamp))
                .num_incr_by(&doc_key, "updateCount", 1);
            match payload.outcome {
                Some(Outcome::Rendered) => {
                    txn.num_incr_by(&doc_key, "renderCount", 1)
                        .set_field(&doc_key, "renderedAt", json!(payload.timestamp));
                }
                Some(Outcome::Skipped) => {
                    txn.num_incr_by(&doc_key, "skipCount", 1);
                }
                Some(Outcome::Cooled) => {
                    txn.num_incr_by(&doc_key, "coolCount", 1);
                }
                None => {}
            }
            UpsertStatus::Updated
        } else {
            let record = TileRecord::new(key, payload)?;
            let value = serde_json::to_value(&record)
                .map_err(|e| StoreError::Serialize(e.to_string()))?;
            txn.json_set(&doc_key, value);
            UpsertStatus::Inserted
        };
        KitRegistry::track_write(&mut txn, &key.kit, state, payload.timestamp);

        match session.exec(txn) {
            Ok(()) => {
                debug!(key = %doc_key, ?status, state, "tile upserted");
                Ok(status)
            }
            Err(e @ StoreError::WriteConflict { .. }) => {
                warn!(key = %doc_key, ?payload, "tile changed during upsert");
                Err(e)
            }
            Err(e) => {
                error!(key = %doc_key, error = %e, "tile upsert failed");
                Err(e)
            }
        }
    }

    pub fn get_by_kit_and_tile(&self, key: &TileKey) -> StoreResult<TileRecord> {
        let doc_key = tile_key(key);
        let value = self
            .engine
            .get_json(&doc_key)?
            .ok_or_else(|| StoreError::NotFound(doc_key.clone()))?;
        serde_json::from_value(value).map_err(|e| StoreError::Deserialize(format!("{doc_key}: {e}")))
    }

    /// Records of one tile for the given kits. Kits without a record are
    /// left out.
    pub fn get_by_kits_and_tile(
        &self,
        kits: &[KitName],
        tile: TileParams,
    ) -> StoreResult<Vec<TileRecord>> {
        let keys: Vec<String> = kits
            .iter()
            .map(|kit| tile_key(&TileKey::new(kit.clone(), tile.z, tile.x, tile.y)))
            .collect();
        self.engine
            .mget_json(&keys)?
            .into_iter()
            .zip(&keys)
            .filter_map(|(value, key)| value.map(|v| (v, key)))
            .map(|(value, key)| {
                serde_json::from_value(value)
                    .map_err(|e| StoreError::Deserialize(format!("{key}: {e}")))
            })
            .collect()
    }

    /// Every kit's record for one tile, bounded by the lookup limit.
    pub fn get_all_kits_for_tile(&self, tile: TileParams) -> StoreResult<Vec<TileRecord>> {
        let compiled = QueryCompiler::tile_at(tile);
        self.paginator.all(&compiled, self.lookup_limit)
    }

    /// First page of a tile search.
    pub fn query(&self, query: &TileQuery) -> StoreResult<TileQueryResponse> {
        let compiled = QueryCompiler::tiles(query)?;
        let size = query.size.unwrap_or(self.default_page_size);
        let page = self.paginator.first(&compiled, size)?;
        info!(query = %compiled.query, size, tiles = page.items.len(), "tile search");
        Ok(TileQueryResponse {
            tiles: page.items,
            cursor: page.cursor,
        })
    }

    /// Continue a tile search from its cursor.
    pub fn read_cursor(&self, cursor: u64, size: Option<usize>) -> StoreResult<TileQueryResponse> {
        let size = size.unwrap_or(self.default_page_size);
        let page = self.paginator.next(cursor, size)?;
        Ok(TileQueryResponse {
            tiles: page.items,
            cursor: page.cursor,
        })
    }
}
