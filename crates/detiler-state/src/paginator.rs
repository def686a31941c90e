//! Bounded pages over an index search.
//!
//! Two modes:
//! - offset: `(from, size)`, the query re-issued for every page;
//! - cursor: the first call opens a server-side cursor, later calls pass
//!   only its id.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use tracing::debug;

use crate::compiler::CompiledQuery;
use crate::engine::{Document, Engine};
use crate::error::{StoreError, StoreResult};

/// Largest page a caller may request.
pub const MAX_PAGE_SIZE: usize = 10_000;

#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Continuation token. `None` once the results are exhausted.
    pub cursor: Option<u64>,
    /// Total matches, known in offset mode only.
    pub total: Option<usize>,
}

impl<T> Page<T> {
    /// Terminal when there is no continuation or the page came back short.
    pub fn is_last(&self, requested: usize) -> bool {
        self.cursor.is_none() || self.items.len() < requested
    }
}

pub fn validate_page_size(size: usize) -> StoreResult<()> {
    if size == 0 || size > MAX_PAGE_SIZE {
        return Err(StoreError::Validation(format!(
            "page size must be between 1 and {MAX_PAGE_SIZE}, got {size}"
        )));
    }
    Ok(())
}

#[derive(Clone)]
pub struct Paginator {
    engine: Engine,
    index: String,
}

impl Paginator {
    pub fn new(engine: Engine, index: &str) -> Self {
        Self {
            engine,
            index: index.to_string(),
        }
    }

    pub fn offset<T: DeserializeOwned>(
        &self,
        query: &CompiledQuery,
        from: usize,
        size: usize,
    ) -> StoreResult<Page<T>> {
        validate_page_size(size)?;
        let result = self
            .engine
            .search(&self.index, &query.query, &query.params, from, size)?;
        let items = decode_all(result.documents)?;
        let cursor = (from + items.len() < result.total).then(|| (from + items.len()) as u64);
        debug!(index = %self.index, from, size, total = result.total, "offset page");
        Ok(Page {
            items,
            cursor,
            total: Some(result.total),
        })
    }

    pub fn first<T: DeserializeOwned>(
        &self,
        query: &CompiledQuery,
        size: usize,
    ) -> StoreResult<Page<T>> {
        validate_page_size(size)?;
        let page = self
            .engine
            .aggregate_with_cursor(&self.index, &query.query, &query.params, size)?;
        debug!(index = %self.index, size, cursor = page.cursor, "cursor opened");
        Ok(Page {
            items: decode_all(page.documents)?,
            cursor: non_zero(page.cursor),
            total: None,
        })
    }

    pub fn next<T: DeserializeOwned>(&self, cursor: u64, size: usize) -> StoreResult<Page<T>> {
        validate_page_size(size)?;
        let page = self.engine.cursor_read(&self.index, cursor, size)?;
        Ok(Page {
            items: decode_all(page.documents)?,
            cursor: non_zero(page.cursor),
            total: None,
        })
    }

    /// Search without paging, bounded by `limit`.
    pub fn all<T: DeserializeOwned>(&self, query: &CompiledQuery, limit: usize) -> StoreResult<Vec<T>> {
        let result = self.engine.search(&self.index, &query.query, &query.params, 0, limit)?;
        decode_all(result.documents)
    }
}

fn non_zero(cursor: u64) -> Option<u64> {
    (cursor != 0).then_some(cursor)
}

fn decode_all<T: DeserializeOwned>(documents: Vec<Document>) -> StoreResult<Vec<T>> {
    documents
        .into_iter()
        .map(|doc| {
            serde_json::from_value(doc.value)
                .map_err(|e| StoreError::Deserialize(format!("{}: {e}", doc.key)))
        })
        .collect()
}

/// Search parameters without a geometry.
pub fn no_params() -> BTreeMap<String, String> {
    BTreeMap::new()
}
