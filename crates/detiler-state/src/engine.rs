//! A redb-backed document engine with optimistic transactions.
//!
//! Documents are JSON values, string hashes, or string sets stored under a
//! single keyspace. Every write bumps a per-key version counter; a
//! [`Session`] records versions at watch time and its `exec` aborts with
//! [`StoreError::WriteConflict`] when any watched key moved in between.
//!
//! Keys may carry an expiry deadline. Expired keys are invisible to reads
//! and searches and are physically removed by [`Engine::purge_expired`].
//!
//! Secondary indexes are schema definitions bound to a key prefix, held in
//! memory and recreated by the owner at open. Searches scan the prefix range
//! in key order, so results are always sorted by key.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use redb::{Database, ReadableDatabase, ReadableTable, WriteTransaction};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::error::{StoreError, StoreResult};
use crate::query::{self, GeoParams};
use crate::tables::*;

/// Convert any `Display` error into a `StoreError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StoreError::$variant(e.to_string())
    };
}

type DocTable<'txn> = redb::Table<'txn, &'static str, &'static [u8]>;
type NumTable<'txn> = redb::Table<'txn, &'static str, u64>;

/// Default idle time after which a search cursor is dropped.
pub const DEFAULT_CURSOR_IDLE: Duration = Duration::from_secs(300);

/// Milliseconds since the unix epoch.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A stored value. The variant is fixed at creation; operations of the wrong
/// kind are rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum StoredValue {
    Json(Value),
    Hash(BTreeMap<String, String>),
    Set(BTreeSet<String>),
}

impl StoredValue {
    fn kind(&self) -> &'static str {
        match self {
            StoredValue::Json(_) => "json",
            StoredValue::Hash(_) => "hash",
            StoredValue::Set(_) => "set",
        }
    }
}

fn wrong_type(key: &str, op: &str, found: &StoredValue) -> StoreError {
    StoreError::Upstream(format!(
        "{op} against key {key} holding a {} value",
        found.kind()
    ))
}

// ── Index schema ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Numeric,
    Tag,
    /// Field holds a WKT string.
    GeoShape,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexField {
    pub name: String,
    pub kind: FieldKind,
}

impl IndexField {
    pub fn numeric(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: FieldKind::Numeric,
        }
    }

    pub fn tag(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: FieldKind::Tag,
        }
    }

    pub fn geoshape(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: FieldKind::GeoShape,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexSchema {
    pub name: String,
    /// Key prefix, including the trailing `:`.
    pub prefix: String,
    pub fields: Vec<IndexField>,
}

impl IndexSchema {
    pub fn field_kind(&self, name: &str) -> Option<FieldKind> {
        self.fields.iter().find(|f| f.name == name).map(|f| f.kind)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub key: String,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    /// Number of matches before paging.
    pub total: usize,
    pub documents: Vec<Document>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CursorPage {
    pub documents: Vec<Document>,
    /// Server-side cursor id; `0` once the result set is exhausted.
    pub cursor: u64,
}

// ── Cursors ────────────────────────────────────────────────────────

struct CursorEntry {
    index: String,
    remaining: VecDeque<Document>,
    last_access: Instant,
}

#[derive(Default)]
struct CursorTable {
    next_id: u64,
    entries: HashMap<u64, CursorEntry>,
}

impl CursorTable {
    fn sweep(&mut self, idle: Duration) {
        let before = self.entries.len();
        self.entries.retain(|_, c| c.last_access.elapsed() < idle);
        let dropped = before - self.entries.len();
        if dropped > 0 {
            debug!(dropped, "idle cursors dropped");
        }
    }
}

// ── Transactions ───────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Op {
    JsonSet { key: String, value: Value },
    ArrAppend { key: String, field: String, value: Value },
    NumIncrBy { key: String, field: String, by: i64 },
    SetField { key: String, field: String, value: Value },
    HashSet { key: String, fields: BTreeMap<String, String> },
    HashMax { key: String, field: String, value: i64 },
    SetAdd { key: String, member: String },
    Expire { key: String, millis: u64 },
}

impl Op {
    fn key(&self) -> &str {
        match self {
            Op::JsonSet { key, .. }
            | Op::ArrAppend { key, .. }
            | Op::NumIncrBy { key, .. }
            | Op::SetField { key, .. }
            | Op::HashSet { key, .. }
            | Op::HashMax { key, .. }
            | Op::SetAdd { key, .. }
            | Op::Expire { key, .. } => key,
        }
    }
}

/// A batch of writes applied atomically by [`Engine::exec`] or [`Session::exec`].
#[derive(Debug, Clone, Default)]
pub struct Transaction {
    ops: Vec<Op>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Store a JSON document, replacing any previous value and its expiry.
    pub fn json_set(&mut self, key: &str, value: Value) -> &mut Self {
        self.push(Op::JsonSet {
            key: key.to_string(),
            value,
        })
    }

    /// Append to an array field of an existing JSON document.
    pub fn arr_append(&mut self, key: &str, field: &str, value: Value) -> &mut Self {
        self.push(Op::ArrAppend {
            key: key.to_string(),
            field: field.to_string(),
            value,
        })
    }

    /// Add to an integer field of an existing JSON document.
    pub fn num_incr_by(&mut self, key: &str, field: &str, by: i64) -> &mut Self {
        self.push(Op::NumIncrBy {
            key: key.to_string(),
            field: field.to_string(),
            by,
        })
    }

    /// Overwrite one field of an existing JSON document.
    pub fn set_field(&mut self, key: &str, field: &str, value: Value) -> &mut Self {
        self.push(Op::SetField {
            key: key.to_string(),
            field: field.to_string(),
            value,
        })
    }

    /// Merge fields into a hash, creating it when absent.
    pub fn hash_set(&mut self, key: &str, fields: BTreeMap<String, String>) -> &mut Self {
        self.push(Op::HashSet {
            key: key.to_string(),
            fields,
        })
    }

    /// Raise an integer hash field to `value` if it is lower. No-op when the
    /// hash does not exist.
    pub fn hash_max(&mut self, key: &str, field: &str, value: i64) -> &mut Self {
        self.push(Op::HashMax {
            key: key.to_string(),
            field: field.to_string(),
            value,
        })
    }

    pub fn set_add(&mut self, key: &str, member: &str) -> &mut Self {
        self.push(Op::SetAdd {
            key: key.to_string(),
            member: member.to_string(),
        })
    }

    /// Expire an existing key after `secs` seconds.
    pub fn expire(&mut self, key: &str, secs: u64) -> &mut Self {
        self.pexpire(key, secs.saturating_mul(1000))
    }

    /// Expire an existing key after `millis` milliseconds.
    pub fn pexpire(&mut self, key: &str, millis: u64) -> &mut Self {
        self.push(Op::Expire {
            key: key.to_string(),
            millis,
        })
    }

    fn push(&mut self, op: Op) -> &mut Self {
        self.ops.push(op);
        self
    }
}

/// Optimistic isolation scope. Watch keys, read, then `exec` a transaction
/// that only commits if none of the watched keys changed.
pub struct Session {
    engine: Engine,
    watched: Vec<(String, u64)>,
}

impl Session {
    pub fn watch(&mut self, key: &str) -> StoreResult<()> {
        let version = self.engine.version(key)?;
        trace!(%key, version, "watch");
        self.watched.push((key.to_string(), version));
        Ok(())
    }

    pub fn exists(&self, key: &str) -> StoreResult<bool> {
        self.engine.exists(key)
    }

    pub fn exec(self, txn: Transaction) -> StoreResult<()> {
        self.engine.commit(&self.watched, txn)
    }
}

// ── Engine ─────────────────────────────────────────────────────────

/// Thread-safe engine handle. Clones share the database, index registry and
/// cursor table.
#[derive(Clone)]
pub struct Engine {
    db: Arc<Database>,
    indexes: Arc<RwLock<HashMap<String, Arc<IndexSchema>>>>,
    cursors: Arc<Mutex<CursorTable>>,
    cursor_idle: Duration,
}

impl Engine {
    /// Open (or create) a persistent engine at the given path.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let db = Database::create(path).map_err(map_err!(Upstream))?;
        let engine = Self::from_database(db)?;
        debug!(?path, "engine opened");
        Ok(engine)
    }

    /// Create an ephemeral in-memory engine.
    pub fn open_in_memory() -> StoreResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Upstream))?;
        let engine = Self::from_database(db)?;
        debug!("in-memory engine opened");
        Ok(engine)
    }

    fn from_database(db: Database) -> StoreResult<Self> {
        let engine = Self {
            db: Arc::new(db),
            indexes: Arc::new(RwLock::new(HashMap::new())),
            cursors: Arc::new(Mutex::new(CursorTable::default())),
            cursor_idle: DEFAULT_CURSOR_IDLE,
        };
        engine.ensure_tables()?;
        Ok(engine)
    }

    pub fn with_cursor_idle(mut self, idle: Duration) -> Self {
        self.cursor_idle = idle;
        self
    }

    fn ensure_tables(&self) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Upstream))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(DOCUMENTS).map_err(map_err!(Upstream))?;
        txn.open_table(VERSIONS).map_err(map_err!(Upstream))?;
        txn.open_table(EXPIRY).map_err(map_err!(Upstream))?;
        txn.commit().map_err(map_err!(Upstream))?;
        Ok(())
    }

    /// Liveness probe against the database.
    pub fn ping(&self) -> StoreResult<()> {
        let txn = self.db.begin_read().map_err(map_err!(Upstream))?;
        txn.open_table(DOCUMENTS).map_err(map_err!(Upstream))?;
        Ok(())
    }

    // ── Reads ──────────────────────────────────────────────────────

    fn load(&self, key: &str) -> StoreResult<Option<StoredValue>> {
        let now = unix_millis();
        let txn = self.db.begin_read().map_err(map_err!(Upstream))?;
        let docs = txn.open_table(DOCUMENTS).map_err(map_err!(Upstream))?;
        let expiry = txn.open_table(EXPIRY).map_err(map_err!(Upstream))?;
        if is_expired(&expiry, key, now)? {
            return Ok(None);
        }
        match docs.get(key).map_err(map_err!(Upstream))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    pub fn exists(&self, key: &str) -> StoreResult<bool> {
        Ok(self.load(key)?.is_some())
    }

    pub fn get_json(&self, key: &str) -> StoreResult<Option<Value>> {
        match self.load(key)? {
            Some(StoredValue::Json(value)) => Ok(Some(value)),
            Some(other) => Err(wrong_type(key, "GET", &other)),
            None => Ok(None),
        }
    }

    /// Fetch several JSON documents in one read transaction. Missing keys
    /// yield `None` at their position.
    pub fn mget_json(&self, keys: &[String]) -> StoreResult<Vec<Option<Value>>> {
        self.mget(keys)?
            .into_iter()
            .zip(keys)
            .map(|(value, key)| match value {
                Some(StoredValue::Json(v)) => Ok(Some(v)),
                Some(other) => Err(wrong_type(key, "MGET", &other)),
                None => Ok(None),
            })
            .collect()
    }

    pub fn hash_get_all(&self, key: &str) -> StoreResult<Option<BTreeMap<String, String>>> {
        match self.load(key)? {
            Some(StoredValue::Hash(fields)) => Ok(Some(fields)),
            Some(other) => Err(wrong_type(key, "HGETALL", &other)),
            None => Ok(None),
        }
    }

    pub fn hash_mget(&self, keys: &[String]) -> StoreResult<Vec<Option<BTreeMap<String, String>>>> {
        self.mget(keys)?
            .into_iter()
            .zip(keys)
            .map(|(value, key)| match value {
                Some(StoredValue::Hash(fields)) => Ok(Some(fields)),
                Some(other) => Err(wrong_type(key, "HGETALL", &other)),
                None => Ok(None),
            })
            .collect()
    }

    /// Members of a set in sorted order; empty when the set does not exist.
    pub fn set_members(&self, key: &str) -> StoreResult<Vec<String>> {
        match self.load(key)? {
            Some(StoredValue::Set(members)) => Ok(members.into_iter().collect()),
            Some(other) => Err(wrong_type(key, "SMEMBERS", &other)),
            None => Ok(Vec::new()),
        }
    }

    fn mget(&self, keys: &[String]) -> StoreResult<Vec<Option<StoredValue>>> {
        let now = unix_millis();
        let txn = self.db.begin_read().map_err(map_err!(Upstream))?;
        let docs = txn.open_table(DOCUMENTS).map_err(map_err!(Upstream))?;
        let expiry = txn.open_table(EXPIRY).map_err(map_err!(Upstream))?;
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            if is_expired(&expiry, key, now)? {
                values.push(None);
                continue;
            }
            let value = match docs.get(key.as_str()).map_err(map_err!(Upstream))? {
                Some(guard) => Some(decode(guard.value())?),
                None => None,
            };
            values.push(value);
        }
        Ok(values)
    }

    /// Remaining time to live in milliseconds. `None` when the key is absent
    /// or has no deadline.
    pub fn pttl(&self, key: &str) -> StoreResult<Option<u64>> {
        let now = unix_millis();
        let txn = self.db.begin_read().map_err(map_err!(Upstream))?;
        let docs = txn.open_table(DOCUMENTS).map_err(map_err!(Upstream))?;
        let expiry = txn.open_table(EXPIRY).map_err(map_err!(Upstream))?;
        if docs.get(key).map_err(map_err!(Upstream))?.is_none() {
            return Ok(None);
        }
        let deadline = expiry.get(key).map_err(map_err!(Upstream))?.map(|g| g.value());
        Ok(match deadline {
            Some(deadline) if deadline > now => Some(deadline - now),
            _ => None,
        })
    }

    fn version(&self, key: &str) -> StoreResult<u64> {
        let txn = self.db.begin_read().map_err(map_err!(Upstream))?;
        let versions = txn.open_table(VERSIONS).map_err(map_err!(Upstream))?;
        let version = versions
            .get(key)
            .map_err(map_err!(Upstream))?
            .map(|g| g.value())
            .unwrap_or(0);
        Ok(version)
    }

    // ── Writes ─────────────────────────────────────────────────────

    /// Start an optimistic isolation scope.
    pub fn isolated(&self) -> Session {
        Session {
            engine: self.clone(),
            watched: Vec::new(),
        }
    }

    /// Apply a transaction without watches.
    pub fn exec(&self, txn: Transaction) -> StoreResult<()> {
        self.commit(&[], txn)
    }

    fn commit(&self, watched: &[(String, u64)], txn: Transaction) -> StoreResult<()> {
        let write = self.db.begin_write().map_err(map_err!(Upstream))?;
        if let Some(key) = self.conflicting(&write, watched)? {
            write.abort().map_err(map_err!(Upstream))?;
            debug!(%key, "watched key changed, transaction discarded");
            return Err(StoreError::WriteConflict { key });
        }
        let now = unix_millis();
        {
            let mut docs = write.open_table(DOCUMENTS).map_err(map_err!(Upstream))?;
            let mut versions = write.open_table(VERSIONS).map_err(map_err!(Upstream))?;
            let mut expiry = write.open_table(EXPIRY).map_err(map_err!(Upstream))?;
            for op in &txn.ops {
                apply(&mut docs, &mut versions, &mut expiry, op, now)?;
            }
        }
        write.commit().map_err(map_err!(Upstream))?;
        trace!(ops = txn.ops.len(), watched = watched.len(), "transaction committed");
        Ok(())
    }

    fn conflicting(
        &self,
        write: &WriteTransaction,
        watched: &[(String, u64)],
    ) -> StoreResult<Option<String>> {
        if watched.is_empty() {
            return Ok(None);
        }
        let versions = write.open_table(VERSIONS).map_err(map_err!(Upstream))?;
        for (key, seen) in watched {
            let current = versions
                .get(key.as_str())
                .map_err(map_err!(Upstream))?
                .map(|g| g.value())
                .unwrap_or(0);
            if current != *seen {
                return Ok(Some(key.clone()));
            }
        }
        Ok(None)
    }

    /// Physically remove every key whose deadline has passed. Returns the
    /// number of keys removed.
    pub fn purge_expired(&self) -> StoreResult<usize> {
        let now = unix_millis();
        let write = self.db.begin_write().map_err(map_err!(Upstream))?;
        let purged;
        {
            let mut docs = write.open_table(DOCUMENTS).map_err(map_err!(Upstream))?;
            let mut versions = write.open_table(VERSIONS).map_err(map_err!(Upstream))?;
            let mut expiry = write.open_table(EXPIRY).map_err(map_err!(Upstream))?;
            let due: Vec<String> = expiry
                .iter()
                .map_err(map_err!(Upstream))?
                .filter_map(|entry| {
                    let (key, deadline) = entry.ok()?;
                    (deadline.value() <= now).then(|| key.value().to_string())
                })
                .collect();
            for key in &due {
                docs.remove(key.as_str()).map_err(map_err!(Upstream))?;
                expiry.remove(key.as_str()).map_err(map_err!(Upstream))?;
                bump_version(&mut versions, key)?;
            }
            purged = due.len();
        }
        write.commit().map_err(map_err!(Upstream))?;
        if purged > 0 {
            debug!(purged, "expired keys purged");
        }
        Ok(purged)
    }

    // ── Indexes ────────────────────────────────────────────────────

    /// Register an index. Returns `false` when an identical index already
    /// exists; a different schema under the same name is rejected.
    pub fn create_index(&self, schema: IndexSchema) -> StoreResult<bool> {
        let mut indexes = self
            .indexes
            .write()
            .map_err(|_| StoreError::Upstream("index registry poisoned".to_string()))?;
        if let Some(existing) = indexes.get(&schema.name) {
            if **existing == schema {
                return Ok(false);
            }
            return Err(StoreError::AlreadyExists(format!("index {}", schema.name)));
        }
        debug!(index = %schema.name, prefix = %schema.prefix, "index created");
        indexes.insert(schema.name.clone(), Arc::new(schema));
        Ok(true)
    }

    fn index(&self, name: &str) -> StoreResult<Arc<IndexSchema>> {
        let indexes = self
            .indexes
            .read()
            .map_err(|_| StoreError::Upstream("index registry poisoned".to_string()))?;
        indexes
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::Upstream(format!("unknown index {name}")))
    }

    /// Every live JSON document under the index prefix matching `query`,
    /// sorted by key.
    fn matching(
        &self,
        index: &str,
        query: &str,
        params: &BTreeMap<String, String>,
    ) -> StoreResult<Vec<Document>> {
        let schema = self.index(index)?;
        let parsed = query::parse(query)?;
        let geo = resolve_params(params)?;
        parsed.check(&schema, &geo)?;

        let now = unix_millis();
        let txn = self.db.begin_read().map_err(map_err!(Upstream))?;
        let docs = txn.open_table(DOCUMENTS).map_err(map_err!(Upstream))?;
        let expiry = txn.open_table(EXPIRY).map_err(map_err!(Upstream))?;

        let mut matches = Vec::new();
        for entry in docs
            .range(schema.prefix.as_str()..)
            .map_err(map_err!(Upstream))?
        {
            let (key, value) = entry.map_err(map_err!(Upstream))?;
            let key = key.value();
            if !key.starts_with(schema.prefix.as_str()) {
                break;
            }
            if is_expired(&expiry, key, now)? {
                continue;
            }
            let StoredValue::Json(doc) = decode(value.value())? else {
                continue;
            };
            if parsed.matches(&doc, &geo) {
                matches.push(Document {
                    key: key.to_string(),
                    value: doc,
                });
            }
        }
        trace!(%index, %query, matches = matches.len(), "index scanned");
        Ok(matches)
    }

    /// Offset-paged search.
    pub fn search(
        &self,
        index: &str,
        query: &str,
        params: &BTreeMap<String, String>,
        from: usize,
        size: usize,
    ) -> StoreResult<SearchResult> {
        let matches = self.matching(index, query, params)?;
        let total = matches.len();
        let documents = matches.into_iter().skip(from).take(size).collect();
        Ok(SearchResult { total, documents })
    }

    /// Run a search and hand back the first `count` results plus a cursor
    /// over the rest.
    pub fn aggregate_with_cursor(
        &self,
        index: &str,
        query: &str,
        params: &BTreeMap<String, String>,
        count: usize,
    ) -> StoreResult<CursorPage> {
        let mut remaining: VecDeque<Document> = self.matching(index, query, params)?.into();
        let take = count.min(remaining.len());
        let documents: Vec<Document> = remaining.drain(..take).collect();

        let mut cursors = self.lock_cursors()?;
        cursors.sweep(self.cursor_idle);
        if remaining.is_empty() {
            return Ok(CursorPage {
                documents,
                cursor: 0,
            });
        }
        cursors.next_id += 1;
        let id = cursors.next_id;
        cursors.entries.insert(
            id,
            CursorEntry {
                index: index.to_string(),
                remaining,
                last_access: Instant::now(),
            },
        );
        debug!(%index, cursor = id, "cursor opened");
        Ok(CursorPage {
            documents,
            cursor: id,
        })
    }

    /// Read the next `count` results of an open cursor.
    pub fn cursor_read(&self, index: &str, cursor: u64, count: usize) -> StoreResult<CursorPage> {
        let mut cursors = self.lock_cursors()?;
        cursors.sweep(self.cursor_idle);

        let entry = match cursors.entries.get_mut(&cursor) {
            Some(entry) if entry.index == index => entry,
            _ => {
                warn!(%index, cursor, "cursor not found");
                return Err(StoreError::NotFound(format!("cursor {cursor}")));
            }
        };
        let take = count.min(entry.remaining.len());
        let documents: Vec<Document> = entry.remaining.drain(..take).collect();
        entry.last_access = Instant::now();

        if entry.remaining.is_empty() {
            cursors.entries.remove(&cursor);
            debug!(%index, cursor, "cursor exhausted");
            return Ok(CursorPage {
                documents,
                cursor: 0,
            });
        }
        Ok(CursorPage { documents, cursor })
    }

    fn lock_cursors(&self) -> StoreResult<std::sync::MutexGuard<'_, CursorTable>> {
        self.cursors
            .lock()
            .map_err(|_| StoreError::Upstream("cursor table poisoned".to_string()))
    }
}

fn resolve_params(params: &BTreeMap<String, String>) -> StoreResult<GeoParams> {
    params
        .iter()
        .map(|(name, wkt)| {
            let geometry = detiler_core::geometry::parse_wkt(wkt)?;
            Ok::<_, StoreError>((name.clone(), geometry))
        })
        .collect()
}

fn decode(bytes: &[u8]) -> StoreResult<StoredValue> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

fn encode(value: &StoredValue) -> StoreResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(map_err!(Serialize))
}

fn is_expired(
    expiry: &impl ReadableTable<&'static str, u64>,
    key: &str,
    now: u64,
) -> StoreResult<bool> {
    let deadline = expiry.get(key).map_err(map_err!(Upstream))?.map(|g| g.value());
    Ok(deadline.is_some_and(|deadline| deadline <= now))
}

fn bump_version(versions: &mut NumTable<'_>, key: &str) -> StoreResult<()> {
    let current = versions
        .get(key)
        .map_err(map_err!(Upstream))?
        .map(|g| g.value())
        .unwrap_or(0);
    versions.insert(key, current + 1).map_err(map_err!(Upstream))?;
    Ok(())
}

fn apply(
    docs: &mut DocTable<'_>,
    versions: &mut NumTable<'_>,
    expiry: &mut NumTable<'_>,
    op: &Op,
    now: u64,
) -> StoreResult<()> {
    let key = op.key();
    let current = if is_expired(&*expiry, key, now)? {
        docs.remove(key).map_err(map_err!(Upstream))?;
        expiry.remove(key).map_err(map_err!(Upstream))?;
        None
    } else {
        match docs.get(key).map_err(map_err!(Upstream))? {
            Some(guard) => Some(decode(guard.value())?),
            None => None,
        }
    };

    let next = match (op, current) {
        (Op::JsonSet { value, .. }, _) => {
            expiry.remove(key).map_err(map_err!(Upstream))?;
            Some(StoredValue::Json(value.clone()))
        }
        (Op::ArrAppend { field, value, .. }, Some(StoredValue::Json(mut doc))) => {
            let array = doc
                .get_mut(field.as_str())
                .and_then(Value::as_array_mut)
                .ok_or_else(|| {
                    StoreError::Upstream(format!("ARRAPPEND: {key}.{field} is not an array"))
                })?;
            array.push(value.clone());
            Some(StoredValue::Json(doc))
        }
        (Op::NumIncrBy { field, by, .. }, Some(StoredValue::Json(mut doc))) => {
            let slot = doc.get_mut(field.as_str()).ok_or_else(|| {
                StoreError::Upstream(format!("NUMINCRBY: {key}.{field} does not exist"))
            })?;
            let n = slot.as_i64().ok_or_else(|| {
                StoreError::Upstream(format!("NUMINCRBY: {key}.{field} is not an integer"))
            })?;
            *slot = Value::from(n + by);
            Some(StoredValue::Json(doc))
        }
        (Op::SetField { field, value, .. }, Some(StoredValue::Json(mut doc))) => {
            let object = doc.as_object_mut().ok_or_else(|| {
                StoreError::Upstream(format!("SET: {key} is not a JSON object"))
            })?;
            object.insert(field.clone(), value.clone());
            Some(StoredValue::Json(doc))
        }
        (Op::HashSet { fields, .. }, None) => Some(StoredValue::Hash(fields.clone())),
        (Op::HashSet { fields, .. }, Some(StoredValue::Hash(mut existing))) => {
            existing.extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
            Some(StoredValue::Hash(existing))
        }
        (Op::HashMax { .. }, None) => None,
        (Op::HashMax { field, value, .. }, Some(StoredValue::Hash(mut existing))) => {
            let current = existing
                .get(field.as_str())
                .and_then(|v| v.parse::<i64>().ok());
            if current.is_some_and(|c| c >= *value) {
                None
            } else {
                existing.insert(field.clone(), value.to_string());
                Some(StoredValue::Hash(existing))
            }
        }
        (Op::SetAdd { member, .. }, None) => {
            Some(StoredValue::Set(BTreeSet::from([member.clone()])))
        }
        (Op::SetAdd { member, .. }, Some(StoredValue::Set(mut members))) => {
            members.insert(member.clone());
            Some(StoredValue::Set(members))
        }
        (Op::Expire { .. }, None) => None,
        (Op::Expire { millis, .. }, Some(_)) => {
            expiry
                .insert(key, now.saturating_add(*millis))
                .map_err(map_err!(Upstream))?;
            bump_version(versions, key)?;
            return Ok(());
        }
        (Op::ArrAppend { .. } | Op::NumIncrBy { .. } | Op::SetField { .. }, None) => {
            return Err(StoreError::Upstream(format!("no such key {key}")));
        }
        (op, Some(found)) => {
            let name = match op {
                Op::ArrAppend { .. } => "ARRAPPEND",
                Op::NumIncrBy { .. } => "NUMINCRBY",
                Op::SetField { .. } => "SET",
                Op::HashSet { .. } => "HSET",
                Op::HashMax { .. } => "HMAX",
                _ => "SADD",
            };
            return Err(wrong_type(key, name, &found));
        }
    };

    if let Some(value) = next {
        let bytes = encode(&value)?;
        docs.insert(key, bytes.as_slice()).map_err(map_err!(Upstream))?;
        bump_version(versions, key)?;
    }
    Ok(())
}
