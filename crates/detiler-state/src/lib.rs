//! detiler-state — tile-state and cooldown stores for detiler.
//!
//! Backed by [redb](https://docs.rs/redb) through a small document
//! [`Engine`] that provides optimistic watch-then-commit transactions, key
//! expiry, prefix-bound secondary indexes and server-side search cursors.
//!
//! # Architecture
//!
//! - [`KitRegistry`] keeps the registered kits (`kit:{name}` hashes plus the
//!   `kits` membership set).
//! - [`TileStateStore`] records one document per `(kit, z, x, y)` at
//!   `tile:{kit}:{z}/{x}/{y}`.
//! - [`CooldownStore`] writes content-addressed `cooldown:{sha256}`
//!   documents.
//! - [`QueryCompiler`] turns structured queries into the index query
//!   language and [`Paginator`] pages the results.
//!
//! [`DetilerStore`] wires them over a single engine. Every handle is
//! `Clone + Send + Sync` (backed by `Arc`) and can be shared across tasks.

pub mod compiler;
pub mod cooldowns;
pub mod engine;
pub mod error;
pub mod keys;
pub mod kits;
pub mod paginator;
pub mod query;
pub mod tables;
pub mod tiles;

use std::path::Path;
use std::time::Duration;

use detiler_core::config::{QueryConfig, StoreConfig};
use tracing::info;

pub use compiler::{CompiledQuery, QueryCompiler};
pub use cooldowns::CooldownStore;
pub use engine::{Engine, Session, Transaction};
pub use error::{StoreError, StoreResult};
pub use kits::KitRegistry;
pub use paginator::{Page, Paginator};
pub use tiles::TileStateStore;

/// All stores over one shared engine.
#[derive(Clone)]
pub struct DetilerStore {
    pub engine: Engine,
    pub kits: KitRegistry,
    pub tiles: TileStateStore,
    pub cooldowns: CooldownStore,
}

impl DetilerStore {
    /// Open (or create) the persistent store described by `store`.
    pub fn open(path: &Path, store: &StoreConfig, query: &QueryConfig) -> StoreResult<Self> {
        let engine = Engine::open(path)?
            .with_cursor_idle(Duration::from_secs(store.cursor_idle_secs));
        info!(?path, "detiler store opened");
        Self::from_engine(engine, query)
    }

    /// Ephemeral in-memory store with default settings.
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::from_engine(Engine::open_in_memory()?, &QueryConfig::default())
    }

    /// Persistent or in-memory store according to `store.in_memory`.
    pub fn from_config(path: &Path, store: &StoreConfig, query: &QueryConfig) -> StoreResult<Self> {
        if store.in_memory {
            let engine = Engine::open_in_memory()?
                .with_cursor_idle(Duration::from_secs(store.cursor_idle_secs));
            info!("in-memory detiler store opened");
            return Self::from_engine(engine, query);
        }
        Self::open(path, store, query)
    }

    pub fn from_engine(engine: Engine, query: &QueryConfig) -> StoreResult<Self> {
        let kits = KitRegistry::new(engine.clone());
        let tiles = TileStateStore::new(engine.clone(), kits.clone(), query)?;
        let cooldowns = CooldownStore::new(engine.clone(), query)?;
        Ok(Self {
            engine,
            kits,
            tiles,
            cooldowns,
        })
    }
}
