//! detiler.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default page size for searches that do not request one.
pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// Result bound for the all-kits tile lookup.
pub const DEFAULT_TILE_LOOKUP_LIMIT: usize = 1000;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetilerConfig {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub query: QueryConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding the database file.
    pub data_dir: PathBuf,
    /// Keep everything in memory (nothing survives a restart).
    pub in_memory: bool,
    /// Seconds an idle search cursor is kept before it is dropped.
    pub cursor_idle_secs: u64,
    /// Seconds between sweeps of expired keys.
    pub purge_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/detiler"),
            in_memory: false,
            cursor_idle_secs: 300,
            purge_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    pub default_page_size: usize,
    pub tile_lookup_limit: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_page_size: DEFAULT_PAGE_SIZE,
            tile_lookup_limit: DEFAULT_TILE_LOOKUP_LIMIT,
        }
    }
}

impl DetilerConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: DetilerConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Path of the database file inside `store.data_dir`.
    pub fn database_path(&self) -> PathBuf {
        self.store.data_dir.join("detiler.redb")
    }
}
