//! redb table definitions for the index engine.
//!
//! Every document lives in one keyspace. Keys follow `{prefix}:{id}` so that
//! an index can scan its documents with a single prefix range.

use redb::TableDefinition;

/// JSON documents keyed by their full key (`tile:kit:1/0/0`, `kit:name`, ...).
pub const DOCUMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("documents");

/// Modification counter per key, bumped by every write. Watches compare it.
pub const VERSIONS: TableDefinition<&str, u64> = TableDefinition::new("versions");

/// Expiry deadline per key, unix milliseconds.
pub const EXPIRY: TableDefinition<&str, u64> = TableDefinition::new("expiry");
