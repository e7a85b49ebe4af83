//! redb table definitions for the quotawatch state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized engine state).

use redb::TableDefinition;

/// A table of JSON documents keyed by string.
pub type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Quota phase state keyed by balance entity id.
pub const QUOTA_PHASE: JsonTable = TableDefinition::new("quota_phase");

/// Service threshold state keyed by service id.
pub const SERVICE_THRESHOLDS: JsonTable = TableDefinition::new("service_thresholds");

/// Last-known-good cache entries keyed by entity id.
pub const CACHE_ENTRIES: JsonTable = TableDefinition::new("cache_entries");
