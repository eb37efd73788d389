//! redb table definitions for the cluster registry.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Cluster descriptors keyed by `{namespace}`.
pub const CLUSTERS: TableDefinition<&str, &[u8]> = TableDefinition::new("clusters");

/// API key records keyed by the key string.
pub const API_KEYS: TableDefinition<&str, &[u8]> = TableDefinition::new("api_keys");

/// Published-route flags keyed by `{namespace}`.
pub const DNS_ROUTES: TableDefinition<&str, &[u8]> = TableDefinition::new("dns_routes");
