//! redb table definitions for the Stratus state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Application entities keyed by `{app_id}`.
pub const APPLICATIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("applications");

/// Instance ledger records keyed by `{app_id}:{instance_index}`.
pub const LEDGER: TableDefinition<&str, &[u8]> = TableDefinition::new("ledger");

/// Node records keyed by `{node_id}`.
pub const NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("nodes");
