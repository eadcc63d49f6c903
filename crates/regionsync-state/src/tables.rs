//! redb table definitions for the regionsync store.
//!
//! String-keyed tables hold JSON-serialized domain types. Composite keys
//! follow `{kind}/{id}` so related rows can be found by prefix scan.

use redb::TableDefinition;

/// Lifecycle requests keyed by request id.
pub const REQUESTS: TableDefinition<u64, &[u8]> = TableDefinition::new("requests");

/// Response rows: `request/{id}`, `versions`, `streaming/{agent_index}`.
pub const RESPONSES: TableDefinition<&str, &[u8]> = TableDefinition::new("responses");

/// Initialization checkpoints keyed by `{agent}/{source}/{table}`.
pub const CHECKPOINTS: TableDefinition<&str, &[u8]> = TableDefinition::new("checkpoints");

/// Replicated table metadata keyed by table name.
pub const TABLES: TableDefinition<&str, &[u8]> = TableDefinition::new("tables");

/// Region map: numeric id → region name.
pub const REGION_IDS: TableDefinition<u32, &str> = TableDefinition::new("region_ids");

/// Counters (`region_seq`).
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

pub const VERSIONS_KEY: &str = "versions";
pub const REGION_SEQ_KEY: &str = "region_seq";

pub fn response_key(request_id: u64) -> String {
    format!("request/{request_id}")
}

pub fn streaming_key(agent_index: u32) -> String {
    format!("streaming/{agent_index}")
}
