//! redb table definitions for the dispatch state store.
//!
//! Most values are JSON-serialized domain types stored as `&[u8]`; counters
//! are native `i64`. Per-task tables use tuple keys led by
//! `(pipeline_id, stage_id)`, so one task's rows form a contiguous range
//! and ids containing separators cannot collide.

use redb::TableDefinition;

/// Host records keyed by `{ip}`.
pub const HOSTS: TableDefinition<&str, &[u8]> = TableDefinition::new("hosts");

/// Dedicated host IP lists keyed by `{project_id}`.
pub const DEDICATED_HOSTS: TableDefinition<&str, &[u8]> = TableDefinition::new("dedicated_hosts");

/// Shared key-value entries (with optional expiry) keyed by the caller's key.
pub const KV: TableDefinition<&str, &[u8]> = TableDefinition::new("kv");

/// Integer counters keyed by the caller's key.
pub const COUNTERS: TableDefinition<&str, i64> = TableDefinition::new("counters");

/// Lease locks keyed by lock name.
pub const LOCKS: TableDefinition<&str, &[u8]> = TableDefinition::new("locks");

/// Concurrency slots keyed by `(pipeline_id, stage_id, slot)`.
pub const SLOT_POOL: TableDefinition<(&str, &str, u32), &[u8]> = TableDefinition::new("slot_pool");

/// Last resolved host per task keyed by `(pipeline_id, stage_id)`.
pub const TASK_SIMPLE: TableDefinition<(&str, &str), &[u8]> = TableDefinition::new("task_simple");

/// Append-only drift audit keyed by `(pipeline_id, stage_id, seq)`.
pub const DRIFT_LOG: TableDefinition<(&str, &str, u64), &[u8]> = TableDefinition::new("drift_log");

/// Container id per build stage keyed by `(build_id, stage_id)`.
pub const BUILD_CONTAINERS: TableDefinition<(&str, &str), &str> =
    TableDefinition::new("build_containers");

/// Sequence counter used to order drift log entries.
pub(crate) const DRIFT_SEQ_KEY: &str = "__drift_log_seq";
