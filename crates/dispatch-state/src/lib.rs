//! dispatch-state: persisted state and collaborator ports for build-host dispatch.
//!
//! Backed by [redb](https://docs.rs/redb), provides the host registry, the
//! shared key-value and counter stores, lease locks, and the bookkeeping
//! tables (slot pool, task records, drift log) that placement reads and writes.
//!
//! # Architecture
//!
//! Placement logic only talks to the traits in [`ports`]. [`StateStore`]
//! implements every one of them, so a single in-memory store is a complete
//! fake for tests and a single on-disk store backs the `dispatchd` binary.
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Per-task tables use tuple keys (`(pipeline_id, stage_id, slot)`), so a
//! range scan returns exactly one task's records.

pub mod error;
pub mod kv;
pub mod ports;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use ports::*;
pub use store::StateStore;
pub use types::*;
