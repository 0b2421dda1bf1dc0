//! Build-host placement: tiered load selection, sticky affinity, slot pools.
//!
//! Decides which build host runs a (pipeline, stage) build and keeps the
//! bookkeeping that goes with the decision. All state goes through the
//! ports in `dispatch-state`, so the components here hold no data of their
//! own beyond configuration.
//!
//! # Components
//!
//! - **`load_config`**: Threshold tiers and drift threshold in the shared KV store
//! - **`selector`**: Sticky-then-tiered host selection
//! - **`revalidate`**: Start-time check of an assigned host
//! - **`slot_pool`**: Per-pipeline concurrency slots under a lease lock
//! - **`rate_limit`**: Per-host in-flight counters
//! - **`affinity`**: Sticky host hints and the drift log
//! - **`proxy`**: Proxy URLs for reaching a host agent
//! - **`dispatcher`**: The build-start and build-finish flow

pub mod affinity;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod load_config;
pub mod proxy;
pub mod rate_limit;
pub mod revalidate;
pub mod selector;
pub mod slot_pool;

pub use affinity::AffinityTracker;
pub use config::{AffinityConfig, DispatchConfig, PoolConfig, RateLimitConfig, SelectorConfig};
pub use dispatcher::{Dispatcher, Ports, StartedBuild};
pub use error::{DispatchError, DispatchResult, HostScope};
pub use load_config::{
    DEFAULT_DRIFT_THRESHOLD, DEFAULT_TIERS, DRIFT_THRESHOLD_KEY, LOAD_CONFIG_KEY, LoadConfigStore,
    LoadTiers,
};
pub use proxy::ProxyUrlBuilder;
pub use rate_limit::RateLimiter;
pub use revalidate::{DriftReason, Placement};
pub use selector::{HostChoice, HostSelector};
pub use slot_pool::SlotPool;
