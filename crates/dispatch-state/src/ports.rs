//! Collaborator ports consumed by placement.
//!
//! Placement never touches storage directly; it holds these traits as
//! `Arc<dyn ...>`. [`StateStore`](crate::StateStore) implements all of them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::error::StateResult;
use crate::types::*;

/// Durable store of build-host records.
#[async_trait]
pub trait HostRegistry: Send + Sync {
    /// Enabled hosts of `gray_env` whose loads are all below `tier` and
    /// which pass `dedicated`.
    async fn query_by_load_filter(
        &self,
        gray_env: bool,
        tier: &LoadThresholdTier,
        dedicated: &DedicatedFilter,
    ) -> StateResult<Vec<HostRecord>>;

    async fn get_by_ip(&self, ip: &str) -> StateResult<Option<HostRecord>>;

    /// IPs an operator has dedicated to `project_id`.
    async fn dedicated_ips(&self, project_id: &str) -> StateResult<Vec<HostIp>>;
}

/// Shared string key-value store.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> StateResult<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> StateResult<()>;

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> StateResult<()>;

    /// Read and delete a key in one atomic step.
    async fn take(&self, key: &str) -> StateResult<Option<String>>;

    async fn delete(&self, key: &str) -> StateResult<bool>;
}

/// Shared integer counters.
#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn get_counter(&self, key: &str) -> StateResult<Option<i64>>;

    async fn incr(&self, key: &str) -> StateResult<i64>;

    async fn decr(&self, key: &str) -> StateResult<i64>;
}

/// Distributed mutual exclusion with bounded leases.
#[async_trait]
pub trait LockService: Send + Sync {
    /// Acquire `key` for at most `lease`, waiting up to `wait` for a
    /// current holder to release or expire.
    async fn acquire(&self, key: &str, lease: Duration, wait: Duration)
    -> StateResult<LeaseGuard>;
}

/// Releases a held lease. Called from [`LeaseGuard`]'s drop, so it is sync.
pub trait LeaseRelease: Send + Sync {
    fn release_lease(&self, key: &str, token: &str);
}

/// A held lease. Released on drop, including during unwinding.
pub struct LeaseGuard {
    key: String,
    token: String,
    releaser: Option<Arc<dyn LeaseRelease>>,
}

impl LeaseGuard {
    pub fn new(
        key: impl Into<String>,
        token: impl Into<String>,
        releaser: Arc<dyn LeaseRelease>,
    ) -> Self {
        Self {
            key: key.into(),
            token: token.into(),
            releaser: Some(releaser),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Release now instead of at end of scope.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(releaser) = self.releaser.take() {
            releaser.release_lease(&self.key, &self.token);
            debug!(key = %self.key, "lease released");
        }
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl std::fmt::Debug for LeaseGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseGuard")
            .field("key", &self.key)
            .field("held", &self.releaser.is_some())
            .finish()
    }
}

/// Current gray-rollout generation of this dispatcher.
pub trait GrayOracle: Send + Sync {
    fn is_gray(&self) -> bool;
}

/// Fixed generation, usually taken from configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticGray(pub bool);

impl GrayOracle for StaticGray {
    fn is_gray(&self) -> bool {
        self.0
    }
}

/// Slot pool, task records, drift log, and container ids.
#[async_trait]
pub trait TaskBookkeeping: Send + Sync {
    async fn slot_status(
        &self,
        pipeline_id: &str,
        stage_id: &str,
        slot: u32,
    ) -> StateResult<Option<SlotStatus>>;

    async fn put_slot_status(
        &self,
        pipeline_id: &str,
        stage_id: &str,
        slot: u32,
        status: SlotStatus,
    ) -> StateResult<()>;

    async fn task_simple(&self, pipeline_id: &str, stage_id: &str)
    -> StateResult<Option<TaskSimpleRecord>>;

    async fn put_task_ip(&self, pipeline_id: &str, stage_id: &str, ip: &str) -> StateResult<()>;

    async fn append_drift(&self, entry: &DriftLogEntry) -> StateResult<()>;

    async fn drift_log(&self, pipeline_id: &str, stage_id: &str) -> StateResult<Vec<DriftLogEntry>>;

    async fn set_container_id(
        &self,
        build_id: &str,
        stage_id: &str,
        container_id: &str,
    ) -> StateResult<()>;

    async fn container_id(&self, build_id: &str, stage_id: &str) -> StateResult<Option<String>>;
}
