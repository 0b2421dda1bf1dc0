//! Per-(pipeline, stage) concurrency slots.
//!
//! Each pair owns slots `1..=max_size`. Acquisition scans in order and
//! takes the first slot that is missing or idle, holding a lease lock on
//! the pair for the whole scan. Distinct pairs use distinct locks.

use std::sync::Arc;

use dispatch_state::{LockService, SlotStatus, StateError, TaskBookkeeping};
use tracing::{debug, error, info, warn};

use crate::config::PoolConfig;
use crate::error::{DispatchError, DispatchResult};

pub(crate) fn lock_key(pipeline_id: &str, stage_id: &str) -> String {
    format!("DISPATCH_DOCKER_LOCK_CONTAINER_{pipeline_id}_{stage_id}")
}

#[derive(Clone)]
pub struct SlotPool {
    bookkeeping: Arc<dyn TaskBookkeeping>,
    locks: Arc<dyn LockService>,
    config: PoolConfig,
}

impl SlotPool {
    pub fn new(
        bookkeeping: Arc<dyn TaskBookkeeping>,
        locks: Arc<dyn LockService>,
        config: PoolConfig,
    ) -> Self {
        Self {
            bookkeeping,
            locks,
            config,
        }
    }

    pub fn max_size(&self) -> u32 {
        self.config.max_size
    }

    async fn lock(
        &self,
        pipeline_id: &str,
        stage_id: &str,
    ) -> DispatchResult<dispatch_state::LeaseGuard> {
        let key = lock_key(pipeline_id, stage_id);
        self.locks
            .acquire(&key, self.config.lock_lease(), self.config.lock_wait())
            .await
            .map_err(|e| match e {
                StateError::LockTimeout(key) => {
                    warn!(%pipeline_id, %stage_id, "slot pool lock contended");
                    DispatchError::LockContention { key }
                }
                other => other.into(),
            })
    }

    /// Claim the lowest free slot number and mark it running.
    pub async fn acquire_slot(&self, pipeline_id: &str, stage_id: &str) -> DispatchResult<u32> {
        let _guard = self.lock(pipeline_id, stage_id).await?;

        let result = self.claim_first_free(pipeline_id, stage_id).await;
        if let Err(e) = &result {
            error!(%pipeline_id, %stage_id, error = %e, "slot acquisition failed");
        }
        result
    }

    async fn claim_first_free(&self, pipeline_id: &str, stage_id: &str) -> DispatchResult<u32> {
        for slot in 1..=self.config.max_size {
            match self.bookkeeping.slot_status(pipeline_id, stage_id, slot).await? {
                Some(SlotStatus::Running) => continue,
                status => {
                    self.bookkeeping
                        .put_slot_status(pipeline_id, stage_id, slot, SlotStatus::Running)
                        .await?;
                    debug!(
                        %pipeline_id,
                        %stage_id,
                        slot,
                        reused = status.is_some(),
                        "slot acquired"
                    );
                    return Ok(slot);
                }
            }
        }
        Err(DispatchError::PoolExhausted {
            pipeline_id: pipeline_id.to_string(),
            stage_id: stage_id.to_string(),
        })
    }

    /// Mark a slot idle so it can be claimed again.
    pub async fn release_slot(
        &self,
        pipeline_id: &str,
        stage_id: &str,
        slot: u32,
    ) -> DispatchResult<()> {
        let _guard = self.lock(pipeline_id, stage_id).await?;

        match self.bookkeeping.slot_status(pipeline_id, stage_id, slot).await? {
            Some(_) => {
                self.bookkeeping
                    .put_slot_status(pipeline_id, stage_id, slot, SlotStatus::Idle)
                    .await?;
                info!(%pipeline_id, %stage_id, slot, "slot released");
            }
            None => warn!(%pipeline_id, %stage_id, slot, "release of unknown slot ignored"),
        }
        Ok(())
    }
}
