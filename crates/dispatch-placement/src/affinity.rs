//! Sticky-host affinity and drift bookkeeping.
//!
//! The sticky record is a one-shot hint: reading it for a selection also
//! clears it, whether or not the hint is used. Drift tracking compares a
//! newly resolved host with the last one recorded for the task.

use std::sync::Arc;
use std::time::Duration;

use dispatch_state::{DriftLogEntry, KvStore, TaskBookkeeping, store::epoch_secs};
use tracing::{debug, info};

use crate::error::DispatchResult;

fn last_host_key(pipeline_id: &str, stage_id: &str) -> String {
    format!("dispatch_docker_build_last_host_{pipeline_id}_{stage_id}")
}

#[derive(Clone)]
pub struct AffinityTracker {
    kv: Arc<dyn KvStore>,
    bookkeeping: Arc<dyn TaskBookkeeping>,
    ttl: Duration,
}

impl AffinityTracker {
    pub fn new(kv: Arc<dyn KvStore>, bookkeeping: Arc<dyn TaskBookkeeping>, ttl: Duration) -> Self {
        Self { kv, bookkeeping, ttl }
    }

    /// Set the sticky host for the next selection of (pipeline, stage).
    pub async fn remember_last_host(
        &self,
        pipeline_id: &str,
        stage_id: &str,
        ip: &str,
    ) -> DispatchResult<()> {
        self.kv
            .set_with_ttl(&last_host_key(pipeline_id, stage_id), ip, self.ttl)
            .await?;
        debug!(%pipeline_id, %stage_id, %ip, "sticky host remembered");
        Ok(())
    }

    /// Consume the sticky host. Blank values read as absent.
    pub async fn take_last_host(
        &self,
        pipeline_id: &str,
        stage_id: &str,
    ) -> DispatchResult<Option<String>> {
        let ip = self.kv.take(&last_host_key(pipeline_id, stage_id)).await?;
        Ok(ip.filter(|ip| !ip.trim().is_empty()))
    }

    /// Record the host a task actually started on.
    ///
    /// Appends a drift entry when the task's previous host differs, then
    /// overwrites the task's host and the build's container id.
    pub async fn resolve_and_record_drift(
        &self,
        pipeline_id: &str,
        stage_id: &str,
        build_id: &str,
        container_id: &str,
        new_ip: &str,
        reason: &str,
    ) -> DispatchResult<bool> {
        let previous = self.bookkeeping.task_simple(pipeline_id, stage_id).await?;

        let drifted = match previous {
            Some(record) if record.docker_ip != new_ip => {
                self.bookkeeping
                    .append_drift(&DriftLogEntry {
                        pipeline_id: pipeline_id.to_string(),
                        build_id: build_id.to_string(),
                        stage_id: stage_id.to_string(),
                        previous_ip: record.docker_ip.clone(),
                        new_ip: new_ip.to_string(),
                        reason: reason.to_string(),
                        created_at: epoch_secs(),
                    })
                    .await?;
                info!(
                    %pipeline_id,
                    %build_id,
                    %stage_id,
                    from = %record.docker_ip,
                    to = %new_ip,
                    %reason,
                    "build host drifted"
                );
                true
            }
            _ => false,
        };

        self.bookkeeping.put_task_ip(pipeline_id, stage_id, new_ip).await?;
        self.bookkeeping
            .set_container_id(build_id, stage_id, container_id)
            .await?;
        Ok(drifted)
    }
}
