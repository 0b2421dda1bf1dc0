//! Start-time re-validation of an already assigned host.
//!
//! Load and gray state can change between placement and the moment the
//! container launches. This is the last check before launch: an invalid
//! host triggers a fresh selection, and a rate-limited host triggers a
//! selection that excludes it.

use std::collections::BTreeSet;
use std::fmt;

use dispatch_state::{BuildStartEvent, HostRecord};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::DispatchResult;
use crate::selector::{HostChoice, HostSelector};

/// Why a task moved away from its assigned host, when the move is not a
/// plain re-selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftReason {
    RateLimit,
}

impl fmt::Display for DriftReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RateLimit => f.write_str("rate-limit drift"),
        }
    }
}

/// Final host for a task about to start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    pub ip: String,
    pub port: u16,
    pub drift_reason: Option<DriftReason>,
}

impl Placement {
    pub fn new(choice: HostChoice, drift_reason: Option<DriftReason>) -> Self {
        Self {
            ip: choice.ip,
            port: choice.port,
            drift_reason,
        }
    }

    /// Reason text for the drift log; empty when there is none.
    pub fn reason_text(&self) -> String {
        self.drift_reason.map(|r| r.to_string()).unwrap_or_default()
    }
}

impl HostSelector {
    /// Confirm `host` is still usable for `event`, re-selecting if not.
    pub async fn check_and_set_ip(
        &self,
        event: &BuildStartEvent,
        dedicated: &BTreeSet<String>,
        host: &HostRecord,
    ) -> DispatchResult<Placement> {
        let threshold = self.load_config.drift_threshold().await;
        let gray_env = self.gray.is_gray();

        let invalid = !host.enabled
            || host.disk_load > threshold
            || host.mem_load > threshold
            || host.dedicated_only
            || host.gray_env != gray_env;
        if invalid {
            warn!(
                %event,
                ip = %host.ip,
                enabled = host.enabled,
                disk_load = host.disk_load,
                mem_load = host.mem_load,
                threshold,
                dedicated_only = host.dedicated_only,
                "assigned host no longer valid, re-selecting"
            );
            // The rejected host also fails the sticky check and any tier pick.
            let rejected = BTreeSet::from([host.ip.clone()]);
            let choice = self
                .select_host(
                    &event.project_id,
                    &event.pipeline_id,
                    &event.stage_id,
                    dedicated,
                    &rejected,
                )
                .await?;
            return Ok(Placement::new(choice, None));
        }

        if self.rate_limiter.is_over_limit(&host.ip).await? {
            info!(%event, ip = %host.ip, "assigned host rate limited, re-selecting");
            let excluded = BTreeSet::from([host.ip.clone()]);
            let choice = self
                .select_host(
                    &event.project_id,
                    &event.pipeline_id,
                    &event.stage_id,
                    dedicated,
                    &excluded,
                )
                .await?;
            return Ok(Placement::new(choice, Some(DriftReason::RateLimit)));
        }

        Ok(Placement::new(HostChoice::from(host), None))
    }
}
