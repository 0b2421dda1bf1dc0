//! Domain types for the dispatch state store.
//!
//! These types represent build hosts, load-threshold tiers, concurrency
//! slots, task bookkeeping, and the drift audit trail. All types are
//! serializable to/from JSON for storage in redb tables.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier (IP address) of a build host.
pub type HostIp = String;

// ── Host ──────────────────────────────────────────────────────────

/// One build-execution node.
///
/// Load fields are percentages and may exceed 100 when a host is
/// over-committed; they are never clamped.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostRecord {
    pub ip: HostIp,
    pub port: u16,
    pub capacity: u32,
    pub used_count: u32,
    pub cpu_load: u32,
    pub mem_load: u32,
    pub disk_load: u32,
    pub disk_io_load: u32,
    pub enabled: bool,
    /// Rollout generation this host belongs to.
    pub gray_env: bool,
    /// Reserved for dedicated assignment, excluded from general selection.
    pub dedicated_only: bool,
    /// Unix timestamp (seconds) when this record was created. Filled on
    /// insert when zero.
    #[serde(default)]
    pub created_at: u64,
}

impl HostRecord {
    /// `ip:port` address of the host's dispatch agent.
    pub fn address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

// ── Load thresholds ───────────────────────────────────────────────

/// One load-threshold profile. A host qualifies when every metric is
/// strictly below its threshold.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LoadThresholdTier {
    pub cpu_load_threshold: u32,
    pub mem_load_threshold: u32,
    pub disk_load_threshold: u32,
    #[serde(rename = "diskIOLoadThreshold")]
    pub disk_io_load_threshold: u32,
}

impl LoadThresholdTier {
    pub const fn new(cpu: u32, mem: u32, disk: u32, disk_io: u32) -> Self {
        Self {
            cpu_load_threshold: cpu,
            mem_load_threshold: mem,
            disk_load_threshold: disk,
            disk_io_load_threshold: disk_io,
        }
    }

    /// Whether all four load metrics of `host` are strictly below this tier.
    pub fn admits(&self, host: &HostRecord) -> bool {
        host.cpu_load < self.cpu_load_threshold
            && host.mem_load < self.mem_load_threshold
            && host.disk_load < self.disk_load_threshold
            && host.disk_io_load < self.disk_io_load_threshold
    }
}

/// Dedicated-host restriction applied to a registry query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedicatedFilter {
    /// Only hosts whose IP is in the set.
    Only(std::collections::BTreeSet<HostIp>),
    /// Every host that is not reserved as dedicated-only.
    ExcludeDedicated,
}

impl DedicatedFilter {
    pub fn matches(&self, host: &HostRecord) -> bool {
        match self {
            Self::Only(ips) => ips.contains(&host.ip),
            Self::ExcludeDedicated => !host.dedicated_only,
        }
    }
}

// ── Slot pool ─────────────────────────────────────────────────────

/// Occupancy of a single concurrency slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotStatus {
    Running,
    Idle,
}

/// A numbered concurrency slot for a (pipeline, stage) pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SlotPoolEntry {
    pub pipeline_id: String,
    pub stage_id: String,
    pub slot: u32,
    pub status: SlotStatus,
    /// Unix timestamp of the last status change.
    pub updated_at: u64,
}


// ── Task bookkeeping ──────────────────────────────────────────────

/// Last-known host for a (pipeline, stage) pair, overwritten on every resolution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskSimpleRecord {
    pub pipeline_id: String,
    pub stage_id: String,
    pub docker_ip: HostIp,
    pub updated_at: u64,
}


/// Audit record written whenever a task's resolved host changes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DriftLogEntry {
    pub pipeline_id: String,
    pub build_id: String,
    pub stage_id: String,
    pub previous_ip: HostIp,
    pub new_ip: HostIp,
    /// Free-form reason; empty when the drift was a plain re-selection.
    pub reason: String,
    pub created_at: u64,
}

// ── Events ────────────────────────────────────────────────────────

/// Payload of a build-start request delivered to the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuildStartEvent {
    pub project_id: String,
    pub pipeline_id: String,
    pub build_id: String,
    pub stage_id: String,
    #[serde(default)]
    pub container_id: String,
}

impl fmt::Display for BuildStartEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}",
            self.project_id, self.pipeline_id, self.build_id, self.stage_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(cpu: u32, mem: u32, disk: u32, disk_io: u32) -> HostRecord {
        HostRecord {
            ip: "10.0.0.1".to_string(),
            port: 80,
            capacity: 100,
            used_count: 0,
            cpu_load: cpu,
            mem_load: mem,
            disk_load: disk,
            disk_io_load: disk_io,
            enabled: true,
            gray_env: false,
            dedicated_only: false,
            created_at: 1000,
        }
    }

    #[test]
    fn tier_admits_only_strictly_below() {
        let tier = LoadThresholdTier::new(80, 80, 60, 80);
        assert!(tier.admits(&host(50, 50, 50, 50)));
        assert!(!tier.admits(&host(80, 50, 50, 50)));
        assert!(!tier.admits(&host(50, 50, 60, 50)));
        assert!(!tier.admits(&host(50, 50, 50, 120)));
    }

    #[test]
    fn tier_json_uses_stored_field_names() {
        let tier = LoadThresholdTier::new(80, 80, 60, 80);
        let json = serde_json::to_string(&tier).unwrap();
        assert!(json.contains("\"cpuLoadThreshold\":80"));
        assert!(json.contains("\"diskIOLoadThreshold\":80"));
    }

    #[test]
    fn dedicated_filter_matches() {
        let mut reserved = host(0, 0, 0, 0);
        reserved.dedicated_only = true;
        let general = host(0, 0, 0, 0);

        assert!(!DedicatedFilter::ExcludeDedicated.matches(&reserved));
        assert!(DedicatedFilter::ExcludeDedicated.matches(&general));

        let only = DedicatedFilter::Only(["10.0.0.1".to_string()].into_iter().collect());
        assert!(only.matches(&reserved));
        let other = DedicatedFilter::Only(["10.0.0.9".to_string()].into_iter().collect());
        assert!(!other.matches(&general));
    }

    #[test]
    fn build_event_defaults_container_id() {
        let event: BuildStartEvent = serde_json::from_str(
            r#"{"project_id":"p","pipeline_id":"pl","build_id":"b1","stage_id":"1"}"#,
        )
        .unwrap();
        assert!(event.container_id.is_empty());
        assert_eq!(event.to_string(), "p|pl|b1|1");
    }
}
