//! Tunables for placement components.
//!
//! Every struct deserializes with defaults for missing fields, so the
//! daemon can embed them directly in its TOML configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level placement configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DispatchConfig {
    pub selection: SelectorConfig,
    pub pool: PoolConfig,
    pub rate_limit: RateLimitConfig,
    pub affinity: AffinityConfig,
    /// Base URL of the proxy that reaches the build network.
    pub idc_proxy: String,
}

/// Host selection tunables.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SelectorConfig {
    /// Random picks attempted among tier candidates before giving up.
    pub max_attempts: u32,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self { max_attempts: 200 }
    }
}

/// Concurrency slot pool tunables.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PoolConfig {
    /// Slots per (pipeline, stage) pair, numbered from 1.
    pub max_size: u32,
    /// Lease held on the pool lock, in seconds.
    pub lock_lease_secs: u64,
    /// How long to wait for the pool lock, in milliseconds.
    pub lock_wait_ms: u64,
}

impl PoolConfig {
    pub fn lock_lease(&self) -> Duration {
        Duration::from_secs(self.lock_lease_secs)
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 100,
            lock_lease_secs: 30,
            lock_wait_ms: 5_000,
        }
    }
}

/// Per-host in-flight request ceiling.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RateLimitConfig {
    pub max_in_flight: i64,
    /// Counter key prefix; the host IP is appended.
    pub key_prefix: String,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 1000,
            key_prefix: "dispatch_docker_ip_count_".to_string(),
        }
    }
}

/// Sticky-host record retention.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AffinityConfig {
    pub ttl_secs: u64,
}

impl AffinityConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Default for AffinityConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 7 * 24 * 3600,
        }
    }
}
