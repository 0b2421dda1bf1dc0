//! Load-threshold tiers and the drift threshold, kept in the shared store.
//!
//! Reads never fail: a missing, empty, or corrupt value falls back to the
//! built-in defaults, and each tier name falls back independently.

use std::collections::BTreeMap;
use std::sync::Arc;

use dispatch_state::{KvStore, LoadThresholdTier};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{DispatchError, DispatchResult};

pub const LOAD_CONFIG_KEY: &str = "dockerhost-load-config";
pub const DRIFT_THRESHOLD_KEY: &str = "docker-drift-threshold";

pub const DEFAULT_DRIFT_THRESHOLD: u32 = 90;

/// Tier names in the stored mapping, strictest first.
pub const TIER_NAMES: [&str; 3] = ["first", "second", "third"];

pub const DEFAULT_TIERS: LoadTiers = LoadTiers {
    first: LoadThresholdTier::new(80, 80, 60, 80),
    second: LoadThresholdTier::new(90, 80, 80, 90),
    third: LoadThresholdTier::new(100, 80, 100, 100),
};

/// The three tiers, strictest first.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoadTiers {
    pub first: LoadThresholdTier,
    pub second: LoadThresholdTier,
    pub third: LoadThresholdTier,
}

impl LoadTiers {
    /// `(name, tier)` pairs in scan order.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &LoadThresholdTier)> {
        TIER_NAMES.into_iter().zip([&self.first, &self.second, &self.third])
    }

    fn from_map(map: &BTreeMap<String, LoadThresholdTier>) -> Self {
        let pick =
            |name: &str, default: LoadThresholdTier| map.get(name).copied().unwrap_or(default);
        Self {
            first: pick("first", DEFAULT_TIERS.first),
            second: pick("second", DEFAULT_TIERS.second),
            third: pick("third", DEFAULT_TIERS.third),
        }
    }

    pub fn to_map(&self) -> BTreeMap<String, LoadThresholdTier> {
        self.iter().map(|(name, tier)| (name.to_string(), *tier)).collect()
    }
}

impl Default for LoadTiers {
    fn default() -> Self {
        DEFAULT_TIERS
    }
}

/// Reads and writes the tier mapping and drift threshold.
#[derive(Clone)]
pub struct LoadConfigStore {
    kv: Arc<dyn KvStore>,
}

impl LoadConfigStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Current tiers, with per-name fallback to the defaults.
    pub async fn get(&self) -> LoadTiers {
        let raw = match self.kv.get(LOAD_CONFIG_KEY).await {
            Ok(Some(raw)) if !raw.trim().is_empty() => raw,
            Ok(_) => return DEFAULT_TIERS,
            Err(e) => {
                warn!(error = %e, "load config read failed, using defaults");
                return DEFAULT_TIERS;
            }
        };

        // Parse per entry so one malformed tier does not discard the others.
        let entries: BTreeMap<String, serde_json::Value> = match serde_json::from_str(&raw) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "stored load config is not a mapping, using defaults");
                return DEFAULT_TIERS;
            }
        };
        let mut map = BTreeMap::new();
        for (name, value) in entries {
            match serde_json::from_value::<LoadThresholdTier>(value) {
                Ok(tier) => {
                    map.insert(name, tier);
                }
                Err(e) => warn!(tier = %name, error = %e, "malformed load tier, using default"),
            }
        }
        let tiers = LoadTiers::from_map(&map);
        debug!(?tiers, "load config");
        tiers
    }

    /// Replace the stored mapping. It must name exactly the three tiers.
    pub async fn set(&self, map: &BTreeMap<String, LoadThresholdTier>) -> DispatchResult<()> {
        if map.len() != TIER_NAMES.len() {
            return Err(DispatchError::InvalidConfig(format!(
                "expected 3 tiers, got {}",
                map.len()
            )));
        }
        if let Some(unknown) = map.keys().find(|k| !TIER_NAMES.contains(&k.as_str())) {
            return Err(DispatchError::InvalidConfig(format!("unknown tier name: {unknown}")));
        }
        let raw = serde_json::to_string(map)
            .map_err(|e| DispatchError::InvalidConfig(e.to_string()))?;
        self.kv.set(LOAD_CONFIG_KEY, &raw).await?;
        info!(config = %raw, "load config updated");
        Ok(())
    }

    /// Load percentage above which an assigned host is abandoned at start time.
    pub async fn drift_threshold(&self) -> u32 {
        match self.kv.get(DRIFT_THRESHOLD_KEY).await {
            Ok(Some(raw)) => raw.trim().parse().unwrap_or_else(|_| {
                warn!(value = %raw, "unparsable drift threshold, using default");
                DEFAULT_DRIFT_THRESHOLD
            }),
            Ok(None) => DEFAULT_DRIFT_THRESHOLD,
            Err(e) => {
                warn!(error = %e, "drift threshold read failed, using default");
                DEFAULT_DRIFT_THRESHOLD
            }
        }
    }

    pub async fn set_drift_threshold(&self, threshold: u32) -> DispatchResult<()> {
        self.kv.set(DRIFT_THRESHOLD_KEY, &threshold.to_string()).await?;
        info!(threshold, "drift threshold updated");
        Ok(())
    }
}
