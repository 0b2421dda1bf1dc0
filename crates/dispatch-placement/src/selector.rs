//! Host selection: sticky affinity, then tiered load search.
//!
//! A selection first consults the one-shot sticky record for the
//! (pipeline, stage) pair. Failing that, it queries the registry through
//! the three load tiers, strictest first, and stops at the first tier with
//! any candidates. Within that tier it makes a bounded number of uniform
//! random picks, skipping excluded and rate-limited hosts. Exhausting the
//! picks is terminal; looser tiers are not tried afterwards.

use std::collections::BTreeSet;
use std::sync::Arc;

use dispatch_state::{DedicatedFilter, GrayOracle, HostRecord, HostRegistry};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::affinity::AffinityTracker;
use crate::config::SelectorConfig;
use crate::error::{DispatchError, DispatchResult, HostScope};
use crate::load_config::{LoadConfigStore, LoadTiers};
use crate::rate_limit::RateLimiter;

/// The chosen host and its dispatch port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostChoice {
    pub ip: String,
    pub port: u16,
}

impl From<&HostRecord> for HostChoice {
    fn from(host: &HostRecord) -> Self {
        Self {
            ip: host.ip.clone(),
            port: host.port,
        }
    }
}

#[derive(Clone)]
pub struct HostSelector {
    pub(crate) registry: Arc<dyn HostRegistry>,
    pub(crate) load_config: LoadConfigStore,
    pub(crate) rate_limiter: RateLimiter,
    pub(crate) affinity: AffinityTracker,
    pub(crate) gray: Arc<dyn GrayOracle>,
    config: SelectorConfig,
}

impl HostSelector {
    pub fn new(
        registry: Arc<dyn HostRegistry>,
        load_config: LoadConfigStore,
        rate_limiter: RateLimiter,
        affinity: AffinityTracker,
        gray: Arc<dyn GrayOracle>,
        config: SelectorConfig,
    ) -> Self {
        Self {
            registry,
            load_config,
            rate_limiter,
            affinity,
            gray,
            config,
        }
    }

    /// Select a host using the dedicated set configured for `project_id`.
    pub async fn select_host_for_project(
        &self,
        project_id: &str,
        pipeline_id: &str,
        stage_id: &str,
        excluded: &BTreeSet<String>,
    ) -> DispatchResult<HostChoice> {
        let dedicated: BTreeSet<String> = self
            .registry
            .dedicated_ips(project_id)
            .await?
            .into_iter()
            .collect();
        debug!(%project_id, ?dedicated, "dedicated hosts");
        self.select_host(project_id, pipeline_id, stage_id, &dedicated, excluded)
            .await
    }

    /// Select a host for one (pipeline, stage) build.
    ///
    /// With a non-empty `dedicated` set only those hosts are considered;
    /// otherwise dedicated-only hosts are skipped. Hosts in `excluded` are
    /// never returned.
    pub async fn select_host(
        &self,
        project_id: &str,
        pipeline_id: &str,
        stage_id: &str,
        dedicated: &BTreeSet<String>,
        excluded: &BTreeSet<String>,
    ) -> DispatchResult<HostChoice> {
        let gray_env = self.gray.is_gray();
        let tiers = self.load_config.get().await;

        if let Some(choice) = self
            .sticky_choice(pipeline_id, stage_id, &tiers, gray_env, dedicated, excluded)
            .await?
        {
            info!(%project_id, %pipeline_id, %stage_id, ip = %choice.ip, "reusing sticky host");
            return Ok(choice);
        }

        let filter = if dedicated.is_empty() {
            DedicatedFilter::ExcludeDedicated
        } else {
            DedicatedFilter::Only(dedicated.clone())
        };

        for (name, tier) in tiers.iter() {
            let candidates = self.registry.query_by_load_filter(gray_env, tier, &filter).await?;
            if candidates.is_empty() {
                debug!(%pipeline_id, %stage_id, tier = name, "no hosts within tier");
                continue;
            }

            debug!(
                %pipeline_id,
                %stage_id,
                tier = name,
                candidates = candidates.len(),
                "tier matched"
            );
            if let Some(choice) = self.pick(&candidates, excluded).await? {
                info!(
                    %project_id,
                    %pipeline_id,
                    %stage_id,
                    tier = name,
                    ip = %choice.ip,
                    "build host selected"
                );
                return Ok(choice);
            }
            warn!(%pipeline_id, %stage_id, tier = name, "every pick excluded or rate limited");
            break;
        }

        let scope = HostScope::from_dedicated(dedicated);
        warn!(%project_id, %pipeline_id, %stage_id, %scope, "no available build host");
        Err(DispatchError::NoAvailableHost { scope })
    }

    /// Consume the sticky record and decide whether to honor it.
    async fn sticky_choice(
        &self,
        pipeline_id: &str,
        stage_id: &str,
        tiers: &LoadTiers,
        gray_env: bool,
        dedicated: &BTreeSet<String>,
        excluded: &BTreeSet<String>,
    ) -> DispatchResult<Option<HostChoice>> {
        let Some(last_ip) = self.affinity.take_last_host(pipeline_id, stage_id).await? else {
            return Ok(None);
        };
        if excluded.contains(&last_ip) {
            debug!(%pipeline_id, %stage_id, ip = %last_ip, "sticky host excluded");
            return Ok(None);
        }
        let Some(host) = self.registry.get_by_ip(&last_ip).await? else {
            debug!(%pipeline_id, %stage_id, ip = %last_ip, "sticky host no longer registered");
            return Ok(None);
        };

        if !dedicated.is_empty() {
            // Dedicated assignment keeps its host regardless of load.
            return Ok(dedicated.contains(&host.ip).then(|| HostChoice::from(&host)));
        }

        let healthy = host.enabled
            && !host.dedicated_only
            && host.gray_env == gray_env
            && tiers.second.admits(&host);
        if !healthy {
            debug!(%pipeline_id, %stage_id, ip = %host.ip, "sticky host not eligible");
        }
        Ok(healthy.then(|| HostChoice::from(&host)))
    }

    /// Uniform random picks among `candidates`, bounded by `max_attempts`.
    async fn pick(
        &self,
        candidates: &[HostRecord],
        excluded: &BTreeSet<String>,
    ) -> DispatchResult<Option<HostChoice>> {
        for attempt in 1..=self.config.max_attempts {
            let index = rand::thread_rng().gen_range(0..candidates.len());
            let host = &candidates[index];
            if excluded.contains(&host.ip) {
                continue;
            }
            if self.rate_limiter.is_over_limit(&host.ip).await? {
                debug!(ip = %host.ip, attempt, "candidate rate limited");
                continue;
            }
            return Ok(Some(HostChoice::from(host)));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitConfig;
    use dispatch_state::{CounterStore, StateStore, StaticGray};
    use std::time::Duration;

    fn host(ip: &str, load: u32) -> HostRecord {
        HostRecord {
            ip: ip.to_string(),
            port: 8080,
            capacity: 100,
            used_count: 0,
            cpu_load: load,
            mem_load: load.min(70),
            disk_load: load.min(50),
            disk_io_load: load,
            enabled: true,
            gray_env: false,
            dedicated_only: false,
            created_at: 1000,
        }
    }

    fn selector(store: &StateStore) -> HostSelector {
        let kv = Arc::new(store.clone());
        HostSelector::new(
            Arc::new(store.clone()),
            LoadConfigStore::new(kv.clone()),
            RateLimiter::new(Arc::new(store.clone()), RateLimitConfig::default()),
            AffinityTracker::new(kv, Arc::new(store.clone()), Duration::from_secs(60)),
            Arc::new(StaticGray(false)),
            SelectorConfig::default(),
        )
    }

    fn none() -> BTreeSet<String> {
        BTreeSet::new()
    }

    #[tokio::test]
    async fn strictest_tier_wins() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_host(&host("10.0.0.1", 50)).unwrap();
        store.put_host(&host("10.0.0.2", 85)).unwrap();
        let selector = selector(&store);

        for _ in 0..20 {
            let choice = selector.select_host("proj", "p1", "1", &none(), &none()).await.unwrap();
            assert_eq!(choice.ip, "10.0.0.1");
            assert_eq!(choice.port, 8080);
        }
    }

    #[tokio::test]
    async fn looser_tier_used_when_stricter_is_empty() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_host(&host("10.0.0.2", 85)).unwrap();
        let selector = selector(&store);

        let choice = selector.select_host("proj", "p1", "1", &none(), &none()).await.unwrap();
        assert_eq!(choice.ip, "10.0.0.2");
    }

    #[tokio::test]
    async fn exhausted_picks_do_not_fall_through() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_host(&host("10.0.0.1", 50)).unwrap();
        store.put_host(&host("10.0.0.2", 85)).unwrap();
        let selector = selector(&store);

        let excluded: BTreeSet<String> = ["10.0.0.1".to_string()].into();
        let err = selector
            .select_host("proj", "p1", "1", &none(), &excluded)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::NoAvailableHost { scope: HostScope::Fleet }));
    }

    #[tokio::test]
    async fn rate_limited_hosts_are_skipped() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_host(&host("10.0.0.1", 50)).unwrap();
        store.put_host(&host("10.0.0.2", 50)).unwrap();
        for _ in 0..1001 {
            store.incr("dispatch_docker_ip_count_10.0.0.1").await.unwrap();
        }
        let selector = selector(&store);

        for _ in 0..10 {
            let choice = selector.select_host("proj", "p1", "1", &none(), &none()).await.unwrap();
            assert_eq!(choice.ip, "10.0.0.2");
        }
    }

    #[tokio::test]
    async fn sticky_host_reused_below_second_tier() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_host(&host("10.0.0.1", 10)).unwrap();
        store.put_host(&host("10.0.0.2", 85)).unwrap();
        let selector = selector(&store);

        selector.affinity.remember_last_host("p1", "1", "10.0.0.2").await.unwrap();
        let choice = selector.select_host("proj", "p1", "1", &none(), &none()).await.unwrap();
        assert_eq!(choice.ip, "10.0.0.2");

        // The record was consumed; the next call selects fresh.
        let choice = selector.select_host("proj", "p1", "1", &none(), &none()).await.unwrap();
        assert_eq!(choice.ip, "10.0.0.1");
    }

    #[tokio::test]
    async fn overloaded_sticky_host_is_dropped() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_host(&host("10.0.0.1", 10)).unwrap();
        store.put_host(&host("10.0.0.2", 95)).unwrap();
        let selector = selector(&store);

        selector.affinity.remember_last_host("p1", "1", "10.0.0.2").await.unwrap();
        let choice = selector.select_host("proj", "p1", "1", &none(), &none()).await.unwrap();
        assert_eq!(choice.ip, "10.0.0.1");
        assert_eq!(selector.affinity.take_last_host("p1", "1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn dedicated_only_sticky_host_is_dropped_for_general_builds() {
        let store = StateStore::open_in_memory().unwrap();
        let mut reserved = host("10.0.0.9", 10);
        reserved.dedicated_only = true;
        store.put_host(&reserved).unwrap();
        store.put_host(&host("10.0.0.1", 10)).unwrap();
        let selector = selector(&store);

        selector.affinity.remember_last_host("p1", "1", "10.0.0.9").await.unwrap();
        let choice = selector.select_host("proj", "p1", "1", &none(), &none()).await.unwrap();
        assert_eq!(choice.ip, "10.0.0.1");
    }

    #[tokio::test]
    async fn dedicated_sticky_host_ignores_load() {
        let store = StateStore::open_in_memory().unwrap();
        let mut busy = host("10.0.0.9", 100);
        busy.dedicated_only = true;
        busy.disk_load = 99;
        store.put_host(&busy).unwrap();
        let selector = selector(&store);

        let dedicated: BTreeSet<String> = ["10.0.0.9".to_string()].into();
        selector.affinity.remember_last_host("p1", "1", "10.0.0.9").await.unwrap();
        let choice = selector.select_host("proj", "p1", "1", &dedicated, &none()).await.unwrap();
        assert_eq!(choice.ip, "10.0.0.9");
    }

    #[tokio::test]
    async fn dedicated_set_restricts_candidates() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_host(&host("10.0.0.1", 10)).unwrap();
        let mut reserved = host("10.0.0.5", 10);
        reserved.dedicated_only = true;
        store.put_host(&reserved).unwrap();
        store.set_dedicated_hosts("proj", &["10.0.0.5".to_string()]).unwrap();
        let selector = selector(&store);

        for _ in 0..10 {
            let choice = selector
                .select_host_for_project("proj", "p1", "1", &none())
                .await
                .unwrap();
            assert_eq!(choice.ip, "10.0.0.5");
            let general = selector
                .select_host_for_project("other", "p1", "1", &none())
                .await
                .unwrap();
            assert_eq!(general.ip, "10.0.0.1");
        }
    }

    #[tokio::test]
    async fn exhausted_dedicated_set_reports_scope() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_host(&host("10.0.0.1", 10)).unwrap();
        let selector = selector(&store);

        let dedicated: BTreeSet<String> = ["10.0.0.7".to_string()].into();
        let err = selector
            .select_host("proj", "p1", "1", &dedicated, &none())
            .await
            .unwrap_err();
        match err {
            DispatchError::NoAvailableHost { scope: HostScope::Dedicated(ips) } => {
                assert_eq!(ips, dedicated);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn other_gray_generation_is_never_selected() {
        let store = StateStore::open_in_memory().unwrap();
        let mut gray = host("10.0.0.3", 10);
        gray.gray_env = true;
        store.put_host(&gray).unwrap();
        let selector = selector(&store);

        selector.affinity.remember_last_host("p1", "1", "10.0.0.3").await.unwrap();
        let err = selector.select_host("proj", "p1", "1", &none(), &none()).await;
        assert!(matches!(err, Err(DispatchError::NoAvailableHost { .. })));
    }
}
