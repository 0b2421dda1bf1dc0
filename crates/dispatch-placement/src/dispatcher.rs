//! Dispatcher: the build-start and build-finish flow.
//!
//! Composes the placement components around one build-start event:
//!
//! ```text
//! start_build(event)
//!   ├── SlotPool::acquire_slot          (per-pipeline concurrency)
//!   ├── previous host for the task?
//!   │     ├── yes → HostSelector::check_and_set_ip
//!   │     └── no  → HostSelector::select_host_for_project
//!   ├── AffinityTracker::resolve_and_record_drift
//!   ├── AffinityTracker::remember_last_host
//!   └── RateLimiter::acquire            (in-flight count)
//! ```

use std::collections::BTreeSet;
use std::sync::Arc;

use dispatch_state::{
    BuildStartEvent, CounterStore, GrayOracle, HostRegistry, KvStore, LockService, StateStore,
    TaskBookkeeping,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::affinity::AffinityTracker;
use crate::config::DispatchConfig;
use crate::error::DispatchResult;
use crate::load_config::LoadConfigStore;
use crate::proxy::ProxyUrlBuilder;
use crate::rate_limit::RateLimiter;
use crate::revalidate::Placement;
use crate::selector::HostSelector;
use crate::slot_pool::SlotPool;

/// Collaborators the dispatcher is built from.
#[derive(Clone)]
pub struct Ports {
    pub registry: Arc<dyn HostRegistry>,
    pub kv: Arc<dyn KvStore>,
    pub counters: Arc<dyn CounterStore>,
    pub locks: Arc<dyn LockService>,
    pub bookkeeping: Arc<dyn TaskBookkeeping>,
    pub gray: Arc<dyn GrayOracle>,
}

impl Ports {
    /// Every port backed by one state store.
    pub fn from_store(store: &StateStore, gray: impl GrayOracle + 'static) -> Self {
        let store = Arc::new(store.clone());
        Self {
            registry: store.clone(),
            kv: store.clone(),
            counters: store.clone(),
            locks: store.clone(),
            bookkeeping: store,
            gray: Arc::new(gray),
        }
    }
}

/// A started build: where it runs and which slot it holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartedBuild {
    pub slot: u32,
    #[serde(flatten)]
    pub placement: Placement,
}

#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<dyn HostRegistry>,
    bookkeeping: Arc<dyn TaskBookkeeping>,
    load_config: LoadConfigStore,
    rate_limiter: RateLimiter,
    affinity: AffinityTracker,
    slots: SlotPool,
    selector: HostSelector,
    proxy: ProxyUrlBuilder,
}

impl Dispatcher {
    pub fn new(ports: Ports, config: DispatchConfig) -> Self {
        let load_config = LoadConfigStore::new(ports.kv.clone());
        let rate_limiter = RateLimiter::new(ports.counters.clone(), config.rate_limit);
        let affinity = AffinityTracker::new(
            ports.kv.clone(),
            ports.bookkeeping.clone(),
            config.affinity.ttl(),
        );
        let slots = SlotPool::new(ports.bookkeeping.clone(), ports.locks.clone(), config.pool);
        let selector = HostSelector::new(
            ports.registry.clone(),
            load_config.clone(),
            rate_limiter.clone(),
            affinity.clone(),
            ports.gray.clone(),
            config.selection,
        );
        let proxy = ProxyUrlBuilder::new(ports.registry.clone(), config.idc_proxy);

        Self {
            registry: ports.registry,
            bookkeeping: ports.bookkeeping,
            load_config,
            rate_limiter,
            affinity,
            slots,
            selector,
            proxy,
        }
    }

    pub fn load_config(&self) -> &LoadConfigStore {
        &self.load_config
    }

    pub fn selector(&self) -> &HostSelector {
        &self.selector
    }

    pub fn slots(&self) -> &SlotPool {
        &self.slots
    }

    pub fn affinity(&self) -> &AffinityTracker {
        &self.affinity
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn proxy(&self) -> &ProxyUrlBuilder {
        &self.proxy
    }

    /// Place and record a build that is about to start.
    ///
    /// The slot is handed back if placement fails after it was claimed.
    pub async fn start_build(&self, event: &BuildStartEvent) -> DispatchResult<StartedBuild> {
        let slot = self.slots.acquire_slot(&event.pipeline_id, &event.stage_id).await?;

        match self.place(event).await {
            Ok(placement) => {
                info!(%event, slot, ip = %placement.ip, port = placement.port, "build placed");
                Ok(StartedBuild { slot, placement })
            }
            Err(e) => {
                error!(%event, slot, error = %e, "build placement failed");
                if let Err(release_err) = self
                    .slots
                    .release_slot(&event.pipeline_id, &event.stage_id, slot)
                    .await
                {
                    error!(%event, slot, error = %release_err, "failed to hand back slot");
                }
                Err(e)
            }
        }
    }

    async fn place(&self, event: &BuildStartEvent) -> DispatchResult<Placement> {
        let previous = self
            .bookkeeping
            .task_simple(&event.pipeline_id, &event.stage_id)
            .await?;
        let assigned = match previous {
            Some(record) => self.registry.get_by_ip(&record.docker_ip).await?,
            None => None,
        };

        let placement = match assigned {
            Some(host) => {
                let dedicated: BTreeSet<String> = self
                    .registry
                    .dedicated_ips(&event.project_id)
                    .await?
                    .into_iter()
                    .collect();
                self.selector.check_and_set_ip(event, &dedicated, &host).await?
            }
            None => {
                let choice = self
                    .selector
                    .select_host_for_project(
                        &event.project_id,
                        &event.pipeline_id,
                        &event.stage_id,
                        &BTreeSet::new(),
                    )
                    .await?;
                Placement::new(choice, None)
            }
        };

        self.affinity
            .resolve_and_record_drift(
                &event.pipeline_id,
                &event.stage_id,
                &event.build_id,
                &event.container_id,
                &placement.ip,
                &placement.reason_text(),
            )
            .await?;
        self.affinity
            .remember_last_host(&event.pipeline_id, &event.stage_id, &placement.ip)
            .await?;
        self.rate_limiter.acquire(&placement.ip).await?;
        Ok(placement)
    }

    /// Hand back the slot and in-flight count of a finished build.
    ///
    /// Both are released even if one fails; the first failure is returned.
    pub async fn finish_build(
        &self,
        event: &BuildStartEvent,
        slot: u32,
        ip: &str,
    ) -> DispatchResult<()> {
        let slot_result = self
            .slots
            .release_slot(&event.pipeline_id, &event.stage_id, slot)
            .await;
        if let Err(e) = &slot_result {
            error!(%event, slot, error = %e, "failed to release slot");
        }
        let count_result = self.rate_limiter.release(ip).await;
        if let Err(e) = &count_result {
            error!(%event, %ip, error = %e, "failed to release in-flight count");
        }
        slot_result?;
        count_result?;
        info!(%event, slot, %ip, "build finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::error::DispatchError;
    use crate::slot_pool::lock_key;
    use async_trait::async_trait;
    use dispatch_state::{
        DriftLogEntry, HostRecord, SlotStatus, StateError, StateResult, StaticGray,
        TaskSimpleRecord,
    };
    use std::time::Duration;

    /// Bookkeeping whose task-record writes always fail.
    struct TaskWritesFail(StateStore);

    #[async_trait]
    impl TaskBookkeeping for TaskWritesFail {
        async fn slot_status(
            &self,
            pipeline_id: &str,
            stage_id: &str,
            slot: u32,
        ) -> StateResult<Option<SlotStatus>> {
            self.0.slot_status(pipeline_id, stage_id, slot).await
        }

        async fn put_slot_status(
            &self,
            pipeline_id: &str,
            stage_id: &str,
            slot: u32,
            status: SlotStatus,
        ) -> StateResult<()> {
            self.0.put_slot_status(pipeline_id, stage_id, slot, status).await
        }

        async fn task_simple(
            &self,
            pipeline_id: &str,
            stage_id: &str,
        ) -> StateResult<Option<TaskSimpleRecord>> {
            self.0.task_simple(pipeline_id, stage_id).await
        }

        async fn put_task_ip(&self, _: &str, _: &str, _: &str) -> StateResult<()> {
            Err(StateError::Write("disk full".to_string()))
        }

        async fn append_drift(&self, entry: &DriftLogEntry) -> StateResult<()> {
            self.0.append_drift(entry).await
        }

        async fn drift_log(
            &self,
            pipeline_id: &str,
            stage_id: &str,
        ) -> StateResult<Vec<DriftLogEntry>> {
            self.0.drift_log(pipeline_id, stage_id).await
        }

        async fn set_container_id(
            &self,
            build_id: &str,
            stage_id: &str,
            container_id: &str,
        ) -> StateResult<()> {
            self.0.set_container_id(build_id, stage_id, container_id).await
        }

        async fn container_id(
            &self,
            build_id: &str,
            stage_id: &str,
        ) -> StateResult<Option<String>> {
            self.0.container_id(build_id, stage_id).await
        }
    }

    fn host(ip: &str, load: u32) -> HostRecord {
        HostRecord {
            ip: ip.to_string(),
            port: 8080,
            capacity: 100,
            used_count: 0,
            cpu_load: load,
            mem_load: load,
            disk_load: load,
            disk_io_load: load,
            enabled: true,
            gray_env: false,
            dedicated_only: false,
            created_at: 1000,
        }
    }

    fn event(build_id: &str) -> BuildStartEvent {
        BuildStartEvent {
            project_id: "proj".to_string(),
            pipeline_id: "p1".to_string(),
            build_id: build_id.to_string(),
            stage_id: "1".to_string(),
            container_id: format!("c-{build_id}"),
        }
    }

    fn dispatcher(store: &StateStore, config: DispatchConfig) -> Dispatcher {
        Dispatcher::new(Ports::from_store(store, StaticGray(false)), config)
    }

    #[tokio::test]
    async fn first_start_selects_and_records() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_host(&host("10.0.0.1", 10)).unwrap();
        let dispatcher = dispatcher(&store, DispatchConfig::default());

        let started = dispatcher.start_build(&event("b1")).await.unwrap();
        assert_eq!(started.slot, 1);
        assert_eq!(started.placement.ip, "10.0.0.1");

        let task = store.get_task_simple("p1", "1").unwrap().unwrap();
        assert_eq!(task.docker_ip, "10.0.0.1");
        assert_eq!(store.get_container_id("b1", "1").unwrap().as_deref(), Some("c-b1"));
        assert_eq!(dispatcher.rate_limiter().in_flight("10.0.0.1").await.unwrap(), 1);
        assert!(store.list_drift("p1", "1").unwrap().is_empty());
    }

    #[tokio::test]
    async fn restart_keeps_healthy_host() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_host(&host("10.0.0.1", 10)).unwrap();
        store.put_host(&host("10.0.0.2", 10)).unwrap();
        let dispatcher = dispatcher(&store, DispatchConfig::default());

        let first = dispatcher.start_build(&event("b1")).await.unwrap();
        dispatcher
            .finish_build(&event("b1"), first.slot, &first.placement.ip)
            .await
            .unwrap();

        let second = dispatcher.start_build(&event("b2")).await.unwrap();
        assert_eq!(second.placement.ip, first.placement.ip);
        assert_eq!(second.slot, first.slot);
        assert!(store.list_drift("p1", "1").unwrap().is_empty());
    }

    #[tokio::test]
    async fn unhealthy_previous_host_drifts_once() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_host(&host("10.0.0.1", 10)).unwrap();
        let dispatcher = dispatcher(&store, DispatchConfig::default());

        let first = dispatcher.start_build(&event("b1")).await.unwrap();
        dispatcher
            .finish_build(&event("b1"), first.slot, &first.placement.ip)
            .await
            .unwrap();

        store.put_host(&host("10.0.0.1", 95)).unwrap();
        store.put_host(&host("10.0.0.2", 10)).unwrap();
        let second = dispatcher.start_build(&event("b2")).await.unwrap();
        assert_eq!(second.placement.ip, "10.0.0.2");

        let drift = store.list_drift("p1", "1").unwrap();
        assert_eq!(drift.len(), 1);
        assert_eq!(drift[0].previous_ip, "10.0.0.1");
        assert_eq!(drift[0].new_ip, "10.0.0.2");
        assert_eq!(drift[0].build_id, "b2");
    }

    #[tokio::test]
    async fn failed_placement_hands_back_slot() {
        let store = StateStore::open_in_memory().unwrap();
        let dispatcher = dispatcher(&store, DispatchConfig::default());

        let err = dispatcher.start_build(&event("b1")).await.unwrap_err();
        assert!(matches!(err, DispatchError::NoAvailableHost { .. }));
        let slot = store.get_slot("p1", "1", 1).unwrap().unwrap();
        assert_eq!(slot.status, SlotStatus::Idle);
    }

    #[tokio::test]
    async fn finish_releases_slot_and_count() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_host(&host("10.0.0.1", 10)).unwrap();
        let dispatcher = dispatcher(&store, DispatchConfig::default());

        let started = dispatcher.start_build(&event("b1")).await.unwrap();
        dispatcher
            .finish_build(&event("b1"), started.slot, &started.placement.ip)
            .await
            .unwrap();

        assert_eq!(dispatcher.rate_limiter().in_flight("10.0.0.1").await.unwrap(), 0);
        let slot = store.get_slot("p1", "1", started.slot).unwrap().unwrap();
        assert_eq!(slot.status, SlotStatus::Idle);
    }

    #[tokio::test]
    async fn host_flipped_to_dedicated_only_is_left() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_host(&host("10.0.0.1", 10)).unwrap();
        let dispatcher = dispatcher(&store, DispatchConfig::default());

        let first = dispatcher.start_build(&event("b1")).await.unwrap();
        dispatcher
            .finish_build(&event("b1"), first.slot, &first.placement.ip)
            .await
            .unwrap();

        let mut reserved = host("10.0.0.1", 10);
        reserved.dedicated_only = true;
        store.put_host(&reserved).unwrap();
        store.put_host(&host("10.0.0.2", 10)).unwrap();

        let second = dispatcher.start_build(&event("b2")).await.unwrap();
        assert_eq!(second.placement.ip, "10.0.0.2");
    }

    #[tokio::test]
    async fn host_over_lowered_drift_threshold_is_left() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_host(&host("10.0.0.1", 10)).unwrap();
        let dispatcher = dispatcher(&store, DispatchConfig::default());

        let first = dispatcher.start_build(&event("b1")).await.unwrap();
        dispatcher
            .finish_build(&event("b1"), first.slot, &first.placement.ip)
            .await
            .unwrap();

        dispatcher.load_config().set_drift_threshold(50).await.unwrap();
        let mut busy = host("10.0.0.1", 10);
        busy.mem_load = 60;
        store.put_host(&busy).unwrap();
        store.put_host(&host("10.0.0.2", 10)).unwrap();

        let second = dispatcher.start_build(&event("b2")).await.unwrap();
        assert_eq!(second.placement.ip, "10.0.0.2");
    }

    #[tokio::test]
    async fn failed_bookkeeping_leaves_no_in_flight_count() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_host(&host("10.0.0.1", 10)).unwrap();
        let mut ports = Ports::from_store(&store, StaticGray(false));
        ports.bookkeeping = Arc::new(TaskWritesFail(store.clone()));
        let dispatcher = Dispatcher::new(ports, DispatchConfig::default());

        let err = dispatcher.start_build(&event("b1")).await.unwrap_err();
        assert!(matches!(err, DispatchError::State(StateError::Write(_))));
        assert_eq!(dispatcher.rate_limiter().in_flight("10.0.0.1").await.unwrap(), 0);
        assert_eq!(store.get_slot("p1", "1", 1).unwrap().unwrap().status, SlotStatus::Idle);
    }

    #[tokio::test]
    async fn contended_slot_release_still_releases_count() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_host(&host("10.0.0.1", 10)).unwrap();
        let config = DispatchConfig {
            pool: PoolConfig {
                lock_wait_ms: 50,
                ..PoolConfig::default()
            },
            ..DispatchConfig::default()
        };
        let dispatcher = dispatcher(&store, config);

        let started = dispatcher.start_build(&event("b1")).await.unwrap();
        let _held = store
            .acquire(&lock_key("p1", "1"), Duration::from_secs(30), Duration::ZERO)
            .await
            .unwrap();

        let err = dispatcher
            .finish_build(&event("b1"), started.slot, &started.placement.ip)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::LockContention { .. }));
        assert_eq!(dispatcher.rate_limiter().in_flight("10.0.0.1").await.unwrap(), 0);
    }
}
