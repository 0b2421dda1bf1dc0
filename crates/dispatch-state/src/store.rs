//! StateStore: redb-backed state persistence for build-host dispatch.
//!
//! Provides typed CRUD operations over hosts, dedicated-host assignments,
//! concurrency slots, task records, the drift log, and build containers.
//! All values are JSON-serialized into redb's `&[u8]` value columns. The
//! store supports both on-disk and in-memory backends (the latter for testing).
//!
//! Key-value entries, counters, and lease locks live in [`crate::kv`].

use std::borrow::Borrow;
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::ops::RangeBounds;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use redb::{Database, Key, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult, map_err};
use crate::ports::{HostRegistry, TaskBookkeeping};
use crate::tables::*;
use crate::types::*;

type JsonTable<K> = TableDefinition<'static, K, &'static [u8]>;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    pub(crate) db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        for table in [HOSTS, DEDICATED_HOSTS, KV, LOCKS] {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.open_table(COUNTERS).map_err(map_err!(Table))?;
        txn.open_table(SLOT_POOL).map_err(map_err!(Table))?;
        txn.open_table(TASK_SIMPLE).map_err(map_err!(Table))?;
        txn.open_table(DRIFT_LOG).map_err(map_err!(Table))?;
        txn.open_table(BUILD_CONTAINERS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── JSON helpers ───────────────────────────────────────────────

    fn put_json<'k, K: Key + 'static, T: Serialize>(
        &self,
        table: JsonTable<K>,
        key: impl Borrow<K::SelfType<'k>>,
        value: &T,
    ) -> StateResult<()> {
        let value = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            table
                .insert(key, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_json<'k, K: Key + 'static, T: DeserializeOwned>(
        &self,
        table: JsonTable<K>,
        key: impl Borrow<K::SelfType<'k>>,
    ) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Every value in the table, in key order.
    fn scan_json<T: DeserializeOwned>(
        &self,
        table: JsonTable<&'static str>,
    ) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
        }
        Ok(results)
    }

    /// All values whose key falls in `range`, in key order.
    fn range_json<'k, K, KR, T>(
        &self,
        table: JsonTable<K>,
        range: impl RangeBounds<KR> + 'k,
    ) -> StateResult<Vec<T>>
    where
        K: Key + 'static,
        KR: Borrow<K::SelfType<'k>> + 'k,
        T: DeserializeOwned,
    {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.range(range).map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
        }
        Ok(results)
    }

    fn remove(&self, table: JsonTable<&'static str>, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Hosts ──────────────────────────────────────────────────────

    /// Insert or update a host record and return it as stored. The IP is
    /// trimmed and must parse as an IPv4 or IPv6 address.
    pub fn put_host(&self, host: &HostRecord) -> StateResult<HostRecord> {
        let ip = host.ip.trim();
        if ip.parse::<IpAddr>().is_err() {
            return Err(StateError::InvalidHost(format!("invalid IP format: {}", host.ip)));
        }
        let mut host = host.clone();
        host.ip = ip.to_string();
        if host.created_at == 0 {
            host.created_at = epoch_secs();
        }
        self.put_json(HOSTS, host.ip.as_str(), &host)?;
        debug!(ip = %host.ip, "host stored");
        Ok(host)
    }

    /// Get a host by IP.
    pub fn get_host(&self, ip: &str) -> StateResult<Option<HostRecord>> {
        self.get_json(HOSTS, ip)
    }

    /// List all hosts ordered by IP.
    pub fn list_hosts(&self) -> StateResult<Vec<HostRecord>> {
        self.scan_json(HOSTS)
    }

    /// Delete a host by IP. Returns true if it existed.
    pub fn delete_host(&self, ip: &str) -> StateResult<bool> {
        let existed = self.remove(HOSTS, ip)?;
        debug!(%ip, existed, "host deleted");
        Ok(existed)
    }

    // ── Dedicated hosts ────────────────────────────────────────────

    /// Replace the dedicated host list for a project. An empty list clears it.
    pub fn set_dedicated_hosts(&self, project_id: &str, ips: &[HostIp]) -> StateResult<()> {
        if ips.is_empty() {
            self.remove(DEDICATED_HOSTS, project_id)?;
            return Ok(());
        }
        let ips: BTreeSet<&str> = ips.iter().map(|ip| ip.trim()).collect();
        self.put_json(DEDICATED_HOSTS, project_id, &ips)?;
        debug!(%project_id, count = ips.len(), "dedicated hosts stored");
        Ok(())
    }

    /// Dedicated host IPs for a project (empty when none are configured).
    pub fn get_dedicated_hosts(&self, project_id: &str) -> StateResult<Vec<HostIp>> {
        Ok(self.get_json(DEDICATED_HOSTS, project_id)?.unwrap_or_default())
    }

    // ── Slot pool ──────────────────────────────────────────────────

    /// Get a slot entry.
    pub fn get_slot(
        &self,
        pipeline_id: &str,
        stage_id: &str,
        slot: u32,
    ) -> StateResult<Option<SlotPoolEntry>> {
        self.get_json(SLOT_POOL, (pipeline_id, stage_id, slot))
    }

    /// Insert or update a slot entry.
    pub fn put_slot(&self, entry: &SlotPoolEntry) -> StateResult<()> {
        let key = (entry.pipeline_id.as_str(), entry.stage_id.as_str(), entry.slot);
        self.put_json(SLOT_POOL, key, entry)
    }

    /// List all slot entries for a (pipeline, stage) pair.
    pub fn list_slots(&self, pipeline_id: &str, stage_id: &str) -> StateResult<Vec<SlotPoolEntry>> {
        self.range_json(SLOT_POOL, (pipeline_id, stage_id, 0)..=(pipeline_id, stage_id, u32::MAX))
    }

    // ── Task records ───────────────────────────────────────────────

    /// Get the task record for a (pipeline, stage) pair.
    pub fn get_task_simple(
        &self,
        pipeline_id: &str,
        stage_id: &str,
    ) -> StateResult<Option<TaskSimpleRecord>> {
        self.get_json(TASK_SIMPLE, (pipeline_id, stage_id))
    }

    /// Insert or update a task record.
    pub fn put_task_simple(&self, record: &TaskSimpleRecord) -> StateResult<()> {
        let key = (record.pipeline_id.as_str(), record.stage_id.as_str());
        self.put_json(TASK_SIMPLE, key, record)
    }

    // ── Drift log ──────────────────────────────────────────────────

    /// Append a drift entry. Entries for one (pipeline, stage) pair keep insertion order.
    pub fn put_drift(&self, entry: &DriftLogEntry) -> StateResult<()> {
        let value = serde_json::to_vec(entry).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut counters = txn.open_table(COUNTERS).map_err(map_err!(Table))?;
            let seq = counters
                .get(DRIFT_SEQ_KEY)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value())
                .unwrap_or(0)
                + 1;
            counters.insert(DRIFT_SEQ_KEY, seq).map_err(map_err!(Write))?;

            let key = (entry.pipeline_id.as_str(), entry.stage_id.as_str(), seq as u64);
            let mut table = txn.open_table(DRIFT_LOG).map_err(map_err!(Table))?;
            table.insert(key, value.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Drift entries for a (pipeline, stage) pair, oldest first.
    pub fn list_drift(&self, pipeline_id: &str, stage_id: &str) -> StateResult<Vec<DriftLogEntry>> {
        self.range_json(DRIFT_LOG, (pipeline_id, stage_id, 0)..=(pipeline_id, stage_id, u64::MAX))
    }

    // ── Build containers ───────────────────────────────────────────

    /// Associate a container id with a build stage.
    pub fn put_container_id(
        &self,
        build_id: &str,
        stage_id: &str,
        container_id: &str,
    ) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(BUILD_CONTAINERS).map_err(map_err!(Table))?;
            table
                .insert((build_id, stage_id), container_id)
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Container id recorded for a build stage.
    pub fn get_container_id(&self, build_id: &str, stage_id: &str) -> StateResult<Option<String>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(BUILD_CONTAINERS).map_err(map_err!(Table))?;
        Ok(table
            .get((build_id, stage_id))
            .map_err(map_err!(Read))?
            .map(|guard| guard.value().to_string()))
    }
}

#[async_trait]
impl HostRegistry for StateStore {
    async fn query_by_load_filter(
        &self,
        gray_env: bool,
        tier: &LoadThresholdTier,
        dedicated: &DedicatedFilter,
    ) -> StateResult<Vec<HostRecord>> {
        let hosts = self
            .list_hosts()?
            .into_iter()
            .filter(|h| {
                h.enabled && h.gray_env == gray_env && tier.admits(h) && dedicated.matches(h)
            })
            .collect();
        Ok(hosts)
    }

    async fn get_by_ip(&self, ip: &str) -> StateResult<Option<HostRecord>> {
        self.get_host(ip)
    }

    async fn dedicated_ips(&self, project_id: &str) -> StateResult<Vec<HostIp>> {
        self.get_dedicated_hosts(project_id)
    }
}

#[async_trait]
impl TaskBookkeeping for StateStore {
    async fn slot_status(
        &self,
        pipeline_id: &str,
        stage_id: &str,
        slot: u32,
    ) -> StateResult<Option<SlotStatus>> {
        Ok(self.get_slot(pipeline_id, stage_id, slot)?.map(|e| e.status))
    }

    async fn put_slot_status(
        &self,
        pipeline_id: &str,
        stage_id: &str,
        slot: u32,
        status: SlotStatus,
    ) -> StateResult<()> {
        self.put_slot(&SlotPoolEntry {
            pipeline_id: pipeline_id.to_string(),
            stage_id: stage_id.to_string(),
            slot,
            status,
            updated_at: epoch_secs(),
        })
    }

    async fn task_simple(
        &self,
        pipeline_id: &str,
        stage_id: &str,
    ) -> StateResult<Option<TaskSimpleRecord>> {
        self.get_task_simple(pipeline_id, stage_id)
    }

    async fn put_task_ip(&self, pipeline_id: &str, stage_id: &str, ip: &str) -> StateResult<()> {
        self.put_task_simple(&TaskSimpleRecord {
            pipeline_id: pipeline_id.to_string(),
            stage_id: stage_id.to_string(),
            docker_ip: ip.to_string(),
            updated_at: epoch_secs(),
        })
    }

    async fn append_drift(&self, entry: &DriftLogEntry) -> StateResult<()> {
        self.put_drift(entry)
    }

    async fn drift_log(
        &self,
        pipeline_id: &str,
        stage_id: &str,
    ) -> StateResult<Vec<DriftLogEntry>> {
        self.list_drift(pipeline_id, stage_id)
    }

    async fn set_container_id(
        &self,
        build_id: &str,
        stage_id: &str,
        container_id: &str,
    ) -> StateResult<()> {
        self.put_container_id(build_id, stage_id, container_id)
    }

    async fn container_id(&self, build_id: &str, stage_id: &str) -> StateResult<Option<String>> {
        self.get_container_id(build_id, stage_id)
    }
}

/// Current Unix epoch in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Current Unix epoch in milliseconds.
pub(crate) fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
