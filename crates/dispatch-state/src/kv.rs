//! Shared key-value entries, counters, and lease locks.
//!
//! These back the stores that a clustered deployment would keep in a
//! shared cache: load configuration, sticky-host records, per-host
//! in-flight counters, and the slot-pool lock. Expiry is evaluated lazily
//! against wall-clock milliseconds; an expired entry reads as absent.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redb::{ReadableDatabase, ReadableTable};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{StateError, StateResult, map_err};
use crate::ports::{CounterStore, KvStore, LeaseGuard, LeaseRelease, LockService};
use crate::store::{StateStore, epoch_millis};
use crate::tables::{COUNTERS, KV, LOCKS};

/// How often a waiting lock acquirer re-checks the lease.
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Serialize, Deserialize)]
struct KvEntry {
    value: String,
    expires_at: Option<u64>,
}

impl KvEntry {
    fn is_live(&self, now: u64) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LockEntry {
    token: String,
    expires_at: u64,
}

impl StateStore {
    // ── Key-value ──────────────────────────────────────────────────

    fn kv_put(&self, key: &str, value: &str, ttl: Option<Duration>) -> StateResult<()> {
        let entry = KvEntry {
            value: value.to_string(),
            expires_at: ttl.map(|ttl| epoch_millis() + ttl.as_millis() as u64),
        };
        let bytes = serde_json::to_vec(&entry).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(KV).map_err(map_err!(Table))?;
            table.insert(key, bytes.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn kv_get(&self, key: &str) -> StateResult<Option<String>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(KV).map_err(map_err!(Table))?;
        let Some(guard) = table.get(key).map_err(map_err!(Read))? else {
            return Ok(None);
        };
        let entry: KvEntry = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
        Ok(entry.is_live(epoch_millis()).then_some(entry.value))
    }

    fn kv_take(&self, key: &str) -> StateResult<Option<String>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let removed = {
            let mut table = txn.open_table(KV).map_err(map_err!(Table))?;
            let removed = table.remove(key).map_err(map_err!(Write))?;
            match removed {
                Some(guard) => Some(
                    serde_json::from_slice::<KvEntry>(guard.value())
                        .map_err(map_err!(Deserialize))?,
                ),
                None => None,
            }
        };
        txn.commit().map_err(map_err!(Transaction))?;
        let now = epoch_millis();
        Ok(removed.filter(|e| e.is_live(now)).map(|e| e.value))
    }

    fn kv_delete(&self, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(KV).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Counters ───────────────────────────────────────────────────

    fn counter_get(&self, key: &str) -> StateResult<Option<i64>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(COUNTERS).map_err(map_err!(Table))?;
        Ok(table.get(key).map_err(map_err!(Read))?.map(|guard| guard.value()))
    }

    fn counter_add(&self, key: &str, delta: i64) -> StateResult<i64> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let next;
        {
            let mut table = txn.open_table(COUNTERS).map_err(map_err!(Table))?;
            let current = table
                .get(key)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value())
                .unwrap_or(0);
            next = current + delta;
            table.insert(key, next).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(next)
    }

    // ── Leases ─────────────────────────────────────────────────────

    /// Take the lease if it is free or expired. Write transactions are
    /// serialized by redb, so check-and-set is atomic.
    fn try_lock(&self, key: &str, token: &str, lease: Duration) -> StateResult<bool> {
        let now = epoch_millis();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(LOCKS).map_err(map_err!(Table))?;
            let held = match table.get(key).map_err(map_err!(Read))? {
                Some(guard) => {
                    let entry: LockEntry =
                        serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                    entry.expires_at > now
                }
                None => false,
            };
            if held {
                return Ok(false);
            }
            let entry = LockEntry {
                token: token.to_string(),
                expires_at: now + lease.as_millis() as u64,
            };
            let bytes = serde_json::to_vec(&entry).map_err(map_err!(Serialize))?;
            table.insert(key, bytes.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(true)
    }

    /// Remove the lease only if `token` still holds it.
    fn unlock(&self, key: &str, token: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let released;
        {
            let mut table = txn.open_table(LOCKS).map_err(map_err!(Table))?;
            let owned = match table.get(key).map_err(map_err!(Read))? {
                Some(guard) => {
                    let entry: LockEntry =
                        serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                    entry.token == token
                }
                None => false,
            };
            if owned {
                table.remove(key).map_err(map_err!(Write))?;
            }
            released = owned;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(released)
    }
}

#[async_trait]
impl KvStore for StateStore {
    async fn get(&self, key: &str) -> StateResult<Option<String>> {
        self.kv_get(key)
    }

    async fn set(&self, key: &str, value: &str) -> StateResult<()> {
        self.kv_put(key, value, None)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> StateResult<()> {
        self.kv_put(key, value, Some(ttl))
    }

    async fn take(&self, key: &str) -> StateResult<Option<String>> {
        self.kv_take(key)
    }

    async fn delete(&self, key: &str) -> StateResult<bool> {
        self.kv_delete(key)
    }
}

#[async_trait]
impl CounterStore for StateStore {
    async fn get_counter(&self, key: &str) -> StateResult<Option<i64>> {
        self.counter_get(key)
    }

    async fn incr(&self, key: &str) -> StateResult<i64> {
        self.counter_add(key, 1)
    }

    async fn decr(&self, key: &str) -> StateResult<i64> {
        self.counter_add(key, -1)
    }
}

#[async_trait]
impl LockService for StateStore {
    async fn acquire(&self, key: &str, lease: Duration, wait: Duration) -> StateResult<LeaseGuard> {
        let token = format!("{:016x}", rand::random::<u64>());
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if self.try_lock(key, &token, lease)? {
                debug!(%key, lease_ms = lease.as_millis() as u64, "lease acquired");
                return Ok(LeaseGuard::new(key, token, Arc::new(self.clone())));
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(StateError::LockTimeout(key.to_string()));
            }
            tokio::time::sleep(LOCK_POLL_INTERVAL).await;
        }
    }
}

impl LeaseRelease for StateStore {
    fn release_lease(&self, key: &str, token: &str) {
        match self.unlock(key, token) {
            Ok(true) => {}
            // The lease expired and someone else took it; nothing of ours to remove.
            Ok(false) => warn!(%key, "lease already expired before release"),
            Err(e) => warn!(%key, error = %e, "failed to release lease"),
        }
    }
}
