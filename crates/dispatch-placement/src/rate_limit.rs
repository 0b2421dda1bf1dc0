//! Per-host in-flight request ceiling.

use std::sync::Arc;

use dispatch_state::CounterStore;
use tracing::{debug, warn};

use crate::config::RateLimitConfig;
use crate::error::DispatchResult;

/// Checks and maintains the in-flight counter of each host.
#[derive(Clone)]
pub struct RateLimiter {
    counters: Arc<dyn CounterStore>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(counters: Arc<dyn CounterStore>, config: RateLimitConfig) -> Self {
        Self { counters, config }
    }

    fn key(&self, ip: &str) -> String {
        format!("{}{ip}", self.config.key_prefix)
    }

    /// Whether `ip` has more requests in flight than the ceiling.
    /// A host without a counter is never limited.
    pub async fn is_over_limit(&self, ip: &str) -> DispatchResult<bool> {
        let count = self.counters.get_counter(&self.key(ip)).await?;
        debug!(%ip, ?count, "host in-flight count");
        Ok(count.is_some_and(|c| c > self.config.max_in_flight))
    }

    /// Current in-flight count of `ip`, zero without a counter.
    pub async fn in_flight(&self, ip: &str) -> DispatchResult<i64> {
        Ok(self.counters.get_counter(&self.key(ip)).await?.unwrap_or(0))
    }

    /// Record one more request in flight on `ip`.
    pub async fn acquire(&self, ip: &str) -> DispatchResult<i64> {
        Ok(self.counters.incr(&self.key(ip)).await?)
    }

    /// Record one request finished on `ip`.
    pub async fn release(&self, ip: &str) -> DispatchResult<i64> {
        let count = self.counters.decr(&self.key(ip)).await?;
        if count < 0 {
            warn!(%ip, count, "in-flight counter went negative");
        }
        Ok(count)
    }
}
