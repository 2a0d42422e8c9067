use std::{sync::Arc, time::Duration};

use super::FlowLimit;
use crate::{
    ports::rate_limit_store::{RateLimitStore, StoreResult},
    utils::clock::Clock,
};

const KEY_PREFIX: &str = "fixedWindowRateLimiter";
const LOCK_TTL: Duration = Duration::from_secs(1);

/// Counts requests per aligned window. The counter update runs under a
/// store lock so concurrent gateways see a consistent count.
pub struct FixedWindowLimiter {
    store: Arc<dyn RateLimitStore>,
    clock: Arc<dyn Clock>,
    lock_attempts: u32,
    lock_retry_delay: Duration,
}

impl FixedWindowLimiter {
    pub fn new(
        store: Arc<dyn RateLimitStore>,
        clock: Arc<dyn Clock>,
        lock_attempts: u32,
        lock_retry_delay: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            lock_attempts: lock_attempts.max(1),
            lock_retry_delay,
        }
    }

    pub async fn is_allowed(&self, key: &str, limit: &FlowLimit) -> StoreResult<bool> {
        let lock_key = format!("{KEY_PREFIX}:LOCK:{key}");
        let owner = uuid::Uuid::new_v4().to_string();

        if !self.acquire(&lock_key, &owner).await? {
            tracing::debug!(key, "fixed window lock busy, denying request");
            return Ok(false);
        }

        let counted = self.count(key, limit).await;
        let released = self.store.unlock(&lock_key, &owner).await;
        let allowed = counted?;
        released?;
        Ok(allowed)
    }

    async fn acquire(&self, lock_key: &str, owner: &str) -> StoreResult<bool> {
        for attempt in 0..self.lock_attempts {
            if self.store.try_lock(lock_key, owner, LOCK_TTL).await? {
                return Ok(true);
            }
            if attempt + 1 < self.lock_attempts {
                tokio::time::sleep(self.lock_retry_delay).await;
            }
        }
        Ok(false)
    }

    async fn count(&self, key: &str, limit: &FlowLimit) -> StoreResult<bool> {
        let window_millis = limit.window_millis();
        let window = self.clock.now_millis().div_euclid(window_millis);
        let counter_key = format!("{KEY_PREFIX}:{key}:{window}");

        let count = self.store.incr(&counter_key).await?;
        if count == 1 {
            self.store.expire(&counter_key, limit.window()).await?;
        }
        Ok(count <= limit.permits)
    }
}
