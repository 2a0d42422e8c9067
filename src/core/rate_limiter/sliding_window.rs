use std::sync::Arc;

use super::FlowLimit;
use crate::{
    ports::rate_limit_store::{RateLimitStore, StoreResult},
    utils::clock::Clock,
};

const KEY_PREFIX: &str = "slidingWindowRateLimiter";

/// Keeps one timestamp per request in a scored set and counts what is left
/// after dropping everything older than the window. Denied requests stay in
/// the set, so sustained overload keeps being denied.
pub struct SlidingWindowLimiter {
    store: Arc<dyn RateLimitStore>,
    clock: Arc<dyn Clock>,
}

impl SlidingWindowLimiter {
    pub fn new(store: Arc<dyn RateLimitStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn is_allowed(&self, key: &str, limit: &FlowLimit) -> StoreResult<bool> {
        let set_key = format!("{KEY_PREFIX}:{key}");
        let now = self.clock.now_millis();
        let member = format!("{now}-{}", uuid::Uuid::new_v4());

        self.store.zadd(&set_key, now, &member).await?;
        self.store
            .zrem_range_by_score(&set_key, i64::MIN, now - limit.window_millis())
            .await?;
        let count = self.store.zcard(&set_key).await?;
        self.store.expire(&set_key, limit.window()).await?;

        Ok(count <= limit.permits)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{adapters::memory_store::InMemoryRateLimitStore, utils::clock::ManualClock};

    #[tokio::test]
    async fn requests_age_out_of_the_window() {
        let clock = ManualClock::new(2_000_000);
        let store = Arc::new(InMemoryRateLimitStore::with_clock(Arc::new(clock.clone())));
        let limiter = SlidingWindowLimiter::new(store, Arc::new(clock.clone()));
        let limit = FlowLimit {
            duration: 1,
            permits: 2,
            warm_up: None,
        };

        assert!(limiter.is_allowed("k", &limit).await.unwrap());
        assert!(limiter.is_allowed("k", &limit).await.unwrap());

        clock.advance(Duration::from_millis(100));
        assert!(!limiter.is_allowed("k", &limit).await.unwrap());

        clock.advance(Duration::from_millis(1100));
        assert!(limiter.is_allowed("k", &limit).await.unwrap());
    }
}
