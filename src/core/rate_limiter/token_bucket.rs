use std::sync::Arc;

use super::FlowLimit;
use crate::{
    ports::rate_limit_store::{RateLimitStore, StoreResult, TokenBucketRequest},
    utils::clock::Clock,
};

const KEY_PREFIX: &str = "request_rate_limiter";

/// Token bucket evaluated atomically by the store. Capacity equals the permit
/// count and tokens refill at `permits / duration` per second.
pub struct TokenBucketLimiter {
    store: Arc<dyn RateLimitStore>,
    clock: Arc<dyn Clock>,
}

impl TokenBucketLimiter {
    pub fn new(store: Arc<dyn RateLimitStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn is_allowed(&self, key: &str, limit: &FlowLimit) -> StoreResult<bool> {
        let request = TokenBucketRequest {
            tokens_key: format!("{KEY_PREFIX}.{{{key}}}.tokens"),
            timestamp_key: format!("{KEY_PREFIX}.{{{key}}}.timestamp"),
            rate: limit.rate(),
            capacity: limit.permits as f64,
            now: self.clock.now_millis() as f64 / 1000.0,
            requested: 1.0,
        };
        self.store.eval_token_bucket(&request).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{adapters::memory_store::InMemoryRateLimitStore, utils::clock::ManualClock};

    #[tokio::test]
    async fn bucket_drains_then_refills_at_rate() {
        let clock = ManualClock::new(3_000_000);
        let store = Arc::new(InMemoryRateLimitStore::with_clock(Arc::new(clock.clone())));
        let limiter = TokenBucketLimiter::new(store, Arc::new(clock.clone()));
        let limit = FlowLimit {
            duration: 2,
            permits: 4,
            warm_up: None,
        };

        for _ in 0..4 {
            assert!(limiter.is_allowed("svc", &limit).await.unwrap());
        }
        assert!(!limiter.is_allowed("svc", &limit).await.unwrap());

        // Two tokens per second.
        clock.advance(Duration::from_millis(500));
        assert!(limiter.is_allowed("svc", &limit).await.unwrap());
        assert!(!limiter.is_allowed("svc", &limit).await.unwrap());
    }
}
