//! Admission control for the flow-control filter.
//!
//! Three distributed algorithms share a [`RateLimitStore`] so several gateway
//! nodes can enforce one budget; a governor-backed limiter covers the
//! single-node (`singleton`) mode. [`RateLimiter::allow`] picks between them
//! from the rule's [`FlowControlConfig`].

mod fixed_window;
mod local;
mod sliding_window;
mod token_bucket;

use std::{sync::Arc, time::Duration};

pub use fixed_window::FixedWindowLimiter;
pub use local::LocalRateLimiter;
use serde::Deserialize;
pub use sliding_window::SlidingWindowLimiter;
pub use token_bucket::TokenBucketLimiter;

use crate::{
    config::models::{RateLimitSettings, StoreFailurePolicy},
    core::{
        error::{GatewayError, GatewayResult},
        filters::FLOW_CTL_FILTER_ID,
        model::{FlowControlConfig, FlowControlMode},
    },
    ports::rate_limit_store::{RateLimitStore, StoreResult},
    utils::clock::Clock,
};

/// Distributed limiter algorithm named by a flow-control config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowAlgorithm {
    TokenBucket,
    FixedWindow,
    SlidingWindow,
}

impl FlowAlgorithm {
    /// Resolves an algorithm name. Absent or unknown names use the token bucket.
    pub fn parse(name: Option<&str>) -> Self {
        match name.map(str::trim) {
            Some("fixed_window") => Self::FixedWindow,
            Some("sliding_window") | Some("move_window") => Self::SlidingWindow,
            Some("token_bucket") | Some("vote_bucket") | None | Some("") => Self::TokenBucket,
            Some(other) => {
                tracing::debug!(algorithm = other, "unknown flow algorithm, using token bucket");
                Self::TokenBucket
            }
        }
    }
}

/// Budget parsed from a flow-control config string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowLimit {
    /// Window length in seconds.
    pub duration: u64,
    pub permits: u64,
    /// Optional warm-up ramp for the local limiter, in seconds.
    pub warm_up: Option<u64>,
}

#[derive(Deserialize)]
struct RawFlowLimit {
    duration: Option<u64>,
    permits: Option<u64>,
    warm_up: Option<u64>,
}

impl FlowLimit {
    /// Parses `{"duration": .., "permits": ..}`. A config without both keys
    /// (or with a zero) does not limit anything and yields `None`.
    pub fn parse(config: &str) -> Result<Option<Self>, serde_json::Error> {
        if config.trim().is_empty() {
            return Ok(None);
        }
        let raw: RawFlowLimit = serde_json::from_str(config)?;
        Ok(match (raw.duration, raw.permits) {
            (Some(duration), Some(permits)) if duration > 0 && permits > 0 => Some(Self {
                duration,
                permits,
                warm_up: raw.warm_up.filter(|w| *w > 0),
            }),
            _ => None,
        })
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.duration)
    }

    pub fn window_millis(&self) -> i64 {
        i64::try_from(self.duration.saturating_mul(1000)).unwrap_or(i64::MAX)
    }

    /// Permits per second.
    pub fn rate(&self) -> f64 {
        self.permits as f64 / self.duration as f64
    }
}

/// Front door for all limiter algorithms.
pub struct RateLimiter {
    fixed_window: FixedWindowLimiter,
    sliding_window: SlidingWindowLimiter,
    token_bucket: TokenBucketLimiter,
    local: LocalRateLimiter,
    on_store_error: StoreFailurePolicy,
}

impl RateLimiter {
    pub fn new(
        store: Arc<dyn RateLimitStore>,
        clock: Arc<dyn Clock>,
        settings: &RateLimitSettings,
    ) -> Self {
        tracing::info!(
            on_store_error = ?settings.on_store_error,
            lock_attempts = settings.lock_attempts,
            "Creating rate limiter"
        );
        Self {
            fixed_window: FixedWindowLimiter::new(
                store.clone(),
                clock.clone(),
                settings.lock_attempts,
                Duration::from_millis(settings.lock_retry_delay_ms),
            ),
            sliding_window: SlidingWindowLimiter::new(store.clone(), clock.clone()),
            token_bucket: TokenBucketLimiter::new(store, clock),
            local: LocalRateLimiter::new(),
            on_store_error: settings.on_store_error,
        }
    }

    /// Decides whether one more request under `key` fits the configured budget.
    pub async fn allow(&self, config: &FlowControlConfig, key: &str) -> GatewayResult<bool> {
        let Some(limit) = FlowLimit::parse(&config.config)
            .map_err(|e| GatewayError::filter_config(FLOW_CTL_FILTER_ID, e))?
        else {
            return Ok(true);
        };

        if config.mode == FlowControlMode::Singleton {
            return Ok(self.local.try_acquire(key, &limit).await);
        }

        let decision = match FlowAlgorithm::parse(config.algorithm.as_deref()) {
            FlowAlgorithm::FixedWindow => self.fixed_window.is_allowed(key, &limit).await,
            FlowAlgorithm::SlidingWindow => self.sliding_window.is_allowed(key, &limit).await,
            FlowAlgorithm::TokenBucket => self.token_bucket.is_allowed(key, &limit).await,
        };
        Ok(self.resolve(key, decision))
    }

    fn resolve(&self, key: &str, decision: StoreResult<bool>) -> bool {
        match decision {
            Ok(allowed) => allowed,
            Err(e) => {
                let allowed = self.on_store_error == StoreFailurePolicy::FailOpen;
                tracing::warn!(
                    key,
                    error = %e,
                    allowed,
                    "Rate limit store failed, applying failure policy"
                );
                allowed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::{
        adapters::memory_store::InMemoryRateLimitStore,
        ports::rate_limit_store::{StoreError, TokenBucketRequest},
        utils::clock::ManualClock,
    };

    struct DownStore;

    #[async_trait]
    impl RateLimitStore for DownStore {
        async fn try_lock(&self, _: &str, _: &str, _: Duration) -> StoreResult<bool> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn unlock(&self, _: &str, _: &str) -> StoreResult<()> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn incr(&self, _: &str) -> StoreResult<u64> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn expire(&self, _: &str, _: Duration) -> StoreResult<()> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn zadd(&self, _: &str, _: i64, _: &str) -> StoreResult<()> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn zrem_range_by_score(&self, _: &str, _: i64, _: i64) -> StoreResult<u64> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn zcard(&self, _: &str) -> StoreResult<u64> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn eval_token_bucket(&self, _: &TokenBucketRequest) -> StoreResult<bool> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
    }

    fn config(algorithm: Option<&str>, limit: &str) -> FlowControlConfig {
        FlowControlConfig {
            value: "/orders".into(),
            algorithm: algorithm.map(str::to_string),
            config: limit.into(),
            ..FlowControlConfig::default()
        }
    }

    fn limiter(store: Arc<dyn RateLimitStore>, policy: StoreFailurePolicy) -> RateLimiter {
        let settings = RateLimitSettings {
            on_store_error: policy,
            ..RateLimitSettings::default()
        };
        RateLimiter::new(store, Arc::new(ManualClock::new(1_000_000)), &settings)
    }

    #[test]
    fn algorithm_names_fall_back_to_token_bucket() {
        assert_eq!(FlowAlgorithm::parse(None), FlowAlgorithm::TokenBucket);
        assert_eq!(FlowAlgorithm::parse(Some("stream_bucket")), FlowAlgorithm::TokenBucket);
        assert_eq!(FlowAlgorithm::parse(Some("move_window")), FlowAlgorithm::SlidingWindow);
        assert_eq!(FlowAlgorithm::parse(Some("fixed_window")), FlowAlgorithm::FixedWindow);
    }

    #[test]
    fn limit_without_both_keys_is_unlimited() {
        assert_eq!(FlowLimit::parse(r#"{"permits": 3}"#).unwrap(), None);
        assert_eq!(FlowLimit::parse("").unwrap(), None);
        let limit = FlowLimit::parse(r#"{"duration": 2, "permits": 10}"#)
            .unwrap()
            .unwrap();
        assert_eq!(limit.rate(), 5.0);
        assert!(FlowLimit::parse("not json").is_err());
    }

    #[tokio::test]
    async fn malformed_config_is_a_filter_config_error() {
        let limiter = limiter(
            Arc::new(InMemoryRateLimitStore::new()),
            StoreFailurePolicy::FailOpen,
        );
        let err = limiter
            .allow(&config(None, "{broken"), "user./orders")
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::FilterConfig { .. }));
    }

    #[tokio::test]
    async fn store_outage_fails_open_by_policy() {
        let limiter = limiter(Arc::new(DownStore), StoreFailurePolicy::FailOpen);
        let cfg = config(Some("sliding_window"), r#"{"duration":1,"permits":1}"#);
        assert!(limiter.allow(&cfg, "user./orders").await.unwrap());
    }

    #[tokio::test]
    async fn store_outage_fails_closed_by_policy() {
        let limiter = limiter(Arc::new(DownStore), StoreFailurePolicy::FailClosed);
        for algorithm in ["fixed_window", "sliding_window", "token_bucket"] {
            let cfg = config(Some(algorithm), r#"{"duration":1,"permits":100}"#);
            assert!(
                !limiter.allow(&cfg, "user./orders").await.unwrap(),
                "{algorithm} should deny while the store is down"
            );
        }
    }

    #[tokio::test]
    async fn singleton_mode_never_touches_the_store() {
        let limiter = limiter(Arc::new(DownStore), StoreFailurePolicy::FailClosed);
        let mut cfg = config(None, r#"{"duration":1,"permits":5}"#);
        cfg.mode = FlowControlMode::Singleton;
        assert!(limiter.allow(&cfg, "user./orders").await.unwrap());
    }
}
