use std::{
    num::NonZeroU32,
    sync::Arc,
    time::{Duration, Instant},
};

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};

use super::FlowLimit;

/// Cost multiplier applied to the first acquisition of a cold limiter.
const COLD_FACTOR: u32 = 3;

/// One in-process limiter plus the settings it was built from.
struct LocalLimiter {
    limit: FlowLimit,
    limiter: DefaultDirectRateLimiter,
    burst: u32,
    created: Instant,
}

impl LocalLimiter {
    fn new(limit: FlowLimit) -> Option<Self> {
        // Up to one second worth of permits may be taken at once.
        let mut burst = limit.rate().ceil().max(1.0) as u32;
        if limit.warm_up.is_some() {
            burst = burst.max(COLD_FACTOR);
        }
        let period = Duration::from_secs_f64(1.0 / limit.rate());
        let quota = Quota::with_period(period)?.allow_burst(NonZeroU32::new(burst)?);
        Some(Self {
            limit,
            limiter: RateLimiter::direct(quota),
            burst,
            created: Instant::now(),
        })
    }

    /// Each acquisition costs `COLD_FACTOR` cells right after creation and
    /// decays linearly to one cell over the warm-up period.
    fn cost(&self) -> u32 {
        let Some(warm_up) = self.limit.warm_up else {
            return 1;
        };
        let warm_up = Duration::from_secs(warm_up).as_secs_f64();
        let elapsed = self.created.elapsed().as_secs_f64();
        if elapsed >= warm_up {
            return 1;
        }
        let remaining = 1.0 - elapsed / warm_up;
        let cost = 1.0 + f64::from(COLD_FACTOR - 1) * remaining;
        (cost.round() as u32).clamp(1, self.burst)
    }

    fn try_acquire(&self) -> bool {
        match NonZeroU32::new(self.cost()) {
            Some(cells) => matches!(self.limiter.check_n(cells), Ok(Ok(()))),
            None => true,
        }
    }
}

/// Smoothing limiters for `singleton` mode, one per `serviceId.value` key.
/// A limiter is rebuilt whenever the configured rate for its key changes.
#[derive(Default)]
pub struct LocalRateLimiter {
    limiters: scc::HashMap<String, Arc<LocalLimiter>>,
}

impl LocalRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn try_acquire(&self, key: &str, limit: &FlowLimit) -> bool {
        let current = self
            .limiters
            .get_async(key)
            .await
            .map(|entry| entry.get().clone());

        let limiter = match current {
            Some(limiter) if limiter.limit == *limit => limiter,
            _ => match LocalLimiter::new(*limit) {
                Some(limiter) => {
                    let limiter = Arc::new(limiter);
                    let _ = self.limiters.upsert_async(key.to_string(), limiter.clone()).await;
                    tracing::info!(
                        key,
                        rate = limit.rate(),
                        warm_up = ?limit.warm_up,
                        "Created local rate limiter"
                    );
                    limiter
                }
                None => {
                    tracing::warn!(key, ?limit, "Invalid local rate limit, request allowed");
                    return true;
                }
            },
        };

        limiter.try_acquire()
    }

    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
