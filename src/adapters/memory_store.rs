use std::{
    collections::{BTreeSet, HashMap},
    sync::{
        Arc,
        atomic::{AtomicI64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::{Mutex, MutexGuard};

use crate::{
    ports::rate_limit_store::{RateLimitStore, StoreError, StoreResult, TokenBucketRequest},
    utils::clock::{Clock, SystemClock},
};

#[derive(Debug, Clone)]
enum Value {
    Counter(u64),
    Text(String),
    Number(f64),
    Scored(BTreeSet<(i64, String)>),
}

/// Minimum clock time between two sweeps of expired keys.
const SWEEP_INTERVAL_MILLIS: i64 = 1000;

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<i64>,
}

/// Process-local [`RateLimitStore`] with key expiry driven by a [`Clock`].
///
/// Every operation runs under one lock, so the token-bucket evaluation is as
/// atomic as a server-side script would be. Suitable for a single gateway node
/// and for tests; a shared deployment plugs in a networked store instead.
pub struct InMemoryRateLimitStore {
    entries: Mutex<HashMap<String, Entry>>,
    next_sweep: AtomicI64,
    clock: Arc<dyn Clock>,
}

impl InMemoryRateLimitStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_sweep: AtomicI64::new(i64::MIN),
            clock,
        }
    }

    /// Locks the key space. Keys that are never read again (old window
    /// counters, abandoned sets) are dropped here at most once per
    /// [`SWEEP_INTERVAL_MILLIS`].
    fn lock_entries(&self, now: i64) -> MutexGuard<'_, HashMap<String, Entry>> {
        let mut entries = self.entries.lock();
        if now >= self.next_sweep.load(Ordering::Relaxed) {
            self.next_sweep
                .store(now.saturating_add(SWEEP_INTERVAL_MILLIS), Ordering::Relaxed);
            let before = entries.len();
            entries.retain(|_, e| !is_expired(e, now));
            let swept = before - entries.len();
            if swept > 0 {
                tracing::trace!(swept, remaining = entries.len(), "Swept expired rate limit keys");
            }
        }
        entries
    }

    /// Number of live keys, after dropping expired ones.
    pub fn len(&self) -> usize {
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock();
        entries.retain(|_, e| !is_expired(e, now));
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ttl_millis(ttl: Duration) -> i64 {
        i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
    }
}

impl Default for InMemoryRateLimitStore {
    fn default() -> Self {
        Self::new()
    }
}

fn is_expired(entry: &Entry, now: i64) -> bool {
    entry.expires_at.is_some_and(|at| at <= now)
}

/// Returns the live entry for `key`, evicting it first if it has expired.
fn live<'a>(entries: &'a mut HashMap<String, Entry>, key: &str, now: i64) -> Option<&'a mut Entry> {
    if entries.get(key).is_some_and(|e| is_expired(e, now)) {
        entries.remove(key);
    }
    entries.get_mut(key)
}

fn number_at(entries: &mut HashMap<String, Entry>, key: &str, now: i64) -> StoreResult<Option<f64>> {
    match live(entries, key, now).map(|e| &e.value) {
        None => Ok(None),
        Some(Value::Number(n)) => Ok(Some(*n)),
        Some(Value::Counter(c)) => Ok(Some(*c as f64)),
        Some(_) => Err(StoreError::WrongType {
            key: key.to_string(),
        }),
    }
}

#[async_trait]
impl RateLimitStore for InMemoryRateLimitStore {
    async fn try_lock(&self, key: &str, owner: &str, ttl: Duration) -> StoreResult<bool> {
        let now = self.clock.now_millis();
        let mut entries = self.lock_entries(now);
        if live(&mut entries, key, now).is_some() {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Text(owner.to_string()),
                expires_at: Some(now.saturating_add(Self::ttl_millis(ttl))),
            },
        );
        Ok(true)
    }

    async fn unlock(&self, key: &str, owner: &str) -> StoreResult<()> {
        let now = self.clock.now_millis();
        let mut entries = self.lock_entries(now);
        let held_by_owner = matches!(
            live(&mut entries, key, now).map(|e| &e.value),
            Some(Value::Text(current)) if current == owner
        );
        if held_by_owner {
            entries.remove(key);
        }
        Ok(())
    }

    async fn incr(&self, key: &str) -> StoreResult<u64> {
        let now = self.clock.now_millis();
        let mut entries = self.lock_entries(now);
        match live(&mut entries, key, now) {
            Some(Entry {
                value: Value::Counter(count),
                ..
            }) => {
                *count += 1;
                Ok(*count)
            }
            Some(_) => Err(StoreError::WrongType {
                key: key.to_string(),
            }),
            None => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: Value::Counter(1),
                        expires_at: None,
                    },
                );
                Ok(1)
            }
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        let now = self.clock.now_millis();
        let mut entries = self.lock_entries(now);
        if let Some(entry) = live(&mut entries, key, now) {
            entry.expires_at = Some(now.saturating_add(Self::ttl_millis(ttl)));
        }
        Ok(())
    }

    async fn zadd(&self, key: &str, score: i64, member: &str) -> StoreResult<()> {
        let now = self.clock.now_millis();
        let mut entries = self.lock_entries(now);
        match live(&mut entries, key, now) {
            Some(Entry {
                value: Value::Scored(set),
                ..
            }) => {
                set.retain(|(_, m)| m != member);
                set.insert((score, member.to_string()));
                Ok(())
            }
            Some(_) => Err(StoreError::WrongType {
                key: key.to_string(),
            }),
            None => {
                let mut set = BTreeSet::new();
                set.insert((score, member.to_string()));
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: Value::Scored(set),
                        expires_at: None,
                    },
                );
                Ok(())
            }
        }
    }

    async fn zrem_range_by_score(&self, key: &str, min: i64, max: i64) -> StoreResult<u64> {
        let now = self.clock.now_millis();
        let mut entries = self.lock_entries(now);
        match live(&mut entries, key, now) {
            Some(Entry {
                value: Value::Scored(set),
                ..
            }) => {
                let before = set.len();
                set.retain(|(score, _)| *score < min || *score > max);
                Ok((before - set.len()) as u64)
            }
            Some(_) => Err(StoreError::WrongType {
                key: key.to_string(),
            }),
            None => Ok(0),
        }
    }

    async fn zcard(&self, key: &str) -> StoreResult<u64> {
        let now = self.clock.now_millis();
        let mut entries = self.lock_entries(now);
        match live(&mut entries, key, now) {
            Some(Entry {
                value: Value::Scored(set),
                ..
            }) => Ok(set.len() as u64),
            Some(_) => Err(StoreError::WrongType {
                key: key.to_string(),
            }),
            None => Ok(0),
        }
    }

    async fn eval_token_bucket(&self, request: &TokenBucketRequest) -> StoreResult<bool> {
        let now_millis = self.clock.now_millis();
        let mut entries = self.lock_entries(now_millis);

        let last_tokens =
            number_at(&mut entries, &request.tokens_key, now_millis)?.unwrap_or(request.capacity);
        let last_refreshed =
            number_at(&mut entries, &request.timestamp_key, now_millis)?.unwrap_or(0.0);

        let delta = (request.now - last_refreshed).max(0.0);
        let filled = (last_tokens + delta * request.rate).min(request.capacity);
        let allowed = filled >= request.requested;
        let remaining = if allowed {
            filled - request.requested
        } else {
            filled
        };

        // Keys live for twice the time a full refill takes.
        let fill_time = if request.rate > 0.0 {
            request.capacity / request.rate
        } else {
            1.0
        };
        let ttl_millis = ((fill_time * 2.0).floor().max(1.0) * 1000.0) as i64;
        let expires_at = Some(now_millis.saturating_add(ttl_millis));

        entries.insert(
            request.tokens_key.clone(),
            Entry {
                value: Value::Number(remaining),
                expires_at,
            },
        );
        entries.insert(
            request.timestamp_key.clone(),
            Entry {
                value: Value::Number(request.now),
                expires_at,
            },
        );
        Ok(allowed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::clock::ManualClock;

    fn store() -> (InMemoryRateLimitStore, ManualClock) {
        let clock = ManualClock::new(10_000);
        (InMemoryRateLimitStore::with_clock(Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn lock_is_exclusive_until_released_or_expired() {
        let (store, clock) = store();
        let ttl = Duration::from_secs(1);

        assert!(store.try_lock("lock", "a", ttl).await.unwrap());
        assert!(!store.try_lock("lock", "b", ttl).await.unwrap());

        // Only the owner can release.
        store.unlock("lock", "b").await.unwrap();
        assert!(!store.try_lock("lock", "b", ttl).await.unwrap());

        clock.advance(Duration::from_secs(1));
        assert!(store.try_lock("lock", "b", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn counter_resets_after_expiry() {
        let (store, clock) = store();
        assert_eq!(store.incr("c").await.unwrap(), 1);
        store.expire("c", Duration::from_millis(500)).await.unwrap();
        assert_eq!(store.incr("c").await.unwrap(), 2);

        clock.advance(Duration::from_millis(500));
        assert_eq!(store.incr("c").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn scored_set_range_removal() {
        let (store, _) = store();
        store.zadd("z", 1, "a").await.unwrap();
        store.zadd("z", 2, "b").await.unwrap();
        store.zadd("z", 3, "c").await.unwrap();

        assert_eq!(store.zrem_range_by_score("z", 0, 2).await.unwrap(), 2);
        assert_eq!(store.zcard("z").await.unwrap(), 1);
        assert_eq!(store.zcard("missing").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn wrong_type_is_reported() {
        let (store, _) = store();
        store.incr("k").await.unwrap();
        let err = store.zadd("k", 1, "m").await.unwrap_err();
        assert_eq!(err, StoreError::WrongType { key: "k".into() });
    }

    #[tokio::test]
    async fn expired_window_keys_do_not_accumulate() {
        let (store, clock) = store();
        for window in 0..1000 {
            let key = format!("fixedWindowRateLimiter:user./orders:{window}");
            assert_eq!(store.incr(&key).await.unwrap(), 1);
            store.expire(&key, Duration::from_secs(1)).await.unwrap();
            clock.advance(Duration::from_secs(1));
        }
        // Only keys written since the last sweep can still be around.
        assert!(store.entries.lock().len() <= 2);
    }

    #[tokio::test]
    async fn token_bucket_refills_over_time() {
        let (store, _) = store();
        let mut request = TokenBucketRequest {
            tokens_key: "t.tokens".into(),
            timestamp_key: "t.timestamp".into(),
            rate: 1.0,
            capacity: 2.0,
            now: 100.0,
            requested: 1.0,
        };

        assert!(store.eval_token_bucket(&request).await.unwrap());
        assert!(store.eval_token_bucket(&request).await.unwrap());
        assert!(!store.eval_token_bucket(&request).await.unwrap());

        request.now = 101.0;
        assert!(store.eval_token_bucket(&request).await.unwrap());
        assert!(!store.eval_token_bucket(&request).await.unwrap());
    }
}
