use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Failure talking to the shared rate-limit store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("key {key} holds a value of the wrong type")]
    WrongType { key: String },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Keys and parameters for one atomic token-bucket evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenBucketRequest {
    pub tokens_key: String,
    pub timestamp_key: String,
    /// Tokens added per second.
    pub rate: f64,
    pub capacity: f64,
    /// Current time in seconds.
    pub now: f64,
    pub requested: f64,
}

/// Shared store backing the distributed limiter algorithms. The operation set
/// mirrors what a key-value server offers: an owner-checked lock, counters with
/// expiry, scored sets and a server-side token-bucket script.
#[async_trait]
pub trait RateLimitStore: Send + Sync + 'static {
    /// Sets `key` to `owner` if absent. Returns whether the lock was taken.
    async fn try_lock(&self, key: &str, owner: &str, ttl: Duration) -> StoreResult<bool>;

    /// Releases `key` only if it is still held by `owner`.
    async fn unlock(&self, key: &str, owner: &str) -> StoreResult<()>;

    /// Increments the counter at `key`, creating it at 1.
    async fn incr(&self, key: &str) -> StoreResult<u64>;

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()>;

    async fn zadd(&self, key: &str, score: i64, member: &str) -> StoreResult<()>;

    /// Removes members with `min <= score <= max`, returning how many went.
    async fn zrem_range_by_score(&self, key: &str, min: i64, max: i64) -> StoreResult<u64>;

    async fn zcard(&self, key: &str) -> StoreResult<u64>;

    /// Refills and takes tokens atomically. Returns whether the request fits.
    async fn eval_token_bucket(&self, request: &TokenBucketRequest) -> StoreResult<bool>;
}
