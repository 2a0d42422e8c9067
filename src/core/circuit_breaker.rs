//! Per-path command isolation for downstream calls.
//!
//! A [`HystrixCommand`] bounds concurrency with a semaphore, enforces an
//! execution timeout that drops the in-flight call, and opens after a run of
//! consecutive failures:
//! - **Closed**: calls flow through
//! - **Open**: calls short-circuit to the fallback until the sleep window ends
//! - **HalfOpen**: one trial call decides between Closed and Open

use std::{
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Semaphore;

use crate::core::{
    error::GatewayError,
    model::HystrixConfig,
    response::ResponseCode,
    store::path_key,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("command timed out after {0} ms")]
    Timeout(u64),

    #[error("command rejected: all {0} permits in use")]
    Rejected(usize),

    #[error("circuit open")]
    ShortCircuited,

    #[error(transparent)]
    Failed(#[from] GatewayError),
}

impl CommandError {
    /// Fallback code reported to the caller.
    pub fn fallback_code(&self) -> ResponseCode {
        match self {
            Self::Timeout(_) => ResponseCode::FallbackTimeout,
            _ => ResponseCode::FallbackError,
        }
    }
}

#[derive(Debug)]
struct Breaker {
    state: State,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

#[derive(Debug)]
pub struct HystrixCommand {
    key: String,
    config: HystrixConfig,
    permits: Semaphore,
    max_concurrency: usize,
    breaker: Mutex<Breaker>,
}

impl HystrixCommand {
    pub fn new(key: impl Into<String>, config: HystrixConfig) -> Self {
        let max_concurrency = config.core_thread_size.max(1);
        Self {
            key: key.into(),
            permits: Semaphore::new(max_concurrency),
            max_concurrency,
            config,
            breaker: Mutex::new(Breaker {
                state: State::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn config(&self) -> &HystrixConfig {
        &self.config
    }

    pub fn state(&self) -> State {
        self.breaker.lock().state
    }

    /// Runs `call` under the command's limits. The call is dropped when the
    /// timeout fires.
    pub async fn execute<T, F>(&self, call: F) -> Result<T, CommandError>
    where
        F: Future<Output = Result<T, GatewayError>>,
    {
        if !self.allow_request() {
            tracing::debug!(command = %self.key, "Circuit open, short-circuiting");
            return Err(CommandError::ShortCircuited);
        }
        let Ok(_permit) = self.permits.try_acquire() else {
            tracing::warn!(command = %self.key, permits = self.max_concurrency, "Command rejected");
            return Err(CommandError::Rejected(self.max_concurrency));
        };

        let timeout = Duration::from_millis(self.config.timeout_ms);
        match tokio::time::timeout(timeout, call).await {
            Ok(Ok(value)) => {
                self.record_success();
                Ok(value)
            }
            Ok(Err(e)) => {
                self.record_failure();
                Err(CommandError::Failed(e))
            }
            Err(_) => {
                self.record_failure();
                Err(CommandError::Timeout(self.config.timeout_ms))
            }
        }
    }

    fn allow_request(&self) -> bool {
        if self.config.failure_threshold == 0 {
            return true;
        }
        let mut breaker = self.breaker.lock();
        match breaker.state {
            State::Closed => true,
            // A trial call is already in flight.
            State::HalfOpen => false,
            State::Open => {
                let window = Duration::from_millis(self.config.sleep_window_ms);
                if breaker.opened_at.is_some_and(|at| at.elapsed() >= window) {
                    breaker.state = State::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    fn record_success(&self) {
        let mut breaker = self.breaker.lock();
        if breaker.state != State::Closed {
            tracing::info!(command = %self.key, "Circuit closed");
        }
        breaker.state = State::Closed;
        breaker.consecutive_failures = 0;
        breaker.opened_at = None;
    }

    fn record_failure(&self) {
        if self.config.failure_threshold == 0 {
            return;
        }
        let mut breaker = self.breaker.lock();
        breaker.consecutive_failures = breaker.consecutive_failures.saturating_add(1);
        let trip = breaker.state == State::HalfOpen
            || breaker.consecutive_failures >= self.config.failure_threshold;
        if trip && breaker.state != State::Open {
            tracing::warn!(
                command = %self.key,
                failures = breaker.consecutive_failures,
                sleep_window_ms = self.config.sleep_window_ms,
                "Circuit opened"
            );
            breaker.state = State::Open;
            breaker.opened_at = Some(Instant::now());
        }
    }
}

/// Commands keyed by `serviceId.path`, rebuilt when their config changes.
#[derive(Default)]
pub struct CommandRegistry {
    commands: scc::HashMap<String, Arc<HystrixCommand>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn command(
        &self,
        service_id: &str,
        path: &str,
        config: &HystrixConfig,
    ) -> Arc<HystrixCommand> {
        let key = path_key(service_id, path);
        if let Some(existing) = self.commands.get_async(&key).await.map(|e| e.get().clone()) {
            if existing.config == *config {
                return existing;
            }
        }

        tracing::debug!(command = %key, timeout_ms = config.timeout_ms, "Building command");
        let created = Arc::new(HystrixCommand::new(key.clone(), config.clone()));
        let _ = self.commands.upsert_async(key, created.clone()).await;
        created
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
