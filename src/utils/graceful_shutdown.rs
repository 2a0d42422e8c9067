use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use eyre::{Result, WrapErr};
use tokio::{signal, sync::broadcast};

/// Why the gateway is stopping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// SIGINT / Ctrl+C
    Interrupt,
    /// SIGTERM
    Terminate,
    /// Requested from inside the process
    Requested,
}

/// Fans a single stop request out to the listener, the discovery watcher
/// and the dispatch queue drain.
pub struct GracefulShutdown {
    shutdown_tx: broadcast::Sender<ShutdownReason>,
    shutdown_initiated: Arc<AtomicBool>,
    drain_timeout: Duration,
}

impl GracefulShutdown {
    /// Default drain window of 30 seconds
    pub fn new() -> Self {
        Self::with_drain_timeout(Duration::from_secs(30))
    }

    pub fn with_drain_timeout(drain_timeout: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(4);
        Self {
            shutdown_tx,
            shutdown_initiated: Arc::new(AtomicBool::new(false)),
            drain_timeout,
        }
    }

    /// How long in-flight work may take once shutdown started
    pub fn drain_timeout(&self) -> Duration {
        self.drain_timeout
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownReason> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_shutdown_initiated(&self) -> bool {
        self.shutdown_initiated.load(Ordering::Acquire)
    }

    /// Starts shutdown. Returns false when it was already under way.
    pub fn trigger_shutdown(&self, reason: ShutdownReason) -> bool {
        if self
            .shutdown_initiated
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!(?reason, "Shutdown already initiated");
            return false;
        }
        tracing::info!(?reason, "Shutdown initiated");
        // No subscriber yet is fine; late subscribers check the flag.
        let _ = self.shutdown_tx.send(reason);
        true
    }

    /// Waits for SIGINT or SIGTERM and triggers shutdown.
    pub async fn run_signal_handler(&self) -> Result<()> {
        tracing::info!("Listening for SIGINT and SIGTERM");
        let reason = tokio::select! {
            res = signal::ctrl_c() => {
                res.wrap_err("Failed to listen for Ctrl+C")?;
                ShutdownReason::Interrupt
            }
            res = wait_for_sigterm() => {
                res?;
                ShutdownReason::Terminate
            }
        };
        self.trigger_shutdown(reason);
        Ok(())
    }

    /// Resolves once shutdown has been triggered, including before the call.
    pub async fn wait_for_shutdown_signal(&self) -> ShutdownReason {
        self.token().wait().await
    }

    pub fn token(&self) -> ShutdownToken {
        ShutdownToken {
            receiver: self.subscribe(),
            shutdown_initiated: self.shutdown_initiated.clone(),
        }
    }
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
async fn wait_for_sigterm() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm =
        signal(SignalKind::terminate()).wrap_err("Failed to register SIGTERM handler")?;
    sigterm.recv().await;
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_sigterm() -> Result<()> {
    std::future::pending::<()>().await;
    Ok(())
}

/// Handle for background tasks that need to stop with the gateway
pub struct ShutdownToken {
    receiver: broadcast::Receiver<ShutdownReason>,
    shutdown_initiated: Arc<AtomicBool>,
}

impl Clone for ShutdownToken {
    fn clone(&self) -> Self {
        Self {
            receiver: self.receiver.resubscribe(),
            shutdown_initiated: self.shutdown_initiated.clone(),
        }
    }
}

impl ShutdownToken {
    pub fn is_shutdown_initiated(&self) -> bool {
        self.shutdown_initiated.load(Ordering::Acquire)
    }

    pub async fn wait(&mut self) -> ShutdownReason {
        if self.is_shutdown_initiated() {
            return self.receiver.try_recv().unwrap_or(ShutdownReason::Requested);
        }
        self.receiver
            .recv()
            .await
            .unwrap_or(ShutdownReason::Requested)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_only_once() {
        let shutdown = GracefulShutdown::new();
        let mut receiver = shutdown.subscribe();

        assert!(!shutdown.is_shutdown_initiated());
        assert!(shutdown.trigger_shutdown(ShutdownReason::Terminate));
        assert!(!shutdown.trigger_shutdown(ShutdownReason::Interrupt));
        assert!(shutdown.is_shutdown_initiated());

        assert_eq!(receiver.try_recv().unwrap(), ShutdownReason::Terminate);
        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_token_wakes_waiting_task() {
        let shutdown = GracefulShutdown::new();
        let mut token = shutdown.token();
        let waiter = tokio::spawn(async move { token.wait().await });

        tokio::task::yield_now().await;
        shutdown.trigger_shutdown(ShutdownReason::Requested);
        assert_eq!(waiter.await.unwrap(), ShutdownReason::Requested);
    }

    #[tokio::test]
    async fn test_late_waiter_returns_immediately() {
        let shutdown = GracefulShutdown::with_drain_timeout(Duration::from_secs(1));
        shutdown.trigger_shutdown(ShutdownReason::Interrupt);

        let reason = tokio::time::timeout(
            Duration::from_millis(200),
            shutdown.wait_for_shutdown_signal(),
        )
        .await
        .unwrap();
        assert_eq!(reason, ShutdownReason::Requested);
        assert_eq!(shutdown.drain_timeout(), Duration::from_secs(1));
    }
}
