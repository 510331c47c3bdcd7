//! Graceful shutdown.
//!
//! A [`ShutdownSignal`] stops the accept loop and cancels every request
//! token derived from it. A [`ConnectionTracker`] counts live connections so
//! the server can wait for them to drain.
//!
//! ```rust
//! use meridian_server::{ConnectionTracker, ShutdownSignal};
//!
//! let shutdown = ShutdownSignal::new();
//! let request = shutdown.child_token();
//! shutdown.trigger();
//! assert!(request.is_cancelled());
//!
//! let tracker = ConnectionTracker::new();
//! let guard = tracker.acquire();
//! assert_eq!(tracker.active_connections(), 1);
//! drop(guard);
//! assert_eq!(tracker.active_connections(), 0);
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// A cloneable shutdown trigger.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    token: CancellationToken,
}

impl ShutdownSignal {
    /// Creates an untriggered signal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a signal triggered by SIGTERM or SIGINT.
    ///
    /// Must be called within a Tokio runtime.
    #[must_use]
    pub fn with_os_signals() -> Self {
        let signal = Self::new();
        let trigger = signal.clone();
        tokio::spawn(async move {
            wait_for_os_signal().await;
            trigger.trigger();
        });
        signal
    }

    /// Triggers shutdown. Idempotent.
    pub fn trigger(&self) {
        self.token.cancel();
    }

    /// Returns `true` once triggered.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Completes when shutdown is triggered.
    pub fn recv(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    /// A token cancelled on shutdown, for one connection or request.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }
}

async fn wait_for_os_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(term), Ok(int)) => (term, int),
                (Err(err), _) | (_, Err(err)) => {
                    tracing::error!(error = %err, "failed to install signal handlers");
                    return std::future::pending().await;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
            _ = sigint.recv() => tracing::info!("received SIGINT, shutting down"),
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to wait for ctrl-c");
            return std::future::pending().await;
        }
        tracing::info!("received ctrl-c, shutting down");
    }
}

#[derive(Debug, Default)]
struct Counter {
    active: AtomicUsize,
    idle: Notify,
}

/// Counts live connections.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    inner: Arc<Counter>,
}

impl ConnectionTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection until the guard is dropped.
    #[must_use]
    pub fn acquire(&self) -> ConnectionGuard {
        self.inner.active.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Number of live connections.
    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Completes once no connection is live.
    pub async fn wait_idle(&self) {
        loop {
            let idle = self.inner.idle.notified();
            if self.active_connections() == 0 {
                return;
            }
            idle.await;
        }
    }
}

/// Keeps a connection counted in its [`ConnectionTracker`].
#[derive(Debug)]
pub struct ConnectionGuard {
    inner: Arc<Counter>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if self.inner.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_trigger_is_idempotent() {
        let shutdown = ShutdownSignal::new();
        let clone = shutdown.clone();
        assert!(!clone.is_shutdown());
        shutdown.trigger();
        shutdown.trigger();
        assert!(clone.is_shutdown());
        clone.recv().await;
    }

    #[tokio::test]
    async fn test_child_tokens_cancelled() {
        let shutdown = ShutdownSignal::new();
        let child = shutdown.child_token();
        child.cancel();
        assert!(!shutdown.is_shutdown());

        let child = shutdown.child_token();
        shutdown.trigger();
        assert!(child.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_idle() {
        let tracker = ConnectionTracker::new();
        tracker.wait_idle().await;

        let guard = tracker.acquire();
        let waiter = tokio::spawn({
            let tracker = tracker.clone();
            async move { tracker.wait_idle().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap();
        assert_eq!(tracker.active_connections(), 0);
    }
}
