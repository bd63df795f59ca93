//! Cooperative cancellation and OS signal handling.
//!
//! A [`ShutdownTrigger`] / [`Shutdown`] pair wraps a `watch` channel. The
//! monitor checks [`Shutdown::is_triggered`] at the top of every iteration
//! and every delay goes through [`Shutdown::sleep`], which wakes early once
//! a stop is requested.
use std::time::Duration;
use tokio::sync::watch;

/// Sending half: requests a stop.
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        // send_replace works even when every receiver is gone.
        self.tx.send_replace(true);
    }
}

/// Receiving half, cloned into every component that waits.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

/// Create a linked trigger/token pair.
pub fn channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, Shutdown { rx })
}

impl Shutdown {
    /// A token that is never triggered. For one-shot commands and tests.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Shutdown { rx }
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once a stop has been requested.
    pub async fn triggered(&self) {
        let mut rx = self.rx.clone();
        let closed = rx.wait_for(|stop| *stop).await.is_err();
        if closed {
            // Trigger dropped without firing: nothing can stop us any more.
            std::future::pending::<()>().await;
        }
    }

    /// Sleep for `duration`, waking early on stop.
    ///
    /// Returns `true` if the full duration elapsed, `false` if interrupted.
    pub async fn sleep(&self, duration: Duration) -> bool {
        if duration.is_zero() {
            return !self.is_triggered();
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.triggered() => false,
        }
    }
}

/// Wait for SIGINT or SIGTERM (Ctrl-C on non-Unix platforms).
pub async fn wait_for_stop_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => tracing::info!("received SIGINT"),
                    _ = term.recv() => tracing::info!("received SIGTERM"),
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler, listening for SIGINT only");
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %e, "failed to listen for SIGINT");
                    std::future::pending::<()>().await;
                }
                tracing::info!("received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
        tracing::info!("received Ctrl-C");
    }
}
