//! Cancellation for long-running store and builder operations.
//!
//! A [`Cancellation`] is a cloneable view of a `watch` channel, the same
//! signal the node agent uses for shutdown. Every operation that can block
//! on store I/O, a pipe, a lock wait or a child process races its future
//! against [`Cancellation::cancelled`].

use std::future::Future;

use thiserror::Error;
use tokio::sync::watch;

/// The operation was cancelled before it completed.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Sender side; flipping it cancels every linked [`Cancellation`].
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Cancel all linked operations.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Receiver side passed into operations.
#[derive(Debug, Clone)]
pub struct Cancellation {
    rx: watch::Receiver<bool>,
}

impl Cancellation {
    /// Create a linked handle and cancellation.
    pub fn new() -> (CancelHandle, Self) {
        let (tx, rx) = watch::channel(false);
        (CancelHandle { tx }, Self { rx })
    }

    /// A cancellation that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    /// Returns true once cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when cancellation is requested; pends forever if the handle
    /// was dropped without cancelling.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    /// Returns `Err(Cancelled)` if cancellation was already requested.
    pub fn check(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }

    /// Run a fallible future, abandoning it if cancellation fires first.
    pub async fn run<T, E, F>(&self, fut: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        E: From<Cancelled>,
    {
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(Cancelled.into()),
            result = fut => result,
        }
    }

    /// Sleep for `duration` unless cancelled first.
    pub async fn sleep(&self, duration: std::time::Duration) -> Result<(), Cancelled> {
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}
