//! Cooperative cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

use crate::error::CloneError;

#[derive(Debug, Default)]
struct Inner {
    cancelled: AtomicBool,
    notify: Notify,
}

/// Shared cancellation flag, checked before every REST call and batch.
///
/// Cloning yields a handle to the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Wakes any in-progress [`sleep`](Self::sleep).
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Clear the flag once a run has finished.
    pub(crate) fn reset(&self) {
        self.inner.cancelled.store(false, Ordering::SeqCst);
    }

    /// `Err(Cancelled)` once cancellation was requested.
    pub fn check(&self) -> Result<(), CloneError> {
        if self.is_cancelled() {
            Err(CloneError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves once cancellation was requested.
    pub async fn cancelled(&self) {
        loop {
            // Register before checking so a concurrent cancel isn't missed.
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Sleep for `duration`, returning early with `Err(Cancelled)` if the
    /// token fires first.
    pub async fn sleep(&self, duration: Duration) -> Result<(), CloneError> {
        self.check()?;
        let interrupted = futures_lite::future::or(
            async {
                tokio::time::sleep(duration).await;
                false
            },
            async {
                self.cancelled().await;
                true
            },
        )
        .await;

        if interrupted {
            Err(CloneError::Cancelled)
        } else {
            Ok(())
        }
    }
}
