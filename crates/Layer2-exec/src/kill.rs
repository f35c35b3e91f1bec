//! Run-wide kill signal
//!
//! A cloneable flag shared by the scheduler, every executor session and every
//! semaphore wait. Once set it never resets; `wait` resolves immediately for
//! late subscribers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct KillInner {
    killed: AtomicBool,
    notify: Notify,
}

/// External cancellation signal for a run
#[derive(Debug, Clone, Default)]
pub struct KillSignal {
    inner: Arc<KillInner>,
}

impl KillSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn kill(&self) {
        self.inner.killed.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_killed(&self) -> bool {
        self.inner.killed.load(Ordering::SeqCst)
    }

    /// Wait until cancellation is requested.
    pub async fn wait(&self) {
        loop {
            if self.is_killed() {
                return;
            }
            let notified = self.inner.notify.notified();
            // Re-check after registering so a kill between the check and the
            // await is not missed.
            if self.is_killed() {
                return;
            }
            notified.await;
        }
    }
}
