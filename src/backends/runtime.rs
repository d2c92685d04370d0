//! Shared runtime primitives for backend integrations.

use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

/// Per-session cancellation signal, observable while a task is parked on I/O.
///
/// The flag makes a trigger that happens before anyone waits sticky; the
/// `Notify` wakes waiters that are already parked.
#[derive(Debug, Default)]
pub struct AbortSignal {
    flag: AtomicBool,
    notify: Notify,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Clears the flag at the start of a turn.
    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }

    /// Resolves once the signal is triggered. Cancel-safe.
    pub async fn triggered(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking the flag so a trigger in between is not lost.
            notified.as_mut().enable();
            if self.is_triggered() {
                return;
            }
            notified.await;
        }
    }
}
