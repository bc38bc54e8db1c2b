//! One-shot cancellable timers

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::AbortHandle;

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

/// Runs `callback` once after a delay unless cancelled or dropped first.
///
/// The callback receives the timer id. Owners keep the `Timer` in their state
/// and compare ids when it fires, so a callback that raced with its own
/// replacement sees a different id and does nothing.
#[derive(Debug)]
pub struct Timer {
    id: u64,
    handle: AbortHandle,
}

impl Timer {
    pub fn start<F>(delay: Duration, callback: F) -> Self
    where
        F: FnOnce(u64) + Send + 'static,
    {
        let id = NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            callback(id);
        })
        .abort_handle();
        Self { id, handle }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn cancel(self) {}
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
