//! Interruptible sleep between loop iterations.

use std::time::Duration;

use tokio::sync::Notify;

/// Sleeps for a fixed duration unless woken early.
///
/// Each scheduler loop owns one `Waiter`; shutdown wakes them all so a loop
/// never has to sit out a full polling interval before noticing the flag.
/// A wake issued while nobody is waiting is buffered and consumed by the
/// next `wait`, so the wake cannot be lost to a race with loop scheduling.
#[derive(Debug)]
pub struct Waiter {
    duration: Duration,
    wakeup: Notify,
}

impl Waiter {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            wakeup: Notify::new(),
        }
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Block for up to the configured duration. Returns `true` iff the wait
    /// was cut short by [`wake`](Waiter::wake).
    pub async fn wait(&self) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.duration) => false,
            _ = self.wakeup.notified() => true,
        }
    }

    /// Interrupt an in-progress [`wait`](Waiter::wait), or the next one if
    /// none is in progress.
    pub fn wake(&self) {
        self.wakeup.notify_one();
    }
}
