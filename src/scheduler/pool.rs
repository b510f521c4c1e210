//! Bounded worker slots.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// A held worker slot. Dropping it releases the slot, on every exit path.
pub type ExecutorSlot = OwnedSemaphorePermit;

/// Fixed pool of worker slots with no queueing: acquisition either succeeds
/// immediately or fails immediately. Queued claims would let a scheduler
/// hoard rows it cannot run, starving its peers, so the claim path is gated
/// on an actually-free slot.
pub struct ExecutorPool {
    slots: Arc<Semaphore>,
    limit: u32,
}

impl ExecutorPool {
    pub fn new(slots: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(slots)),
            limit: slots as u32,
        }
    }

    pub fn try_acquire(&self) -> Option<ExecutorSlot> {
        Arc::clone(&self.slots).try_acquire_owned().ok()
    }

    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    pub fn limit(&self) -> usize {
        self.limit as usize
    }

    /// Wait until every slot is free again, bounded by `timeout`. Returns
    /// `true` iff the pool went idle in time.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        matches!(
            tokio::time::timeout(timeout, self.slots.acquire_many(self.limit)).await,
            Ok(Ok(_))
        )
    }
}
