//! Process-wide scheduler flags.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared `{running, shutting_down}` flags. The lifecycle is the only
/// writer; the loops and task execution contexts are readers.
#[derive(Debug, Clone, Default)]
pub struct SchedulerState {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    running: AtomicBool,
    shutting_down: AtomicBool,
}

impl SchedulerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Relaxed)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::Relaxed)
    }

    pub(crate) fn set_running(&self) {
        self.inner.running.store(true, Ordering::Relaxed);
    }

    pub(crate) fn set_shutting_down(&self) {
        self.inner.shutting_down.store(true, Ordering::Relaxed);
    }
}
