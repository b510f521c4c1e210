//! Error counters and status snapshots.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Sink for unexpected-error counts.
///
/// Every caught-and-logged error in a loop or callback registers here, so an
/// external metrics backend can alarm on a scheduler that is limping along.
pub trait StatsRegistry: Send + Sync {
    fn register_unexpected_error(&self);
}

/// Registry that discards everything. The default.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStatsRegistry;

impl StatsRegistry for NoopStatsRegistry {
    fn register_unexpected_error(&self) {}
}

/// Registry backed by an atomic counter, readable in-process.
#[derive(Debug, Default)]
pub struct CountingStatsRegistry {
    unexpected_errors: AtomicU64,
}

impl CountingStatsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unexpected_errors(&self) -> u64 {
        self.unexpected_errors.load(Ordering::Relaxed)
    }
}

impl StatsRegistry for CountingStatsRegistry {
    fn register_unexpected_error(&self) {
        self.unexpected_errors.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time view of a scheduler, suitable for status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatusSnapshot {
    pub scheduler_name: String,
    pub currently_executing: usize,
    pub available_executor_slots: usize,
    pub shutting_down: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counting_registry() {
        let stats = CountingStatsRegistry::new();
        assert_eq!(stats.unexpected_errors(), 0);
        stats.register_unexpected_error();
        stats.register_unexpected_error();
        assert_eq!(stats.unexpected_errors(), 2);
    }
}
