//! Belay - a persistent, cluster-safe task scheduler
//!
//! Any number of scheduler processes share one PostgreSQL store and
//! cooperate so each scheduled execution runs on at most one of them at a
//! time. The key components are:
//!
//! ## Engine
//!
//! - [`Scheduler`]: three cooperating loops (due-polling, dead-execution
//!   detection, heartbeat refresh) over a bounded worker pool
//! - [`SchedulerBuilder`]: configuration surface and assembly
//! - [`SchedulerClient`]: the scheduling handle given to on-startup tasks
//!
//! ## Storage
//!
//! - [`ExecutionRepository`]: the claim/release/reschedule contract all
//!   coordination reduces to
//! - [`PostgresRepository`]: durable store with optimistic version checks
//! - [`InMemoryRepository`]: non-durable twin for tests and single-node use
//!
//! ## Tasks
//!
//! - [`Task`]: task body plus completion and dead-execution policies
//! - [`OneTimeTask`] / [`RecurringTask`]: ready-made policy wrappers

pub mod clock;
pub mod execution;
pub mod repository;
pub mod resolver;
pub mod scheduler;
pub mod stats;
pub mod task;
pub mod waiter;

// Engine
pub use scheduler::{
    ExecutorPool, ExecutorSlot, OnStartup, Scheduler, SchedulerBuilder, SchedulerClient,
    SchedulerState, SHUTDOWN_MAX_WAIT,
};

// Storage
pub use repository::{
    ExecutionRepository, InMemoryRepository, PostgresRepository, RepositoryError, RepositoryResult,
};

// Tasks and the data model
pub use clock::{Clock, SettableClock, SystemClock};
pub use execution::{CurrentlyExecuting, Execution, TaskInstance};
pub use resolver::{OnCannotResolve, TaskResolver};
pub use stats::{CountingStatsRegistry, NoopStatsRegistry, SchedulerStatusSnapshot, StatsRegistry};
pub use task::{
    ExecutionComplete, ExecutionContext, ExecutionHandler, ExecutionOperations, ExecutionResult,
    OneTimeTask, RecurringTask, Task,
};
pub use waiter::Waiter;
