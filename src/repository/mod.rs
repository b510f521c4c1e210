//! Durable storage of scheduled executions.
//!
//! Two implementations share the [`ExecutionRepository`] contract: the
//! PostgreSQL store used in production and an in-memory store for tests and
//! single-node embedding. All coordination between competing schedulers
//! reduces to [`pick`](ExecutionRepository::pick) being a single atomic,
//! version-checked state transition.

mod memory;
mod postgres;

pub use memory::InMemoryRepository;
pub use postgres::PostgresRepository;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::execution::{Execution, TaskInstance};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("version conflict for execution {task_instance}: expected version {expected}")]
    VersionConflict {
        task_instance: TaskInstance,
        expected: i64,
    },

    #[error("store row references unregistered task: {0}")]
    UnresolvedTask(String),
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;

/// Store of scheduled executions with atomic claim, release, and reschedule.
///
/// Every mutating operation is conditional on the `version` observed by the
/// caller, so a lost race surfaces as "no rows affected" rather than as a
/// clobbered row. No operation spans more than one store round-trip.
#[async_trait]
pub trait ExecutionRepository: Send + Sync {
    /// Insert a new execution unless one already exists for the same task
    /// instance. Returns `true` iff a row was inserted; concurrent callers
    /// with the same instance produce exactly one insertion.
    async fn create_if_not_exists(&self, execution: Execution) -> RepositoryResult<bool>;

    /// All free executions due at `now`, ascending by `execution_time`,
    /// ties broken by task name then instance id so scans are
    /// deterministic.
    async fn get_due(&self, now: DateTime<Utc>) -> RepositoryResult<Vec<Execution>>;

    /// Atomically claim a free execution for this scheduler. Succeeds only
    /// if the row still exists, is still free, and still carries the
    /// version the caller observed; on success the returned row is claimed,
    /// carries a fresh heartbeat at `time_picked`, and a bumped version.
    /// Returns `None` when another scheduler won the race.
    async fn pick(
        &self,
        execution: &Execution,
        time_picked: DateTime<Utc>,
    ) -> RepositoryResult<Option<Execution>>;

    /// Refresh `last_heartbeat` iff the row is still claimed at the version
    /// the caller holds. A lost claim is not an error; the update just does
    /// not happen.
    async fn update_heartbeat(
        &self,
        execution: &Execution,
        heartbeat_time: DateTime<Utc>,
    ) -> RepositoryResult<()>;

    /// Atomically release the row back to free at `next_execution_time`,
    /// recording terminal-outcome timestamps. Errors with
    /// [`RepositoryError::VersionConflict`] when the caller no longer owns
    /// the claim, since a recurring task must not double-schedule.
    async fn reschedule(
        &self,
        execution: &Execution,
        next_execution_time: DateTime<Utc>,
        last_success: Option<DateTime<Utc>>,
        last_failure: Option<DateTime<Utc>>,
    ) -> RepositoryResult<()>;

    /// Delete the row iff the caller still owns the claim.
    async fn remove(&self, execution: &Execution) -> RepositoryResult<()>;

    /// All claimed executions, any owner, whose heartbeat is at or before
    /// `older_than`, ascending by `execution_time`. Feeds dead-execution
    /// detection.
    async fn get_old_executions(
        &self,
        older_than: DateTime<Utc>,
    ) -> RepositoryResult<Vec<Execution>>;

    /// Executions that have been failing for at least `interval`: the most
    /// recent failure is at least `interval` old and no success is newer
    /// than it. Purely informational; the in-memory store returns an empty
    /// list.
    async fn get_executions_failing_longer_than(
        &self,
        interval: Duration,
    ) -> RepositoryResult<Vec<Execution>>;
}
