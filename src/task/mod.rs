//! The task contract: what user code provides and what it is handed back.

mod helpers;

pub use helpers::{OneTimeTask, RecurringTask};

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::execution::{Execution, TaskInstance};
use crate::repository::{ExecutionRepository, RepositoryResult};
use crate::scheduler::SchedulerState;

/// A named unit of schedulable work plus the policies applied to its rows.
///
/// `execute` is the task body. `on_complete` decides what happens to the row
/// after the body finishes (reschedule, remove); `on_dead_execution` decides
/// how to recover a row whose owning scheduler stopped heartbeating. The
/// ready-made [`OneTimeTask`] and [`RecurringTask`] wrappers cover the
/// common policies.
#[async_trait]
pub trait Task: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, instance: &TaskInstance, context: ExecutionContext) -> Result<()>;

    async fn on_complete(
        &self,
        complete: ExecutionComplete,
        ops: &ExecutionOperations,
    ) -> Result<()>;

    async fn on_dead_execution(
        &self,
        execution: &Execution,
        ops: &ExecutionOperations,
    ) -> Result<()>;
}

/// Just the task body, for use with the ready-made wrappers.
#[async_trait]
pub trait ExecutionHandler: Send + Sync {
    async fn execute(&self, instance: &TaskInstance, context: ExecutionContext) -> Result<()>;
}

/// Handed to every task body. Long-running tasks should poll
/// [`is_shutting_down`](ExecutionContext::is_shutting_down) and wind down
/// cooperatively; nothing force-terminates user code before the shutdown
/// grace period expires.
#[derive(Clone)]
pub struct ExecutionContext {
    state: SchedulerState,
}

impl ExecutionContext {
    pub(crate) fn new(state: SchedulerState) -> Self {
        Self { state }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state.is_shutting_down()
    }

    pub fn scheduler_state(&self) -> &SchedulerState {
        &self.state
    }
}

/// Terminal result of one execution of a task body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionResult {
    Ok,
    Failed,
}

/// Passed to `on_complete`: the claimed row, when the body finished, and how.
#[derive(Debug, Clone)]
pub struct ExecutionComplete {
    pub execution: Execution,
    pub time_done: DateTime<Utc>,
    pub result: ExecutionResult,
}

/// Repository handle scoped to one claimed execution. Completion and
/// dead-execution handlers use it to release the row; both operations are
/// version-checked, so a handler acting on a stale claim fails instead of
/// clobbering another scheduler's row.
pub struct ExecutionOperations {
    repository: Arc<dyn ExecutionRepository>,
    execution: Execution,
}

impl ExecutionOperations {
    pub fn new(repository: Arc<dyn ExecutionRepository>, execution: Execution) -> Self {
        Self {
            repository,
            execution,
        }
    }

    pub fn execution(&self) -> &Execution {
        &self.execution
    }

    /// Delete the row. Ends the lifecycle of a one-shot task.
    pub async fn remove(&self) -> RepositoryResult<()> {
        self.repository.remove(&self.execution).await
    }

    /// Atomically set the row back to free at `next_execution_time`,
    /// recording the given terminal-outcome timestamps.
    pub async fn reschedule(
        &self,
        next_execution_time: DateTime<Utc>,
        last_success: Option<DateTime<Utc>>,
        last_failure: Option<DateTime<Utc>>,
    ) -> RepositoryResult<()> {
        self.repository
            .reschedule(&self.execution, next_execution_time, last_success, last_failure)
            .await
    }
}
