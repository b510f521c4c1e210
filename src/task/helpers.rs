//! Ready-made task kinds covering the common completion and recovery
//! policies.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, warn};

use crate::execution::{Execution, TaskInstance};

use super::{
    ExecutionComplete, ExecutionContext, ExecutionHandler, ExecutionOperations, ExecutionResult,
    Task,
};

/// A task that runs once and is then deleted, whatever the outcome.
///
/// If the owning scheduler dies mid-run the execution is dropped rather than
/// retried; callers that want retry semantics should implement [`Task`]
/// directly with a rescheduling dead-execution handler.
pub struct OneTimeTask<H> {
    name: String,
    handler: H,
}

impl<H: ExecutionHandler> OneTimeTask<H> {
    pub fn new(name: impl Into<String>, handler: H) -> Self {
        Self {
            name: name.into(),
            handler,
        }
    }
}

#[async_trait]
impl<H: ExecutionHandler> Task for OneTimeTask<H> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, instance: &TaskInstance, context: ExecutionContext) -> Result<()> {
        self.handler.execute(instance, context).await
    }

    async fn on_complete(
        &self,
        complete: ExecutionComplete,
        ops: &ExecutionOperations,
    ) -> Result<()> {
        if complete.result == ExecutionResult::Failed {
            warn!(execution = %complete.execution, "one-time task failed; removing anyway");
        }
        ops.remove().await?;
        Ok(())
    }

    async fn on_dead_execution(
        &self,
        execution: &Execution,
        ops: &ExecutionOperations,
    ) -> Result<()> {
        warn!(execution = %execution, "one-time task died without completing; marking failed and removing");
        ops.remove().await?;
        Ok(())
    }
}

/// A task re-run forever on a fixed delay, measured from completion.
pub struct RecurringTask<H> {
    name: String,
    fixed_delay: Duration,
    handler: H,
}

impl<H: ExecutionHandler> RecurringTask<H> {
    pub fn new(name: impl Into<String>, fixed_delay: Duration, handler: H) -> Self {
        Self {
            name: name.into(),
            fixed_delay,
            handler,
        }
    }

    pub fn fixed_delay(&self) -> Duration {
        self.fixed_delay
    }
}

#[async_trait]
impl<H: ExecutionHandler> Task for RecurringTask<H> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, instance: &TaskInstance, context: ExecutionContext) -> Result<()> {
        self.handler.execute(instance, context).await
    }

    async fn on_complete(
        &self,
        complete: ExecutionComplete,
        ops: &ExecutionOperations,
    ) -> Result<()> {
        let next = complete.time_done
            + chrono::Duration::from_std(self.fixed_delay).unwrap_or(chrono::Duration::MAX);
        let (last_success, last_failure) = match complete.result {
            ExecutionResult::Ok => (Some(complete.time_done), complete.execution.last_failure),
            ExecutionResult::Failed => (complete.execution.last_success, Some(complete.time_done)),
        };
        debug!(execution = %complete.execution, next = %next, "rescheduling recurring task");
        ops.reschedule(next, last_success, last_failure).await?;
        Ok(())
    }

    async fn on_dead_execution(
        &self,
        execution: &Execution,
        ops: &ExecutionOperations,
    ) -> Result<()> {
        warn!(execution = %execution, "recurring task died; rescheduling to run now");
        ops.reschedule(Utc::now(), execution.last_success, execution.last_failure)
            .await?;
        Ok(())
    }
}
