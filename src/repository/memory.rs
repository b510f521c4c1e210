//! Non-durable repository for tests and single-node embedding.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::execution::{Execution, TaskInstance};

use super::{ExecutionRepository, RepositoryError, RepositoryResult};

/// In-memory implementation of [`ExecutionRepository`].
///
/// The single mutex makes every operation atomic, which is exactly the
/// per-row atomicity the contract asks for. Several handles created with
/// [`for_scheduler`](InMemoryRepository::for_scheduler) can share one
/// backing store, so multi-scheduler claim races are testable in-process.
pub struct InMemoryRepository {
    scheduler_name: String,
    executions: Arc<Mutex<HashMap<TaskInstance, Execution>>>,
}

impl InMemoryRepository {
    pub fn new(scheduler_name: impl Into<String>) -> Self {
        Self {
            scheduler_name: scheduler_name.into(),
            executions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Another scheduler's view of the same backing store.
    pub fn for_scheduler(&self, scheduler_name: impl Into<String>) -> Self {
        Self {
            scheduler_name: scheduler_name.into(),
            executions: Arc::clone(&self.executions),
        }
    }

    /// Current row for a task instance, if any. Test and diagnostic helper.
    pub fn get(&self, task_instance: &TaskInstance) -> Option<Execution> {
        self.executions
            .lock()
            .expect("executions lock")
            .get(task_instance)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.executions.lock().expect("executions lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn sorted_by_time(mut executions: Vec<Execution>) -> Vec<Execution> {
    executions.sort_by(|a, b| {
        a.execution_time
            .cmp(&b.execution_time)
            .then_with(|| a.task_instance.task_name.cmp(&b.task_instance.task_name))
            .then_with(|| a.task_instance.instance_id.cmp(&b.task_instance.instance_id))
    });
    executions
}

#[async_trait]
impl ExecutionRepository for InMemoryRepository {
    async fn create_if_not_exists(&self, execution: Execution) -> RepositoryResult<bool> {
        let mut executions = self.executions.lock().expect("executions lock");
        if executions.contains_key(&execution.task_instance) {
            debug!(execution = %execution, "execution already scheduled; not adding duplicate");
            return Ok(false);
        }
        executions.insert(execution.task_instance.clone(), execution);
        Ok(true)
    }

    async fn get_due(&self, now: DateTime<Utc>) -> RepositoryResult<Vec<Execution>> {
        let executions = self.executions.lock().expect("executions lock");
        let due = executions
            .values()
            .filter(|e| !e.picked && e.execution_time <= now)
            .cloned()
            .collect();
        Ok(sorted_by_time(due))
    }

    async fn pick(
        &self,
        execution: &Execution,
        time_picked: DateTime<Utc>,
    ) -> RepositoryResult<Option<Execution>> {
        let mut executions = self.executions.lock().expect("executions lock");
        let Some(row) = executions.get_mut(&execution.task_instance) else {
            return Ok(None);
        };
        if row.picked || row.version != execution.version {
            debug!(execution = %execution, "pick lost: row already claimed or changed");
            return Ok(None);
        }
        row.picked = true;
        row.picked_by = Some(self.scheduler_name.clone());
        row.last_heartbeat = Some(time_picked);
        row.version += 1;
        Ok(Some(row.clone()))
    }

    async fn update_heartbeat(
        &self,
        execution: &Execution,
        heartbeat_time: DateTime<Utc>,
    ) -> RepositoryResult<()> {
        let mut executions = self.executions.lock().expect("executions lock");
        match executions.get_mut(&execution.task_instance) {
            Some(row) if row.picked && row.version == execution.version => {
                row.last_heartbeat = Some(heartbeat_time);
            }
            _ => {
                debug!(execution = %execution, "heartbeat skipped: execution no longer claimed at this version");
            }
        }
        Ok(())
    }

    async fn reschedule(
        &self,
        execution: &Execution,
        next_execution_time: DateTime<Utc>,
        last_success: Option<DateTime<Utc>>,
        last_failure: Option<DateTime<Utc>>,
    ) -> RepositoryResult<()> {
        let mut executions = self.executions.lock().expect("executions lock");
        match executions.get_mut(&execution.task_instance) {
            Some(row) if row.version == execution.version => {
                row.picked = false;
                row.picked_by = None;
                row.last_heartbeat = None;
                row.execution_time = next_execution_time;
                row.last_success = last_success;
                row.last_failure = last_failure;
                row.version += 1;
                Ok(())
            }
            _ => Err(RepositoryError::VersionConflict {
                task_instance: execution.task_instance.clone(),
                expected: execution.version,
            }),
        }
    }

    async fn remove(&self, execution: &Execution) -> RepositoryResult<()> {
        let mut executions = self.executions.lock().expect("executions lock");
        match executions.get(&execution.task_instance) {
            Some(row) if row.version == execution.version => {
                executions.remove(&execution.task_instance);
                Ok(())
            }
            _ => Err(RepositoryError::VersionConflict {
                task_instance: execution.task_instance.clone(),
                expected: execution.version,
            }),
        }
    }

    async fn get_old_executions(
        &self,
        older_than: DateTime<Utc>,
    ) -> RepositoryResult<Vec<Execution>> {
        let executions = self.executions.lock().expect("executions lock");
        let old = executions
            .values()
            .filter(|e| e.picked && e.last_heartbeat.is_some_and(|hb| hb <= older_than))
            .cloned()
            .collect();
        Ok(sorted_by_time(old))
    }

    async fn get_executions_failing_longer_than(
        &self,
        _interval: Duration,
    ) -> RepositoryResult<Vec<Execution>> {
        // Failure history is not tracked in memory.
        Ok(Vec::new())
    }
}
