//! The scheduled-execution data model.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

/// Identity of a concrete piece of scheduled work: the task's registered
/// name plus an instance id chosen by the caller. The pair is globally
/// unique while an execution for it is scheduled.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct TaskInstance {
    pub task_name: String,
    pub instance_id: String,
}

impl TaskInstance {
    pub fn new(task_name: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            task_name: task_name.into(),
            instance_id: instance_id.into(),
        }
    }
}

impl fmt::Display for TaskInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.task_name, self.instance_id)
    }
}

/// One scheduled occurrence of a task instance.
///
/// A row is *free* (`picked = false`, no owner, no heartbeat) or *claimed*
/// (`picked = true`, `picked_by` and `last_heartbeat` set). `version` is
/// bumped by every claiming or releasing update and guards all conditional
/// writes in the repository.
#[derive(Debug, Clone, Serialize)]
pub struct Execution {
    pub task_instance: TaskInstance,
    pub execution_time: DateTime<Utc>,
    pub picked: bool,
    pub picked_by: Option<String>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub version: i64,
}

impl Execution {
    /// A fresh free row due at `execution_time`.
    pub fn new(execution_time: DateTime<Utc>, task_instance: TaskInstance) -> Self {
        Self {
            task_instance,
            execution_time,
            picked: false,
            picked_by: None,
            last_heartbeat: None,
            last_success: None,
            last_failure: None,
            version: 1,
        }
    }
}

impl fmt::Display for Execution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} at {} (version {})",
            self.task_instance, self.execution_time, self.version
        )
    }
}

/// In-memory record of an execution a worker slot is currently running.
/// Created at claim, dropped when the worker releases; the heartbeat loop
/// iterates a snapshot of these.
#[derive(Debug, Clone)]
pub struct CurrentlyExecuting {
    pub execution: Execution,
    pub started_at: DateTime<Utc>,
}

impl CurrentlyExecuting {
    pub fn new(execution: Execution, started_at: DateTime<Utc>) -> Self {
        Self {
            execution,
            started_at,
        }
    }

    pub fn running_for(&self, now: DateTime<Utc>) -> Duration {
        now - self.started_at
    }
}
