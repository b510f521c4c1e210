//! Task name resolution.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use crate::task::Task;

/// Policy for store rows whose task name has no registered handler.
///
/// Under `WarnAndSkip` (the default) such rows are left in place, logged,
/// and excluded from due and dead scans; under `Fail` a scan that meets one
/// errors out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnCannotResolve {
    #[default]
    WarnAndSkip,
    Fail,
}

/// Immutable registry mapping task names to their handlers. Built once at
/// scheduler construction.
pub struct TaskResolver {
    policy: OnCannotResolve,
    tasks: HashMap<String, Arc<dyn Task>>,
}

impl TaskResolver {
    pub fn new(policy: OnCannotResolve, known_tasks: Vec<Arc<dyn Task>>) -> Self {
        let mut tasks: HashMap<String, Arc<dyn Task>> = HashMap::new();
        for task in known_tasks {
            let name = task.name().to_string();
            if tasks.insert(name.clone(), task).is_some() {
                warn!(task_name = %name, "duplicate task registration; last one wins");
            }
        }
        Self { policy, tasks }
    }

    pub fn policy(&self) -> OnCannotResolve {
        self.policy
    }

    pub fn resolve(&self, task_name: &str) -> Option<Arc<dyn Task>> {
        self.tasks.get(task_name).cloned()
    }

    pub fn can_resolve(&self, task_name: &str) -> bool {
        self.tasks.contains_key(task_name)
    }

    pub fn task_names(&self) -> impl Iterator<Item = &str> {
        self.tasks.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use async_trait::async_trait;

    use super::*;
    use crate::execution::{Execution, TaskInstance};
    use crate::task::{ExecutionComplete, ExecutionContext, ExecutionOperations, Task};

    struct NamedTask(&'static str);

    #[async_trait]
    impl Task for NamedTask {
        fn name(&self) -> &str {
            self.0
        }

        async fn execute(&self, _instance: &TaskInstance, _context: ExecutionContext) -> Result<()> {
            Ok(())
        }

        async fn on_complete(
            &self,
            _complete: ExecutionComplete,
            _ops: &ExecutionOperations,
        ) -> Result<()> {
            Ok(())
        }

        async fn on_dead_execution(
            &self,
            _execution: &Execution,
            _ops: &ExecutionOperations,
        ) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_resolves_registered_tasks() {
        let resolver = TaskResolver::new(
            OnCannotResolve::WarnAndSkip,
            vec![Arc::new(NamedTask("alpha")), Arc::new(NamedTask("beta"))],
        );

        assert!(resolver.can_resolve("alpha"));
        assert!(resolver.resolve("beta").is_some());
        assert!(resolver.resolve("gamma").is_none());
        assert!(!resolver.can_resolve("gamma"));
    }

    #[test]
    fn test_duplicate_registration_keeps_last() {
        let resolver = TaskResolver::new(
            OnCannotResolve::WarnAndSkip,
            vec![Arc::new(NamedTask("alpha")), Arc::new(NamedTask("alpha"))],
        );
        assert_eq!(resolver.task_names().count(), 1);
    }

    #[test]
    fn test_default_policy_is_warn_and_skip() {
        assert_eq!(OnCannotResolve::default(), OnCannotResolve::WarnAndSkip);
    }
}
