//! The scheduler engine: due-polling, dead-execution detection, heartbeat
//! refresh, and the lifecycle that ties them together.
//!
//! Three long-running loops share one [`SchedulerState`] and one bounded
//! [`ExecutorPool`]. The due loop claims eligible rows through the
//! repository's atomic `pick` and hands them to worker slots; the heartbeat
//! loop keeps claimed rows visibly alive; the dead loop recovers rows whose
//! owner went quiet. Shutdown is cooperative throughout.

mod pool;
mod state;

pub use pool::{ExecutorPool, ExecutorSlot};
pub use state::SchedulerState;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::clock::{Clock, SystemClock};
use crate::execution::{CurrentlyExecuting, Execution, TaskInstance};
use crate::repository::{ExecutionRepository, PostgresRepository, RepositoryResult};
use crate::resolver::{OnCannotResolve, TaskResolver};
use crate::stats::{NoopStatsRegistry, SchedulerStatusSnapshot, StatsRegistry};
use crate::task::{ExecutionComplete, ExecutionContext, ExecutionOperations, ExecutionResult};
use crate::waiter::Waiter;

/// How long `stop` waits for in-flight task bodies by default.
pub const SHUTDOWN_MAX_WAIT: Duration = Duration::from_secs(30 * 60);

/// How long `stop` waits for each control loop to exit.
const LOOP_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Scheduling surface handed to on-startup tasks (and usable by anything
/// else holding a scheduler reference).
#[async_trait]
pub trait SchedulerClient: Send + Sync {
    /// Durably record that `task_instance` should run at `execution_time`.
    /// Idempotent per instance; returns whether a new execution was created.
    async fn schedule(
        &self,
        execution_time: DateTime<Utc>,
        task_instance: TaskInstance,
    ) -> RepositoryResult<bool>;
}

/// Work to run synchronously when the scheduler starts, before the loops
/// launch. Typically seeds recurring executions.
#[async_trait]
pub trait OnStartup: Send + Sync {
    async fn on_startup(&self, client: &dyn SchedulerClient) -> Result<()>;
}

struct SchedulerCore {
    scheduler_name: String,
    clock: Arc<dyn Clock>,
    repository: Arc<dyn ExecutionRepository>,
    resolver: Arc<TaskResolver>,
    pool: ExecutorPool,
    heartbeat_interval: Duration,
    currently_processing: Mutex<HashMap<TaskInstance, CurrentlyExecuting>>,
    state: SchedulerState,
    stats: Arc<dyn StatsRegistry>,
}

impl SchedulerCore {
    fn max_age_before_considered_dead(&self) -> Duration {
        self.heartbeat_interval * 4
    }

    /// One due-polling pass: claim as many due executions as there are free
    /// slots, in execution-time order, and dispatch them.
    async fn execute_due(core: &Arc<Self>) -> RepositoryResult<()> {
        if core.pool.available() == 0 {
            return Ok(());
        }

        let now = core.clock.now();
        let due = core.repository.get_due(now).await?;
        trace!(count = due.len(), "found executions due to run");

        for (index, execution) in due.iter().enumerate() {
            if core.state.is_shutting_down() {
                info!(
                    skipped = due.len() - index,
                    "scheduler is shutting down; skipping remaining due executions"
                );
                return Ok(());
            }

            let Some(slot) = core.pool.try_acquire() else {
                debug!(
                    skipped = due.len() - index,
                    "no executor slots available; deferring remaining due executions"
                );
                return Ok(());
            };

            // The slot is held across the pick so a claim is only made when
            // it can actually run here; if the pick loses or errors the slot
            // drops and frees itself.
            match core.repository.pick(execution, core.clock.now()).await? {
                Some(picked) => {
                    let started_at = core.clock.now();
                    core.currently_processing
                        .lock()
                        .expect("currently-processing lock")
                        .insert(
                            picked.task_instance.clone(),
                            CurrentlyExecuting::new(picked.clone(), started_at),
                        );
                    Self::spawn_worker(Arc::clone(core), picked, slot);
                }
                None => {
                    debug!(execution = %execution, "execution picked by another scheduler; continuing");
                }
            }
        }
        Ok(())
    }

    fn spawn_worker(core: Arc<Self>, execution: Execution, slot: ExecutorSlot) {
        tokio::spawn(async move {
            Self::run_execution(&core, &execution).await;

            drop(slot);
            let removed = core
                .currently_processing
                .lock()
                .expect("currently-processing lock")
                .remove(&execution.task_instance);
            if removed.is_none() {
                error!(execution = %execution, "released execution was missing from the currently-processing set");
                core.stats.register_unexpected_error();
            }
        });
    }

    /// Run the task body and then its completion handler. The body runs in
    /// its own spawned task so that a panic is contained and still produces
    /// a `Failed` terminal result.
    async fn run_execution(core: &Arc<Self>, execution: &Execution) {
        let Some(task) = core.resolver.resolve(&execution.task_instance.task_name) else {
            // get_due filters unresolved names, so a picked row always
            // resolves unless the registry and store disagree badly.
            error!(execution = %execution, "picked execution references an unregistered task");
            core.stats.register_unexpected_error();
            return;
        };

        debug!(execution = %execution, "executing");
        let body = {
            let task = Arc::clone(&task);
            let instance = execution.task_instance.clone();
            let context = ExecutionContext::new(core.state.clone());
            tokio::spawn(async move { task.execute(&instance, context).await })
        };

        let result = match body.await {
            Ok(Ok(())) => {
                debug!(execution = %execution, "execution done");
                ExecutionResult::Ok
            }
            Ok(Err(error)) => {
                warn!(execution = %execution, %error, "unhandled task error; treating as failure");
                ExecutionResult::Failed
            }
            Err(join_error) if join_error.is_panic() => {
                error!(execution = %execution, "task body panicked; treating as failure");
                ExecutionResult::Failed
            }
            Err(_) => {
                error!(execution = %execution, "task body was aborted; treating as failure");
                ExecutionResult::Failed
            }
        };

        let complete = ExecutionComplete {
            execution: execution.clone(),
            time_done: core.clock.now(),
            result,
        };
        let ops = ExecutionOperations::new(Arc::clone(&core.repository), execution.clone());
        if let Err(error) = task.on_complete(complete, &ops).await {
            core.stats.register_unexpected_error();
            error!(
                execution = %execution,
                %error,
                "completion handler failed; execution stays claimed and will be recovered as dead after {:?}",
                core.max_age_before_considered_dead()
            );
        }
    }

    /// One dead-detection pass: hand every claimed row with a lapsed
    /// heartbeat to its task's dead-execution handler.
    async fn detect_dead_executions(&self) -> RepositoryResult<()> {
        debug!("checking for dead executions");
        let now = self.clock.now();
        let old_age_limit = now - chrono_interval(self.max_age_before_considered_dead());
        let old_executions = self.repository.get_old_executions(old_age_limit).await?;

        if old_executions.is_empty() {
            trace!("no dead executions found");
            return Ok(());
        }

        for execution in old_executions {
            info!(execution = %execution, "found dead execution; delegating handling to task");
            let Some(task) = self.resolver.resolve(&execution.task_instance.task_name) else {
                warn!(execution = %execution, "dead execution references an unregistered task; leaving in place");
                continue;
            };
            let ops = ExecutionOperations::new(Arc::clone(&self.repository), execution.clone());
            if let Err(error) = task.on_dead_execution(&execution, &ops).await {
                error!(execution = %execution, %error, "dead-execution handler failed; will be tried again later");
                self.stats.register_unexpected_error();
            }
        }
        Ok(())
    }

    /// One heartbeat pass over a snapshot of the currently-running set.
    async fn update_heartbeats(&self) -> RepositoryResult<()> {
        let snapshot: Vec<Execution> = self
            .currently_processing
            .lock()
            .expect("currently-processing lock")
            .values()
            .map(|current| current.execution.clone())
            .collect();

        if snapshot.is_empty() {
            trace!("no executions to update heartbeats for");
            return Ok(());
        }

        debug!(count = snapshot.len(), "updating heartbeats");
        let now = self.clock.now();
        for execution in snapshot {
            trace!(execution = %execution, "updating heartbeat");
            if let Err(error) = self.repository.update_heartbeat(&execution, now).await {
                error!(execution = %execution, %error, "failed updating heartbeat; will try again later");
                self.stats.register_unexpected_error();
            }
        }
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum SchedulerLoop {
    Due,
    DetectDead,
    Heartbeat,
}

impl SchedulerLoop {
    fn name(self) -> &'static str {
        match self {
            Self::Due => "execute-due",
            Self::DetectDead => "detect-dead",
            Self::Heartbeat => "update-heartbeat",
        }
    }
}

/// Run one loop until shutdown: tick, log-and-count failures, wait.
/// The flag is checked both before and after the tick so a shutdown issued
/// mid-tick skips the final sleep.
async fn run_until_shutdown(core: Arc<SchedulerCore>, waiter: Arc<Waiter>, which: SchedulerLoop) {
    loop {
        if core.state.is_shutting_down() {
            break;
        }

        let tick = match which {
            SchedulerLoop::Due => SchedulerCore::execute_due(&core).await,
            SchedulerLoop::DetectDead => core.detect_dead_executions().await,
            SchedulerLoop::Heartbeat => core.update_heartbeats().await,
        };
        if let Err(error) = tick {
            error!(name = which.name(), %error, "unhandled error in scheduler loop; will keep running");
            core.stats.register_unexpected_error();
        }

        if core.state.is_shutting_down() {
            break;
        }
        if waiter.wait().await {
            debug!(name = which.name(), "loop woken early");
        }
    }
    debug!(name = which.name(), "scheduler loop stopped");
}

/// A cluster-safe scheduler instance.
///
/// Construct through [`Scheduler::builder`], then [`start`](Scheduler::start)
/// it. Any number of instances may share one store; the repository's claim
/// protocol guarantees each execution runs on at most one of them at a time.
pub struct Scheduler {
    core: Arc<SchedulerCore>,
    start_tasks: Vec<Arc<dyn OnStartup>>,
    due_waiter: Arc<Waiter>,
    detect_dead_waiter: Arc<Waiter>,
    heartbeat_waiter: Arc<Waiter>,
    shutdown_max_wait: Duration,
    loop_handles: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl Scheduler {
    pub fn builder(known_tasks: Vec<Arc<dyn crate::task::Task>>) -> SchedulerBuilder {
        SchedulerBuilder::new(known_tasks)
    }

    /// Run the on-startup tasks, then launch the three loops.
    pub async fn start(&self) {
        if self.core.state.is_running() {
            warn!("scheduler already started; ignoring");
            return;
        }
        info!(scheduler_name = %self.core.scheduler_name, "starting scheduler");

        for task in &self.start_tasks {
            if let Err(error) = task.on_startup(self).await {
                error!(%error, "on-startup task failed; continuing");
                self.core.stats.register_unexpected_error();
            }
        }

        self.core.state.set_running();
        let mut handles = self.loop_handles.lock().expect("loop-handles lock");
        for (which, waiter) in [
            (SchedulerLoop::Due, &self.due_waiter),
            (SchedulerLoop::DetectDead, &self.detect_dead_waiter),
            (SchedulerLoop::Heartbeat, &self.heartbeat_waiter),
        ] {
            handles.push((
                which.name(),
                tokio::spawn(run_until_shutdown(
                    Arc::clone(&self.core),
                    Arc::clone(waiter),
                    which,
                )),
            ));
        }
    }

    /// Cooperative shutdown: stop the loops promptly, then let in-flight
    /// task bodies finish within the long grace period.
    pub async fn stop(&self) {
        self.core.state.set_shutting_down();
        info!("shutting down scheduler");

        self.due_waiter.wake();
        self.detect_dead_waiter.wake();
        self.heartbeat_waiter.wake();

        let handles: Vec<_> = {
            let mut guard = self.loop_handles.lock().expect("loop-handles lock");
            guard.drain(..).collect()
        };
        for (name, handle) in handles {
            if tokio::time::timeout(LOOP_SHUTDOWN_GRACE, handle).await.is_err() {
                warn!(name, "scheduler loop did not stop within the grace period");
            }
        }

        info!(
            "letting running executions finish; will wait up to {:?}",
            self.shutdown_max_wait
        );
        if self.core.pool.wait_idle(self.shutdown_max_wait).await {
            info!("scheduler stopped");
        } else {
            let still_running: Vec<String> = self
                .currently_executing()
                .iter()
                .map(|current| current.execution.to_string())
                .collect();
            warn!(
                executions = ?still_running,
                "scheduler stopped, but some executions did not complete"
            );
        }
    }

    /// Snapshot of the executions this instance is running right now.
    pub fn currently_executing(&self) -> Vec<CurrentlyExecuting> {
        self.core
            .currently_processing
            .lock()
            .expect("currently-processing lock")
            .values()
            .cloned()
            .collect()
    }

    /// Executions that have been failing for at least `failing_at_least_for`.
    pub async fn failing_executions(
        &self,
        failing_at_least_for: Duration,
    ) -> RepositoryResult<Vec<Execution>> {
        self.core
            .repository
            .get_executions_failing_longer_than(failing_at_least_for)
            .await
    }

    pub fn status(&self) -> SchedulerStatusSnapshot {
        SchedulerStatusSnapshot {
            scheduler_name: self.core.scheduler_name.clone(),
            currently_executing: self
                .core
                .currently_processing
                .lock()
                .expect("currently-processing lock")
                .len(),
            available_executor_slots: self.core.pool.available(),
            shutting_down: self.core.state.is_shutting_down(),
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.core.state.clone()
    }

    /// Run a single due-polling pass immediately, outside the loop cadence.
    pub async fn check_due(&self) -> RepositoryResult<()> {
        SchedulerCore::execute_due(&self.core).await
    }

    /// Run a single dead-detection pass immediately.
    pub async fn detect_dead_executions(&self) -> RepositoryResult<()> {
        self.core.detect_dead_executions().await
    }

    /// Run a single heartbeat pass immediately.
    pub async fn update_heartbeats(&self) -> RepositoryResult<()> {
        self.core.update_heartbeats().await
    }
}

#[async_trait]
impl SchedulerClient for Scheduler {
    async fn schedule(
        &self,
        execution_time: DateTime<Utc>,
        task_instance: TaskInstance,
    ) -> RepositoryResult<bool> {
        self.core
            .repository
            .create_if_not_exists(Execution::new(execution_time, task_instance))
            .await
    }
}

/// Configuration surface for [`Scheduler`].
pub struct SchedulerBuilder {
    scheduler_name: Option<String>,
    executor_threads: usize,
    polling_interval: Duration,
    heartbeat_interval: Duration,
    on_cannot_resolve: OnCannotResolve,
    known_tasks: Vec<Arc<dyn crate::task::Task>>,
    start_tasks: Vec<Arc<dyn OnStartup>>,
    stats_registry: Arc<dyn StatsRegistry>,
    shutdown_max_wait: Duration,
}

impl SchedulerBuilder {
    pub fn new(known_tasks: Vec<Arc<dyn crate::task::Task>>) -> Self {
        Self {
            scheduler_name: None,
            executor_threads: 10,
            polling_interval: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(5 * 60),
            on_cannot_resolve: OnCannotResolve::default(),
            known_tasks,
            start_tasks: Vec::new(),
            stats_registry: Arc::new(NoopStatsRegistry),
            shutdown_max_wait: SHUTDOWN_MAX_WAIT,
        }
    }

    /// Name written as `picked_by` on every claim. Defaults to the
    /// `HOSTNAME` environment variable, falling back to the process id.
    pub fn scheduler_name(mut self, name: impl Into<String>) -> Self {
        self.scheduler_name = Some(name.into());
        self
    }

    pub fn executor_threads(mut self, threads: usize) -> Self {
        self.executor_threads = threads;
        self
    }

    pub fn polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = interval;
        self
    }

    /// Heartbeat period. Dead detection runs at twice this period and
    /// considers a claim dead after four times this period.
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn on_cannot_resolve(mut self, policy: OnCannotResolve) -> Self {
        self.on_cannot_resolve = policy;
        self
    }

    /// Register a task that both handles executions and seeds work on
    /// startup.
    pub fn start_task<T>(mut self, task: Arc<T>) -> Self
    where
        T: crate::task::Task + OnStartup + 'static,
    {
        self.known_tasks.push(task.clone());
        self.start_tasks.push(task);
        self
    }

    pub fn stats_registry(mut self, stats: Arc<dyn StatsRegistry>) -> Self {
        self.stats_registry = stats;
        self
    }

    pub fn shutdown_max_wait(mut self, wait: Duration) -> Self {
        self.shutdown_max_wait = wait;
        self
    }

    /// Connect to PostgreSQL, run migrations, and assemble the scheduler.
    pub async fn build(self, database_url: &str) -> RepositoryResult<Scheduler> {
        let resolver = Arc::new(TaskResolver::new(
            self.on_cannot_resolve,
            self.known_tasks.clone(),
        ));
        let scheduler_name = self
            .scheduler_name
            .clone()
            .unwrap_or_else(default_scheduler_name);
        let repository = Arc::new(
            PostgresRepository::connect(database_url, Arc::clone(&resolver), scheduler_name.clone())
                .await?,
        );
        Ok(self.assemble(repository, Arc::new(SystemClock), resolver, scheduler_name))
    }

    /// Run migrations on an existing pool and assemble the scheduler.
    pub async fn build_with_pool(self, pool: PgPool) -> RepositoryResult<Scheduler> {
        let resolver = Arc::new(TaskResolver::new(
            self.on_cannot_resolve,
            self.known_tasks.clone(),
        ));
        let scheduler_name = self
            .scheduler_name
            .clone()
            .unwrap_or_else(default_scheduler_name);
        let repository = Arc::new(
            PostgresRepository::migrate(pool, Arc::clone(&resolver), scheduler_name.clone()).await?,
        );
        Ok(self.assemble(repository, Arc::new(SystemClock), resolver, scheduler_name))
    }

    /// Assemble around any repository and clock: the in-memory store, a
    /// test clock, or a custom durable store.
    pub fn build_with_repository(
        self,
        repository: Arc<dyn ExecutionRepository>,
        clock: Arc<dyn Clock>,
    ) -> Scheduler {
        let resolver = Arc::new(TaskResolver::new(
            self.on_cannot_resolve,
            self.known_tasks.clone(),
        ));
        let scheduler_name = self
            .scheduler_name
            .clone()
            .unwrap_or_else(default_scheduler_name);
        self.assemble(repository, clock, resolver, scheduler_name)
    }

    fn assemble(
        self,
        repository: Arc<dyn ExecutionRepository>,
        clock: Arc<dyn Clock>,
        resolver: Arc<TaskResolver>,
        scheduler_name: String,
    ) -> Scheduler {
        let core = Arc::new(SchedulerCore {
            scheduler_name,
            clock,
            repository,
            resolver,
            pool: ExecutorPool::new(self.executor_threads),
            heartbeat_interval: self.heartbeat_interval,
            currently_processing: Mutex::new(HashMap::new()),
            state: SchedulerState::new(),
            stats: self.stats_registry,
        });
        Scheduler {
            core,
            start_tasks: self.start_tasks,
            due_waiter: Arc::new(Waiter::new(self.polling_interval)),
            detect_dead_waiter: Arc::new(Waiter::new(self.heartbeat_interval * 2)),
            heartbeat_waiter: Arc::new(Waiter::new(self.heartbeat_interval)),
            shutdown_max_wait: self.shutdown_max_wait,
            loop_handles: Mutex::new(Vec::new()),
        }
    }
}

fn default_scheduler_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| format!("scheduler-{}", std::process::id()))
}

fn chrono_interval(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}
