//! End-to-end scheduler scenarios against the in-memory repository.
//!
//! These tests drive the engine tick by tick with a settable clock: claim
//! and dispatch of due work, claim races between schedulers, slot
//! exhaustion, dead-execution recovery, and cooperative shutdown.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::time::sleep;

use belay::{
    Clock, Execution, ExecutionComplete, ExecutionContext, ExecutionHandler, ExecutionOperations,
    ExecutionRepository, InMemoryRepository, OneTimeTask, Scheduler, SchedulerClient,
    SettableClock, Task, TaskInstance,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

async fn wait_until(mut condition: impl FnMut() -> bool, what: &str) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Counts invocations, then blocks until a permit is added to the gate.
struct GatedHandler {
    invocations: Arc<AtomicU32>,
    gate: Arc<Semaphore>,
}

#[async_trait]
impl ExecutionHandler for GatedHandler {
    async fn execute(&self, _instance: &TaskInstance, _context: ExecutionContext) -> Result<()> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let permit = self.gate.acquire().await?;
        permit.forget();
        Ok(())
    }
}

/// Counts invocations and returns immediately.
struct CountingHandler {
    invocations: Arc<AtomicU32>,
}

#[async_trait]
impl ExecutionHandler for CountingHandler {
    async fn execute(&self, _instance: &TaskInstance, _context: ExecutionContext) -> Result<()> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn test_single_due_execution_runs_once_and_is_removed() {
    init_tracing();
    let clock = Arc::new(SettableClock::new(Utc::now()));
    let repository = Arc::new(InMemoryRepository::new("sched-1"));
    let invocations = Arc::new(AtomicU32::new(0));
    let gate = Arc::new(Semaphore::new(0));

    let task: Arc<dyn Task> = Arc::new(OneTimeTask::new(
        "single",
        GatedHandler {
            invocations: Arc::clone(&invocations),
            gate: Arc::clone(&gate),
        },
    ));
    let scheduler = Scheduler::builder(vec![task])
        .scheduler_name("sched-1")
        .executor_threads(2)
        .build_with_repository(repository.clone(), clock.clone());

    let instance = TaskInstance::new("single", "1");
    assert!(scheduler
        .schedule(clock.now(), instance.clone())
        .await
        .expect("schedule"));

    scheduler.check_due().await.expect("due tick");

    wait_until(|| scheduler.currently_executing().len() == 1, "claim").await;
    wait_until(|| invocations.load(Ordering::SeqCst) == 1, "invocation").await;
    let row = repository.get(&instance).expect("row");
    assert!(row.picked);
    assert_eq!(row.picked_by.as_deref(), Some("sched-1"));
    assert_eq!(scheduler.status().available_executor_slots, 1);

    gate.add_permits(1);
    wait_until(|| repository.get(&instance).is_none(), "row removal").await;
    wait_until(|| scheduler.currently_executing().is_empty(), "release").await;
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    assert_eq!(scheduler.status().available_executor_slots, 2);
}

#[tokio::test]
async fn test_two_schedulers_claim_one_row_exactly_once() {
    init_tracing();
    let clock = Arc::new(SettableClock::new(Utc::now()));
    let repository_a = Arc::new(InMemoryRepository::new("sched-a"));
    let repository_b = Arc::new(repository_a.for_scheduler("sched-b"));
    let invocations = Arc::new(AtomicU32::new(0));

    let task: Arc<dyn Task> = Arc::new(OneTimeTask::new(
        "contested",
        CountingHandler {
            invocations: Arc::clone(&invocations),
        },
    ));
    let scheduler_a = Scheduler::builder(vec![task.clone()])
        .scheduler_name("sched-a")
        .build_with_repository(repository_a.clone(), clock.clone());
    let scheduler_b = Scheduler::builder(vec![task])
        .scheduler_name("sched-b")
        .build_with_repository(repository_b.clone(), clock.clone());

    let instance = TaskInstance::new("contested", "1");
    scheduler_a
        .schedule(clock.now(), instance.clone())
        .await
        .expect("schedule");

    let (a, b) = tokio::join!(scheduler_a.check_due(), scheduler_b.check_due());
    a.expect("due tick a");
    b.expect("due tick b");

    wait_until(|| repository_a.get(&instance).is_none(), "row removal").await;
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_slot_exhaustion_defers_later_executions() {
    init_tracing();
    let start = Utc::now();
    let clock = Arc::new(SettableClock::new(start));
    let repository = Arc::new(InMemoryRepository::new("sched-1"));
    let invocations = Arc::new(AtomicU32::new(0));
    let gate = Arc::new(Semaphore::new(0));

    let task: Arc<dyn Task> = Arc::new(OneTimeTask::new(
        "slot",
        GatedHandler {
            invocations: Arc::clone(&invocations),
            gate: Arc::clone(&gate),
        },
    ));
    let scheduler = Scheduler::builder(vec![task])
        .scheduler_name("sched-1")
        .executor_threads(1)
        .build_with_repository(repository.clone(), clock.clone());

    let first = TaskInstance::new("slot", "a");
    let second = TaskInstance::new("slot", "b");
    scheduler
        .schedule(start, first.clone())
        .await
        .expect("schedule");
    scheduler
        .schedule(start + chrono::Duration::seconds(1), second.clone())
        .await
        .expect("schedule");

    clock.advance(chrono::Duration::seconds(2));
    scheduler.check_due().await.expect("due tick");

    wait_until(|| scheduler.currently_executing().len() == 1, "claim").await;
    wait_until(|| invocations.load(Ordering::SeqCst) == 1, "invocation").await;
    // The earlier execution won the single slot; the later one is untouched.
    assert!(repository.get(&first).expect("first row").picked);
    assert!(!repository.get(&second).expect("second row").picked);

    gate.add_permits(1);
    wait_until(|| repository.get(&first).is_none(), "first removal").await;

    scheduler.check_due().await.expect("due tick");
    wait_until(|| scheduler.currently_executing().len() == 1, "second claim").await;
    assert!(repository.get(&second).expect("second row").picked);

    gate.add_permits(1);
    wait_until(|| repository.get(&second).is_none(), "second removal").await;
    assert_eq!(invocations.load(Ordering::SeqCst), 2);
}

/// Succeeds immediately; dead-execution recovery reschedules one minute out.
struct RescheduleOnDead {
    clock: Arc<SettableClock>,
    dead_invocations: Arc<AtomicU32>,
}

#[async_trait]
impl Task for RescheduleOnDead {
    fn name(&self) -> &str {
        "watchdogged"
    }

    async fn execute(&self, _instance: &TaskInstance, _context: ExecutionContext) -> Result<()> {
        Ok(())
    }

    async fn on_complete(
        &self,
        _complete: ExecutionComplete,
        ops: &ExecutionOperations,
    ) -> Result<()> {
        ops.remove().await?;
        Ok(())
    }

    async fn on_dead_execution(
        &self,
        execution: &Execution,
        ops: &ExecutionOperations,
    ) -> Result<()> {
        self.dead_invocations.fetch_add(1, Ordering::SeqCst);
        ops.reschedule(
            self.clock.now() + chrono::Duration::minutes(1),
            execution.last_success,
            execution.last_failure,
        )
        .await?;
        Ok(())
    }
}

#[tokio::test]
async fn test_dead_execution_is_recovered_after_heartbeats_stop() {
    init_tracing();
    let start = Utc::now();
    let clock = Arc::new(SettableClock::new(start));
    let repository = Arc::new(InMemoryRepository::new("sched-1"));
    let dead_invocations = Arc::new(AtomicU32::new(0));

    let task: Arc<dyn Task> = Arc::new(RescheduleOnDead {
        clock: clock.clone(),
        dead_invocations: Arc::clone(&dead_invocations),
    });
    let heartbeat_interval = Duration::from_secs(60);
    let scheduler = Scheduler::builder(vec![task])
        .scheduler_name("sched-1")
        .heartbeat_interval(heartbeat_interval)
        .build_with_repository(repository.clone(), clock.clone());

    let instance = TaskInstance::new("watchdogged", "1");
    scheduler
        .schedule(start, instance.clone())
        .await
        .expect("schedule");

    // Claim the row, then never heartbeat again: the owner has died.
    let due = repository.get_due(start).await.expect("due");
    repository
        .pick(&due[0], start)
        .await
        .expect("pick")
        .expect("picked");

    // One heartbeat short of the threshold: not yet dead.
    clock.advance(chrono::Duration::seconds(3 * 60));
    scheduler.detect_dead_executions().await.expect("dead tick");
    assert_eq!(dead_invocations.load(Ordering::SeqCst), 0);

    clock.advance(chrono::Duration::seconds(60));
    scheduler.detect_dead_executions().await.expect("dead tick");
    assert_eq!(dead_invocations.load(Ordering::SeqCst), 1);

    let row = repository.get(&instance).expect("row");
    assert!(!row.picked);
    assert!(row.picked_by.is_none());
    assert_eq!(row.execution_time, clock.now() + chrono::Duration::minutes(1));
}

#[tokio::test]
async fn test_schedule_is_idempotent_per_instance() {
    init_tracing();
    let clock = Arc::new(SettableClock::new(Utc::now()));
    let repository = Arc::new(InMemoryRepository::new("sched-1"));
    let task: Arc<dyn Task> = Arc::new(OneTimeTask::new(
        "idem",
        CountingHandler {
            invocations: Arc::new(AtomicU32::new(0)),
        },
    ));
    let scheduler = Scheduler::builder(vec![task])
        .scheduler_name("sched-1")
        .build_with_repository(repository.clone(), clock.clone());

    let instance = TaskInstance::new("idem", "1");
    let winner_time = clock.now();
    assert!(scheduler
        .schedule(winner_time, instance.clone())
        .await
        .expect("schedule"));
    assert!(!scheduler
        .schedule(winner_time + chrono::Duration::hours(1), instance.clone())
        .await
        .expect("schedule"));

    let row = repository.get(&instance).expect("row");
    assert_eq!(row.execution_time, winner_time);
}

/// Runs fine, then blows up in its completion handler. Recovery must come
/// from dead detection, not from the worker.
struct FailingCompletion {
    dead_invocations: Arc<AtomicU32>,
}

#[async_trait]
impl Task for FailingCompletion {
    fn name(&self) -> &str {
        "flaky-completion"
    }

    async fn execute(&self, _instance: &TaskInstance, _context: ExecutionContext) -> Result<()> {
        Ok(())
    }

    async fn on_complete(
        &self,
        _complete: ExecutionComplete,
        _ops: &ExecutionOperations,
    ) -> Result<()> {
        Err(anyhow!("completion handler exploded"))
    }

    async fn on_dead_execution(
        &self,
        _execution: &Execution,
        ops: &ExecutionOperations,
    ) -> Result<()> {
        self.dead_invocations.fetch_add(1, Ordering::SeqCst);
        ops.remove().await?;
        Ok(())
    }
}

#[tokio::test]
async fn test_completion_handler_failure_leaves_row_for_dead_detection() {
    init_tracing();
    let start = Utc::now();
    let clock = Arc::new(SettableClock::new(start));
    let repository = Arc::new(InMemoryRepository::new("sched-1"));
    let dead_invocations = Arc::new(AtomicU32::new(0));
    let stats = Arc::new(belay::CountingStatsRegistry::new());

    let task: Arc<dyn Task> = Arc::new(FailingCompletion {
        dead_invocations: Arc::clone(&dead_invocations),
    });
    let scheduler = Scheduler::builder(vec![task])
        .scheduler_name("sched-1")
        .heartbeat_interval(Duration::from_secs(60))
        .stats_registry(stats.clone())
        .build_with_repository(repository.clone(), clock.clone());

    let instance = TaskInstance::new("flaky-completion", "1");
    scheduler
        .schedule(start, instance.clone())
        .await
        .expect("schedule");

    scheduler.check_due().await.expect("due tick");
    wait_until(|| scheduler.currently_executing().is_empty(), "worker exit").await;

    // The failed completion left the row claimed and counted an error.
    let row = repository.get(&instance).expect("row");
    assert!(row.picked);
    assert!(stats.unexpected_errors() >= 1);

    clock.advance(chrono::Duration::seconds(5 * 60));
    scheduler.detect_dead_executions().await.expect("dead tick");

    assert_eq!(dead_invocations.load(Ordering::SeqCst), 1);
    assert!(repository.get(&instance).is_none());
}

#[tokio::test]
async fn test_reschedule_round_trip_comes_due_again() {
    init_tracing();
    let start = Utc::now();
    let repository = InMemoryRepository::new("sched-1");
    let instance = TaskInstance::new("cycle", "1");

    repository
        .create_if_not_exists(Execution::new(start, instance.clone()))
        .await
        .expect("create");

    let due = repository.get_due(start).await.expect("due");
    assert_eq!(due.len(), 1);

    let picked = repository
        .pick(&due[0], start)
        .await
        .expect("pick")
        .expect("picked");

    let next = start + chrono::Duration::hours(1);
    repository
        .reschedule(&picked, next, Some(start), None)
        .await
        .expect("reschedule");

    assert!(repository.get_due(start).await.expect("due").is_empty());
    let due_again = repository.get_due(next).await.expect("due");
    assert_eq!(due_again.len(), 1);
    assert_eq!(due_again[0].task_instance, instance);
}

/// Seeds its own recurring execution when the scheduler starts.
struct SelfSeeding {
    clock: Arc<SettableClock>,
    invocations: Arc<AtomicU32>,
}

#[async_trait]
impl Task for SelfSeeding {
    fn name(&self) -> &str {
        "self-seeding"
    }

    async fn execute(&self, _instance: &TaskInstance, _context: ExecutionContext) -> Result<()> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn on_complete(
        &self,
        _complete: ExecutionComplete,
        ops: &ExecutionOperations,
    ) -> Result<()> {
        ops.remove().await?;
        Ok(())
    }

    async fn on_dead_execution(
        &self,
        _execution: &Execution,
        ops: &ExecutionOperations,
    ) -> Result<()> {
        ops.remove().await?;
        Ok(())
    }
}

#[async_trait]
impl belay::OnStartup for SelfSeeding {
    async fn on_startup(&self, client: &dyn SchedulerClient) -> Result<()> {
        client
            .schedule(self.clock.now(), TaskInstance::new("self-seeding", "boot"))
            .await?;
        Ok(())
    }
}

#[tokio::test]
async fn test_started_scheduler_runs_seeded_work_and_stops_cleanly() {
    init_tracing();
    let clock = Arc::new(SettableClock::new(Utc::now()));
    let repository = Arc::new(InMemoryRepository::new("sched-1"));
    let invocations = Arc::new(AtomicU32::new(0));

    let task = Arc::new(SelfSeeding {
        clock: clock.clone(),
        invocations: Arc::clone(&invocations),
    });
    let scheduler = Scheduler::builder(Vec::new())
        .scheduler_name("sched-1")
        .polling_interval(Duration::from_millis(50))
        .shutdown_max_wait(Duration::from_secs(5))
        .start_task(task)
        .build_with_repository(repository.clone(), clock.clone());

    scheduler.start().await;
    assert!(scheduler.state().is_running());

    let instance = TaskInstance::new("self-seeding", "boot");
    wait_until(|| repository.get(&instance).is_none(), "seeded run").await;
    assert_eq!(invocations.load(Ordering::SeqCst), 1);

    scheduler.stop().await;
    assert!(scheduler.state().is_shutting_down());

    // Work scheduled after shutdown is never claimed.
    scheduler
        .schedule(clock.now(), TaskInstance::new("self-seeding", "late"))
        .await
        .expect("schedule");
    sleep(Duration::from_millis(200)).await;
    let late = repository
        .get(&TaskInstance::new("self-seeding", "late"))
        .expect("late row");
    assert!(!late.picked);
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_stop_reports_executions_that_outlive_the_grace_period() {
    init_tracing();
    let clock = Arc::new(SettableClock::new(Utc::now()));
    let repository = Arc::new(InMemoryRepository::new("sched-1"));
    let invocations = Arc::new(AtomicU32::new(0));
    let gate = Arc::new(Semaphore::new(0));

    let task: Arc<dyn Task> = Arc::new(OneTimeTask::new(
        "stubborn",
        GatedHandler {
            invocations: Arc::clone(&invocations),
            gate: Arc::clone(&gate),
        },
    ));
    let scheduler = Scheduler::builder(vec![task])
        .scheduler_name("sched-1")
        .shutdown_max_wait(Duration::from_millis(100))
        .build_with_repository(repository.clone(), clock.clone());

    let instance = TaskInstance::new("stubborn", "1");
    scheduler
        .schedule(clock.now(), instance.clone())
        .await
        .expect("schedule");
    scheduler.check_due().await.expect("due tick");
    wait_until(|| scheduler.currently_executing().len() == 1, "claim").await;

    // The worker is blocked on the gate, so stop gives up after its short
    // grace period and reports the straggler.
    scheduler.stop().await;
    assert_eq!(scheduler.currently_executing().len(), 1);

    gate.add_permits(1);
    wait_until(|| repository.get(&instance).is_none(), "late completion").await;
}

#[tokio::test]
async fn test_status_snapshot_serializes() {
    init_tracing();
    let clock = Arc::new(SettableClock::new(Utc::now()));
    let repository = Arc::new(InMemoryRepository::new("sched-1"));
    let scheduler = Scheduler::builder(Vec::new())
        .scheduler_name("sched-1")
        .executor_threads(3)
        .build_with_repository(repository, clock);

    let status = serde_json::to_value(scheduler.status()).expect("serialize status");
    assert_eq!(status["scheduler_name"], "sched-1");
    assert_eq!(status["available_executor_slots"], 3);
    assert_eq!(status["currently_executing"], 0);
    assert_eq!(status["shutting_down"], false);
}
