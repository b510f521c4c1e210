//! PostgreSQL-backed repository.
//!
//! Every mutation is a single conditional `UPDATE`/`DELETE` guarded by the
//! row's `version` column, with the outcome read from `rows_affected()`.
//! That keeps each operation one atomic store round-trip and makes a lost
//! race indistinguishable from a concurrent scheduler having won it, which
//! is exactly what the claim protocol needs.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool};
use tracing::{debug, info, warn};

use crate::execution::{Execution, TaskInstance};
use crate::resolver::{OnCannotResolve, TaskResolver};

use super::{ExecutionRepository, RepositoryError, RepositoryResult};

/// Durable implementation of [`ExecutionRepository`].
pub struct PostgresRepository {
    pool: PgPool,
    resolver: Arc<TaskResolver>,
    scheduler_name: String,
}

impl PostgresRepository {
    /// Wrap an existing pool. Assumes migrations have been run.
    pub fn new(pool: PgPool, resolver: Arc<TaskResolver>, scheduler_name: impl Into<String>) -> Self {
        Self {
            pool,
            resolver,
            scheduler_name: scheduler_name.into(),
        }
    }

    /// Connect and run migrations.
    pub async fn connect(
        database_url: &str,
        resolver: Arc<TaskResolver>,
        scheduler_name: impl Into<String>,
    ) -> RepositoryResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Self::migrate(pool, resolver, scheduler_name).await
    }

    /// Run migrations on an existing pool, then wrap it.
    pub async fn migrate(
        pool: PgPool,
        resolver: Arc<TaskResolver>,
        scheduler_name: impl Into<String>,
    ) -> RepositoryResult<Self> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self::new(pool, resolver, scheduler_name))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Map scan rows into domain executions, applying the resolver policy
    /// to rows whose task name has no registered handler.
    fn resolve_rows(&self, rows: Vec<ExecutionRow>) -> RepositoryResult<Vec<Execution>> {
        let mut executions = Vec::with_capacity(rows.len());
        for row in rows {
            if !self.resolver.can_resolve(&row.task_name) {
                match self.resolver.policy() {
                    OnCannotResolve::WarnAndSkip => {
                        warn!(
                            task_name = %row.task_name,
                            instance_id = %row.task_instance,
                            "store row references unregistered task; skipping"
                        );
                        continue;
                    }
                    OnCannotResolve::Fail => {
                        return Err(RepositoryError::UnresolvedTask(row.task_name));
                    }
                }
            }
            executions.push(row.into());
        }
        Ok(executions)
    }
}

#[async_trait]
impl ExecutionRepository for PostgresRepository {
    async fn create_if_not_exists(&self, execution: Execution) -> RepositoryResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO scheduled_executions (task_name, task_instance, execution_time)
            VALUES ($1, $2, $3)
            ON CONFLICT (task_name, task_instance) DO NOTHING
            "#,
        )
        .bind(&execution.task_instance.task_name)
        .bind(&execution.task_instance.instance_id)
        .bind(execution.execution_time)
        .execute(&self.pool)
        .await?;

        let inserted = result.rows_affected() > 0;
        if !inserted {
            info!(execution = %execution, "execution already scheduled; not adding duplicate");
        }
        Ok(inserted)
    }

    async fn get_due(&self, now: DateTime<Utc>) -> RepositoryResult<Vec<Execution>> {
        let rows = sqlx::query_as::<_, ExecutionRow>(
            r#"
            SELECT task_name, task_instance, execution_time, picked, picked_by,
                   last_heartbeat, last_success, last_failure, version
            FROM scheduled_executions
            WHERE picked = FALSE
              AND execution_time <= $1
            ORDER BY execution_time ASC, task_name ASC, task_instance ASC
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        self.resolve_rows(rows)
    }

    async fn pick(
        &self,
        execution: &Execution,
        time_picked: DateTime<Utc>,
    ) -> RepositoryResult<Option<Execution>> {
        let row = sqlx::query_as::<_, ExecutionRow>(
            r#"
            UPDATE scheduled_executions
            SET picked = TRUE,
                picked_by = $4,
                last_heartbeat = $5,
                version = version + 1
            WHERE task_name = $1
              AND task_instance = $2
              AND picked = FALSE
              AND version = $3
            RETURNING task_name, task_instance, execution_time, picked, picked_by,
                      last_heartbeat, last_success, last_failure, version
            "#,
        )
        .bind(&execution.task_instance.task_name)
        .bind(&execution.task_instance.instance_id)
        .bind(execution.version)
        .bind(&self.scheduler_name)
        .bind(time_picked)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Execution::from))
    }

    async fn update_heartbeat(
        &self,
        execution: &Execution,
        heartbeat_time: DateTime<Utc>,
    ) -> RepositoryResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_executions
            SET last_heartbeat = $4
            WHERE task_name = $1
              AND task_instance = $2
              AND picked = TRUE
              AND version = $3
            "#,
        )
        .bind(&execution.task_instance.task_name)
        .bind(&execution.task_instance.instance_id)
        .bind(execution.version)
        .bind(heartbeat_time)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            debug!(execution = %execution, "heartbeat skipped: execution no longer claimed at this version");
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
        let result = sqlx::query(
            r#"
            UPDATE scheduled_executions
            SET picked = FALSE,
                picked_by = NULL,
                last_heartbeat = NULL,
                execution_time = $4,
                last_success = $5,
                last_failure = $6,
                version = version + 1
            WHERE task_name = $1
              AND task_instance = $2
              AND version = $3
            "#,
        )
        .bind(&execution.task_instance.task_name)
        .bind(&execution.task_instance.instance_id)
        .bind(execution.version)
        .bind(next_execution_time)
        .bind(last_success)
        .bind(last_failure)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::VersionConflict {
                task_instance: execution.task_instance.clone(),
                expected: execution.version,
            });
        }
        Ok(())
    }

    async fn remove(&self, execution: &Execution) -> RepositoryResult<()> {
        let result = sqlx::query(
            r#"
            DELETE FROM scheduled_executions
            WHERE task_name = $1
              AND task_instance = $2
              AND version = $3
            "#,
        )
        .bind(&execution.task_instance.task_name)
        .bind(&execution.task_instance.instance_id)
        .bind(execution.version)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::VersionConflict {
                task_instance: execution.task_instance.clone(),
                expected: execution.version,
            });
        }
        Ok(())
    }

    async fn get_old_executions(
        &self,
        older_than: DateTime<Utc>,
    ) -> RepositoryResult<Vec<Execution>> {
        let rows = sqlx::query_as::<_, ExecutionRow>(
            r#"
            SELECT task_name, task_instance, execution_time, picked, picked_by,
                   last_heartbeat, last_success, last_failure, version
            FROM scheduled_executions
            WHERE picked = TRUE
              AND last_heartbeat <= $1
            ORDER BY execution_time ASC, task_name ASC, task_instance ASC
            "#,
        )
        .bind(older_than)
        .fetch_all(&self.pool)
        .await?;

        self.resolve_rows(rows)
    }

    async fn get_executions_failing_longer_than(
        &self,
        interval: Duration,
    ) -> RepositoryResult<Vec<Execution>> {
        let rows = sqlx::query_as::<_, ExecutionRow>(
            r#"
            SELECT task_name, task_instance, execution_time, picked, picked_by,
                   last_heartbeat, last_success, last_failure, version
            FROM scheduled_executions
            WHERE last_failure IS NOT NULL
              AND last_failure <= NOW() - make_interval(secs => $1::double precision)
              AND (last_success IS NULL OR last_success < last_failure)
            ORDER BY execution_time ASC, task_name ASC, task_instance ASC
            "#,
        )
        .bind(interval.as_secs_f64())
        .fetch_all(&self.pool)
        .await?;

        self.resolve_rows(rows)
    }
}

// Internal row type for sqlx.
#[derive(FromRow)]
struct ExecutionRow {
    task_name: String,
    task_instance: String,
    execution_time: DateTime<Utc>,
    picked: bool,
    picked_by: Option<String>,
    last_heartbeat: Option<DateTime<Utc>>,
    last_success: Option<DateTime<Utc>>,
    last_failure: Option<DateTime<Utc>>,
    version: i64,
}

impl From<ExecutionRow> for Execution {
    fn from(row: ExecutionRow) -> Self {
        Self {
            task_instance: TaskInstance::new(row.task_name, row.task_instance),
            execution_time: row.execution_time,
            picked: row.picked,
            picked_by: row.picked_by,
            last_heartbeat: row.last_heartbeat,
            last_success: row.last_success,
            last_failure: row.last_failure,
            version: row.version,
        }
    }
}
