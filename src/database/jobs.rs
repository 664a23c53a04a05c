//! Job storage backed by PostgreSQL
//!
//! Status lifecycle: PENDING → RUNNING → SUCCESS/ERROR/TIMEOUT. Every update
//! is guarded in SQL so terminal rows are never rewritten.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgExecutor};
use uuid::Uuid;

use crate::core::{Job, JobId, JobOutcome, JobStore};
use crate::database::PostgresPool;
use crate::error::Result;

#[derive(Debug, FromRow)]
struct JobRow {
    id: Uuid,
    language: String,
    code: String,
    timeout_seconds: i64,
    status: String,
    output: String,
    error: String,
    execution_time_ms: Option<i64>,
    exit_code: Option<i64>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    attempts: i32,
    worker_id: Option<String>,
}

impl TryFrom<JobRow> for Job {
    type Error = crate::Error;

    fn try_from(row: JobRow) -> Result<Self> {
        Ok(Job {
            id: row.id,
            language: row.language,
            code: row.code,
            timeout_seconds: row.timeout_seconds.max(0) as u64,
            status: row.status.parse()?,
            output: row.output,
            error: row.error,
            execution_time_ms: row.execution_time_ms.map(|ms| ms.max(0) as u64),
            exit_code: row.exit_code,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            attempts: row.attempts.max(0) as u32,
            worker_id: row.worker_id,
        })
    }
}

/// Insert a new job row on a pool or inside a transaction
pub(super) async fn insert_job<'e, E>(executor: E, job: &Job) -> Result<()>
where
    E: PgExecutor<'e>,
{
    sqlx::query(r#"
        INSERT INTO jobs (id, language, code, timeout_seconds, status, created_at)
        VALUES ($1, $2, $3, $4, $5, $6)
    "#)
    .bind(job.id)
    .bind(&job.language)
    .bind(&job.code)
    .bind(job.timeout_seconds as i64)
    .bind(job.status.as_str())
    .bind(job.created_at)
    .execute(executor)
    .await?;
    Ok(())
}

/// Job store backed by PostgreSQL
#[derive(Clone)]
pub struct PgJobStore {
    pool: PostgresPool,
}

impl PgJobStore {
    pub fn new(pool: PostgresPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    fn name(&self) -> &str {
        "postgres"
    }

    async fn create(&self, job: &Job) -> Result<()> {
        insert_job(&self.pool, job).await
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>> {
        let row: Option<JobRow> = sqlx::query_as("SELECT * FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Job::try_from).transpose()
    }

    async fn mark_running(&self, id: JobId, worker_id: &str) -> Result<Option<Job>> {
        let row: Option<JobRow> = sqlx::query_as(r#"
            UPDATE jobs
            SET status = 'RUNNING',
                started_at = GREATEST(NOW(), created_at),
                attempts = attempts + 1,
                worker_id = $2
            WHERE id = $1 AND status IN ('PENDING', 'RUNNING')
            RETURNING *
        "#)
        .bind(id)
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Job::try_from).transpose()
    }

    async fn complete(&self, id: JobId, worker_id: &str, outcome: &JobOutcome) -> Result<bool> {
        let result = sqlx::query(r#"
            UPDATE jobs
            SET status = $3,
                output = $4,
                error = $5,
                execution_time_ms = $6,
                exit_code = $7,
                completed_at = GREATEST(NOW(), COALESCE(started_at, created_at)),
                worker_id = $2
            WHERE id = $1 AND status IN ('PENDING', 'RUNNING')
        "#)
        .bind(id)
        .bind(worker_id)
        .bind(outcome.status.as_str())
        .bind(&outcome.output)
        .bind(&outcome.error)
        .bind(outcome.execution_time_ms as i64)
        .bind(outcome.exit_code)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn pending_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<JobId>> {
        let ids: Vec<(Uuid,)> = sqlx::query_as(r#"
            SELECT id FROM jobs
            WHERE status = 'PENDING' AND created_at <= $1
            ORDER BY created_at
            LIMIT 500
        "#)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().map(|(id,)| id).collect())
    }

    async fn purge_expired(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM jobs WHERE created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn health_check(&self) -> Result<bool> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(true)
    }
}
