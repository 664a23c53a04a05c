//! Dispatch queue backed by PostgreSQL
//!
//! A message is visible when `visible_at <= NOW()`. Claiming pushes
//! `visible_at` forward by the visibility timeout and stamps a fresh lease
//! token, using `FOR UPDATE SKIP LOCKED` so concurrent workers never claim
//! the same row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::core::{DispatchQueue, JobId, Lease};
use crate::database::PostgresPool;
use crate::error::{Error, Result};

/// Dispatch queue backed by PostgreSQL
#[derive(Clone)]
pub struct PgDispatchQueue {
    pool: PostgresPool,
    visibility_timeout: Duration,
    poll_interval: Duration,
}

impl PgDispatchQueue {
    pub fn new(pool: PostgresPool, visibility_timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            pool,
            visibility_timeout,
            poll_interval,
        }
    }

    async fn try_claim(&self, worker_id: &str) -> Result<Option<Lease>> {
        let token = Uuid::new_v4();
        let row: Option<(i64, Uuid, i32, DateTime<Utc>)> = sqlx::query_as(r#"
            UPDATE dispatch_queue
            SET visible_at = NOW() + make_interval(secs => $1),
                delivery_count = delivery_count + 1,
                lease_token = $2,
                leased_by = $3
            WHERE id = (
                SELECT id FROM dispatch_queue
                WHERE visible_at <= NOW()
                ORDER BY visible_at, id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, job_id, delivery_count, visible_at
        "#)
        .bind(self.visibility_timeout.as_secs_f64())
        .bind(token)
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(message_id, job_id, delivery_count, expires_at)| Lease {
            message_id,
            job_id,
            token,
            worker_id: worker_id.to_string(),
            delivery_count: delivery_count.max(0) as u32,
            expires_at,
        }))
    }
}

#[async_trait]
impl DispatchQueue for PgDispatchQueue {
    fn name(&self) -> &str {
        "postgres"
    }

    async fn enqueue(&self, job_id: JobId) -> Result<i64> {
        let (id,): (i64,) =
            sqlx::query_as("INSERT INTO dispatch_queue (job_id) VALUES ($1) RETURNING id")
                .bind(job_id)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| Error::Queue(format!("Failed to enqueue job {}: {}", job_id, e)))?;
        Ok(id)
    }

    async fn claim(&self, worker_id: &str, wait: Duration) -> Result<Option<Lease>> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(lease) = self.try_claim(worker_id).await? {
                return Ok(Some(lease));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn ack(&self, lease: &Lease) -> Result<()> {
        let result = sqlx::query("DELETE FROM dispatch_queue WHERE id = $1 AND lease_token = $2")
            .bind(lease.message_id)
            .bind(lease.token)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::LeaseLost(lease.message_id));
        }
        debug!(message_id = lease.message_id, job_id = %lease.job_id, "Acked message");
        Ok(())
    }

    async fn depth(&self) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM dispatch_queue")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn contains(&self, job_id: JobId) -> Result<bool> {
        let (exists,): (bool,) =
            sqlx::query_as("SELECT EXISTS (SELECT 1 FROM dispatch_queue WHERE job_id = $1)")
                .bind(job_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }
}
