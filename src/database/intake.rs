//! Job admission backed by PostgreSQL
//!
//! The job row and its queue message are inserted in one transaction, so a
//! job is never visible as PENDING without a message to run it.

use async_trait::async_trait;
use tracing::debug;

use crate::core::{Intake, Job};
use crate::database::jobs::insert_job;
use crate::database::PostgresPool;
use crate::error::{Error, Result};

/// Transactional intake over the `jobs` and `dispatch_queue` tables
#[derive(Clone)]
pub struct PgIntake {
    pool: PostgresPool,
}

impl PgIntake {
    pub fn new(pool: PostgresPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Intake for PgIntake {
    fn name(&self) -> &str {
        "postgres"
    }

    async fn admit(&self, job: &Job) -> Result<i64> {
        let mut tx = self.pool.begin().await?;

        insert_job(&mut *tx, job).await?;

        let (message_id,): (i64,) =
            sqlx::query_as("INSERT INTO dispatch_queue (job_id) VALUES ($1) RETURNING id")
                .bind(job.id)
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| Error::Queue(format!("Failed to enqueue job {}: {}", job.id, e)))?;

        // Dropping the transaction before this point rolls both inserts back
        tx.commit().await?;

        debug!(job_id = %job.id, message_id, "Admitted job");
        Ok(message_id)
    }
}
