//! PostgreSQL database connection and migrations

use crate::config::PostgresConfig;
use crate::error::Result;
use secrecy::ExposeSecret;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::info;

/// PostgreSQL connection pool type alias
pub type PostgresPool = PgPool;

/// Initialize the PostgreSQL connection pool
pub async fn init_pool(config: &PostgresConfig) -> Result<PostgresPool> {
    info!("Initializing PostgreSQL connection pool");

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
        .connect(config.url.expose_secret())
        .await?;

    // Verify connection
    sqlx::query("SELECT 1").execute(&pool).await?;

    info!("PostgreSQL connection pool initialized successfully");
    Ok(pool)
}

/// Database migrations
pub mod migrations {
    use super::*;

    /// Run all migrations
    pub async fn run(pool: &PgPool) -> Result<()> {
        info!("Running database migrations");

        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id UUID PRIMARY KEY,
                language TEXT NOT NULL,
                code TEXT NOT NULL,
                timeout_seconds BIGINT NOT NULL,
                status TEXT NOT NULL DEFAULT 'PENDING',
                output TEXT NOT NULL DEFAULT '',
                error TEXT NOT NULL DEFAULT '',
                execution_time_ms BIGINT,
                exit_code BIGINT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                started_at TIMESTAMPTZ,
                completed_at TIMESTAMPTZ,
                attempts INTEGER NOT NULL DEFAULT 0,
                worker_id TEXT,
                CONSTRAINT jobs_execution_time_terminal CHECK (
                    (status IN ('SUCCESS', 'ERROR', 'TIMEOUT')) = (execution_time_ms IS NOT NULL)
                )
            )
        "#)
        .execute(pool)
        .await?;

        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS dispatch_queue (
                id BIGSERIAL PRIMARY KEY,
                job_id UUID NOT NULL,
                enqueued_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                visible_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                delivery_count INTEGER NOT NULL DEFAULT 0,
                lease_token UUID,
                leased_by TEXT
            )
        "#)
        .execute(pool)
        .await?;

        // Tables created before exit codes were recorded
        sqlx::query("ALTER TABLE jobs ADD COLUMN IF NOT EXISTS exit_code BIGINT")
            .execute(pool)
            .await?;

        // Create indexes (each must be a separate query for SQLx)
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_created_at ON jobs(created_at)")
            .execute(pool)
            .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status)")
            .execute(pool)
            .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_dispatch_queue_visible_at ON dispatch_queue(visible_at)")
            .execute(pool)
            .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_dispatch_queue_job_id ON dispatch_queue(job_id)")
            .execute(pool)
            .await?;

        info!("Database migrations completed");
        Ok(())
    }
}
