//! Job store trait - Abstract interface for job persistence
//!
//! Implemented by the PostgreSQL store (shared by every process) and the
//! in-memory store (single process, tests and local runs).

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::types::{Job, JobId, JobOutcome};
use crate::error::Result;

/// Durable record of job state, keyed by job id
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &str;

    /// Insert a new PENDING job
    async fn create(&self, job: &Job) -> Result<()>;

    /// Read a job snapshot
    async fn get(&self, id: JobId) -> Result<Option<Job>>;

    /// Move a non-terminal job to RUNNING and bump its attempt counter.
    ///
    /// Returns `None` if the job is unknown or already terminal.
    async fn mark_running(&self, id: JobId, worker_id: &str) -> Result<Option<Job>>;

    /// Write the terminal outcome.
    ///
    /// Returns `false` if the job was already terminal; the earlier terminal
    /// write is kept.
    async fn complete(&self, id: JobId, worker_id: &str, outcome: &JobOutcome) -> Result<bool>;

    /// Ids of PENDING jobs created at or before `cutoff`, oldest first.
    /// Backends may return a bounded batch.
    async fn pending_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<JobId>>;

    /// Delete jobs created before `cutoff`. Returns the number removed.
    async fn purge_expired(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Health check
    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }
}
