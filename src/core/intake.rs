//! Intake trait - admission of new jobs
//!
//! Admitting a job records it as PENDING and puts a message for it on the
//! dispatch queue. A PENDING job without a message would never run, so
//! backends that share a database do both in one transaction.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::error;

use super::queue::DispatchQueue;
use super::store::JobStore;
use super::types::{Job, JobOutcome};
use crate::error::Result;

/// Worker id recorded on jobs that intake itself fails
pub const INTAKE_WRITER: &str = "intake";

/// Records and enqueues new jobs
#[async_trait]
pub trait Intake: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &str;

    /// Record `job` and enqueue it. Returns the queue message id.
    ///
    /// On error no worker will ever see the job as PENDING work.
    async fn admit(&self, job: &Job) -> Result<i64>;
}

/// Create, then enqueue, over a separate store and queue.
///
/// A failed enqueue fails the job. If that write fails too, or the process
/// dies between the two steps, the job is left for `AppContext::fail_orphans`.
pub struct StagedIntake {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn DispatchQueue>,
}

impl StagedIntake {
    pub fn new(store: Arc<dyn JobStore>, queue: Arc<dyn DispatchQueue>) -> Self {
        Self { store, queue }
    }
}

#[async_trait]
impl Intake for StagedIntake {
    fn name(&self) -> &str {
        "staged"
    }

    async fn admit(&self, job: &Job) -> Result<i64> {
        self.store.create(job).await?;

        match self.queue.enqueue(job.id).await {
            Ok(message_id) => Ok(message_id),
            Err(e) => {
                error!(job_id = %job.id, "Enqueue failed: {}", e);
                let outcome = JobOutcome::infrastructure(format!("could not enqueue job: {}", e));
                if let Err(write_err) = self.store.complete(job.id, INTAKE_WRITER, &outcome).await {
                    error!(
                        job_id = %job.id,
                        "Failed to record enqueue failure, leaving the job to the orphan sweep: {}",
                        write_err
                    );
                }
                Err(e)
            }
        }
    }
}
