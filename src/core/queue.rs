//! Dispatch queue trait - at-least-once delivery of job references
//!
//! A claimed message is hidden for the visibility timeout. If it is not
//! acked in that window it becomes claimable again, so a job may be started
//! more than once.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use super::types::JobId;
use crate::error::Result;

/// Time-bounded claim a worker holds on one queued message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Queue message id
    pub message_id: i64,
    /// Job the message refers to
    pub job_id: JobId,
    /// Fresh token per claim; an ack with a stale token is rejected
    pub token: Uuid,
    /// Worker holding the lease
    pub worker_id: String,
    /// How many times this message has been handed out, including this claim
    pub delivery_count: u32,
    /// When the message becomes claimable again
    pub expires_at: DateTime<Utc>,
}

/// Reliable handoff of job references to workers
#[async_trait]
pub trait DispatchQueue: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &str;

    /// Append a message for `job_id`. Returns the message id.
    async fn enqueue(&self, job_id: JobId) -> Result<i64>;

    /// Claim the next visible message, waiting up to `wait` for one to appear.
    async fn claim(&self, worker_id: &str, wait: Duration) -> Result<Option<Lease>>;

    /// Remove the message for good. Fails with `Error::LeaseLost` when the
    /// lease expired and the message was claimed again.
    async fn ack(&self, lease: &Lease) -> Result<()>;

    /// Messages not yet acked, visible or leased
    async fn depth(&self) -> Result<u64>;

    /// True while some message for `job_id` is queued or leased
    async fn contains(&self, job_id: JobId) -> Result<bool>;
}
