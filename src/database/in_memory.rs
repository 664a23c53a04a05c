//! In-process job store and dispatch queue
//!
//! Same contracts as the PostgreSQL backends, for a single process that runs
//! both the API and its workers (local runs and tests).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::time::Instant;
use uuid::Uuid;

use crate::core::{DispatchQueue, Job, JobId, JobOutcome, JobStatus, JobStore, Lease};
use crate::error::{Error, Result};

/// Job store kept in a map
#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn create(&self, job: &Job) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(Error::Internal(format!("Job {} already exists", job.id)));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn mark_running(&self, id: JobId, worker_id: &str) -> Result<Option<Job>> {
        let mut jobs = self.jobs.write().await;
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(None);
        };
        if !job.apply_running(worker_id, Utc::now()) {
            return Ok(None);
        }
        Ok(Some(job.clone()))
    }

    async fn complete(&self, id: JobId, worker_id: &str, outcome: &JobOutcome) -> Result<bool> {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(&id) {
            Some(job) => Ok(job.apply_outcome(worker_id, outcome, Utc::now())),
            None => Ok(false),
        }
    }

    async fn pending_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<JobId>> {
        let jobs = self.jobs.read().await;
        let mut pending: Vec<&Job> = jobs
            .values()
            .filter(|job| job.status == JobStatus::Pending && job.created_at <= cutoff)
            .collect();
        pending.sort_by_key(|job| job.created_at);
        Ok(pending.into_iter().map(|job| job.id).collect())
    }

    async fn purge_expired(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|_, job| job.created_at >= cutoff);
        Ok((before - jobs.len()) as u64)
    }
}

#[derive(Debug)]
struct Message {
    job_id: JobId,
    visible_at: Instant,
    delivery_count: u32,
    token: Option<Uuid>,
}

#[derive(Default)]
struct QueueState {
    next_id: i64,
    messages: BTreeMap<i64, Message>,
}

/// Dispatch queue kept in memory, with blocking claims
pub struct InMemoryQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    visibility_timeout: Duration,
}

impl InMemoryQueue {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            visibility_timeout,
        }
    }

    /// Lease the first visible message, or report when the next leased one expires
    async fn try_claim(&self, worker_id: &str) -> std::result::Result<Lease, Option<Instant>> {
        let mut state = self.state.lock().await;
        let now = Instant::now();

        let visible = state
            .messages
            .iter_mut()
            .find(|(_, message)| message.visible_at <= now);

        if let Some((&message_id, message)) = visible {
            let token = Uuid::new_v4();
            message.visible_at = now + self.visibility_timeout;
            message.delivery_count += 1;
            message.token = Some(token);

            let expires_at = Utc::now()
                + chrono::Duration::from_std(self.visibility_timeout)
                    .unwrap_or_else(|_| chrono::Duration::zero());

            return Ok(Lease {
                message_id,
                job_id: message.job_id,
                token,
                worker_id: worker_id.to_string(),
                delivery_count: message.delivery_count,
                expires_at,
            });
        }

        Err(state.messages.values().map(|m| m.visible_at).min())
    }
}

#[async_trait]
impl DispatchQueue for InMemoryQueue {
    fn name(&self) -> &str {
        "memory"
    }

    async fn enqueue(&self, job_id: JobId) -> Result<i64> {
        let id = {
            let mut state = self.state.lock().await;
            state.next_id += 1;
            let id = state.next_id;
            state.messages.insert(
                id,
                Message {
                    job_id,
                    visible_at: Instant::now(),
                    delivery_count: 0,
                    token: None,
                },
            );
            id
        };
        self.notify.notify_waiters();
        Ok(id)
    }

    async fn claim(&self, worker_id: &str, wait: Duration) -> Result<Option<Lease>> {
        let deadline = Instant::now() + wait;
        loop {
            // Register for wakeups before looking, so an enqueue in between is not missed
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_expiry = match self.try_claim(worker_id).await {
                Ok(lease) => return Ok(Some(lease)),
                Err(next_expiry) => next_expiry,
            };

            if Instant::now() >= deadline {
                return Ok(None);
            }
            let wake_at = next_expiry.map_or(deadline, |at| at.min(deadline));

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn ack(&self, lease: &Lease) -> Result<()> {
        let mut state = self.state.lock().await;
        match state.messages.get(&lease.message_id) {
            Some(message) if message.token == Some(lease.token) => {
                state.messages.remove(&lease.message_id);
                Ok(())
            }
            _ => Err(Error::LeaseLost(lease.message_id)),
        }
    }

    async fn depth(&self) -> Result<u64> {
        Ok(self.state.lock().await.messages.len() as u64)
    }

    async fn contains(&self, job_id: JobId) -> Result<bool> {
        let state = self.state.lock().await;
        Ok(state.messages.values().any(|message| message.job_id == job_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_store_lifecycle() {
        let store = InMemoryJobStore::new();
        let job = Job::new("python", "print(1)", 5);
        store.create(&job).await.unwrap();

        let running = store.mark_running(job.id, "w1").await.unwrap().unwrap();
        assert_eq!(running.status, JobStatus::Running);
        assert_eq!(running.attempts, 1);

        let outcome = JobOutcome {
            status: JobStatus::Success,
            output: "1\n".into(),
            error: String::new(),
            execution_time_ms: 40,
            exit_code: Some(0),
        };
        assert!(store.complete(job.id, "w1", &outcome).await.unwrap());

        // Duplicate terminal write keeps the first one
        assert!(!store
            .complete(job.id, "w2", &JobOutcome::infrastructure("late"))
            .await
            .unwrap());
        assert!(store.mark_running(job.id, "w2").await.unwrap().is_none());

        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Success);
        assert_eq!(stored.output, "1\n");
        assert_eq!(stored.worker_id.as_deref(), Some("w1"));
    }

    #[tokio::test]
    async fn test_store_rejects_duplicate_id() {
        let store = InMemoryJobStore::new();
        let job = Job::new("python", "print(1)", 5);
        assert_ok!(store.create(&job).await);
        assert_err!(store.create(&job).await);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let store = InMemoryJobStore::new();
        let mut old = Job::new("python", "print(1)", 5);
        old.created_at = Utc::now() - chrono::Duration::days(8);
        let fresh = Job::new("python", "print(2)", 5);
        store.create(&old).await.unwrap();
        store.create(&fresh).await.unwrap();

        let removed = store
            .purge_expired(Utc::now() - chrono::Duration::days(7))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store.get(old.id).await.unwrap().is_none());
        assert!(store.get(fresh.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_pending_before_skips_started_and_recent_jobs() {
        let store = InMemoryJobStore::new();
        let mut stale = Job::new("python", "print(1)", 5);
        stale.created_at = Utc::now() - chrono::Duration::minutes(10);
        let mut started = Job::new("python", "print(2)", 5);
        started.created_at = stale.created_at;
        let fresh = Job::new("python", "print(3)", 5);
        for job in [&stale, &started, &fresh] {
            store.create(job).await.unwrap();
        }
        store.mark_running(started.id, "w1").await.unwrap();

        let cutoff = Utc::now() - chrono::Duration::minutes(5);
        assert_eq!(store.pending_before(cutoff).await.unwrap(), vec![stale.id]);
    }

    #[tokio::test]
    async fn test_contains_tracks_unacked_messages() {
        let queue = InMemoryQueue::new(Duration::from_secs(30));
        let job_id = Uuid::new_v4();
        assert!(!queue.contains(job_id).await.unwrap());

        queue.enqueue(job_id).await.unwrap();
        let lease = queue.claim("w1", Duration::ZERO).await.unwrap().unwrap();
        assert!(queue.contains(job_id).await.unwrap());

        queue.ack(&lease).await.unwrap();
        assert!(!queue.contains(job_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_claim_hides_message_until_acked() {
        let queue = InMemoryQueue::new(Duration::from_secs(30));
        let job_id = Uuid::new_v4();
        queue.enqueue(job_id).await.unwrap();

        let lease = queue.claim("w1", Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(lease.job_id, job_id);
        assert_eq!(lease.delivery_count, 1);

        assert!(queue.claim("w2", Duration::ZERO).await.unwrap().is_none());
        assert_eq!(queue.depth().await.unwrap(), 1);

        queue.ack(&lease).await.unwrap();
        assert_eq!(queue.depth().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lease_is_redelivered() {
        let queue = InMemoryQueue::new(Duration::from_secs(30));
        let job_id = Uuid::new_v4();
        queue.enqueue(job_id).await.unwrap();

        let first = queue.claim("w1", Duration::ZERO).await.unwrap().unwrap();

        // Blocks until the visibility timeout lapses
        let second = queue
            .claim("w2", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.job_id, job_id);
        assert_eq!(second.delivery_count, 2);
        assert_ne!(first.token, second.token);

        assert!(matches!(queue.ack(&first).await, Err(Error::LeaseLost(_))));
        queue.ack(&second).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_claim_wakes_on_enqueue() {
        let queue = Arc::new(InMemoryQueue::new(Duration::from_secs(30)));

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.claim("w1", Duration::from_secs(20)).await })
        };
        tokio::task::yield_now().await;

        let job_id = Uuid::new_v4();
        queue.enqueue(job_id).await.unwrap();

        let lease = waiter.await.unwrap().unwrap().unwrap();
        assert_eq!(lease.job_id, job_id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_claim_times_out_when_empty() {
        let queue = InMemoryQueue::new(Duration::from_secs(30));
        let lease = queue.claim("w1", Duration::from_secs(5)).await.unwrap();
        assert!(lease.is_none());
    }
}
