//! Worker - claims jobs from the dispatch queue and runs them in sandboxes
//!
//! For each lease:
//! 1. Give up on the job if it was delivered too many times
//! 2. Load the job; a terminal job means a duplicate delivery, so just ack
//! 3. Mark it RUNNING, resolve its runtime and run the sandbox
//! 4. Write the terminal outcome, then ack
//!
//! Any failure before the ack leaves the message alone; the lease expires
//! and another worker picks the job up again.

use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::{QueueConfig, WorkerConfig};
use crate::context::AppContext;
use crate::core::{DispatchQueue, JobOutcome, JobStore, Lease};
use crate::error::{Error, Result};
use crate::registry::LanguageRegistry;
use crate::sandbox::SandboxRunner;

/// Liveness shared by the workers of one process
#[derive(Debug, Clone, Default)]
pub struct Heartbeat {
    inner: Arc<HeartbeatState>,
}

#[derive(Debug, Default)]
struct HeartbeatState {
    /// Unix millis of the last beat, 0 if never
    last_beat_ms: AtomicI64,
    jobs_finished: AtomicU64,
}

impl Heartbeat {
    pub fn beat(&self) {
        self.inner
            .last_beat_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last_beat(&self) -> Option<DateTime<Utc>> {
        match self.inner.last_beat_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => DateTime::from_timestamp_millis(ms),
        }
    }

    fn record_finished(&self) {
        self.inner.jobs_finished.fetch_add(1, Ordering::Relaxed);
    }

    pub fn jobs_finished(&self) -> u64 {
        self.inner.jobs_finished.load(Ordering::Relaxed)
    }
}

/// A queue consumer with a bounded number of execution slots
pub struct Worker {
    id: String,
    store: Arc<dyn JobStore>,
    queue: Arc<dyn DispatchQueue>,
    registry: Arc<LanguageRegistry>,
    runner: SandboxRunner,
    config: WorkerConfig,
    queue_config: QueueConfig,
    slots: Arc<Semaphore>,
    heartbeat: Heartbeat,
}

impl Worker {
    pub fn new(id: impl Into<String>, context: &AppContext, runner: SandboxRunner) -> Self {
        let config = context.config.worker.clone();
        Self {
            id: id.into(),
            store: context.store.clone(),
            queue: context.queue.clone(),
            registry: context.registry.clone(),
            runner,
            slots: Arc::new(Semaphore::new(config.concurrency.max(1))),
            config,
            queue_config: context.config.queue.clone(),
            heartbeat: context.heartbeat.clone(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Main worker loop. Returns once `shutdown` flips to true and every
    /// in-flight job has finished, or after too many consecutive queue errors.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            worker_id = %self.id,
            concurrency = self.config.concurrency,
            sandbox = self.runner.name(),
            "Worker started"
        );

        let mut in_flight = JoinSet::new();
        let mut consecutive_errors = 0u32;
        let mut outcome = Ok(());

        loop {
            if *shutdown.borrow() {
                break;
            }

            let permit = tokio::select! {
                _ = shutdown.changed() => break,
                permit = self.slots.clone().acquire_owned() => permit
                    .map_err(|_| Error::Internal("worker slots closed".into()))?,
            };

            self.heartbeat.beat();

            let claimed = tokio::select! {
                _ = shutdown.changed() => break,
                claimed = self.queue.claim(&self.id, self.queue_config.claim_wait) => claimed,
            };

            match claimed {
                Ok(Some(lease)) => {
                    consecutive_errors = 0;
                    let worker = self.clone();
                    in_flight.spawn(async move {
                        let _permit = permit;
                        worker.process(lease).await;
                    });
                }
                Ok(None) => {
                    consecutive_errors = 0;
                }
                Err(e) => {
                    consecutive_errors += 1;
                    error!(
                        worker_id = %self.id,
                        consecutive_errors,
                        "Claim failed: {}", e
                    );
                    if consecutive_errors >= self.config.max_consecutive_errors {
                        error!(worker_id = %self.id, "Too many consecutive errors, stopping");
                        outcome = Err(e);
                        break;
                    }
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(self.config.error_backoff) => {}
                    }
                }
            }

            while let Some(joined) = in_flight.try_join_next() {
                if let Err(e) = joined {
                    error!(worker_id = %self.id, "Job task failed: {}", e);
                }
            }
        }

        if !in_flight.is_empty() {
            info!(worker_id = %self.id, "Waiting for {} in-flight jobs", in_flight.len());
        }
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                error!(worker_id = %self.id, "Job task failed: {}", e);
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
        outcome
    }

    /// Handle one lease end to end
    pub async fn process(&self, lease: Lease) {
        let span = info_span!(
            "job",
            job_id = %lease.job_id,
            worker_id = %self.id,
            delivery = lease.delivery_count
        );

        async {
            match self.execute(&lease).await {
                Ok(()) => match self.queue.ack(&lease).await {
                    Ok(()) => debug!("Acked"),
                    Err(Error::LeaseLost(_)) => {
                        warn!("Lease expired before ack; another delivery owns the message")
                    }
                    Err(e) => warn!("Ack failed, message will be redelivered: {}", e),
                },
                Err(e) => warn!("Leaving message for redelivery: {}", e),
            }
            self.heartbeat.beat();
        }
        .instrument(span)
        .await
    }

    /// Everything up to the terminal write. `Ok` means the message can be acked.
    async fn execute(&self, lease: &Lease) -> Result<()> {
        let job_id = lease.job_id;

        if lease.delivery_count > self.queue_config.max_deliveries {
            warn!("Delivery limit reached, failing job");
            let outcome = JobOutcome::infrastructure(format!(
                "job was abandoned after {} delivery attempts",
                lease.delivery_count - 1
            ));
            self.finish(lease, &outcome).await?;
            return Ok(());
        }

        let Some(job) = self.with_store_retry(|| self.store.get(job_id)).await? else {
            warn!("Job not found, dropping message");
            return Ok(());
        };

        if job.status.is_terminal() {
            info!(status = %job.status, "Duplicate delivery of a finished job");
            return Ok(());
        }

        let Some(job) = self
            .with_store_retry(|| self.store.mark_running(job_id, &self.id))
            .await?
        else {
            info!("Job finished elsewhere before it could start");
            return Ok(());
        };

        let spec = match self.registry.resolve(&job.language) {
            Ok(spec) => spec,
            Err(e) => {
                warn!(language = %job.language, "Job has no runtime: {}", e);
                let outcome = JobOutcome {
                    error: e.to_string(),
                    ..JobOutcome::infrastructure("")
                };
                self.finish(lease, &outcome).await?;
                return Ok(());
            }
        };

        debug!(language = %spec.language, timeout = job.timeout_seconds, "Running job");

        let result = self
            .runner
            .run(&job.code, spec, job.timeout_seconds)
            .await?;
        let outcome = result.into_outcome(job.timeout_seconds, self.runner.output_cap());

        self.finish(lease, &outcome).await
    }

    /// Conditional terminal write, retried while the store error is transient
    async fn finish(&self, lease: &Lease, outcome: &JobOutcome) -> Result<()> {
        let written = self
            .with_store_retry(|| self.store.complete(lease.job_id, &self.id, outcome))
            .await?;

        if written {
            self.heartbeat.record_finished();
            info!(
                status = %outcome.status,
                execution_time_ms = outcome.execution_time_ms,
                "Job finished"
            );
        } else {
            info!("Job was already finished by another delivery; keeping that result");
        }
        Ok(())
    }

    async fn with_store_retry<T, F, Fut>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let policy = ExponentialBackoff {
            max_elapsed_time: Some(self.config.store_retry_max_elapsed),
            ..Default::default()
        };

        backoff::future::retry(policy, || {
            let attempt = operation();
            async move {
                attempt.await.map_err(|e| {
                    if e.is_retryable() {
                        warn!("Store operation failed, retrying: {}", e);
                        backoff::Error::transient(e)
                    } else {
                        backoff::Error::permanent(e)
                    }
                })
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::core::{Job, JobId, JobStatus};
    use crate::sandbox::testing::ScriptedSandbox;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn context() -> AppContext {
        let mut config = Config::default();
        config.queue.visibility_timeout = Duration::from_secs(30);
        config.queue.max_deliveries = 3;
        config.worker.concurrency = 4;
        AppContext::in_memory(config).unwrap()
    }

    fn worker(context: &AppContext, sandbox: Arc<ScriptedSandbox>) -> Worker {
        Worker::new("w1", context, SandboxRunner::new(sandbox, 4000))
    }

    async fn submit(context: &AppContext, language: &str, code: &str) -> JobId {
        let job = Job::new(language, code, 2);
        context.store.create(&job).await.unwrap();
        context.queue.enqueue(job.id).await.unwrap();
        job.id
    }

    async fn claim(context: &AppContext, worker_id: &str) -> Lease {
        context
            .queue
            .claim(worker_id, Duration::from_secs(120))
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_process_runs_job_to_success() {
        let context = context();
        let sandbox = Arc::new(ScriptedSandbox::new());
        let worker = worker(&context, sandbox.clone());
        let id = submit(&context, "python", "print('hi')").await;

        worker.process(claim(&context, "w1").await).await;

        let job = context.store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Success);
        assert_eq!(job.output, "print('hi')");
        assert_eq!(job.attempts, 1);
        assert!(job.started_at.is_some() && job.completed_at.is_some());
        assert!(job.execution_time_ms.is_some());
        assert_eq!(job.exit_code, Some(0));
        assert_eq!(context.queue.depth().await.unwrap(), 0);
        assert_eq!(sandbox.live(), 0);
        assert_eq!(context.heartbeat.jobs_finished(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_runtime_error_and_timeout() {
        let context = context();
        let worker = worker(&context, Arc::new(ScriptedSandbox::new()));
        let failing = submit(&context, "ruby", "fail").await;
        worker.process(claim(&context, "w1").await).await;

        let job = context.store.get(failing).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(job.error, "fail");

        let slow = submit(&context, "python", "sleep").await;
        worker.process(claim(&context, "w1").await).await;

        let job = context.store.get(slow).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Timeout);
        assert_eq!(job.error, "Execution exceeded 2s limit");
    }

    #[tokio::test(start_paused = true)]
    async fn test_crashed_run_is_redelivered() {
        let context = context();
        let sandbox = Arc::new(ScriptedSandbox::new().failing_runs(1));
        let worker = worker(&context, sandbox.clone());
        let id = submit(&context, "python", "print(1)").await;

        // First delivery: the runner fails, the message stays leased
        worker.process(claim(&context, "w1").await).await;
        let job = context.store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(context.queue.depth().await.unwrap(), 1);

        // Lease expires and the job is picked up again
        let lease = claim(&context, "w2").await;
        assert_eq!(lease.delivery_count, 2);
        worker.process(lease).await;

        let job = context.store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Success);
        assert_eq!(job.attempts, 2);
        assert_eq!(context.queue.depth().await.unwrap(), 0);
        assert_eq!(sandbox.live(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivery_limit_forces_error() {
        let context = context();
        let sandbox = Arc::new(ScriptedSandbox::new().failing_runs(usize::MAX));
        let worker = worker(&context, sandbox.clone());
        let id = submit(&context, "python", "print(1)").await;

        for _ in 0..4 {
            worker.process(claim(&context, "w1").await).await;
        }

        let job = context.store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Error);
        assert!(job.error.starts_with("Infrastructure failure"));
        assert_eq!(job.attempts, 3);
        assert_eq!(sandbox.created(), 3);
        assert_eq!(context.queue.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_delivery_keeps_first_result() {
        let context = context();
        let sandbox = Arc::new(ScriptedSandbox::new());
        let worker = worker(&context, sandbox.clone());
        let id = submit(&context, "python", "print(1)").await;

        // A second message for the same job, as after a redelivery race
        context.queue.enqueue(id).await.unwrap();

        worker.process(claim(&context, "w1").await).await;
        let first = context.store.get(id).await.unwrap().unwrap();

        worker.process(claim(&context, "w1").await).await;
        let second = context.store.get(id).await.unwrap().unwrap();

        assert_eq!(first, second);
        assert_eq!(sandbox.created(), 1);
        assert_eq!(context.queue.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_missing_job_is_dropped() {
        let context = context();
        let worker = worker(&context, Arc::new(ScriptedSandbox::new()));
        context.queue.enqueue(uuid::Uuid::new_v4()).await.unwrap();

        worker.process(claim(&context, "w1").await).await;
        assert_eq!(context.queue.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unknown_language_fails_without_running() {
        let context = context();
        let sandbox = Arc::new(ScriptedSandbox::new());
        let worker = worker(&context, sandbox.clone());
        let id = submit(&context, "cobol", "DISPLAY 'HI'").await;

        worker.process(claim(&context, "w1").await).await;

        let job = context.store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Error);
        assert!(job.error.contains("Unsupported language"));
        assert_eq!(sandbox.created(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_jobs_do_not_mix_output() {
        let context = context();
        let sandbox = Arc::new(ScriptedSandbox::new().with_delay(Duration::from_millis(20)));
        let worker = Arc::new(worker(&context, sandbox.clone()));

        let mut ids = Vec::new();
        for i in 0..8 {
            ids.push((i, submit(&context, "python", &format!("print({})", i)).await));
        }

        let (tx, rx) = watch::channel(false);
        let running = tokio::spawn(worker.clone().run(rx));

        for _ in 0..200 {
            if context.heartbeat.jobs_finished() == 8 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tx.send(true).unwrap();
        running.await.unwrap().unwrap();

        for (i, id) in ids {
            let job = context.store.get(id).await.unwrap().unwrap();
            assert_eq!(job.status, JobStatus::Success);
            assert_eq!(job.output, format!("print({})", i));
        }
        assert_eq!(sandbox.live(), 0);
        assert!(context.heartbeat.last_beat().is_some());
    }

    /// Store whose first `get` fails with a transient error
    struct FlakyStore {
        inner: Arc<dyn JobStore>,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl JobStore for FlakyStore {
        fn name(&self) -> &str {
            "flaky"
        }
        async fn create(&self, job: &Job) -> Result<()> {
            self.inner.create(job).await
        }
        async fn get(&self, id: JobId) -> Result<Option<Job>> {
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(Error::Timeout("store unavailable".into()));
            }
            self.inner.get(id).await
        }
        async fn mark_running(&self, id: JobId, worker_id: &str) -> Result<Option<Job>> {
            self.inner.mark_running(id, worker_id).await
        }
        async fn complete(&self, id: JobId, worker_id: &str, outcome: &JobOutcome) -> Result<bool> {
            self.inner.complete(id, worker_id, outcome).await
        }
        async fn pending_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<JobId>> {
            self.inner.pending_before(cutoff).await
        }
        async fn purge_expired(&self, cutoff: DateTime<Utc>) -> Result<u64> {
            self.inner.purge_expired(cutoff).await
        }
    }

    #[tokio::test]
    async fn test_transient_store_errors_are_retried() {
        let mut context = context();
        context.store = Arc::new(FlakyStore {
            inner: context.store.clone(),
            failures: AtomicUsize::new(1),
        });
        let worker = worker(&context, Arc::new(ScriptedSandbox::new()));
        let id = submit(&context, "python", "print(1)").await;

        worker.process(claim(&context, "w1").await).await;

        let job = context.store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Success);
    }

    /// Queue that hands out what `inner` has for the first `healthy_claims`
    /// claims, then fails every claim
    struct FailingQueue {
        inner: Arc<dyn DispatchQueue>,
        healthy_claims: AtomicUsize,
        claims: AtomicUsize,
    }

    #[async_trait]
    impl DispatchQueue for FailingQueue {
        fn name(&self) -> &str {
            "failing"
        }
        async fn enqueue(&self, job_id: JobId) -> Result<i64> {
            self.inner.enqueue(job_id).await
        }
        async fn claim(&self, worker_id: &str, wait: Duration) -> Result<Option<Lease>> {
            self.claims.fetch_add(1, Ordering::SeqCst);
            let healthy = self
                .healthy_claims
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if healthy {
                self.inner.claim(worker_id, wait).await
            } else {
                Err(Error::Queue("connection refused".into()))
            }
        }
        async fn ack(&self, lease: &Lease) -> Result<()> {
            self.inner.ack(lease).await
        }
        async fn depth(&self) -> Result<u64> {
            self.inner.depth().await
        }
        async fn contains(&self, job_id: JobId) -> Result<bool> {
            self.inner.contains(job_id).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_claim_errors_stop_worker_after_draining() {
        let mut context = context();
        let mut config = (*context.config).clone();
        config.worker.max_consecutive_errors = 3;
        config.worker.error_backoff = Duration::from_secs(5);
        context.config = Arc::new(config);

        let failing = Arc::new(FailingQueue {
            inner: context.queue.clone(),
            healthy_claims: AtomicUsize::new(1),
            claims: AtomicUsize::new(0),
        });
        context.queue = failing.clone();

        // Still running when the queue gives out
        let sandbox = Arc::new(ScriptedSandbox::new().with_delay(Duration::from_secs(30)));
        let worker = Arc::new(worker(&context, sandbox.clone()));
        let id = submit(&context, "python", "print(1)").await;

        let started = tokio::time::Instant::now();
        let (_tx, rx) = watch::channel(false);
        let result = worker.run(rx).await;

        assert!(matches!(result, Err(Error::Queue(_))));
        // One good claim, then three failures with a backoff between each pair
        assert_eq!(failing.claims.load(Ordering::SeqCst), 4);
        assert!(started.elapsed() >= Duration::from_secs(30));

        // The in-flight job was finished before `run` returned
        let job = context.store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Success);
        assert_eq!(context.queue.depth().await.unwrap(), 0);
        assert_eq!(sandbox.live(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_stops_after_consecutive_claim_errors() {
        let mut context = context();
        let mut config = (*context.config).clone();
        config.worker.max_consecutive_errors = 2;
        config.worker.error_backoff = Duration::from_secs(1);
        config.queue.claim_wait = Duration::from_secs(1);
        context.config = Arc::new(config);

        // Every claim fails
        let failing = Arc::new(FailingQueue {
            inner: context.queue.clone(),
            healthy_claims: AtomicUsize::new(0),
            claims: AtomicUsize::new(0),
        });
        context.queue = failing.clone();
        let worker = Arc::new(worker(&context, Arc::new(ScriptedSandbox::new())));

        let started = tokio::time::Instant::now();
        let (_tx, rx) = watch::channel(false);
        assert!(worker.run(rx).await.is_err());
        assert_eq!(failing.claims.load(Ordering::SeqCst), 2);
        // A single backoff between the two failures
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(1) && elapsed < Duration::from_secs(2));
    }
}
