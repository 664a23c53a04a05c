//! Submission and status operations behind the HTTP routes

use chrono::Utc;
use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::config::{LimitsConfig, TimeoutPolicy};
use crate::context::AppContext;
use crate::core::{DispatchQueue, Intake, Job, JobId, JobStore};
use crate::error::{Error, Result, ValidationError};
use crate::registry::LanguageRegistry;

const SNAPSHOT_CACHE_CAPACITY: u64 = 10_000;
const SNAPSHOT_CACHE_TTL: Duration = Duration::from_secs(10 * 60);

/// Validates submissions, records and enqueues them, and serves snapshots
pub struct SubmissionService {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn DispatchQueue>,
    intake: Arc<dyn Intake>,
    registry: Arc<LanguageRegistry>,
    limits: LimitsConfig,
    overload_threshold: u64,
    retention: Duration,
    /// Terminal snapshots never change, so they can be served from memory
    terminal: Cache<JobId, Job>,
}

impl SubmissionService {
    pub fn new(context: &AppContext) -> Self {
        Self {
            store: context.store.clone(),
            queue: context.queue.clone(),
            intake: context.intake.clone(),
            registry: context.registry.clone(),
            limits: context.config.limits.clone(),
            overload_threshold: context.config.queue.overload_threshold,
            retention: context.config.storage.retention,
            terminal: Cache::builder()
                .max_capacity(SNAPSHOT_CACHE_CAPACITY)
                .time_to_live(SNAPSHOT_CACHE_TTL)
                .build(),
        }
    }

    /// Accept a submission. Returns the PENDING job without waiting for it to run.
    pub async fn submit(&self, language: &str, code: &str, timeout: Option<i64>) -> Result<Job> {
        let spec = self.registry.resolve(language)?;

        if code.trim().is_empty() {
            return Err(ValidationError::EmptyCode.into());
        }
        if code.len() > self.limits.max_code_bytes {
            return Err(ValidationError::CodeTooLarge {
                max: self.limits.max_code_bytes,
                actual: code.len(),
            }
            .into());
        }
        let timeout_seconds = self.resolve_timeout(timeout)?;

        let depth = self.queue.depth().await?;
        if depth >= self.overload_threshold {
            warn!(depth, threshold = self.overload_threshold, "Rejecting submission, queue is full");
            return Err(ValidationError::Overloaded { depth }.into());
        }

        let job = Job::new(spec.language.clone(), code, timeout_seconds);

        for pattern in suspicious_patterns(code) {
            warn!(job_id = %job.id, language = %job.language, pattern, "Suspicious pattern in submission");
        }

        if let Err(e) = self.intake.admit(&job).await {
            error!(job_id = %job.id, "Could not admit job: {}", e);
            return Err(e);
        }

        info!(
            job_id = %job.id,
            language = %job.language,
            timeout = job.timeout_seconds,
            code_bytes = code.len(),
            "Job accepted"
        );
        Ok(job)
    }

    /// Current snapshot of a job. Unknown and expired jobs are `NotFound`.
    pub async fn get_status(&self, id: JobId) -> Result<Job> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.retention).unwrap_or_else(|_| chrono::Duration::days(365 * 100));

        let job = match self.terminal.get(&id).await {
            Some(job) => job,
            None => {
                let job = self
                    .store
                    .get(id)
                    .await?
                    .ok_or_else(|| Error::NotFound(format!("Job {}", id)))?;
                if job.status.is_terminal() {
                    self.terminal.insert(id, job.clone()).await;
                }
                job
            }
        };

        if job.created_at < cutoff {
            return Err(Error::NotFound(format!("Job {}", id)));
        }
        Ok(job)
    }

    pub async fn store_healthy(&self) -> Result<bool> {
        self.store.health_check().await
    }

    /// Current queue depth
    pub async fn queue_depth(&self) -> Result<u64> {
        self.queue.depth().await
    }

    /// Apply the default and the configured bounds to a requested timeout
    pub fn resolve_timeout(&self, requested: Option<i64>) -> std::result::Result<u64, ValidationError> {
        let min = self.limits.min_timeout_secs;
        let max = self.limits.max_timeout_secs;

        let Some(requested) = requested else {
            return Ok(self.limits.default_timeout_secs);
        };

        if requested >= min as i64 && requested <= max as i64 {
            return Ok(requested as u64);
        }

        match self.limits.timeout_policy {
            TimeoutPolicy::Clamp => Ok(requested.max(min as i64).min(max as i64) as u64),
            TimeoutPolicy::Reject => Err(ValidationError::InvalidTimeout {
                min,
                max,
                got: requested,
            }),
        }
    }
}

/// Patterns worth flagging in logs. They never block a submission; the
/// sandbox is what contains them.
pub fn suspicious_patterns(code: &str) -> Vec<&'static str> {
    let lower = code.to_lowercase();
    let mut found = Vec::new();

    let tokens: Vec<&str> = lower.split_whitespace().collect();
    if tokens.windows(2).any(|w| w[0].ends_with("rm") && w[1].starts_with("-rf")) {
        found.push("rm -rf");
    }
    if lower.contains("wget") || lower.contains("curl") {
        found.push("wget|curl");
    }
    if followed_by(&lower, "eval", "(") {
        found.push("eval(");
    }
    if lower.contains("/etc/passwd") {
        found.push("/etc/passwd");
    }
    if followed_by(&lower, ">&", "/dev/tcp") {
        found.push(">& /dev/tcp");
    }

    found
}

/// `head`, optional whitespace, then `tail`, anywhere in `text`
fn followed_by(text: &str, head: &str, tail: &str) -> bool {
    text.match_indices(head)
        .any(|(at, _)| text[at + head.len()..].trim_start().starts_with(tail))
}
