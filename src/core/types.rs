//! Core types used across the application
//!
//! The `Job` record, its status machine and the terminal outcome a worker
//! writes back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Job identifier
pub type JobId = Uuid;

/// Status of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    /// Accepted and queued, not yet claimed
    Pending,
    /// Claimed by a worker and executing
    Running,
    /// Exited 0 with no resource-limit violation
    Success,
    /// Non-zero exit, limit violation, or infrastructure failure
    Error,
    /// Killed by the wall-clock timer
    Timeout,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Success => "SUCCESS",
            JobStatus::Error => "ERROR",
            JobStatus::Timeout => "TIMEOUT",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Error | JobStatus::Timeout)
    }

    fn rank(&self) -> u8 {
        match self {
            JobStatus::Pending => 0,
            JobStatus::Running => 1,
            JobStatus::Success | JobStatus::Error | JobStatus::Timeout => 2,
        }
    }

    /// Forward-only transitions. RUNNING may be re-entered by a worker that
    /// picked the job up after a previous lease expired.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        next.rank() > self.rank() || (*self == JobStatus::Running && next == JobStatus::Running)
    }
}

impl std::str::FromStr for JobStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "PENDING" => Ok(JobStatus::Pending),
            "RUNNING" => Ok(JobStatus::Running),
            "SUCCESS" => Ok(JobStatus::Success),
            "ERROR" => Ok(JobStatus::Error),
            "TIMEOUT" => Ok(JobStatus::Timeout),
            other => Err(crate::Error::Internal(format!("Unknown job status: {}", other))),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A code execution job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub language: String,
    pub code: String,
    pub timeout_seconds: u64,
    pub status: JobStatus,
    pub output: String,
    pub error: String,
    /// Present iff the job is terminal
    pub execution_time_ms: Option<u64>,
    /// Exit status of the user process; absent for timeouts and
    /// infrastructure failures
    pub exit_code: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Number of times a worker moved the job to RUNNING
    pub attempts: u32,
    /// Last worker that wrote to the job
    pub worker_id: Option<String>,
}

impl Job {
    /// Create a fresh PENDING job with a new identifier
    pub fn new(language: impl Into<String>, code: impl Into<String>, timeout_seconds: u64) -> Self {
        Job {
            id: Uuid::new_v4(),
            language: language.into(),
            code: code.into(),
            timeout_seconds,
            status: JobStatus::Pending,
            output: String::new(),
            error: String::new(),
            execution_time_ms: None,
            exit_code: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            attempts: 0,
            worker_id: None,
        }
    }

    /// Move the job to RUNNING. Returns false (and changes nothing) if terminal.
    pub fn apply_running(&mut self, worker_id: &str, now: DateTime<Utc>) -> bool {
        if !self.status.can_transition_to(JobStatus::Running) {
            return false;
        }
        self.status = JobStatus::Running;
        self.started_at = Some(now.max(self.created_at));
        self.attempts += 1;
        self.worker_id = Some(worker_id.to_string());
        true
    }

    /// Write the terminal outcome. Returns false (and changes nothing) if the
    /// job is already terminal.
    pub fn apply_outcome(&mut self, worker_id: &str, outcome: &JobOutcome, now: DateTime<Utc>) -> bool {
        if !self.status.can_transition_to(outcome.status) {
            return false;
        }
        let floor = self.started_at.unwrap_or(self.created_at);
        self.status = outcome.status;
        self.output = outcome.output.clone();
        self.error = outcome.error.clone();
        self.execution_time_ms = Some(outcome.execution_time_ms);
        self.exit_code = outcome.exit_code;
        self.completed_at = Some(now.max(floor));
        self.worker_id = Some(worker_id.to_string());
        true
    }
}

/// Terminal fields a worker writes back for a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOutcome {
    /// One of SUCCESS, ERROR, TIMEOUT
    pub status: JobStatus,
    pub output: String,
    pub error: String,
    pub execution_time_ms: u64,
    /// `None` when the process never exited on its own
    pub exit_code: Option<i64>,
}

impl JobOutcome {
    /// ERROR outcome for failures outside user code (queue, store, runner)
    pub fn infrastructure(message: impl Into<String>) -> Self {
        JobOutcome {
            status: JobStatus::Error,
            output: String::new(),
            error: format!("Infrastructure failure: {}", message.into()),
            execution_time_ms: 0,
            exit_code: None,
        }
    }
}
