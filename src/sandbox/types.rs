//! Sandbox handles and results

use std::time::Duration;

use crate::core::{JobOutcome, JobStatus};
use crate::error::SandboxViolation;
use crate::registry::RuntimeSpec;
use crate::sandbox::output::{truncate_to_cap, CapturedOutput};

/// A created, not yet destroyed, sandbox
#[derive(Debug, Clone)]
pub struct SandboxHandle {
    /// Backend identifier (container name for Docker)
    pub id: String,
    pub spec: RuntimeSpec,
}

/// How the sandboxed process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// Exited on its own (or was killed by a limit) with this status
    Exited(i64),
    /// Terminated by the supervisory timer
    TimedOut,
}

/// Everything observed about one execution
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxResult {
    pub exit: ExitKind,
    pub stdout: CapturedOutput,
    pub stderr: CapturedOutput,
    /// Wall clock from start to observed termination, kill handling included
    pub duration: Duration,
    pub violations: Vec<SandboxViolation>,
}

impl SandboxResult {
    pub fn exited(code: i64, stdout: impl Into<String>, stderr: impl Into<String>, duration: Duration) -> Self {
        SandboxResult {
            exit: ExitKind::Exited(code),
            stdout: CapturedOutput::new(stdout),
            stderr: CapturedOutput::new(stderr),
            duration,
            violations: Vec::new(),
        }
    }

    pub fn timed_out(stdout: impl Into<String>, stderr: impl Into<String>, duration: Duration) -> Self {
        SandboxResult {
            exit: ExitKind::TimedOut,
            stdout: CapturedOutput::new(stdout),
            stderr: CapturedOutput::new(stderr),
            duration,
            violations: Vec::new(),
        }
    }

    pub fn with_violation(mut self, violation: SandboxViolation) -> Self {
        self.violations.push(violation);
        self
    }

    /// Classify into the terminal job fields.
    ///
    /// A recorded limit violation wins over the exit status and the timer.
    /// `detect_violations` only records one for a timer kill when the
    /// runtime itself reported the OOM kill.
    pub fn into_outcome(self, timeout_seconds: u64, output_cap: usize) -> JobOutcome {
        let execution_time_ms = u64::try_from(self.duration.as_millis()).unwrap_or(u64::MAX);
        let output = self.stdout.render();
        let exit_code = match self.exit {
            ExitKind::Exited(code) => Some(code),
            ExitKind::TimedOut => None,
        };

        let (status, error) = if !self.violations.is_empty() {
            let mut message = self
                .violations
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join("\n");
            if !self.stderr.text.trim().is_empty() {
                message.push('\n');
                message.push_str(&self.stderr.text);
            }
            (JobStatus::Error, bounded(&message, self.stderr.truncated, output_cap))
        } else {
            match self.exit {
                ExitKind::TimedOut => (
                    JobStatus::Timeout,
                    format!("Execution exceeded {}s limit", timeout_seconds),
                ),
                ExitKind::Exited(0) => (JobStatus::Success, self.stderr.render()),
                ExitKind::Exited(code) if self.stderr.text.trim().is_empty() => {
                    (JobStatus::Error, format!("Process exited with code {}", code))
                }
                ExitKind::Exited(_) => (JobStatus::Error, self.stderr.render()),
            }
        };

        JobOutcome {
            status,
            output,
            error,
            execution_time_ms,
            exit_code,
        }
    }
}

fn bounded(text: &str, already_truncated: bool, cap: usize) -> String {
    let mut captured = truncate_to_cap(text, cap);
    captured.truncated |= already_truncated;
    captured.render()
}
