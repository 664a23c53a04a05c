//! Resource-limit violation detection
//!
//! The container runtime only reports OOM kills directly. The other limits
//! surface as errno-style failures inside the runtime, so they are recognized
//! from stderr. Stderr is written by user code, so those signatures only
//! explain a process that exited on its own with a non-zero status; they
//! never turn a clean exit or a timer kill into an error.

use crate::error::SandboxViolation;
use crate::registry::ResourceProfile;

/// Exit status of a process killed with SIGKILL
const SIGKILL_EXIT: i64 = 137;

const MEMORY_PATTERNS: &[&str] = &[
    "MemoryError",
    "JavaScript heap out of memory",
    "failed to allocate memory",
    "NoMemoryError",
    "fatal error: runtime: out of memory",
    "Cannot allocate memory",
];

const PROCESS_PATTERNS: &[&str] = &[
    "Resource temporarily unavailable",
    "BlockingIOError",
    "EAGAIN",
    "can't start new thread",
    "fork: retry",
    "Cannot fork",
    "pthread_create failed",
];

const NETWORK_PATTERNS: &[&str] = &[
    "Network is unreachable",
    "Temporary failure in name resolution",
    "ENETUNREACH",
    "EAI_AGAIN",
    "getaddrinfo",
    "nodename nor servname",
];

const FILESYSTEM_PATTERNS: &[&str] = &[
    "Read-only file system",
    "EROFS",
    "No space left on device",
    "ENOSPC",
];

/// What the runtime observed about a finished container
#[derive(Debug, Clone, Copy, Default)]
pub struct Termination {
    pub exit_code: Option<i64>,
    /// Reported by the container runtime
    pub oom_killed: bool,
    /// The supervisory timer sent the kill
    pub timer_fired: bool,
}

/// Map an observed termination to the limits it tripped, in severity order
pub fn detect_violations(
    termination: Termination,
    stderr: &str,
    profile: &ResourceProfile,
) -> Vec<SandboxViolation> {
    let mut violations = Vec::new();

    let failed_on_its_own = !termination.timer_fired
        && matches!(termination.exit_code, Some(code) if code != 0);
    let sigkilled = failed_on_its_own && termination.exit_code == Some(SIGKILL_EXIT);
    let scan = |patterns: &[&str]| failed_on_its_own && contains_any(stderr, patterns);

    if termination.oom_killed || sigkilled || scan(MEMORY_PATTERNS) {
        violations.push(SandboxViolation::OutOfMemory {
            limit_mb: profile.memory_mb,
        });
    }
    if scan(PROCESS_PATTERNS) {
        violations.push(SandboxViolation::ProcessLimitExceeded {
            limit: profile.pids_limit,
        });
    }
    if scan(NETWORK_PATTERNS) {
        violations.push(SandboxViolation::NetworkDenied);
    }
    if scan(FILESYSTEM_PATTERNS) {
        violations.push(SandboxViolation::FilesystemDenied);
    }

    violations
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| haystack.contains(needle))
}
