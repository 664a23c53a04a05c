//! Error types for Codexec

use thiserror::Error;

/// Result type alias using Codexec's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Codexec
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Submission rejected before it reached the queue
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Dispatch queue error
    #[error("Queue error: {0}")]
    Queue(String),

    /// The lease was reclaimed by another worker before it was acked
    #[error("Lease lost for message {0}")]
    LeaseLost(i64),

    /// Sandbox execution error (runner failed before producing a result)
    #[error("Sandbox error: {0}")]
    Sandbox(String),

    /// Docker/container error
    #[error("Container error: {0}")]
    Container(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Database(_)
                | Error::Queue(_)
                | Error::Container(_)
                | Error::Timeout(_)
                | Error::Io(_)
        )
    }
}

impl From<bollard::errors::Error> for Error {
    fn from(err: bollard::errors::Error) -> Self {
        Error::Container(err.to_string())
    }
}

/// Reasons a submission is rejected synchronously
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Unsupported language '{language}'. Supported: {supported}")]
    UnsupportedLanguage { language: String, supported: String },

    #[error("Code cannot be empty")]
    EmptyCode,

    #[error("Code exceeds maximum size of {max} bytes ({actual} bytes submitted)")]
    CodeTooLarge { max: usize, actual: usize },

    #[error("Timeout must be between {min} and {max} seconds (got {got})")]
    InvalidTimeout { min: u64, max: u64, got: i64 },

    #[error("Execution queue is full ({depth} jobs waiting); retry later")]
    Overloaded { depth: u64 },
}

impl ValidationError {
    /// Stable machine-readable name for API responses
    pub fn kind(&self) -> &'static str {
        match self {
            ValidationError::UnsupportedLanguage { .. } => "unsupported_language",
            ValidationError::EmptyCode => "empty_code",
            ValidationError::CodeTooLarge { .. } => "code_too_large",
            ValidationError::InvalidTimeout { .. } => "invalid_timeout",
            ValidationError::Overloaded { .. } => "overloaded",
        }
    }
}

/// Resource-limit violations detected while a sandbox ran.
///
/// These are deterministic for a given submission, so they end the job as
/// ERROR and are never retried.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxViolation {
    #[error("Memory limit exceeded: process was killed after using more than {limit_mb} MB")]
    OutOfMemory { limit_mb: u64 },

    #[error("Process limit exceeded: more than {limit} processes/threads were requested")]
    ProcessLimitExceeded { limit: i64 },

    #[error("Network access denied: the sandbox has no network")]
    NetworkDenied,

    #[error("Filesystem access denied: only the scratch area is writable")]
    FilesystemDenied,
}
