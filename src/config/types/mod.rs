//! Configuration types module
//!
//! Top-level `Config` plus the small sections (server, limits, queue, worker,
//! log). Sandbox and storage settings live in their own files.

pub mod sandbox;
pub mod storage;

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Submission limits
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Dispatch queue configuration
    #[serde(default)]
    pub queue: QueueConfig,

    /// Worker configuration
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Sandbox configuration (languages, images, resource profiles)
    #[serde(default)]
    pub sandbox: sandbox::SandboxConfig,

    /// Storage configuration
    #[serde(default)]
    pub storage: storage::StorageConfig,

    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Port to bind to
    #[serde(default = "default_port")]
    pub port: u16,
    /// Enable permissive CORS (the original API gateway allowed any origin)
    #[serde(default = "default_true")]
    pub cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind: default_bind(),
            port: default_port(),
            cors: true,
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

/// What to do with a timeout outside `[min_timeout_secs, max_timeout_secs]`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeoutPolicy {
    /// Reject the submission with `InvalidTimeout`
    #[default]
    Reject,
    /// Clamp into range
    Clamp,
}

/// Submission limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum code size in bytes
    #[serde(default = "default_max_code_bytes")]
    pub max_code_bytes: usize,
    #[serde(default = "default_min_timeout")]
    pub min_timeout_secs: u64,
    #[serde(default = "default_max_timeout")]
    pub max_timeout_secs: u64,
    /// Timeout used when the submission does not name one
    #[serde(default = "default_timeout")]
    pub default_timeout_secs: u64,
    #[serde(default)]
    pub timeout_policy: TimeoutPolicy,
    /// Byte cap applied to stored `output` and `error`
    #[serde(default = "default_output_cap")]
    pub output_cap_bytes: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        LimitsConfig {
            max_code_bytes: default_max_code_bytes(),
            min_timeout_secs: default_min_timeout(),
            max_timeout_secs: default_max_timeout(),
            default_timeout_secs: default_timeout(),
            timeout_policy: TimeoutPolicy::default(),
            output_cap_bytes: default_output_cap(),
        }
    }
}

fn default_max_code_bytes() -> usize {
    10 * 1024
}

fn default_min_timeout() -> u64 {
    1
}

fn default_max_timeout() -> u64 {
    30
}

fn default_timeout() -> u64 {
    5
}

fn default_output_cap() -> usize {
    4000
}

/// Dispatch queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// How long a claimed message stays hidden from other workers
    #[serde(default = "default_visibility_timeout", with = "humantime_serde")]
    pub visibility_timeout: Duration,
    /// Deliveries allowed before a job is forced to ERROR
    #[serde(default = "default_max_deliveries")]
    pub max_deliveries: u32,
    /// Longest a single claim blocks waiting for a message
    #[serde(default = "default_claim_wait", with = "humantime_serde")]
    pub claim_wait: Duration,
    /// Polling interval for backends without push notification
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Queue depth at which new submissions are rejected as overloaded
    #[serde(default = "default_overload_threshold")]
    pub overload_threshold: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            visibility_timeout: default_visibility_timeout(),
            max_deliveries: default_max_deliveries(),
            claim_wait: default_claim_wait(),
            poll_interval: default_poll_interval(),
            overload_threshold: default_overload_threshold(),
        }
    }
}

fn default_visibility_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_max_deliveries() -> u32 {
    3
}

fn default_claim_wait() -> Duration {
    Duration::from_secs(20)
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(500)
}

fn default_overload_threshold() -> u64 {
    1000
}

/// Worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Worker identity recorded on leases and job rows
    #[serde(default = "default_worker_id")]
    pub id: String,
    /// Concurrent sandbox slots
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Consecutive claim failures before the worker stops
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u32,
    /// Pause after a failed claim
    #[serde(default = "default_error_backoff", with = "humantime_serde")]
    pub error_backoff: Duration,
    /// Upper bound on retrying a single store write
    #[serde(default = "default_store_retry", with = "humantime_serde")]
    pub store_retry_max_elapsed: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            id: default_worker_id(),
            concurrency: default_concurrency(),
            max_consecutive_errors: default_max_consecutive_errors(),
            error_backoff: default_error_backoff(),
            store_retry_max_elapsed: default_store_retry(),
        }
    }
}

fn default_worker_id() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| {
        let id = uuid::Uuid::new_v4().simple().to_string();
        format!("worker-{}", &id[..8])
    })
}

fn default_concurrency() -> usize {
    2
}

fn default_max_consecutive_errors() -> u32 {
    5
}

fn default_error_backoff() -> Duration {
    Duration::from_secs(5)
}

fn default_store_retry() -> Duration {
    Duration::from_secs(10)
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level filter (overridden by `RUST_LOG`)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log format (pretty, json)
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info,codexec=debug,sqlx=warn".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.limits.max_code_bytes, 10 * 1024);
        assert_eq!(config.limits.default_timeout_secs, 5);
        assert_eq!(config.queue.max_deliveries, 3);
        assert_eq!(config.limits.timeout_policy, TimeoutPolicy::Reject);
    }

    #[test]
    fn test_humantime_durations() {
        let queue: QueueConfig =
            serde_json::from_str(r#"{ "visibility_timeout": "45s", "claim_wait": "2s" }"#).unwrap();
        assert_eq!(queue.visibility_timeout, Duration::from_secs(45));
        assert_eq!(queue.claim_wait, Duration::from_secs(2));
        assert_eq!(queue.poll_interval, Duration::from_millis(500));
    }
}
