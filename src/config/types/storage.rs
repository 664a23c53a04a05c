//! Storage configuration types
//!
//! Selects the job store / dispatch queue backend and the retention window.

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Backend for both the job store and the dispatch queue
    #[serde(default)]
    pub backend: StorageBackendType,
    /// PostgreSQL configuration
    pub postgres: Option<PostgresConfig>,
    /// Jobs older than this are no longer served and get purged
    #[serde(default = "default_retention", with = "humantime_serde")]
    pub retention: Duration,
    /// How often the server purges expired jobs and fails orphaned ones
    #[serde(default = "default_purge_interval", with = "humantime_serde")]
    pub purge_interval: Duration,
    /// A PENDING job with no queue message for this long is failed
    #[serde(default = "default_orphan_grace", with = "humantime_serde")]
    pub orphan_grace: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            backend: StorageBackendType::default(),
            postgres: None,
            retention: default_retention(),
            purge_interval: default_purge_interval(),
            orphan_grace: default_orphan_grace(),
        }
    }
}

fn default_retention() -> Duration {
    Duration::from_secs(7 * 24 * 60 * 60)
}

fn default_purge_interval() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_orphan_grace() -> Duration {
    Duration::from_secs(5 * 60)
}

/// Storage backend type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackendType {
    /// In-process store and queue; API and workers must share a process
    #[default]
    Memory,
    /// PostgreSQL tables shared by every API and worker process
    Postgres,
}

impl std::fmt::Display for StorageBackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageBackendType::Memory => write!(f, "memory"),
            StorageBackendType::Postgres => write!(f, "postgres"),
        }
    }
}

/// PostgreSQL configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    /// Database URL
    #[serde(skip_serializing)]
    pub url: SecretString,
    /// Maximum connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_max_connections() -> u32 {
    5
}

fn default_connect_timeout() -> u64 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn test_storage_default_is_memory() {
        let config = StorageConfig::default();
        assert_eq!(config.backend, StorageBackendType::Memory);
        assert_eq!(config.retention, Duration::from_secs(604_800));
    }

    #[test]
    fn test_postgres_url_not_serialized() {
        let config: StorageConfig = serde_json::from_str(
            r#"{ "backend": "postgres", "postgres": { "url": "postgres://u:p@db/jobs" } }"#,
        )
        .unwrap();
        let pg = config.postgres.as_ref().unwrap();
        assert_eq!(pg.url.expose_secret(), "postgres://u:p@db/jobs");
        assert_eq!(pg.max_connections, 5);

        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("u:p@db"));
    }
}
