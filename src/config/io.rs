//! Configuration I/O - Loading configuration
//!
//! Handles reading configuration from files and environment variables.

use std::path::Path;

use super::types::Config;
use crate::error::{Error, Result};

/// Load configuration with layered precedence:
/// 1. Config file (config.json / config.toml) if it exists, otherwise defaults
/// 2. Environment variable overrides (includes .env)
pub fn load_config() -> Result<Config> {
    let config_path = super::paths::config_path();

    let mut config = if config_path.exists() {
        load_config_from_path(&config_path)?
    } else {
        Config::default()
    };

    // Apply environment variable overrides (highest precedence)
    apply_env_overrides(&mut config);

    Ok(config)
}

/// Load configuration from a specific path
pub fn load_config_from_path(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;

    // Detect format by extension
    let config: Config = if path.extension().is_some_and(|ext| ext == "json") {
        // Parse as JSON5 (more lenient than strict JSON)
        json5::from_str(&content).map_err(|e| Error::Config(format!("Invalid JSON config: {}", e)))?
    } else if path.extension().is_some_and(|ext| ext == "toml") {
        toml::from_str(&content).map_err(|e| Error::Config(format!("Invalid TOML config: {}", e)))?
    } else {
        // Try JSON5 first, then TOML
        json5::from_str(&content)
            .or_else(|_| toml::from_str(&content).map_err(|e| Error::Config(e.to_string())))
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?
    };

    Ok(config)
}

/// Apply environment variable overrides to an existing config.
///
/// Loads `.env` first, then overlays any set variables. Env vars have the
/// highest precedence: defaults < file < env.
pub fn apply_env_overrides(config: &mut Config) {
    use super::types::storage::{PostgresConfig, StorageBackendType};
    use secrecy::SecretString;

    dotenvy::dotenv().ok();

    // Database overrides
    if let Ok(database_url) = std::env::var("DATABASE_URL") {
        let pg = config.storage.postgres.get_or_insert_with(|| PostgresConfig {
            url: SecretString::from(String::new()),
            max_connections: 5,
            connect_timeout_secs: 30,
        });
        pg.url = SecretString::from(database_url);
        config.storage.backend = StorageBackendType::Postgres;
    }
    if let Ok(max_conn) = std::env::var("DATABASE_MAX_CONNECTIONS") {
        if let Some(ref mut pg) = config.storage.postgres {
            if let Ok(v) = max_conn.parse() {
                pg.max_connections = v;
            }
        }
    }

    // Server overrides
    if let Ok(bind) = std::env::var("CODEXEC_BIND") {
        config.server.bind = bind;
    }
    if let Ok(port) = std::env::var("CODEXEC_PORT") {
        if let Ok(port) = port.parse() {
            config.server.port = port;
        }
    }

    // Limits overrides
    if let Ok(max) = std::env::var("CODEXEC_MAX_TIMEOUT") {
        if let Ok(v) = max.parse() {
            config.limits.max_timeout_secs = v;
        }
    }
    if let Ok(max) = std::env::var("CODEXEC_MAX_CODE_BYTES") {
        if let Ok(v) = max.parse() {
            config.limits.max_code_bytes = v;
        }
    }

    // Worker overrides
    if let Ok(id) = std::env::var("CODEXEC_WORKER_ID") {
        config.worker.id = id;
    }
    if let Ok(n) = std::env::var("CODEXEC_WORKER_CONCURRENCY") {
        if let Ok(v) = n.parse() {
            config.worker.concurrency = v;
        }
    }

    // Log overrides
    if let Ok(level) = std::env::var("CODEXEC_LOG_LEVEL") {
        config.log.level = level;
    }
    if let Ok(format) = std::env::var("CODEXEC_LOG_FORMAT") {
        match format.to_lowercase().as_str() {
            "json" => config.log.format = super::types::LogFormat::Json,
            "pretty" => config.log.format = super::types::LogFormat::Pretty,
            _ => {}
        }
    }
}
