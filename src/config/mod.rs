//! Configuration module
//!
//! - types/mod.rs: core configuration types (Config, ServerConfig, LimitsConfig, ...)
//! - types/sandbox.rs: container limits and the language table
//! - types/storage.rs: job store / queue backend
//! - io.rs: configuration loading
//! - validation.rs: configuration validation
//! - paths.rs: configuration file paths

mod io;
mod paths;
mod types;
mod validation;

// Re-export core config types
pub use types::{
    Config, LimitsConfig, LogConfig, LogFormat, QueueConfig, ServerConfig, TimeoutPolicy,
    WorkerConfig,
};

// Re-export sandbox types
pub use types::sandbox::{LanguageConfig, ProfileConfig, SandboxConfig};

// Re-export storage types
pub use types::storage::{PostgresConfig, StorageBackendType, StorageConfig};

// Re-export IO and utilities
pub use io::{apply_env_overrides, load_config, load_config_from_path};
pub use paths::{config_dir, config_path};
pub use validation::{validate_config, ConfigValidationResult, ValidationIssue};
