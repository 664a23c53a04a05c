//! Configuration validation
//!
//! Validates configuration and reports issues.

use super::types::Config;

/// Result of configuration validation
#[derive(Debug, Clone)]
pub struct ConfigValidationResult {
    /// Whether the config is valid
    pub valid: bool,
    /// Validation errors (critical)
    pub errors: Vec<ValidationIssue>,
    /// Validation warnings (non-critical)
    pub warnings: Vec<ValidationIssue>,
}

impl ConfigValidationResult {
    /// Create a valid result
    pub fn valid() -> Self {
        ConfigValidationResult {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Add an error
    pub fn with_error(mut self, issue: ValidationIssue) -> Self {
        self.valid = false;
        self.errors.push(issue);
        self
    }

    /// Add a warning
    pub fn with_warning(mut self, issue: ValidationIssue) -> Self {
        self.warnings.push(issue);
        self
    }

    /// Collapse errors into a single configuration error
    pub fn into_result(self) -> crate::Result<Vec<ValidationIssue>> {
        if self.valid {
            return Ok(self.warnings);
        }
        let messages: Vec<String> = self.errors.iter().map(|i| i.to_string()).collect();
        Err(crate::Error::Config(messages.join("; ")))
    }
}

/// A validation issue
#[derive(Debug, Clone)]
pub struct ValidationIssue {
    /// Path to the config field
    pub path: String,
    /// Issue message
    pub message: String,
    /// Suggested fix
    pub suggestion: Option<String>,
}

impl ValidationIssue {
    /// Create a new issue
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        ValidationIssue {
            path: path.into(),
            message: message.into(),
            suggestion: None,
        }
    }

    /// Add a suggestion
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Validate the configuration
pub fn validate_config(config: &Config) -> ConfigValidationResult {
    let mut result = ConfigValidationResult::valid();

    result = validate_limits_config(config, result);
    result = validate_queue_config(config, result);
    result = validate_worker_config(config, result);
    result = validate_sandbox_config(config, result);
    result = validate_storage_config(config, result);

    result
}

fn validate_limits_config(config: &Config, mut result: ConfigValidationResult) -> ConfigValidationResult {
    let limits = &config.limits;

    if limits.min_timeout_secs == 0 {
        result = result.with_error(ValidationIssue::new(
            "limits.min_timeout_secs",
            "Minimum timeout must be at least 1 second",
        ));
    }

    if limits.min_timeout_secs > limits.max_timeout_secs {
        result = result.with_error(ValidationIssue::new(
            "limits",
            format!(
                "min_timeout_secs ({}) is greater than max_timeout_secs ({})",
                limits.min_timeout_secs, limits.max_timeout_secs
            ),
        ));
    }

    if limits.default_timeout_secs < limits.min_timeout_secs
        || limits.default_timeout_secs > limits.max_timeout_secs
    {
        result = result.with_error(
            ValidationIssue::new(
                "limits.default_timeout_secs",
                format!(
                    "Default timeout {}s is outside [{}, {}]",
                    limits.default_timeout_secs, limits.min_timeout_secs, limits.max_timeout_secs
                ),
            )
            .with_suggestion("Pick a default between min_timeout_secs and max_timeout_secs"),
        );
    }

    if limits.max_code_bytes == 0 || limits.output_cap_bytes == 0 {
        result = result.with_error(ValidationIssue::new(
            "limits",
            "max_code_bytes and output_cap_bytes must be greater than zero",
        ));
    }

    result
}

fn validate_queue_config(config: &Config, mut result: ConfigValidationResult) -> ConfigValidationResult {
    // A lease must outlive the longest possible sandbox run, or healthy jobs get redelivered
    let longest_run = std::time::Duration::from_secs(config.limits.max_timeout_secs)
        + config.sandbox.kill_grace;
    if config.queue.visibility_timeout <= longest_run {
        result = result.with_error(
            ValidationIssue::new(
                "queue.visibility_timeout",
                format!(
                    "Visibility timeout {:?} does not exceed max timeout plus kill grace ({:?})",
                    config.queue.visibility_timeout, longest_run
                ),
            )
            .with_suggestion("Raise queue.visibility_timeout or lower limits.max_timeout_secs"),
        );
    }

    if config.queue.max_deliveries == 0 {
        result = result.with_error(ValidationIssue::new(
            "queue.max_deliveries",
            "At least one delivery must be allowed",
        ));
    }

    if config.queue.overload_threshold == 0 {
        result = result.with_warning(ValidationIssue::new(
            "queue.overload_threshold",
            "Overload threshold of 0 rejects every submission",
        ));
    }

    result
}

fn validate_worker_config(config: &Config, mut result: ConfigValidationResult) -> ConfigValidationResult {
    if config.worker.concurrency == 0 {
        result = result.with_error(ValidationIssue::new(
            "worker.concurrency",
            "Worker needs at least one execution slot",
        ));
    }

    if config.worker.id.trim().is_empty() {
        result = result.with_error(
            ValidationIssue::new("worker.id", "Worker id must not be empty")
                .with_suggestion("Set CODEXEC_WORKER_ID"),
        );
    }

    result
}

fn validate_sandbox_config(config: &Config, mut result: ConfigValidationResult) -> ConfigValidationResult {
    if config.sandbox.languages.is_empty() {
        result = result.with_error(
            ValidationIssue::new("sandbox.languages", "No languages configured")
                .with_suggestion("Add at least one entry under sandbox.languages"),
        );
    }

    for (name, language) in &config.sandbox.languages {
        if language.image.trim().is_empty() {
            result = result.with_error(ValidationIssue::new(
                format!("sandbox.languages.{}.image", name),
                "Image must not be empty",
            ));
        }
        if !language.command.iter().any(|arg| arg.contains("{code}")) {
            result = result.with_error(
                ValidationIssue::new(
                    format!("sandbox.languages.{}.command", name),
                    "Command template never references {code}",
                )
                .with_suggestion("Add an argument containing {code}, e.g. [\"python\", \"-c\", \"{code}\"]"),
            );
        }
    }

    result
}

fn validate_storage_config(config: &Config, mut result: ConfigValidationResult) -> ConfigValidationResult {
    use super::types::storage::StorageBackendType;

    if config.storage.backend == StorageBackendType::Postgres && config.storage.postgres.is_none() {
        result = result.with_error(
            ValidationIssue::new(
                "storage.postgres",
                "PostgreSQL backend selected but not configured",
            )
            .with_suggestion("Set DATABASE_URL environment variable or configure storage.postgres"),
        );
    }

    result
}
