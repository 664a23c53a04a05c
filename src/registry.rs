//! Language registry
//!
//! Closed mapping from language identifier to the `RuntimeSpec` used to run
//! it. Built once at startup from `sandbox.languages` and read-only after
//! that; the submission API and the worker both resolve through it so
//! validation and execution can never disagree.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::{ProfileConfig, SandboxConfig};
use crate::error::{Error, Result, ValidationError};

/// Placeholder replaced with the submitted code in command templates
pub const CODE_PLACEHOLDER: &str = "{code}";

/// Resource limits applied to one sandbox
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceProfile {
    /// CPU share in cores
    pub cpus: f64,
    /// Hard memory ceiling in MB (swap disabled)
    pub memory_mb: u64,
    /// Maximum concurrent processes/threads
    pub pids_limit: i64,
    /// Writable scratch size in MB
    pub scratch_mb: u64,
    /// Whether binaries may be executed from scratch
    pub scratch_exec: bool,
}

impl Default for ResourceProfile {
    fn default() -> Self {
        ResourceProfile {
            cpus: 0.5,
            memory_mb: 256,
            pids_limit: 50,
            scratch_mb: 16,
            scratch_exec: false,
        }
    }
}

impl ResourceProfile {
    /// Layer `overrides` over this profile
    fn merged(&self, overrides: &ProfileConfig) -> ResourceProfile {
        ResourceProfile {
            cpus: overrides.cpus.unwrap_or(self.cpus),
            memory_mb: overrides.memory_mb.unwrap_or(self.memory_mb),
            pids_limit: overrides.pids_limit.unwrap_or(self.pids_limit),
            scratch_mb: overrides.scratch_mb.unwrap_or(self.scratch_mb),
            scratch_exec: overrides.scratch_exec.unwrap_or(self.scratch_exec),
        }
    }
}

/// How to execute code for one language
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeSpec {
    pub language: String,
    pub image: String,
    /// Command template containing `{code}`
    pub command: Vec<String>,
    pub env: Vec<String>,
    pub profile: ResourceProfile,
}

impl RuntimeSpec {
    /// Expand the command template for a submission.
    ///
    /// The code always travels as a single argv entry, never through a shell
    /// string the registry did not write itself.
    pub fn command_for(&self, code: &str) -> Vec<String> {
        self.command
            .iter()
            .map(|arg| arg.replace(CODE_PLACEHOLDER, code))
            .collect()
    }
}

/// Registry of supported languages
#[derive(Debug, Clone)]
pub struct LanguageRegistry {
    specs: BTreeMap<String, RuntimeSpec>,
}

impl LanguageRegistry {
    /// Build the registry from sandbox configuration
    pub fn from_config(config: &SandboxConfig) -> Result<Self> {
        let base = ResourceProfile::default().merged(&config.default_profile);
        let mut specs = BTreeMap::new();

        for (name, language) in &config.languages {
            let id = normalize(name);
            if id.is_empty()
                || !id
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '+'))
            {
                return Err(Error::Config(format!("Invalid language identifier: {:?}", name)));
            }
            if !language.command.iter().any(|arg| arg.contains(CODE_PLACEHOLDER)) {
                return Err(Error::Config(format!(
                    "Command for language '{}' does not contain {}",
                    id, CODE_PLACEHOLDER
                )));
            }

            let spec = RuntimeSpec {
                language: id.clone(),
                image: language.image.clone(),
                command: language.command.clone(),
                env: language.env.clone(),
                profile: base.merged(&language.profile),
            };
            if specs.insert(id.clone(), spec).is_some() {
                return Err(Error::Config(format!("Language '{}' is configured twice", id)));
            }
        }

        if specs.is_empty() {
            return Err(Error::Config("No languages configured".to_string()));
        }

        Ok(LanguageRegistry { specs })
    }

    /// Resolve a language identifier (case-insensitive)
    pub fn resolve(&self, language: &str) -> std::result::Result<&RuntimeSpec, ValidationError> {
        self.specs
            .get(&normalize(language))
            .ok_or_else(|| ValidationError::UnsupportedLanguage {
                language: language.trim().to_string(),
                supported: self.supported().join(", "),
            })
    }

    /// Supported identifiers, sorted
    pub fn supported(&self) -> Vec<&str> {
        self.specs.keys().map(|k| k.as_str()).collect()
    }

    /// Distinct images, for pre-pulling
    pub fn images(&self) -> Vec<&str> {
        let mut images: Vec<&str> = self.specs.values().map(|s| s.image.as_str()).collect();
        images.sort_unstable();
        images.dedup();
        images
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

/// Canonical form of a language identifier
pub fn normalize(language: &str) -> String {
    language.trim().to_lowercase()
}
