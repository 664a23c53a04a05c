//! Sandbox configuration types
//!
//! Container limits shared by every execution and the per-language table the
//! language registry is built from.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Sandbox configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Grace period between SIGTERM and SIGKILL when the timer fires
    #[serde(default = "default_kill_grace", with = "humantime_serde")]
    pub kill_grace: Duration,
    /// Pull every registered image when a worker starts
    #[serde(default = "default_true")]
    pub prepull_images: bool,
    /// User the interpreter runs as inside the container
    #[serde(default = "default_user")]
    pub user: String,
    /// Mount point of the writable scratch area
    #[serde(default = "default_scratch_path")]
    pub scratch_path: String,
    /// Prefix for container names (also used as a cleanup label)
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,
    /// Resource profile applied when a language does not override a field
    #[serde(default)]
    pub default_profile: ProfileConfig,
    /// Supported languages, keyed by identifier
    #[serde(default = "default_languages")]
    pub languages: BTreeMap<String, LanguageConfig>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        SandboxConfig {
            kill_grace: default_kill_grace(),
            prepull_images: true,
            user: default_user(),
            scratch_path: default_scratch_path(),
            name_prefix: default_name_prefix(),
            default_profile: ProfileConfig::default(),
            languages: default_languages(),
        }
    }
}

fn default_kill_grace() -> Duration {
    Duration::from_secs(2)
}

fn default_true() -> bool {
    true
}

fn default_user() -> String {
    "65534:65534".to_string()
}

fn default_scratch_path() -> String {
    "/tmp".to_string()
}

fn default_name_prefix() -> String {
    "codexec".to_string()
}

/// Resource limits for one sandbox. Unset fields fall back to the default profile.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileConfig {
    /// CPU share in cores
    pub cpus: Option<f64>,
    /// Hard memory ceiling in MB
    pub memory_mb: Option<u64>,
    /// Maximum processes/threads
    pub pids_limit: Option<i64>,
    /// Size of the writable scratch tmpfs in MB
    pub scratch_mb: Option<u64>,
    /// Allow executing binaries from scratch (needed by compiled languages)
    pub scratch_exec: Option<bool>,
}

/// One language entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageConfig {
    /// Container image
    pub image: String,
    /// Command template; `{code}` inside any argument is replaced with the submission
    pub command: Vec<String>,
    /// Extra environment variables (`KEY=VALUE`)
    #[serde(default)]
    pub env: Vec<String>,
    /// Profile overrides for this language
    #[serde(default)]
    pub profile: ProfileConfig,
}

fn language(image: &str, command: &[&str]) -> LanguageConfig {
    LanguageConfig {
        image: image.to_string(),
        command: command.iter().map(|s| s.to_string()).collect(),
        env: Vec::new(),
        profile: ProfileConfig::default(),
    }
}

pub(crate) fn default_languages() -> BTreeMap<String, LanguageConfig> {
    let mut languages = BTreeMap::new();
    languages.insert(
        "python".to_string(),
        language("python:3.11-alpine", &["python", "-c", "{code}"]),
    );
    languages.insert(
        "javascript".to_string(),
        language("node:20-alpine", &["node", "-e", "{code}"]),
    );
    languages.insert(
        "ruby".to_string(),
        language("ruby:3.2-alpine", &["ruby", "-e", "{code}"]),
    );

    // `go run` compiles into the scratch area and executes from there
    let mut go = language(
        "golang:1.21-alpine",
        &[
            "sh",
            "-c",
            "printf '%s' \"$1\" > /tmp/main.go && exec go run /tmp/main.go",
            "sh",
            "{code}",
        ],
    );
    go.env = vec![
        "HOME=/tmp".to_string(),
        "GOCACHE=/tmp/.gocache".to_string(),
        "GOPATH=/tmp/go".to_string(),
        "CGO_ENABLED=0".to_string(),
    ];
    go.profile = ProfileConfig {
        cpus: Some(1.0),
        memory_mb: Some(512),
        pids_limit: Some(128),
        scratch_mb: Some(256),
        scratch_exec: Some(true),
    };
    languages.insert("go".to_string(), go);

    languages
}
