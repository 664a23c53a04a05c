//! Configuration paths
//!
//! Utilities for resolving configuration file paths.

use std::path::PathBuf;

/// Get the configuration directory
pub fn config_dir() -> PathBuf {
    // Check for explicit override
    if let Ok(dir) = std::env::var("CODEXEC_CONFIG_DIR") {
        return PathBuf::from(dir);
    }

    // Use XDG config directory or fallback
    dirs::config_dir()
        .map(|d| d.join("codexec"))
        .unwrap_or_else(|| {
            dirs::home_dir()
                .map(|h| h.join(".config").join("codexec"))
                .unwrap_or_else(|| PathBuf::from(".codexec"))
        })
}

/// Get the main configuration file path
pub fn config_path() -> PathBuf {
    // Check for explicit override
    if let Ok(path) = std::env::var("CODEXEC_CONFIG") {
        return PathBuf::from(path);
    }

    config_dir().join("config.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_path_is_under_config_dir_or_overridden() {
        let path = config_path();
        if std::env::var("CODEXEC_CONFIG").is_err() {
            assert!(path.starts_with(config_dir()));
            assert_eq!(path.file_name().unwrap(), "config.json");
        }
    }
}
