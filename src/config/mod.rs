//! Configuration file loading and parsing.
//!
//! This module handles loading the configuration file from disk and parsing
//! it into a validated [`TestConfig`]. Named profiles and their persistence
//! live outside this crate; the core only consumes one resolved value.
//!
//! # Configuration File Locations
//!
//! The configuration file is searched in the following order:
//!
//! 1. Path specified via `--config` CLI flag
//! 2. Default location:
//!    - **Linux/macOS:** `~/.mcp-server-validator/config.json`
//!    - **Windows:** `%USERPROFILE%\.mcp-server-validator\config.json`
//!
//! When no path is given and the default file does not exist, the built-in
//! defaults are used.

mod scenarios;
mod settings;

pub use scenarios::{
    default_load_scenarios, default_scenarios, LoadScenario, Scenario, ScenarioStep,
    StepExpectation, PROFILE_DESKTOP, PROFILE_GENERIC,
};
pub use settings::{
    CapabilityPolicy, ConcurrencyConfig, FeatureToggles, IntegrationConfig, LoggingConfig,
    PerformanceConfig, ProtocolConfig, ReportConfig, ReportFormat, RetryConfig,
    ServerLaunchConfig, TestConfig, TimeoutConfig, ValidatorConfig,
};

use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Returns the default configuration directory.
///
/// - **Linux/macOS:** `~/.mcp-server-validator/`
/// - **Windows:** `%USERPROFILE%\.mcp-server-validator\`
#[must_use]
pub fn default_config_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|p| p.join(".mcp-server-validator"))
}

/// Returns the platform-specific default configuration file path.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    default_config_dir().map(|p| p.join("config.json"))
}

/// Loads and parses the configuration file.
///
/// If `path` is `None`, uses the platform-specific default location, falling
/// back to [`TestConfig::default`] when that file does not exist.
///
/// # Errors
///
/// Returns an error if:
/// - An explicitly given configuration file cannot be found
/// - The file cannot be read
/// - The JSON is malformed
/// - Required fields are missing or invalid
pub fn load_config(path: Option<&Path>) -> Result<TestConfig, ConfigError> {
    let config_path = match path {
        Some(p) => p.to_path_buf(),
        None => match default_config_path() {
            Some(p) if p.exists() => p,
            _ => {
                tracing::debug!("No configuration file found, using defaults");
                return Ok(TestConfig::default());
            }
        },
    };

    if !config_path.exists() {
        return Err(ConfigError::NotFound { path: config_path });
    }

    let contents = std::fs::read_to_string(&config_path).map_err(|e| ConfigError::ReadError {
        path: config_path.clone(),
        source: e,
    })?;

    let config: TestConfig =
        serde_json::from_str(&contents).map_err(|e| ConfigError::ParseError {
            path: config_path.clone(),
            source: e,
        })?;

    // Validate the configuration
    config.validate()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_dir_exists() {
        assert!(default_config_dir().is_some());
    }

    #[test]
    fn default_config_path_exists() {
        let path = default_config_path();
        assert!(path.is_some());
        assert!(path.unwrap().to_string_lossy().contains("config.json"));
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let err = load_config(Some(Path::new("/nonexistent/validator.json"))).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound { .. }));
    }

    #[test]
    fn load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "retry": { "attempts": 5 } }"#).unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.retry.attempts, 5);
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = load_config(Some(&path)).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }
}
