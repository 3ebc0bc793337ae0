//! Error types for mcp-server-validator.
//!
//! Besides the per-module error enums, this file defines the failure taxonomy
//! shared by the pipeline, the diagnostics engine and the reporter:
//! [`FailureType`] classifies *what kind* of failure occurred and
//! [`Severity`] ranks how bad it is.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration file could not be read.
    #[error("failed to read configuration file: {path}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Configuration file could not be parsed.
    #[error("failed to parse configuration file: {path}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// Configuration file not found.
    #[error("configuration file not found: {path}")]
    NotFound {
        /// Path where the configuration file was expected.
        path: PathBuf,
    },

    /// Configuration validation failed.
    #[error("configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation failure.
        message: String,
    },
}

/// Environment failures raised by a validator.
///
/// Problems *found* by a validator are reported as data in its
/// `ValidationResult`; this type only covers the cases where the validator
/// could not do its job at all.
#[derive(Error, Debug)]
pub enum ValidatorError {
    /// The external tool the validator drives is not installed.
    #[error("required tool '{tool}' was not found on PATH")]
    ToolMissing {
        /// Program name that failed to start.
        tool: String,
    },

    /// The server directory cannot be read.
    #[error("server path is not readable: {path}")]
    PathUnreadable {
        /// The offending path.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Running the tool failed for a reason other than it being missing.
    #[error("failed to run '{tool}'")]
    Io {
        /// Program name.
        tool: String,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The tool did not finish within the validator timeout.
    #[error("'{tool}' timed out after {}s", .after.as_secs())]
    Timeout {
        /// Program name.
        tool: String,
        /// The configured timeout.
        after: Duration,
    },

    /// The validator was cancelled before it finished.
    #[error("validation cancelled")]
    Cancelled,
}

/// Failure of a single pipeline stage.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StageError {
    /// The stage exceeded its timeout.
    #[error("stage '{stage}' timed out after {}ms", .after.as_millis())]
    Timeout {
        /// Stage name.
        stage: String,
        /// The configured timeout.
        after: Duration,
    },

    /// A failure that retrying cannot fix (compilation failure, missing tool).
    #[error("{kind}: {message}")]
    Fatal {
        /// Classified failure type.
        kind: FailureType,
        /// Primary error text.
        message: String,
    },

    /// An ordinary, possibly transient failure.
    #[error("{message}")]
    Failed {
        /// Primary error text.
        message: String,
    },

    /// The stage's post-condition rejected the accumulated result.
    #[error("post-condition failed: {message}")]
    PostCondition {
        /// Description of the violated post-condition.
        message: String,
    },

    /// The run was cancelled while the stage was executing.
    #[error("stage '{stage}' cancelled")]
    Cancelled {
        /// Stage name.
        stage: String,
    },
}

impl StageError {
    /// Returns `true` if retrying the stage cannot change the outcome.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal { .. } | Self::Cancelled { .. })
    }

    /// The failure type implied by this error, if it carries one.
    #[must_use]
    pub const fn failure_type(&self) -> Option<FailureType> {
        match self {
            Self::Timeout { .. } => Some(FailureType::Timeout),
            Self::Fatal { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

/// Errors raised while rendering or writing reports.
#[derive(Error, Debug)]
pub enum ReportError {
    /// Writing the report file failed.
    #[error("failed to write report: {path}")]
    Write {
        /// Destination path.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Serialising the result failed.
    #[error("failed to serialise report")]
    Serialise(#[from] serde_json::Error),

    /// Writing CSV output failed.
    #[error("failed to write CSV export")]
    Csv(#[from] csv::Error),

    /// An HTML or XML template failed to render.
    #[error("failed to render report template")]
    Template(#[from] askama::Error),
}

/// Classified failure type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FailureType {
    /// The server does not build.
    #[serde(rename = "compilation_error")]
    Compilation,
    /// Source files are structurally malformed.
    #[serde(rename = "syntax_error")]
    Syntax,
    /// Something exceeded its deadline.
    #[serde(rename = "timeout_error")]
    Timeout,
    /// Connection or pipe level failure.
    #[serde(rename = "network_error")]
    Network,
    /// Access denied by the operating system.
    #[serde(rename = "permission_error")]
    Permission,
    /// Out-of-memory or leak related failure.
    #[serde(rename = "memory_error")]
    Memory,
    /// Dependency resolution or audit failure.
    #[serde(rename = "dependency_error")]
    Dependency,
    /// The server violates the MCP / JSON-RPC protocol.
    #[serde(rename = "protocol_error")]
    Protocol,
    /// Nothing recognisable.
    #[serde(rename = "unknown_error")]
    Unknown,
}

impl FailureType {
    /// Every failure type, in classification order.
    pub const ALL: [Self; 9] = [
        Self::Compilation,
        Self::Syntax,
        Self::Timeout,
        Self::Network,
        Self::Permission,
        Self::Memory,
        Self::Dependency,
        Self::Protocol,
        Self::Unknown,
    ];

    /// The wire name, e.g. `compilation_error`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Compilation => "compilation_error",
            Self::Syntax => "syntax_error",
            Self::Timeout => "timeout_error",
            Self::Network => "network_error",
            Self::Permission => "permission_error",
            Self::Memory => "memory_error",
            Self::Dependency => "dependency_error",
            Self::Protocol => "protocol_error",
            Self::Unknown => "unknown_error",
        }
    }

    /// Broad category used to group recommendations.
    #[must_use]
    pub const fn category(self) -> &'static str {
        match self {
            Self::Compilation | Self::Syntax => "build",
            Self::Timeout | Self::Memory => "performance",
            Self::Network | Self::Permission => "environment",
            Self::Dependency => "dependencies",
            Self::Protocol => "protocol",
            Self::Unknown => "general",
        }
    }

    /// Default severity of this failure type.
    #[must_use]
    pub const fn severity(self) -> Severity {
        match self {
            Self::Compilation | Self::Syntax | Self::Permission | Self::Protocol => {
                Severity::Critical
            }
            Self::Timeout | Self::Network | Self::Memory | Self::Dependency => Severity::Major,
            Self::Unknown => Severity::Minor,
        }
    }
}

impl fmt::Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How bad a failure is. Ordered so that `max()` picks the worst.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Cosmetic or advisory.
    #[default]
    Minor,
    /// Degrades the server but does not make it unusable.
    Major,
    /// The server is unusable.
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Minor => "minor",
            Self::Major => "major",
            Self::Critical => "critical",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_display() {
        let error = ConfigError::NotFound {
            path: PathBuf::from("/path/to/config.json"),
        };
        let msg = error.to_string();
        assert!(msg.contains("not found"));
        assert!(msg.contains("config.json"));
    }

    #[test]
    fn validation_error_display() {
        let error = ConfigError::ValidationError {
            message: "invalid setting".to_string(),
        };
        let msg = error.to_string();
        assert!(msg.contains("invalid setting"));
    }

    #[test]
    fn failure_type_serialises_to_wire_name() {
        for kind in FailureType::ALL {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
    }

    #[test]
    fn severity_orders_worst_last() {
        assert!(Severity::Critical > Severity::Major);
        assert!(Severity::Major > Severity::Minor);
        let worst = [Severity::Minor, Severity::Critical, Severity::Major]
            .into_iter()
            .max();
        assert_eq!(worst, Some(Severity::Critical));
    }

    #[test]
    fn fatal_stage_errors_are_not_retryable() {
        let fatal = StageError::Fatal {
            kind: FailureType::Compilation,
            message: "main.go:1: undefined: foo".to_string(),
        };
        assert!(fatal.is_fatal());
        assert_eq!(fatal.failure_type(), Some(FailureType::Compilation));

        let timeout = StageError::Timeout {
            stage: "protocol".to_string(),
            after: Duration::from_millis(50),
        };
        assert!(!timeout.is_fatal());
        assert_eq!(timeout.failure_type(), Some(FailureType::Timeout));
        assert!(timeout.to_string().contains("50ms"));
    }
}
