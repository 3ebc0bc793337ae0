//! Dependency manifest check.

use std::path::Path;
use std::time::Instant;

use indexmap::IndexMap;
use serde_json::json;

use super::command::run_tool;
use super::sources::ensure_readable;
use crate::cancel::CancelSignal;
use crate::config::TestConfig;
use crate::error::ValidatorError;
use crate::results::ValidationResult;

/// A recognised dependency manifest and the lock files that pin it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManifestKind {
    /// Manifest file name.
    pub manifest: &'static str,
    /// Ecosystem label.
    pub ecosystem: &'static str,
    /// Accepted lock files; empty when the ecosystem has none.
    pub lock_files: &'static [&'static str],
}

/// Manifests in detection order.
pub const MANIFESTS: &[ManifestKind] = &[
    ManifestKind {
        manifest: "go.mod",
        ecosystem: "go",
        lock_files: &["go.sum"],
    },
    ManifestKind {
        manifest: "Cargo.toml",
        ecosystem: "rust",
        lock_files: &["Cargo.lock"],
    },
    ManifestKind {
        manifest: "package.json",
        ecosystem: "node",
        lock_files: &["package-lock.json", "yarn.lock", "pnpm-lock.yaml"],
    },
    ManifestKind {
        manifest: "pyproject.toml",
        ecosystem: "python",
        lock_files: &["poetry.lock", "uv.lock", "pdm.lock"],
    },
    ManifestKind {
        manifest: "requirements.txt",
        ecosystem: "python",
        lock_files: &[],
    },
];

/// The first manifest present in `root`.
#[must_use]
pub fn detect_manifest(root: &Path) -> Option<&'static ManifestKind> {
    MANIFESTS.iter().find(|m| root.join(m.manifest).is_file())
}

pub(super) async fn validate(
    config: &TestConfig,
    server_path: &Path,
    cancel: &CancelSignal,
) -> Result<ValidationResult, ValidatorError> {
    let started = Instant::now();
    ensure_readable(server_path)?;

    let mut errors = Vec::new();
    let mut warnings = Vec::new();
    let mut details = IndexMap::new();

    match detect_manifest(server_path) {
        None => {
            let names: Vec<&str> = MANIFESTS.iter().map(|m| m.manifest).collect();
            errors.push(format!(
                "no dependency manifest found (looked for {})",
                names.join(", ")
            ));
        }
        Some(kind) => {
            details.insert("manifest".to_string(), json!(kind.manifest));
            details.insert("ecosystem".to_string(), json!(kind.ecosystem));

            let lock = kind
                .lock_files
                .iter()
                .find(|lock| server_path.join(lock).is_file());
            details.insert("lockFile".to_string(), json!(lock));
            if lock.is_none() && !kind.lock_files.is_empty() {
                warnings.push(format!(
                    "{} has no lock file ({}); builds are not reproducible",
                    kind.manifest,
                    kind.lock_files.join(" or ")
                ));
            }

            let contents = tokio::fs::read_to_string(server_path.join(kind.manifest))
                .await
                .map_err(|source| ValidatorError::PathUnreadable {
                    path: server_path.join(kind.manifest),
                    source,
                })?;
            if contents.trim().is_empty() {
                errors.push(format!("{} is empty", kind.manifest));
            }
        }
    }

    if let Some(command) = &config.validators.audit_command {
        let output = run_tool(command, server_path, config.timeouts.validator(), cancel).await?;
        details.insert("tool".to_string(), json!(output.tool));
        details.insert("exitCode".to_string(), json!(output.exit_code));
        if !output.success {
            let before = errors.len();
            errors.extend(output.lines().map(String::from));
            if errors.len() == before {
                errors.push(format!(
                    "dependency audit failed with {}",
                    output.exit_description()
                ));
            }
        }
    }

    details.insert("errorCount".to_string(), json!(errors.len()));
    details.insert("warningCount".to_string(), json!(warnings.len()));

    Ok(ValidationResult::from_findings(
        super::Validator::Dependency.name(),
        errors,
        warnings,
        started.elapsed(),
        details,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_manifest_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = validate(&TestConfig::default(), dir.path(), &CancelSignal::new())
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.errors[0].contains("no dependency manifest"));
    }

    #[tokio::test]
    async fn missing_lock_file_warns() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("go.mod"), "module example.com/server\n").unwrap();
        let result = validate(&TestConfig::default(), dir.path(), &CancelSignal::new())
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.warnings.len(), 1);
        assert_eq!(result.details["ecosystem"], json!("go"));
    }

    #[test]
    fn detection_order_prefers_go() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("package.json"), "{}").unwrap();
        std::fs::write(dir.path().join("go.mod"), "module x").unwrap();
        assert_eq!(detect_manifest(dir.path()).map(|m| m.manifest), Some("go.mod"));
    }
}
