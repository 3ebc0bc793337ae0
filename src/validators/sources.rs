//! Source file discovery.

use std::path::{Path, PathBuf};

use glob::{glob_with, MatchOptions, Pattern};
use tracing::warn;

use crate::error::ValidatorError;

/// Directory names never descended into.
const IGNORED_DIRS: &[&str] = &[
    ".git",
    "node_modules",
    "vendor",
    "target",
    "dist",
    "build",
    "__pycache__",
    ".venv",
];

/// Checks that `root` is a readable directory.
///
/// # Errors
///
/// Returns [`ValidatorError::PathUnreadable`] otherwise.
pub fn ensure_readable(root: &Path) -> Result<(), ValidatorError> {
    std::fs::read_dir(root)
        .map(drop)
        .map_err(|source| ValidatorError::PathUnreadable {
            path: root.to_path_buf(),
            source,
        })
}

/// Files under `root` matching any of `patterns`, sorted and de-duplicated.
///
/// Patterns are relative to `root`. Files inside [`IGNORED_DIRS`] are
/// skipped. Invalid patterns are logged and ignored.
///
/// # Errors
///
/// Returns [`ValidatorError::PathUnreadable`] if `root` cannot be read.
pub fn discover(root: &Path, patterns: &[String]) -> Result<Vec<PathBuf>, ValidatorError> {
    ensure_readable(root)?;

    let options = MatchOptions {
        case_sensitive: true,
        require_literal_separator: false,
        require_literal_leading_dot: true,
    };
    let base = Pattern::escape(&root.to_string_lossy());

    let mut files = Vec::new();
    for pattern in patterns {
        let full = format!("{base}/{pattern}");
        let entries = match glob_with(&full, options) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(pattern = %pattern, error = %e, "Ignoring invalid source glob");
                continue;
            }
        };
        files.extend(
            entries
                .filter_map(Result::ok)
                .filter(|path| path.is_file() && !is_ignored(root, path)),
        );
    }

    files.sort();
    files.dedup();
    Ok(files)
}

/// `path` relative to `root`, with forward slashes, for messages.
#[must_use]
pub fn relative(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

fn is_ignored(root: &Path, path: &Path) -> bool {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .any(|c| IGNORED_DIRS.iter().any(|d| c.as_os_str() == *d))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovers_sorted_files_and_skips_vendored_code() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("pkg")).unwrap();
        std::fs::create_dir_all(dir.path().join("vendor/dep")).unwrap();
        std::fs::write(dir.path().join("main.go"), "package main").unwrap();
        std::fs::write(dir.path().join("pkg/b.go"), "package pkg").unwrap();
        std::fs::write(dir.path().join("pkg/a.go"), "package pkg").unwrap();
        std::fs::write(dir.path().join("vendor/dep/x.go"), "package dep").unwrap();

        let files = discover(dir.path(), &["**/*.go".to_string(), "*.go".to_string()]).unwrap();
        let names: Vec<String> = files.iter().map(|f| relative(dir.path(), f)).collect();
        assert_eq!(names, vec!["main.go", "pkg/a.go", "pkg/b.go"]);
    }

    #[test]
    fn missing_root_is_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        let err = discover(&dir.path().join("nope"), &["**/*".to_string()]).unwrap_err();
        assert!(matches!(err, ValidatorError::PathUnreadable { .. }));
    }
}
