//! Source tree and dependency facts used to correlate failures.

use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::validators::dependency::{detect_manifest, ManifestKind};
use crate::validators::sources::{discover, relative};

/// Files changed more recently than this count as "recently modified".
pub const RECENT_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

const LARGEST_FILES: usize = 5;

const ENTRY_POINTS: &[&str] = &[
    "main.go",
    "cmd/server/main.go",
    "src/main.rs",
    "index.js",
    "index.ts",
    "src/index.ts",
    "main.py",
    "server.py",
    "__main__.py",
];

/// One file with its line count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSize {
    /// Path relative to the server root.
    pub path: String,
    /// Number of lines.
    pub lines: usize,
}

/// Shape of the generated source tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeAnalysis {
    /// Source files found.
    pub file_count: usize,
    /// Lines across all files.
    pub total_lines: usize,
    /// File count per extension.
    pub languages: IndexMap<String, usize>,
    /// Conventional entry point files present.
    pub entry_points: Vec<String>,
    /// The largest files by line count.
    pub largest_files: Vec<FileSize>,
}

impl CodeAnalysis {
    /// Scans `root` with the given source globs. An unreadable tree yields
    /// an empty analysis.
    #[must_use]
    pub fn scan(root: &Path, patterns: &[String]) -> Self {
        let files = discover(root, patterns).unwrap_or_default();
        let mut analysis = Self {
            file_count: files.len(),
            ..Self::default()
        };

        let mut sizes = Vec::with_capacity(files.len());
        for file in &files {
            let ext = file
                .extension()
                .map_or_else(|| "(none)".to_string(), |e| e.to_string_lossy().into_owned());
            *analysis.languages.entry(ext).or_insert(0) += 1;

            let lines = fs::read(file)
                .map(|bytes| bytecount_lines(&bytes))
                .unwrap_or(0);
            analysis.total_lines += lines;
            sizes.push(FileSize {
                path: relative(root, file),
                lines,
            });
        }
        analysis.languages.sort_by(|ka, a, kb, b| b.cmp(a).then_with(|| ka.cmp(kb)));

        sizes.sort_by(|a, b| b.lines.cmp(&a.lines).then_with(|| a.path.cmp(&b.path)));
        sizes.truncate(LARGEST_FILES);
        analysis.largest_files = sizes;

        analysis.entry_points = ENTRY_POINTS
            .iter()
            .filter(|p| root.join(p).is_file())
            .map(|p| (*p).to_string())
            .collect();
        analysis
    }
}

fn bytecount_lines(bytes: &[u8]) -> usize {
    if bytes.is_empty() {
        return 0;
    }
    let newlines = bytes.iter().filter(|b| **b == b'\n').count();
    if bytes.ends_with(b"\n") {
        newlines
    } else {
        newlines + 1
    }
}

/// Dependency manifest facts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyAnalysis {
    /// Manifest file name, if one was found.
    pub manifest: Option<String>,
    /// Ecosystem of the manifest.
    pub ecosystem: Option<String>,
    /// Declared dependencies.
    pub declared_dependencies: usize,
    /// Lock file found next to the manifest.
    pub lock_file: Option<String>,
    /// Manifest or lock files modified within [`RECENT_WINDOW`].
    pub recently_modified: Vec<String>,
}

impl DependencyAnalysis {
    /// Inspects the manifest in `root`.
    #[must_use]
    pub fn scan(root: &Path) -> Self {
        let Some(kind) = detect_manifest(root) else {
            return Self::default();
        };
        let text = fs::read_to_string(root.join(kind.manifest)).unwrap_or_default();
        let lock_file = kind
            .lock_files
            .iter()
            .find(|l| root.join(l).is_file())
            .map(|l| (*l).to_string());

        let now = SystemTime::now();
        let recently_modified = std::iter::once(kind.manifest)
            .chain(lock_file.as_deref())
            .filter(|name| is_recent(&root.join(name), now))
            .map(String::from)
            .collect();

        Self {
            manifest: Some(kind.manifest.to_string()),
            ecosystem: Some(kind.ecosystem.to_string()),
            declared_dependencies: count_dependencies(kind, &text),
            lock_file,
            recently_modified,
        }
    }
}

fn is_recent(path: &Path, now: SystemTime) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| now.duration_since(modified).ok())
        .is_some_and(|age| age <= RECENT_WINDOW)
}

/// Counts declared dependencies with a light per-ecosystem parse.
#[must_use]
pub fn count_dependencies(kind: &ManifestKind, text: &str) -> usize {
    match kind.manifest {
        "go.mod" => count_go_requires(text),
        "Cargo.toml" => count_toml_tables(text, |t| t.ends_with("dependencies")),
        "package.json" => serde_json::from_str::<serde_json::Value>(text)
            .map(|v| {
                ["dependencies", "devDependencies"]
                    .iter()
                    .filter_map(|k| v.get(*k).and_then(serde_json::Value::as_object))
                    .map(serde_json::Map::len)
                    .sum()
            })
            .unwrap_or(0),
        "pyproject.toml" => count_pyproject(text),
        _ => text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#') && !l.starts_with('-'))
            .count(),
    }
}

fn count_go_requires(text: &str) -> usize {
    let mut count = 0;
    let mut in_block = false;
    for line in text.lines().map(str::trim) {
        if in_block {
            if line == ")" {
                in_block = false;
            } else if !line.is_empty() && !line.starts_with("//") {
                count += 1;
            }
        } else if line == "require (" {
            in_block = true;
        } else if line.starts_with("require ") {
            count += 1;
        }
    }
    count
}

fn count_toml_tables(text: &str, wanted: impl Fn(&str) -> bool) -> usize {
    let mut count = 0;
    let mut in_table = false;
    for line in text.lines().map(str::trim) {
        if let Some(header) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            in_table = wanted(header.trim());
        } else if in_table && line.contains('=') && !line.starts_with('#') {
            count += 1;
        }
    }
    count
}

fn count_pyproject(text: &str) -> usize {
    let mut count = 0;
    let mut in_list = false;
    for line in text.lines().map(str::trim) {
        if in_list {
            if line.starts_with(']') {
                in_list = false;
            } else if line.starts_with('"') || line.starts_with('\'') {
                count += 1;
            }
        } else if line.starts_with("dependencies") && line.ends_with('[') {
            in_list = true;
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validators::dependency::MANIFESTS;

    fn kind(manifest: &str) -> &'static ManifestKind {
        MANIFESTS.iter().find(|m| m.manifest == manifest).unwrap()
    }

    #[test]
    fn counts_go_requires() {
        let text = "module x\n\ngo 1.22\n\nrequire (\n\tgithub.com/a/b v1.0.0\n\tgithub.com/c/d v0.2.0 // indirect\n)\n\nrequire github.com/e/f v1.1.0\n";
        assert_eq!(count_dependencies(kind("go.mod"), text), 3);
    }

    #[test]
    fn counts_cargo_and_npm() {
        let cargo = "[package]\nname = \"x\"\n\n[dependencies]\nserde = \"1\"\ntokio = { version = \"1\" }\n\n[dev-dependencies]\ntempfile = \"3\"\n";
        assert_eq!(count_dependencies(kind("Cargo.toml"), cargo), 3);
        let npm = r#"{ "dependencies": { "a": "1" }, "devDependencies": { "b": "2", "c": "3" } }"#;
        assert_eq!(count_dependencies(kind("package.json"), npm), 3);
    }

    #[test]
    fn scan_finds_manifest_lock_and_recent_changes() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("go.mod"), "module x\nrequire github.com/a/b v1.0.0\n").unwrap();
        fs::write(dir.path().join("go.sum"), "").unwrap();
        let analysis = DependencyAnalysis::scan(dir.path());
        assert_eq!(analysis.manifest.as_deref(), Some("go.mod"));
        assert_eq!(analysis.lock_file.as_deref(), Some("go.sum"));
        assert_eq!(analysis.declared_dependencies, 1);
        assert_eq!(analysis.recently_modified, vec!["go.mod".to_string(), "go.sum".to_string()]);
    }

    #[test]
    fn code_analysis_counts_lines_and_entry_points() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("main.go"), "package main\n\nfunc main() {}\n").unwrap();
        fs::write(dir.path().join("tools.go"), "package main").unwrap();
        let analysis = CodeAnalysis::scan(dir.path(), &["**/*.go".to_string()]);
        assert_eq!(analysis.file_count, 2);
        assert_eq!(analysis.total_lines, 4);
        assert_eq!(analysis.languages.get("go"), Some(&2));
        assert_eq!(analysis.entry_points, vec!["main.go".to_string()]);
        assert_eq!(analysis.largest_files[0].path, "main.go");
    }
}
