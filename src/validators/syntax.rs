//! Structural source check.
//!
//! This is not a parser. It catches the truncated or mangled files code
//! generators tend to produce: invalid UTF-8, unbalanced brackets, runaway
//! string literals and malformed JSON.

use std::path::Path;
use std::time::Instant;

use indexmap::IndexMap;
use serde_json::json;

use super::sources::{discover, relative};
use crate::cancel::CancelSignal;
use crate::config::TestConfig;
use crate::error::ValidatorError;
use crate::results::ValidationResult;

/// Comment and string conventions of a source language.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dialect {
    /// `//`, `/* */`, `"…"`, `'…'` and backtick strings (Go, JS, TS).
    CLike,
    /// Like [`Dialect::CLike`] but `'` may open a lifetime, not a literal.
    Rust,
    /// `#` comments, `"…"` and `'…'` strings.
    Python,
}

impl Dialect {
    fn for_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "go" | "js" | "mjs" | "cjs" | "ts" | "tsx" | "jsx" | "java" | "c" | "h" => {
                Some(Self::CLike)
            }
            "rs" => Some(Self::Rust),
            "py" => Some(Self::Python),
            _ => None,
        }
    }
}

pub(super) async fn validate(
    config: &TestConfig,
    server_path: &Path,
    cancel: &CancelSignal,
) -> Result<ValidationResult, ValidatorError> {
    let started = Instant::now();
    let files = discover(server_path, &config.validators.source_globs)?;

    let mut errors = Vec::new();
    let mut warnings = Vec::new();
    let mut checked = 0usize;
    for file in &files {
        if cancel.is_cancelled() {
            return Err(ValidatorError::Cancelled);
        }
        let rel = relative(server_path, file);
        let bytes = tokio::fs::read(file)
            .await
            .map_err(|source| ValidatorError::PathUnreadable {
                path: file.clone(),
                source,
            })?;
        checked += 1;

        let Ok(text) = std::str::from_utf8(&bytes) else {
            errors.push(format!("{rel}: file is not valid UTF-8"));
            continue;
        };

        if file.extension().is_some_and(|e| e == "json") {
            if let Err(e) = serde_json::from_str::<serde_json::Value>(text) {
                errors.push(format!(
                    "{rel}:{}:{}: invalid JSON: {e}",
                    e.line(),
                    e.column()
                ));
            }
        } else if let Some(dialect) = Dialect::for_path(file) {
            errors.extend(check_delimiters(text, dialect).into_iter().map(|e| format!("{rel}:{e}")));
        } else {
            warnings.push(format!("{rel}: no structural check for this file type"));
        }
    }

    let mut details = IndexMap::new();
    details.insert("filesChecked".to_string(), json!(checked));
    details.insert("errorCount".to_string(), json!(errors.len()));

    Ok(ValidationResult::from_findings(
        super::Validator::Syntax.name(),
        errors,
        warnings,
        started.elapsed(),
        details,
    ))
}

/// Finds unbalanced delimiters and unterminated literals.
///
/// Each problem is reported as `line: message`.
fn check_delimiters(text: &str, dialect: Dialect) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut problems = Vec::new();
    let mut stack: Vec<(char, usize)> = Vec::new();
    let mut line = 1usize;
    let mut i = 0usize;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            '\n' => line += 1,
            '/' if dialect != Dialect::Python && next == Some('/') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
                continue;
            }
            '#' if dialect == Dialect::Python => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
                continue;
            }
            '/' if dialect != Dialect::Python && next == Some('*') => {
                let opened = line;
                i += 2;
                loop {
                    match chars.get(i) {
                        None => {
                            problems.push(format!("{opened}: unterminated block comment"));
                            return problems;
                        }
                        Some('*') if chars.get(i + 1) == Some(&'/') => {
                            i += 2;
                            break;
                        }
                        Some('\n') => line += 1,
                        Some(_) => {}
                    }
                    i += 1;
                }
                continue;
            }
            '\'' if dialect == Dialect::Rust && !is_rust_char_literal(&chars, i) => {}
            '"' | '\'' | '`' => {
                if c == '`' && dialect != Dialect::CLike {
                    i += 1;
                    continue;
                }
                let opened = line;
                // Backtick strings may span lines; the others may not, except
                // that Rust and Python strings can.
                let multiline = c == '`' || (c == '"' && dialect != Dialect::CLike);
                i += 1;
                loop {
                    match chars.get(i) {
                        None => {
                            problems.push(format!("{opened}: unterminated string literal"));
                            return problems;
                        }
                        Some('\\') if c != '`' => i += 1,
                        Some(&q) if q == c => break,
                        Some('\n') if !multiline => {
                            problems.push(format!("{opened}: unterminated string literal"));
                            line += 1;
                            break;
                        }
                        Some('\n') => line += 1,
                        Some(_) => {}
                    }
                    i += 1;
                }
            }
            '(' | '[' | '{' => stack.push((c, line)),
            ')' | ']' | '}' => {
                let expected = match c {
                    ')' => '(',
                    ']' => '[',
                    _ => '{',
                };
                match stack.pop() {
                    Some((open, _)) if open == expected => {}
                    Some((open, opened)) => {
                        problems.push(format!(
                            "{line}: mismatched '{c}', expected closer for '{open}' opened at line {opened}"
                        ));
                    }
                    None => problems.push(format!("{line}: unmatched '{c}'")),
                }
            }
            _ => {}
        }
        i += 1;
    }

    for (open, opened) in stack {
        problems.push(format!("{opened}: unclosed '{open}'"));
    }
    problems
}

/// `'x'`, `'\n'` or `'\u{..}'` starting at `i`; anything else is a lifetime.
fn is_rust_char_literal(chars: &[char], i: usize) -> bool {
    match chars.get(i + 1) {
        Some('\\') => true,
        Some(_) => chars.get(i + 2) == Some(&'\''),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balanced_go_source_is_clean() {
        let src = r#"package main

// a comment with ( unbalanced
func main() {
    s := "quote ) inside"
    r := `raw
    { string`
    /* block ] */
    fmt.Println(s, r, '}')
}
"#;
        assert!(check_delimiters(src, Dialect::CLike).is_empty());
    }

    #[test]
    fn truncated_file_reports_unclosed_brace() {
        let src = "func main() {\n    if x {\n        y()\n";
        assert_eq!(
            check_delimiters(src, Dialect::CLike),
            vec!["1: unclosed '{'", "2: unclosed '{'"]
        );
    }

    #[test]
    fn stray_closer_is_reported_with_line() {
        let src = "a()\n)\n";
        assert_eq!(check_delimiters(src, Dialect::CLike), vec!["2: unmatched ')'"]);
    }

    #[test]
    fn rust_lifetimes_are_not_strings() {
        let src = "fn f<'a>(x: &'a str) -> char { let c = '{'; x.chars().next().unwrap_or(c) }";
        assert!(check_delimiters(src, Dialect::Rust).is_empty());
    }

    #[test]
    fn python_comments_and_strings() {
        let src = "def f():\n    # ( not code\n    return {'a': \"]\"}\n";
        assert!(check_delimiters(src, Dialect::Python).is_empty());
    }

    #[test]
    fn unterminated_string_on_one_line() {
        let src = "x := \"abc\ny := 1\n";
        assert_eq!(
            check_delimiters(src, Dialect::CLike),
            vec!["1: unterminated string literal"]
        );
    }

    #[tokio::test]
    async fn validator_reports_json_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("main.go"), "func main() {\n").unwrap();
        std::fs::write(dir.path().join("manifest.json"), "{\"a\": }").unwrap();

        let config = TestConfig::default();
        let cancel = CancelSignal::new();
        let first = validate(&config, dir.path(), &cancel).await.unwrap();
        let second = validate(&config, dir.path(), &cancel).await.unwrap();

        assert!(!first.success);
        assert_eq!(first.errors.len(), 2);
        assert!(first.errors[0].starts_with("main.go:1:"));
        assert!(first.errors[1].starts_with("manifest.json:1:"));
        assert_eq!(first.errors, second.errors);
        assert_eq!(first.warnings, second.warnings);
    }
}
