//! Static security scan.
//!
//! A fixed catalogue of regular expressions run over every source file,
//! optionally followed by an external scanner.

use std::path::Path;
use std::sync::OnceLock;
use std::time::Instant;

use indexmap::IndexMap;
use regex::Regex;
use serde_json::json;
use tracing::warn;

use super::command::run_tool;
use super::sources::{discover, relative};
use crate::cancel::CancelSignal;
use crate::config::TestConfig;
use crate::error::ValidatorError;
use crate::results::ValidationResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RuleSeverity {
    High,
    Medium,
    Low,
}

struct Rule {
    id: &'static str,
    severity: RuleSeverity,
    pattern: &'static str,
    /// Matches containing this pattern are ignored.
    unless: Option<&'static str>,
    message: &'static str,
}

const RULES: &[Rule] = &[
    Rule {
        id: "hardcoded-credential",
        severity: RuleSeverity::High,
        pattern: r#"(?i)\b(password|passwd|secret|api[_-]?key|access[_-]?token|auth[_-]?token)\b["']?\s*(:=|=|:)\s*["'][^"'\s]{8,}["']"#,
        unless: Some(r"(?i)(example|changeme|placeholder|your[_-]|xxx|\$\{)"),
        message: "possible hard-coded credential",
    },
    Rule {
        id: "private-key",
        severity: RuleSeverity::High,
        pattern: r"-----BEGIN (RSA |EC |DSA |OPENSSH )?PRIVATE KEY-----",
        unless: None,
        message: "embedded private key",
    },
    Rule {
        id: "tls-verification-disabled",
        severity: RuleSeverity::High,
        pattern: r"InsecureSkipVerify:\s*true|rejectUnauthorized:\s*false|verify\s*=\s*False|danger_accept_invalid_certs\(\s*true\s*\)",
        unless: None,
        message: "TLS certificate verification disabled",
    },
    Rule {
        id: "shell-command",
        severity: RuleSeverity::Medium,
        pattern: r#"exec\.Command\(\s*"(sh|bash)"\s*,\s*"-c"|child_process\.exec(Sync)?\(|\bos\.system\(|subprocess\.\w+\([^)]*shell\s*=\s*True"#,
        unless: None,
        message: "shell command constructed at runtime",
    },
    Rule {
        id: "wildcard-cors",
        severity: RuleSeverity::Medium,
        pattern: r#"Access-Control-Allow-Origin["']?\s*[,:]\s*["']\*["']"#,
        unless: None,
        message: "CORS allows any origin",
    },
    Rule {
        id: "plain-http",
        severity: RuleSeverity::Low,
        pattern: r#"["']http://[^"'\s]+["']"#,
        unless: Some(r"(localhost|127\.0\.0\.1|0\.0\.0\.0|\[::1\])"),
        message: "plain HTTP endpoint",
    },
];

struct CompiledRule {
    rule: &'static Rule,
    pattern: Regex,
    unless: Option<Regex>,
}

fn compiled_rules() -> &'static [CompiledRule] {
    static RULESET: OnceLock<Vec<CompiledRule>> = OnceLock::new();
    RULESET.get_or_init(|| {
        RULES
            .iter()
            .filter_map(|rule| {
                let pattern = Regex::new(rule.pattern).ok()?;
                let unless = rule.unless.and_then(|u| Regex::new(u).ok());
                Some(CompiledRule {
                    rule,
                    pattern,
                    unless,
                })
            })
            .collect()
    })
}

/// One rule hit.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Finding {
    severity: RuleSeverity,
    text: String,
}

fn scan(rel: &str, text: &str) -> Vec<Finding> {
    let mut findings = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        for compiled in compiled_rules() {
            let Some(hit) = compiled.pattern.find(line) else {
                continue;
            };
            if compiled
                .unless
                .as_ref()
                .is_some_and(|u| u.is_match(hit.as_str()))
            {
                continue;
            }
            findings.push(Finding {
                severity: compiled.rule.severity,
                text: format!(
                    "{rel}:{}: [{}] {}",
                    idx + 1,
                    compiled.rule.id,
                    compiled.rule.message
                ),
            });
        }
    }
    findings
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
    let mut by_severity: IndexMap<&str, usize> = IndexMap::new();
    for file in &files {
        if cancel.is_cancelled() {
            return Err(ValidatorError::Cancelled);
        }
        let Ok(text) = tokio::fs::read_to_string(file).await else {
            // Binary or non-UTF-8 files are the syntax validator's concern.
            continue;
        };
        for finding in scan(&relative(server_path, file), &text) {
            let (bucket, label) = match finding.severity {
                RuleSeverity::High => (&mut errors, "high"),
                RuleSeverity::Medium => (&mut warnings, "medium"),
                RuleSeverity::Low => (&mut warnings, "low"),
            };
            bucket.push(finding.text);
            *by_severity.entry(label).or_default() += 1;
        }
    }

    let mut details = IndexMap::new();
    details.insert("filesScanned".to_string(), json!(files.len()));
    details.insert("rules".to_string(), json!(compiled_rules().len()));
    details.insert("findings".to_string(), json!(by_severity));

    if let Some(command) = &config.validators.security_command {
        let output = run_tool(command, server_path, config.timeouts.validator(), cancel).await?;
        details.insert("tool".to_string(), json!(output.tool));
        details.insert("exitCode".to_string(), json!(output.exit_code));
        if !output.success {
            let before = errors.len();
            errors.extend(output.lines().map(|l| format!("{}: {l}", output.tool)));
            if errors.len() == before {
                errors.push(format!(
                    "{} reported findings ({})",
                    output.tool,
                    output.exit_description()
                ));
            }
        }
    }

    if !errors.is_empty() {
        warn!(server = %server_path.display(), findings = errors.len(), "Security scan found high-severity issues");
    }

    Ok(ValidationResult::from_findings(
        super::Validator::Security.name(),
        errors,
        warnings,
        started.elapsed(),
        details,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_rules_compile() {
        assert_eq!(compiled_rules().len(), RULES.len());
    }

    #[test]
    fn detects_credentials_and_tls_bypass() {
        let src = r#"package main
const apiKey = "sk_live_0123456789abcdef"
var cfg = &tls.Config{InsecureSkipVerify: true}
"#;
        let findings = scan("main.go", src);
        let texts: Vec<&str> = findings.iter().map(|f| f.text.as_str()).collect();
        assert_eq!(
            texts,
            vec![
                "main.go:2: [hardcoded-credential] possible hard-coded credential",
                "main.go:3: [tls-verification-disabled] TLS certificate verification disabled",
            ]
        );
        assert!(findings.iter().all(|f| f.severity == RuleSeverity::High));
    }

    #[test]
    fn placeholders_and_localhost_are_ignored() {
        let src = r#"password = "changeme-please"
url = "http://localhost:8080/api"
other = "http://api.example.com/v1"
"#;
        let findings = scan("config.py", src);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].severity, RuleSeverity::Low);
        assert!(findings[0].text.starts_with("config.py:3:"));
    }
}
