//! Build check.

use std::path::Path;
use std::sync::OnceLock;

use indexmap::IndexMap;
use regex::Regex;
use serde_json::json;

use super::command::{run_tool, ToolOutput};
use crate::cancel::CancelSignal;
use crate::config::TestConfig;
use crate::error::ValidatorError;
use crate::results::ValidationResult;

/// `file:line:` or `file:line:col:` at the start of a line, or a line
/// mentioning an error.
fn diagnostic_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^\S+:\d+(:\d+)?:|\berror\b").ok())
        .as_ref()
}

pub(super) async fn validate(
    config: &TestConfig,
    server_path: &Path,
    cancel: &CancelSignal,
) -> Result<ValidationResult, ValidatorError> {
    let output = run_tool(
        &config.validators.build_command,
        server_path,
        config.timeouts.validator(),
        cancel,
    )
    .await?;
    Ok(interpret(&output))
}

fn interpret(output: &ToolOutput) -> ValidationResult {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    for line in output.lines() {
        let lower = line.to_lowercase();
        if lower.contains("warning") {
            warnings.push(line.to_string());
        } else if !output.success && diagnostic_regex().is_some_and(|re| re.is_match(line)) {
            errors.push(line.to_string());
        }
    }

    if !output.success && errors.is_empty() {
        errors.extend(output.lines().map(String::from));
        if errors.is_empty() {
            errors.push(format!(
                "build command failed with {}",
                output.exit_description()
            ));
        }
    }

    let mut details = IndexMap::new();
    details.insert("tool".to_string(), json!(output.tool));
    details.insert("exitCode".to_string(), json!(output.exit_code));
    details.insert("errorCount".to_string(), json!(errors.len()));
    details.insert("warningCount".to_string(), json!(warnings.len()));

    ValidationResult::from_findings(
        super::Validator::Compilation.name(),
        errors,
        warnings,
        output.duration,
        details,
    )
}
