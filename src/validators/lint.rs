//! Linter check.

use std::path::Path;

use indexmap::IndexMap;
use serde_json::json;

use super::command::{run_tool, ToolOutput};
use crate::cancel::CancelSignal;
use crate::config::TestConfig;
use crate::error::ValidatorError;
use crate::results::ValidationResult;

pub(super) async fn validate(
    config: &TestConfig,
    server_path: &Path,
    cancel: &CancelSignal,
) -> Result<ValidationResult, ValidatorError> {
    let output = run_tool(
        &config.validators.lint_command,
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

    // Package headers such as `# example.com/server` carry no finding.
    for line in output.lines().filter(|l| !l.starts_with('#')) {
        if line.to_lowercase().contains("error") {
            errors.push(line.to_string());
        } else {
            warnings.push(line.to_string());
        }
    }

    if !output.success && errors.is_empty() {
        errors.push(format!(
            "lint command failed with {} ({} finding(s))",
            output.exit_description(),
            warnings.len()
        ));
    }

    let mut details = IndexMap::new();
    details.insert("tool".to_string(), json!(output.tool));
    details.insert("exitCode".to_string(), json!(output.exit_code));
    details.insert("errorCount".to_string(), json!(errors.len()));
    details.insert("warningCount".to_string(), json!(warnings.len()));

    ValidationResult::from_findings(
        super::Validator::Lint.name(),
        errors,
        warnings,
        output.duration,
        details,
    )
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn output(success: bool, stderr: &str) -> ToolOutput {
        ToolOutput {
            tool: "go".to_string(),
            exit_code: Some(i32::from(!success)),
            signal: None,
            success,
            stdout: String::new(),
            stderr: stderr.to_string(),
            duration: Duration::from_millis(5),
        }
    }

    #[test]
    fn error_lines_fail_and_others_warn() {
        let result = interpret(&output(
            false,
            "# example.com/server\n./main.go:3:2: error return value not checked\n./main.go:9:1: exported func Foo should have comment\n",
        ));
        assert!(!result.success);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn failing_exit_without_errors_is_synthesised() {
        let result = interpret(&output(false, "./main.go:9:1: printf format %d has arg of wrong type\n"));
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].contains("exit code 1"));
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn clean_lint_passes() {
        let result = interpret(&output(true, ""));
        assert!(result.success);
        assert!(result.warnings.is_empty());
    }
}
