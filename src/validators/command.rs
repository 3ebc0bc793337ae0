//! Running external tools on behalf of the validators.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tokio::process::Command;
use tracing::debug;

use crate::cancel::CancelSignal;
use crate::error::ValidatorError;

/// Captured output of a finished tool.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    /// Program name (first element of the command).
    pub tool: String,
    /// Exit code, `None` when killed by a signal.
    pub exit_code: Option<i32>,
    /// Signal that terminated the tool.
    pub signal: Option<i32>,
    /// Whether the tool exited with status 0.
    pub success: bool,
    /// Lossily decoded stdout.
    pub stdout: String,
    /// Lossily decoded stderr.
    pub stderr: String,
    /// Wall-clock time.
    pub duration: Duration,
}

impl ToolOutput {
    /// Non-empty, trimmed lines of stderr followed by stdout.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.stderr
            .lines()
            .chain(self.stdout.lines())
            .map(str::trim_end)
            .filter(|line| !line.trim().is_empty())
    }

    /// Human-readable exit description, e.g. `exit code 2`.
    #[must_use]
    pub fn exit_description(&self) -> String {
        match (self.exit_code, self.signal) {
            (Some(code), _) => format!("exit code {code}"),
            (None, Some(signal)) => format!("signal {signal}"),
            (None, None) => "unknown exit status".to_string(),
        }
    }
}

/// Runs `command` in `cwd` and captures its output.
///
/// The child is killed if the timeout elapses or `cancel` fires.
///
/// # Errors
///
/// - [`ValidatorError::ToolMissing`] if the program is not installed
/// - [`ValidatorError::Timeout`] if it runs longer than `timeout`
/// - [`ValidatorError::Cancelled`] if `cancel` fires
/// - [`ValidatorError::Io`] for any other spawn failure
pub async fn run_tool(
    command: &[String],
    cwd: &Path,
    timeout: Duration,
    cancel: &CancelSignal,
) -> Result<ToolOutput, ValidatorError> {
    let Some((program, args)) = command.split_first() else {
        return Err(ValidatorError::ToolMissing {
            tool: String::new(),
        });
    };

    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!(tool = %program, args = ?args, cwd = %cwd.display(), "Running tool");
    let started = Instant::now();
    let output = tokio::select! {
        biased;
        () = cancel.cancelled() => return Err(ValidatorError::Cancelled),
        outcome = tokio::time::timeout(timeout, cmd.output()) => match outcome {
            Ok(Ok(output)) => output,
            Ok(Err(source)) if source.kind() == std::io::ErrorKind::NotFound => {
                return Err(ValidatorError::ToolMissing { tool: program.clone() });
            }
            Ok(Err(source)) => {
                return Err(ValidatorError::Io { tool: program.clone(), source });
            }
            Err(_) => {
                return Err(ValidatorError::Timeout { tool: program.clone(), after: timeout });
            }
        },
    };

    let result = ToolOutput {
        tool: program.clone(),
        exit_code: output.status.code(),
        signal: exit_signal(&output.status),
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        duration: started.elapsed(),
    };
    debug!(
        tool = %result.tool,
        status = %result.exit_description(),
        elapsed_ms = result.duration.as_millis(),
        "Tool finished"
    );
    Ok(result)
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
const fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn captures_output_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let output = run_tool(
            &sh("echo out; echo err >&2; exit 3"),
            dir.path(),
            Duration::from_secs(10),
            &CancelSignal::new(),
        )
        .await
        .unwrap();

        assert!(!output.success);
        assert_eq!(output.exit_code, Some(3));
        assert_eq!(output.lines().collect::<Vec<_>>(), vec!["err", "out"]);
        assert_eq!(output.exit_description(), "exit code 3");
    }

    #[tokio::test]
    async fn missing_tool_is_an_environment_failure() {
        let dir = tempfile::tempdir().unwrap();
        let err = run_tool(
            &["definitely-not-a-real-tool-1b2c".to_string()],
            dir.path(),
            Duration::from_secs(10),
            &CancelSignal::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ValidatorError::ToolMissing { .. }));
    }

    #[tokio::test]
    async fn slow_tool_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let err = run_tool(
            &sh("sleep 5"),
            dir.path(),
            Duration::from_millis(100),
            &CancelSignal::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ValidatorError::Timeout { .. }));
    }
}
