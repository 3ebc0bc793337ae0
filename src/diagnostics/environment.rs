//! Host and toolchain information.

use std::path::Path;
use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use sysinfo::System;
use tracing::debug;

use crate::cancel::CancelSignal;
use crate::config::TestConfig;
use crate::validators::command::run_tool;

const VERSION_TIMEOUT: Duration = Duration::from_secs(5);

/// The machine the validator ran on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentInfo {
    /// Operating system name.
    pub os_name: String,
    /// Operating system version.
    pub os_version: String,
    /// Kernel version.
    pub kernel_version: String,
    /// CPU architecture.
    pub architecture: String,
    /// Logical CPUs.
    pub cpu_count: usize,
    /// Installed memory.
    pub total_memory_mb: u64,
    /// First line of `<tool> version` per configured tool; `None` when the
    /// tool could not be run.
    pub toolchain: IndexMap<String, Option<String>>,
}

impl EnvironmentInfo {
    /// Collects host facts and probes the configured tools.
    pub async fn collect(config: &TestConfig, cwd: &Path) -> Self {
        let sys = System::new_all();
        let mut info = Self {
            os_name: System::name().unwrap_or_else(|| "unknown".to_string()),
            os_version: System::os_version().unwrap_or_else(|| "unknown".to_string()),
            kernel_version: System::kernel_version().unwrap_or_else(|| "unknown".to_string()),
            architecture: std::env::consts::ARCH.to_string(),
            cpu_count: sys.cpus().len(),
            total_memory_mb: sys.total_memory() / (1024 * 1024),
            toolchain: IndexMap::new(),
        };

        for tool in tools(config) {
            let version = tool_version(&tool, cwd).await;
            debug!(tool = %tool, version = ?version, "Probed tool version");
            info.toolchain.insert(tool, version);
        }
        info
    }
}

/// Program names of the configured commands, de-duplicated in order.
fn tools(config: &TestConfig) -> Vec<String> {
    let v = &config.validators;
    let commands = [
        Some(&v.build_command),
        Some(&v.lint_command),
        v.security_command.as_ref(),
        v.audit_command.as_ref(),
        Some(&config.server.command),
    ];
    let mut out: Vec<String> = Vec::new();
    for program in commands.into_iter().flatten().filter_map(|c| c.first()) {
        if !out.contains(program) {
            out.push(program.clone());
        }
    }
    out
}

async fn tool_version(tool: &str, cwd: &Path) -> Option<String> {
    let cancel = CancelSignal::new();
    for flag in ["version", "--version"] {
        let command = [tool.to_string(), flag.to_string()];
        if let Ok(output) = run_tool(&command, cwd, VERSION_TIMEOUT, &cancel).await {
            if output.success {
                let line = output
                    .stdout
                    .lines()
                    .chain(output.stderr.lines())
                    .map(str::trim)
                    .find(|l| !l.is_empty());
                if let Some(line) = line {
                    return Some(line.to_string());
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tools_are_deduplicated() {
        let mut config = TestConfig::default();
        config.validators.build_command = vec!["go".into(), "build".into()];
        config.validators.lint_command = vec!["go".into(), "vet".into()];
        config.validators.audit_command = Some(vec!["govulncheck".into()]);
        config.server.command = vec!["go".into(), "run".into(), ".".into()];
        assert_eq!(tools(&config), vec!["go".to_string(), "govulncheck".to_string()]);
    }

    #[tokio::test]
    async fn collects_host_facts() {
        let mut config = TestConfig::default();
        config.validators.build_command = vec!["definitely-not-a-real-tool-7f3a".into()];
        config.validators.lint_command = Vec::new();
        config.server.command = Vec::new();
        let dir = tempfile::tempdir().unwrap();
        let info = EnvironmentInfo::collect(&config, dir.path()).await;
        assert!(!info.architecture.is_empty());
        assert_eq!(
            info.toolchain.get("definitely-not-a-real-tool-7f3a"),
            Some(&None)
        );
    }
}
