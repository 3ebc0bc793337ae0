//! Configuration structures for deserialisation.
//!
//! These structures map directly to the JSON configuration file format. A
//! fully resolved [`TestConfig`] is immutable for the duration of a run and is
//! shared between testers behind an `Arc`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::scenarios::{LoadScenario, Scenario};
use crate::error::ConfigError;

/// Root configuration structure.
///
/// This is the top-level structure that matches the JSON config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TestConfig {
    /// Optional JSON schema reference (ignored during parsing).
    #[serde(rename = "$schema", default, skip_serializing)]
    _schema: Option<String>,

    /// Optional comment field (ignored during parsing).
    #[serde(rename = "_comment", default, skip_serializing)]
    _comment: Option<String>,

    /// How to start the server under test.
    #[serde(default)]
    pub server: ServerLaunchConfig,

    /// Which stage groups run.
    #[serde(default)]
    pub features: FeatureToggles,

    /// Timeouts at call, stage and pipeline level.
    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// Concurrency limits.
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,

    /// External tools driven by the validators.
    #[serde(default)]
    pub validators: ValidatorConfig,

    /// MCP handshake and required surface.
    #[serde(default)]
    pub protocol: ProtocolConfig,

    /// Multi-step client scenarios.
    #[serde(default)]
    pub integration: IntegrationConfig,

    /// Load scenarios and thresholds.
    #[serde(default)]
    pub performance: PerformanceConfig,

    /// Stage retry behaviour.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Report output.
    #[serde(default)]
    pub report: ReportConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl TestConfig {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any validation checks fail.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: String| Err(ConfigError::ValidationError { message });

        if self.server.command.is_empty() {
            return invalid("server.command must name a program to run".to_string());
        }
        for (name, command) in [
            ("validators.build_command", &self.validators.build_command),
            ("validators.lint_command", &self.validators.lint_command),
        ] {
            if command.is_empty() {
                return invalid(format!("{name} must not be empty"));
            }
        }
        if self.protocol.handshake_method.trim().is_empty() {
            return invalid("protocol.handshake_method must not be empty".to_string());
        }
        if self.concurrency.max_concurrency == 0 || self.concurrency.batch_workers == 0 {
            return invalid("concurrency limits must be at least 1".to_string());
        }
        if !(0.0..=1.0).contains(&self.performance.max_failure_rate) {
            return invalid(format!(
                "performance.max_failure_rate must be between 0 and 1, got {}",
                self.performance.max_failure_rate
            ));
        }
        for scenario in &self.performance.load_scenarios {
            if scenario.callers == 0 {
                return invalid(format!(
                    "load scenario '{}' needs at least one caller",
                    scenario.name
                ));
            }
            if scenario.iterations == 0 && scenario.duration_ms == 0 {
                return invalid(format!(
                    "load scenario '{}' needs iterations or duration_ms",
                    scenario.name
                ));
            }
        }
        for scenario in &self.integration.scenarios {
            if scenario.steps.is_empty() {
                return invalid(format!("scenario '{}' has no steps", scenario.name));
            }
        }
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return invalid(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            ));
        }
        Ok(())
    }
}

/// How the server under test is launched.
///
/// The command runs with the server directory as its working directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerLaunchConfig {
    /// Program and arguments, e.g. `["go", "run", "."]`.
    #[serde(default = "default_launch_command")]
    pub command: Vec<String>,

    /// Extra environment variables for the server process.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl Default for ServerLaunchConfig {
    fn default() -> Self {
        Self {
            command: default_launch_command(),
            env: HashMap::new(),
        }
    }
}

fn default_launch_command() -> Vec<String> {
    vec!["go".to_string(), "run".to_string(), ".".to_string()]
}

/// Enables or disables individual stage groups.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
#[allow(clippy::struct_excessive_bools)] // each toggle is an independent switch
pub struct FeatureToggles {
    /// Run the static validators.
    #[serde(default = "default_true")]
    pub validation: bool,
    /// Include the lint validator.
    #[serde(default = "default_true")]
    pub lint: bool,
    /// Include the security validator.
    #[serde(default = "default_true")]
    pub security_scan: bool,
    /// Run the protocol tester.
    #[serde(default = "default_true")]
    pub protocol: bool,
    /// Run the integration tester.
    #[serde(default = "default_true")]
    pub integration: bool,
    /// Run the performance tester.
    #[serde(default = "default_true")]
    pub performance: bool,
    /// Produce a diagnostic report when a run fails.
    #[serde(default = "default_true")]
    pub diagnostics: bool,
}

impl Default for FeatureToggles {
    fn default() -> Self {
        Self {
            validation: true,
            lint: true,
            security_scan: true,
            protocol: true,
            integration: true,
            performance: true,
            diagnostics: true,
        }
    }
}

const fn default_true() -> bool {
    true
}

/// Timeouts, all in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeoutConfig {
    /// Single JSON-RPC call.
    #[serde(default = "default_call_timeout")]
    pub call_ms: u64,
    /// Server start plus handshake.
    #[serde(default = "default_startup_timeout")]
    pub startup_ms: u64,
    /// Single external validator tool.
    #[serde(default = "default_validator_timeout")]
    pub validator_ms: u64,
    /// Single pipeline stage (one attempt).
    #[serde(default = "default_stage_timeout")]
    pub stage_ms: u64,
    /// Whole pipeline; `0` disables the limit.
    #[serde(default)]
    pub pipeline_ms: u64,
}

impl TimeoutConfig {
    /// Per-call timeout.
    #[must_use]
    pub const fn call(&self) -> Duration {
        Duration::from_millis(self.call_ms)
    }

    /// Startup and handshake timeout.
    #[must_use]
    pub const fn startup(&self) -> Duration {
        Duration::from_millis(self.startup_ms)
    }

    /// External tool timeout.
    #[must_use]
    pub const fn validator(&self) -> Duration {
        Duration::from_millis(self.validator_ms)
    }

    /// Per-stage timeout.
    #[must_use]
    pub const fn stage(&self) -> Duration {
        Duration::from_millis(self.stage_ms)
    }

    /// Pipeline timeout, if enabled.
    #[must_use]
    pub const fn pipeline(&self) -> Option<Duration> {
        if self.pipeline_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.pipeline_ms))
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            call_ms: default_call_timeout(),
            startup_ms: default_startup_timeout(),
            validator_ms: default_validator_timeout(),
            stage_ms: default_stage_timeout(),
            pipeline_ms: 0,
        }
    }
}

const fn default_call_timeout() -> u64 {
    10_000
}

const fn default_startup_timeout() -> u64 {
    30_000
}

const fn default_validator_timeout() -> u64 {
    300_000
}

const fn default_stage_timeout() -> u64 {
    600_000
}

/// Concurrency limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConcurrencyConfig {
    /// Upper bound on synthetic callers in a load scenario.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Pipelines running at once in a batch.
    #[serde(default = "default_batch_workers")]
    pub batch_workers: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            batch_workers: default_batch_workers(),
        }
    }
}

const fn default_max_concurrency() -> usize {
    10
}

const fn default_batch_workers() -> usize {
    4
}

/// External tools and source discovery for the validators.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValidatorConfig {
    /// Build command, run in the server directory.
    #[serde(default = "default_build_command")]
    pub build_command: Vec<String>,
    /// Lint command, run in the server directory.
    #[serde(default = "default_lint_command")]
    pub lint_command: Vec<String>,
    /// Optional external security scanner.
    #[serde(default)]
    pub security_command: Option<Vec<String>>,
    /// Optional dependency audit command.
    #[serde(default)]
    pub audit_command: Option<Vec<String>>,
    /// Glob patterns, relative to the server directory, selecting source files.
    #[serde(default = "default_source_globs")]
    pub source_globs: Vec<String>,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            build_command: default_build_command(),
            lint_command: default_lint_command(),
            security_command: None,
            audit_command: None,
            source_globs: default_source_globs(),
        }
    }
}

fn default_build_command() -> Vec<String> {
    vec!["go".to_string(), "build".to_string(), "./...".to_string()]
}

fn default_lint_command() -> Vec<String> {
    vec!["go".to_string(), "vet".to_string(), "./...".to_string()]
}

fn default_source_globs() -> Vec<String> {
    [
        "**/*.go", "**/*.rs", "**/*.ts", "**/*.js", "**/*.py", "**/*.json",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

/// What to do when a required capability is advertised as unsupported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityPolicy {
    /// Count it as a failed test.
    #[default]
    Fail,
    /// Count it as skipped and record a warning.
    Warn,
}

/// MCP handshake and the surface the server must expose.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProtocolConfig {
    /// Initialisation method name.
    #[serde(default = "default_handshake_method")]
    pub handshake_method: String,
    /// Protocol version offered by the client.
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,
    /// Versions the server may answer with. Empty means only `protocol_version`.
    #[serde(default = "default_accepted_versions")]
    pub accepted_versions: Vec<String>,
    /// Client name sent in `clientInfo`.
    #[serde(default = "default_client_name")]
    pub client_name: String,
    /// Methods that must answer successfully.
    #[serde(default = "default_required_methods")]
    pub required_methods: Vec<String>,
    /// Capabilities that must be advertised.
    #[serde(default = "default_required_capabilities")]
    pub required_capabilities: Vec<String>,
    /// Capabilities probed but allowed to be absent.
    #[serde(default)]
    pub optional_capabilities: Vec<String>,
    /// Representative params per method; `{}` when absent.
    #[serde(default)]
    pub method_params: HashMap<String, Value>,
    /// Handling of required-but-unsupported capabilities.
    #[serde(default)]
    pub capability_policy: CapabilityPolicy,
}

impl ProtocolConfig {
    /// Returns `true` if `version` is acceptable.
    #[must_use]
    pub fn accepts_version(&self, version: &str) -> bool {
        if self.accepted_versions.is_empty() {
            return version == self.protocol_version;
        }
        self.accepted_versions.iter().any(|v| v == version)
    }

    /// Params sent when exercising `method`.
    #[must_use]
    pub fn params_for(&self, method: &str) -> Value {
        self.method_params
            .get(method)
            .cloned()
            .unwrap_or_else(|| Value::Object(serde_json::Map::new()))
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            handshake_method: default_handshake_method(),
            protocol_version: default_protocol_version(),
            accepted_versions: default_accepted_versions(),
            client_name: default_client_name(),
            required_methods: default_required_methods(),
            required_capabilities: default_required_capabilities(),
            optional_capabilities: Vec::new(),
            method_params: HashMap::new(),
            capability_policy: CapabilityPolicy::default(),
        }
    }
}

fn default_handshake_method() -> String {
    "initialize".to_string()
}

fn default_protocol_version() -> String {
    "2024-11-05".to_string()
}

fn default_accepted_versions() -> Vec<String> {
    vec![
        "2024-11-05".to_string(),
        "2025-03-26".to_string(),
        "2025-06-18".to_string(),
    ]
}

fn default_client_name() -> String {
    env!("CARGO_PKG_NAME").to_string()
}

fn default_required_methods() -> Vec<String> {
    vec!["ping".to_string(), "tools/list".to_string()]
}

fn default_required_capabilities() -> Vec<String> {
    vec!["tools".to_string()]
}

/// Integration scenarios and simulated client profiles.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IntegrationConfig {
    /// Scenarios to run; the built-in set is used when empty.
    #[serde(default)]
    pub scenarios: Vec<Scenario>,
    /// Simulated client profiles; derived from scenario tags when empty.
    #[serde(default)]
    pub client_profiles: Vec<String>,
}

/// Load scenarios and performance thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PerformanceConfig {
    /// Scenarios to run; the built-in set is used when empty.
    #[serde(default)]
    pub load_scenarios: Vec<LoadScenario>,
    /// p95 latency limit per scenario.
    #[serde(default = "default_max_response_time")]
    pub max_response_time_ms: u64,
    /// Peak RSS limit.
    #[serde(default = "default_max_memory")]
    pub max_memory_mb: u64,
    /// Failure ratio above which a scenario fails.
    #[serde(default = "default_max_failure_rate")]
    pub max_failure_rate: f64,
    /// Memory sampling cadence.
    #[serde(default = "default_memory_interval")]
    pub memory_sample_interval_ms: u64,
    /// Slope (bytes/second) above which a monotonic trend counts as a leak.
    #[serde(default = "default_leak_slope")]
    pub leak_slope_threshold_bytes_per_sec: f64,
}

impl PerformanceConfig {
    /// Memory sampling cadence as a duration.
    #[must_use]
    pub const fn memory_sample_interval(&self) -> Duration {
        Duration::from_millis(self.memory_sample_interval_ms)
    }
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            load_scenarios: Vec::new(),
            max_response_time_ms: default_max_response_time(),
            max_memory_mb: default_max_memory(),
            max_failure_rate: default_max_failure_rate(),
            memory_sample_interval_ms: default_memory_interval(),
            leak_slope_threshold_bytes_per_sec: default_leak_slope(),
        }
    }
}

const fn default_max_response_time() -> u64 {
    1_000
}

const fn default_max_memory() -> u64 {
    512
}

fn default_max_failure_rate() -> f64 {
    0.05
}

const fn default_memory_interval() -> u64 {
    100
}

fn default_leak_slope() -> f64 {
    262_144.0
}

/// Stage retry behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    /// Extra attempts for stages with the `retry` policy.
    #[serde(default = "default_retry_attempts")]
    pub attempts: u32,
    /// Delay between attempts.
    #[serde(default = "default_retry_delay")]
    pub delay_ms: u64,
}

impl RetryConfig {
    /// Delay between attempts as a duration.
    #[must_use]
    pub const fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: default_retry_attempts(),
            delay_ms: default_retry_delay(),
        }
    }
}

const fn default_retry_attempts() -> u32 {
    2
}

const fn default_retry_delay() -> u64 {
    1_000
}

/// Rendered report format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    /// Pretty-printed JSON.
    #[default]
    Json,
    /// Standalone HTML page.
    Html,
    /// XML document.
    Xml,
}

impl ReportFormat {
    /// File extension for this format.
    #[must_use]
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Html => "html",
            Self::Xml => "xml",
        }
    }
}

/// Report output settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReportConfig {
    /// Output format.
    #[serde(default)]
    pub format: ReportFormat,
    /// Directory for report files; reports are only rendered to stdout when unset.
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "warn".to_string()
}
