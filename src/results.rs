//! Result types produced by the validators, testers and the test suite.
//!
//! Every result is built once, at the end of the stage that produces it, and
//! is not mutated afterwards. All types serialise to camelCase JSON; durations
//! are written as integer milliseconds.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::FailureType;

/// Serde helpers writing a [`Duration`] as whole milliseconds.
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialises a duration as milliseconds.
    ///
    /// # Errors
    ///
    /// Propagates serializer errors.
    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    /// Deserialises milliseconds into a duration.
    ///
    /// # Errors
    ///
    /// Propagates deserializer errors.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Outcome of one counted test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// The test ran and passed.
    Passed,
    /// The test ran and failed.
    Failed,
    /// The test did not run.
    Skipped,
}

/// Totals over every counted test of a run.
///
/// Built only from outcomes, so `passed + failed + skipped == total` holds
/// by construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCounts {
    /// Number of tests.
    pub total: usize,
    /// Tests that passed.
    pub passed: usize,
    /// Tests that failed.
    pub failed: usize,
    /// Tests that did not run.
    pub skipped: usize,
}

impl TestCounts {
    /// Tallies a sequence of outcomes.
    pub fn tally(outcomes: impl IntoIterator<Item = Outcome>) -> Self {
        let mut counts = Self::default();
        for outcome in outcomes {
            counts.total += 1;
            match outcome {
                Outcome::Passed => counts.passed += 1,
                Outcome::Failed => counts.failed += 1,
                Outcome::Skipped => counts.skipped += 1,
            }
        }
        counts
    }

    /// Returns `true` if the counts are internally consistent.
    #[must_use]
    pub const fn is_consistent(&self) -> bool {
        self.passed + self.failed + self.skipped == self.total
    }

    /// Ratio of passed tests among those that ran, or `None` if none ran.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn pass_ratio(&self) -> Option<f64> {
        let ran = self.passed + self.failed;
        (ran > 0).then(|| self.passed as f64 / ran as f64)
    }
}

// ============================================================================
// Validation
// ============================================================================

/// Result of one static validator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    /// Validator name.
    pub validator: String,
    /// `true` when no errors were found.
    pub success: bool,
    /// Problems that fail the validator, in deterministic order.
    pub errors: Vec<String>,
    /// Advisory findings.
    pub warnings: Vec<String>,
    /// Wall-clock time.
    #[serde(with = "duration_ms")]
    pub duration: Duration,
    /// Tool, exit code, counts and similar.
    pub details: IndexMap<String, Value>,
}

impl ValidationResult {
    /// Builds a result whose success is derived from `errors`.
    #[must_use]
    pub fn from_findings(
        validator: impl Into<String>,
        errors: Vec<String>,
        warnings: Vec<String>,
        duration: Duration,
        details: IndexMap<String, Value>,
    ) -> Self {
        Self {
            validator: validator.into(),
            success: errors.is_empty(),
            errors,
            warnings,
            duration,
            details,
        }
    }

    /// A failed result for a validator that could not run.
    #[must_use]
    pub fn environment_failure(validator: impl Into<String>, message: String) -> Self {
        let mut details = IndexMap::new();
        details.insert("environmentFailure".to_string(), Value::Bool(true));
        Self {
            validator: validator.into(),
            success: false,
            errors: vec![message],
            warnings: Vec::new(),
            duration: Duration::ZERO,
            details,
        }
    }

    /// Outcome for counting.
    #[must_use]
    pub const fn outcome(&self) -> Outcome {
        if self.success {
            Outcome::Passed
        } else {
            Outcome::Failed
        }
    }
}

// ============================================================================
// Protocol
// ============================================================================

/// State the protocol tester finished in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolState {
    /// Nothing happened yet.
    Uninitialized,
    /// Waiting for the handshake response.
    Handshaking,
    /// Exercising required methods.
    MethodTesting,
    /// Probing capabilities.
    CapabilityTesting,
    /// Every check ran.
    Done,
    /// The handshake failed; nothing else ran.
    Failed,
}

/// One exercised JSON-RPC method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodTest {
    /// Method name.
    pub method: String,
    /// `true` when the call succeeded with a conformant result.
    pub success: bool,
    /// `true` when the call was never issued.
    pub skipped: bool,
    /// Round-trip latency.
    #[serde(with = "duration_ms")]
    pub latency: Duration,
    /// Params sent.
    pub request: Value,
    /// Result or error object received.
    pub response: Option<Value>,
    /// Why the test failed or was skipped.
    pub error: Option<String>,
}

impl MethodTest {
    /// A test that was not run.
    #[must_use]
    pub fn skipped(method: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            success: false,
            skipped: true,
            latency: Duration::ZERO,
            request: Value::Null,
            response: None,
            error: Some(reason.into()),
        }
    }

    /// Outcome for counting.
    #[must_use]
    pub const fn outcome(&self) -> Outcome {
        match (self.skipped, self.success) {
            (true, _) => Outcome::Skipped,
            (false, true) => Outcome::Passed,
            (false, false) => Outcome::Failed,
        }
    }
}

/// One probed capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityTest {
    /// Capability name, e.g. `tools`.
    pub capability: String,
    /// Whether the configuration requires it.
    pub required: bool,
    /// Whether the server advertises it.
    pub supported: bool,
    /// Whether the check passed.
    pub success: bool,
    /// `true` when the check was not run or downgraded to a warning.
    pub skipped: bool,
    /// Method used to exercise the capability.
    pub probe_method: Option<String>,
    /// Why the check failed or was skipped.
    pub error: Option<String>,
}

impl CapabilityTest {
    /// Outcome for counting.
    #[must_use]
    pub const fn outcome(&self) -> Outcome {
        match (self.skipped, self.success) {
            (true, _) => Outcome::Skipped,
            (false, true) => Outcome::Passed,
            (false, false) => Outcome::Failed,
        }
    }
}

/// Result of the protocol tester.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolTestResult {
    /// `true` when the handshake and every counted check passed.
    pub success: bool,
    /// Final state of the tester.
    pub state: ProtocolState,
    /// The handshake exchange.
    pub handshake: MethodTest,
    /// Version the server answered with.
    pub negotiated_version: Option<String>,
    /// The server's `serverInfo`.
    pub server_info: Option<Value>,
    /// Required methods, in configured order.
    pub method_tests: IndexMap<String, MethodTest>,
    /// Required and optional capabilities, in configured order.
    pub capability_tests: IndexMap<String, CapabilityTest>,
    /// Failures not tied to a single test.
    pub errors: Vec<String>,
    /// Advisory findings.
    pub warnings: Vec<String>,
    /// Wall-clock time.
    #[serde(with = "duration_ms")]
    pub duration: Duration,
}

impl ProtocolTestResult {
    /// Outcomes of every counted test.
    pub fn outcomes(&self) -> impl Iterator<Item = Outcome> + '_ {
        self.method_tests
            .values()
            .map(MethodTest::outcome)
            .chain(self.capability_tests.values().map(CapabilityTest::outcome))
    }
}

// ============================================================================
// Integration
// ============================================================================

/// One executed scenario step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    /// Step name.
    pub step: String,
    /// Method called.
    pub method: String,
    /// Whether the step met its expectation.
    pub success: bool,
    /// Round-trip latency.
    #[serde(with = "duration_ms")]
    pub latency: Duration,
    /// Params after placeholder substitution.
    pub request: Value,
    /// Result or error object received.
    pub response: Option<Value>,
    /// Why the step failed.
    pub error: Option<String>,
}

/// Result of one scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioTestResult {
    /// Scenario name.
    pub scenario: String,
    /// Whether every step succeeded.
    pub success: bool,
    /// Steps that ran, in order.
    pub steps: Vec<StepResult>,
    /// Steps not run because an earlier step failed.
    pub skipped_steps: Vec<String>,
    /// Primary failure text.
    pub error: Option<String>,
    /// Wall-clock time.
    #[serde(with = "duration_ms")]
    pub duration: Duration,
}

impl ScenarioTestResult {
    /// Outcome for counting.
    #[must_use]
    pub const fn outcome(&self) -> Outcome {
        if self.success {
            Outcome::Passed
        } else {
            Outcome::Failed
        }
    }
}

/// Result of the integration tester.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrationTestResult {
    /// Whether every scenario succeeded.
    pub success: bool,
    /// Scenarios in configured order.
    pub scenarios: IndexMap<String, ScenarioTestResult>,
    /// Compatibility verdict per client profile.
    pub client_compatibility: IndexMap<String, bool>,
    /// Wall-clock time.
    #[serde(with = "duration_ms")]
    pub duration: Duration,
}

impl IntegrationTestResult {
    /// Outcomes of every counted test.
    pub fn outcomes(&self) -> impl Iterator<Item = Outcome> + '_ {
        self.scenarios.values().map(ScenarioTestResult::outcome)
    }
}

// ============================================================================
// Performance
// ============================================================================

/// Latency statistics in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencyStats {
    /// Number of samples.
    pub samples: usize,
    /// Arithmetic mean.
    pub avg_ms: f64,
    /// Smallest sample.
    pub min_ms: f64,
    /// 50th percentile.
    pub median_ms: f64,
    /// 95th percentile.
    pub p95_ms: f64,
    /// 99th percentile.
    pub p99_ms: f64,
    /// Largest sample.
    pub max_ms: f64,
}

/// Memory statistics of the server process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStats {
    /// Number of RSS samples.
    pub samples: usize,
    /// Mean RSS.
    pub avg_mb: f64,
    /// Peak RSS.
    pub peak_mb: f64,
    /// Least-squares growth over the second half of the run.
    pub slope_bytes_per_sec: f64,
    /// Whether the growth looks like a leak.
    pub leak_detected: bool,
}

/// Result of one load scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadTestMetric {
    /// Scenario name.
    pub scenario: String,
    /// Method under load.
    pub method: String,
    /// Concurrent callers.
    pub callers: usize,
    /// Calls issued.
    pub total_calls: usize,
    /// Calls answered without error.
    pub successful_calls: usize,
    /// Calls that failed.
    pub failed_calls: usize,
    /// `failed_calls / total_calls`.
    pub failure_rate: f64,
    /// Successful calls per second.
    pub throughput_per_sec: f64,
    /// Latency of every call.
    pub latency: LatencyStats,
    /// Whether the scenario met its thresholds.
    pub success: bool,
    /// Why the scenario failed.
    pub failures: Vec<String>,
    /// Wall-clock time.
    #[serde(with = "duration_ms")]
    pub duration: Duration,
}

/// Memory threshold check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryCheck {
    /// Whether peak and trend are within limits.
    pub success: bool,
    /// Why the check failed.
    pub failures: Vec<String>,
}

/// Result of the performance tester.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceTestResult {
    /// Whether every scenario and the memory check passed.
    pub success: bool,
    /// Latency across all scenarios.
    pub latency: LatencyStats,
    /// Memory samples, when the process could be observed.
    pub memory: Option<MemoryStats>,
    /// Memory threshold check, when samples exist.
    pub memory_check: Option<MemoryCheck>,
    /// Successful calls per second across all scenarios.
    pub throughput_per_sec: f64,
    /// Load scenarios in configured order.
    pub scenarios: IndexMap<String, LoadTestMetric>,
    /// Wall-clock time.
    #[serde(with = "duration_ms")]
    pub duration: Duration,
}

impl PerformanceTestResult {
    /// Outcomes of every counted test.
    pub fn outcomes(&self) -> impl Iterator<Item = Outcome> + '_ {
        let memory = self.memory_check.as_ref().map(|check| {
            if check.success {
                Outcome::Passed
            } else {
                Outcome::Failed
            }
        });
        self.scenarios
            .values()
            .map(|s| {
                if s.success {
                    Outcome::Passed
                } else {
                    Outcome::Failed
                }
            })
            .chain(memory)
    }
}

// ============================================================================
// Test result
// ============================================================================

/// Everything learned about one server in one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    /// Unique id (UUID v4).
    pub test_id: String,
    /// Server project directory.
    pub server_path: PathBuf,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run finished.
    pub finished_at: DateTime<Utc>,
    /// Wall-clock time.
    #[serde(with = "duration_ms")]
    pub duration: Duration,
    /// `true` when nothing failed.
    pub success: bool,
    /// Test totals.
    pub counts: TestCounts,
    /// Validator results in run order.
    pub validation: IndexMap<String, ValidationResult>,
    /// Protocol tester result.
    pub protocol: Option<ProtocolTestResult>,
    /// Integration tester result.
    pub integration: Option<IntegrationTestResult>,
    /// Performance tester result.
    pub performance: Option<PerformanceTestResult>,
    /// Classified primary failure, if any.
    pub failure_type: Option<FailureType>,
    /// Run-level failures (spawn errors, cancellation).
    pub errors: Vec<String>,
    /// Last lines of server stderr.
    pub server_stderr: Vec<String>,
}

impl TestResult {
    /// Recomputes counts from the group results.
    #[must_use]
    pub fn count(
        validation: &IndexMap<String, ValidationResult>,
        protocol: Option<&ProtocolTestResult>,
        integration: Option<&IntegrationTestResult>,
        performance: Option<&PerformanceTestResult>,
    ) -> TestCounts {
        let validation = validation.values().map(ValidationResult::outcome);
        let protocol = protocol.into_iter().flat_map(ProtocolTestResult::outcomes);
        let integration = integration
            .into_iter()
            .flat_map(IntegrationTestResult::outcomes);
        let performance = performance
            .into_iter()
            .flat_map(PerformanceTestResult::outcomes);
        TestCounts::tally(
            validation
                .chain(protocol)
                .chain(integration)
                .chain(performance),
        )
    }

    /// Primary error text: the first run-level error, else the first
    /// failing test's message.
    #[must_use]
    pub fn primary_error(&self) -> Option<String> {
        self.primary_failure().map(|(_, text)| text)
    }

    /// Primary failure together with the stage that produced it
    /// (`run`, a validator name, `protocol`, `integration` or `performance`).
    #[must_use]
    pub fn primary_failure(&self) -> Option<(String, String)> {
        if let Some(error) = self.errors.first() {
            return Some(("run".to_string(), error.clone()));
        }
        if let Some(v) = self.validation.values().find(|v| !v.success) {
            return Some((
                v.validator.clone(),
                format!(
                    "{}: {}",
                    v.validator,
                    v.errors.first().map_or("failed", String::as_str)
                ),
            ));
        }
        if let Some(p) = &self.protocol {
            if let Some(error) = p.errors.first() {
                return Some(("protocol".to_string(), error.clone()));
            }
            if let Some(m) = p.method_tests.values().find(|m| !m.success && !m.skipped) {
                return Some((
                    "protocol".to_string(),
                    format!("{}: {}", m.method, m.error.as_deref().unwrap_or("failed")),
                ));
            }
            if let Some(c) = p.capability_tests.values().find(|c| !c.success && !c.skipped) {
                return Some((
                    "protocol".to_string(),
                    format!(
                        "capability {}: {}",
                        c.capability,
                        c.error.as_deref().unwrap_or("failed")
                    ),
                ));
            }
        }
        if let Some(s) = self
            .integration
            .as_ref()
            .and_then(|i| i.scenarios.values().find(|s| !s.success))
        {
            return Some((
                "integration".to_string(),
                format!(
                    "scenario {}: {}",
                    s.scenario,
                    s.error.as_deref().unwrap_or("failed")
                ),
            ));
        }
        let performance = self.performance.as_ref()?;
        if let Some(s) = performance.scenarios.values().find(|s| !s.success) {
            return Some((
                "performance".to_string(),
                format!("load scenario {}: {}", s.scenario, s.failures.join("; ")),
            ));
        }
        performance
            .memory_check
            .as_ref()
            .filter(|check| !check.success)
            .map(|check| ("performance".to_string(), check.failures.join("; ")))
    }
}
