//! Test suite: the four test groups for one server.
//!
//! [`RunContext`] carries everything one run shares (configuration, the
//! server path, cancellation, counters and the lazily started
//! [`ServerSession`]). Each [`TestGroup`] runs against the context and
//! returns a [`GroupOutput`]; a [`ResultBuilder`] folds the outputs into the
//! final [`TestResult`].
//!
//! [`TestSuite::run`] drives the groups directly. The
//! [`Pipeline`](crate::pipeline::Pipeline) drives the same groups as stages
//! with timeouts and retry policies.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use indexmap::IndexMap;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cancel::CancelSignal;
use crate::config::{FeatureToggles, TestConfig};
use crate::diagnostics::classify::failure_type_of;
use crate::error::{FailureType, StageError, ValidatorError};
use crate::mcp::ServerSession;
use crate::metrics::MetricsRegistry;
use crate::results::{
    IntegrationTestResult, PerformanceTestResult, ProtocolState, ProtocolTestResult, TestResult,
    ValidationResult,
};
use crate::testers::{integration, performance, protocol};
use crate::validators::{run_validators, Validator};

#[derive(Debug, Clone)]
struct SessionFailure {
    failure_type: FailureType,
    message: String,
}

/// State shared by every group of one run.
pub struct RunContext {
    config: Arc<TestConfig>,
    server_path: PathBuf,
    cancel: CancelSignal,
    metrics: Arc<MetricsRegistry>,
    session: OnceCell<Result<ServerSession, SessionFailure>>,
}

impl RunContext {
    /// Creates a context; no process is started until a dynamic group asks
    /// for the session.
    #[must_use]
    pub fn new(
        config: Arc<TestConfig>,
        server_path: impl Into<PathBuf>,
        cancel: CancelSignal,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            config,
            server_path: server_path.into(),
            cancel,
            metrics,
            session: OnceCell::new(),
        }
    }

    /// The run configuration.
    #[must_use]
    pub const fn config(&self) -> &Arc<TestConfig> {
        &self.config
    }

    /// The server project directory.
    #[must_use]
    pub fn server_path(&self) -> &Path {
        &self.server_path
    }

    /// The run's cancellation signal.
    #[must_use]
    pub const fn cancel(&self) -> &CancelSignal {
        &self.cancel
    }

    /// The run's counters.
    #[must_use]
    pub const fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    /// Starts the server on first use and returns the shared session.
    ///
    /// # Errors
    ///
    /// Returns [`StageError::Fatal`] if the server could not be started;
    /// later calls return the same error without retrying the spawn.
    pub async fn session(&self) -> Result<&ServerSession, StageError> {
        let slot = self
            .session
            .get_or_init(|| async {
                info!(server = %self.server_path.display(), "Starting server under test");
                ServerSession::start(
                    Arc::clone(&self.config),
                    &self.server_path,
                    Arc::clone(&self.metrics),
                )
                .map_err(|e| {
                    warn!(server = %self.server_path.display(), error = %e, "Server failed to start");
                    let chain = error_chain(&e);
                    SessionFailure {
                        failure_type: e.failure_type(),
                        message: if chain.is_empty() {
                            e.to_string()
                        } else {
                            format!("{e}: {chain}")
                        },
                    }
                })
            })
            .await;
        slot.as_ref().map_err(|failure| StageError::Fatal {
            kind: failure.failure_type,
            message: failure.message.clone(),
        })
    }

    /// Whether a server process was ever started.
    #[must_use]
    pub fn session_started(&self) -> bool {
        matches!(self.session.get(), Some(Ok(_)))
    }

    /// Last lines the server wrote to stderr.
    #[must_use]
    pub fn recent_stderr(&self) -> Vec<String> {
        match self.session.get() {
            Some(Ok(session)) => session.client().recent_stderr(),
            _ => Vec::new(),
        }
    }

    /// Terminates the server if it was started. Idempotent.
    pub async fn close(&self) {
        if let Some(Ok(session)) = self.session.get() {
            session.close().await;
        }
    }
}

fn error_chain(error: &dyn std::error::Error) -> String {
    let mut parts = Vec::new();
    let mut source = error.source();
    while let Some(e) = source {
        parts.push(e.to_string());
        source = e.source();
    }
    parts.join(": ")
}

/// One of the four test groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TestGroup {
    /// Static validators.
    Validation,
    /// Protocol compliance.
    Protocol,
    /// Client scenarios.
    Integration,
    /// Load, latency and memory.
    Performance,
}

impl TestGroup {
    /// Every group, in run order.
    pub const ALL: [Self; 4] = [
        Self::Validation,
        Self::Protocol,
        Self::Integration,
        Self::Performance,
    ];

    /// Stable name, also used as the default stage name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Protocol => "protocol",
            Self::Integration => "integration",
            Self::Performance => "performance",
        }
    }

    /// Whether the group talks to a running server.
    #[must_use]
    pub const fn is_dynamic(self) -> bool {
        !matches!(self, Self::Validation)
    }

    /// Groups switched on by the feature toggles, in run order.
    #[must_use]
    pub fn enabled(features: &FeatureToggles) -> Vec<Self> {
        Self::ALL
            .into_iter()
            .filter(|g| match g {
                Self::Validation => features.validation,
                Self::Protocol => features.protocol,
                Self::Integration => features.integration,
                Self::Performance => features.performance,
            })
            .collect()
    }

    /// Runs the group.
    ///
    /// # Errors
    ///
    /// Returns a [`StageError`] when the group could not run at all: the
    /// server did not start or the run was cancelled.
    pub async fn run(self, ctx: &RunContext) -> Result<GroupOutput, StageError> {
        if ctx.cancel.is_cancelled() {
            return Err(StageError::Cancelled {
                stage: self.name().to_string(),
            });
        }
        debug!(group = self.name(), server = %ctx.server_path.display(), "Group started");
        match self {
            Self::Validation => run_validation(ctx).await,
            Self::Protocol => {
                let session = ctx.session().await?;
                Ok(GroupOutput::Protocol(protocol::run(session, &ctx.cancel).await))
            }
            Self::Integration => {
                let session = ctx.session().await?;
                Ok(GroupOutput::Integration(
                    integration::run(session, &ctx.cancel).await,
                ))
            }
            Self::Performance => {
                let session = ctx.session().await?;
                Ok(GroupOutput::Performance(
                    performance::run(session, &ctx.cancel).await,
                ))
            }
        }
    }

    /// Post-condition over the accumulated result once this group's output
    /// has been merged.
    ///
    /// # Errors
    ///
    /// - [`StageError::Fatal`] when later groups cannot meaningfully run:
    ///   the server does not build or the handshake failed
    /// - [`StageError::Failed`] when the group ran but some of its tests
    ///   failed
    pub fn check(self, result: &TestResult) -> Result<(), StageError> {
        match self {
            Self::Validation => check_validation(result),
            Self::Protocol => match &result.protocol {
                Some(p) if p.state == ProtocolState::Failed => {
                    let message = p
                        .errors
                        .first()
                        .cloned()
                        .unwrap_or_else(|| "handshake failed".to_string());
                    Err(StageError::Fatal {
                        kind: failure_type_of(&message, Some("protocol")),
                        message,
                    })
                }
                Some(p) if !p.success => Err(StageError::Failed {
                    message: summarize_failures(
                        "protocol",
                        p.method_tests
                            .values()
                            .filter(|m| !m.success && !m.skipped)
                            .map(|m| m.method.as_str())
                            .chain(
                                p.capability_tests
                                    .values()
                                    .filter(|c| !c.success && !c.skipped)
                                    .map(|c| c.capability.as_str()),
                            ),
                    ),
                }),
                _ => Ok(()),
            },
            Self::Integration => match &result.integration {
                Some(i) if !i.success => Err(StageError::Failed {
                    message: summarize_failures(
                        "scenario",
                        i.scenarios
                            .values()
                            .filter(|s| !s.success)
                            .map(|s| s.scenario.as_str()),
                    ),
                }),
                _ => Ok(()),
            },
            Self::Performance => match &result.performance {
                Some(p) if !p.success => Err(StageError::Failed {
                    message: summarize_failures(
                        "performance",
                        p.scenarios
                            .values()
                            .filter(|s| !s.success)
                            .map(|s| s.scenario.as_str())
                            .chain(
                                p.memory_check
                                    .iter()
                                    .filter(|c| !c.success)
                                    .map(|_| "memory"),
                            ),
                    ),
                }),
                _ => Ok(()),
            },
        }
    }
}

impl std::fmt::Display for TestGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

fn summarize_failures<'a>(what: &str, failed: impl Iterator<Item = &'a str>) -> String {
    let failed: Vec<&str> = failed.collect();
    format!("{what} checks failed: {}", failed.join(", "))
}

async fn run_validation(ctx: &RunContext) -> Result<GroupOutput, StageError> {
    let validators = Validator::enabled(&ctx.config.features);
    let outcomes = run_validators(
        &validators,
        Arc::clone(&ctx.config),
        &ctx.server_path,
        &ctx.cancel,
    )
    .await;

    let mut results = IndexMap::new();
    for (validator, outcome) in outcomes {
        let result = match outcome {
            Ok(result) => result,
            Err(ValidatorError::Cancelled) => {
                return Err(StageError::Cancelled {
                    stage: TestGroup::Validation.name().to_string(),
                })
            }
            Err(e) => ValidationResult::environment_failure(validator.name(), e.to_string()),
        };
        results.insert(validator.name().to_string(), result);
    }
    Ok(GroupOutput::Validation(results))
}

fn check_validation(result: &TestResult) -> Result<(), StageError> {
    let Some(compilation) = result.validation.get(Validator::Compilation.name()) else {
        return Ok(());
    };
    if compilation.success {
        return Ok(());
    }
    let message = compilation
        .errors
        .first()
        .cloned()
        .unwrap_or_else(|| "build failed".to_string());
    let environment = compilation
        .details
        .get("environmentFailure")
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false);
    let kind = if environment {
        failure_type_of(&message, None)
    } else {
        FailureType::Compilation
    };
    Err(StageError::Fatal { kind, message })
}

/// What a group produced.
#[derive(Debug, Clone)]
pub enum GroupOutput {
    /// Validator results keyed by validator name.
    Validation(IndexMap<String, ValidationResult>),
    /// Protocol tester result.
    Protocol(ProtocolTestResult),
    /// Integration tester result.
    Integration(IntegrationTestResult),
    /// Performance tester result.
    Performance(PerformanceTestResult),
    /// A custom stage that contributes nothing to the test result.
    Empty,
}

/// Accumulates group outputs into a [`TestResult`].
#[derive(Debug, Clone)]
pub struct ResultBuilder {
    test_id: String,
    server_path: PathBuf,
    started_at: chrono::DateTime<Utc>,
    started: Instant,
    validation: IndexMap<String, ValidationResult>,
    protocol: Option<ProtocolTestResult>,
    integration: Option<IntegrationTestResult>,
    performance: Option<PerformanceTestResult>,
    errors: Vec<String>,
    failure_type: Option<FailureType>,
}

impl ResultBuilder {
    /// Starts a result for `server_path` with a fresh test id.
    #[must_use]
    pub fn new(server_path: impl Into<PathBuf>) -> Self {
        Self {
            test_id: Uuid::new_v4().to_string(),
            server_path: server_path.into(),
            started_at: Utc::now(),
            started: Instant::now(),
            validation: IndexMap::new(),
            protocol: None,
            integration: None,
            performance: None,
            errors: Vec::new(),
            failure_type: None,
        }
    }

    /// The test id the final result will carry.
    #[must_use]
    pub fn test_id(&self) -> &str {
        &self.test_id
    }

    /// Folds one group's output in. A repeated group replaces its earlier
    /// output, which is what a retried stage needs.
    pub fn merge(&mut self, output: GroupOutput) {
        match output {
            GroupOutput::Validation(results) => self.validation = results,
            GroupOutput::Protocol(result) => self.protocol = Some(result),
            GroupOutput::Integration(result) => self.integration = Some(result),
            GroupOutput::Performance(result) => self.performance = Some(result),
            GroupOutput::Empty => {}
        }
    }

    /// Records a run-level failure. The first classified failure type wins.
    pub fn record_error(&mut self, message: impl Into<String>, failure_type: Option<FailureType>) {
        self.errors.push(message.into());
        if self.failure_type.is_none() {
            self.failure_type = failure_type;
        }
    }

    /// The result as accumulated so far.
    #[must_use]
    pub fn snapshot(&self) -> TestResult {
        self.build(Vec::new())
    }

    /// Finalises the result.
    #[must_use]
    pub fn finish(self, server_stderr: Vec<String>) -> TestResult {
        self.build(server_stderr)
    }

    fn build(&self, server_stderr: Vec<String>) -> TestResult {
        let counts = TestResult::count(
            &self.validation,
            self.protocol.as_ref(),
            self.integration.as_ref(),
            self.performance.as_ref(),
        );
        let mut result = TestResult {
            test_id: self.test_id.clone(),
            server_path: self.server_path.clone(),
            started_at: self.started_at,
            finished_at: Utc::now(),
            duration: self.started.elapsed(),
            success: counts.failed == 0 && self.errors.is_empty(),
            counts,
            validation: self.validation.clone(),
            protocol: self.protocol.clone(),
            integration: self.integration.clone(),
            performance: self.performance.clone(),
            failure_type: None,
            errors: self.errors.clone(),
            server_stderr,
        };
        result.failure_type = if result.success {
            None
        } else {
            self.failure_type.or_else(|| {
                result
                    .primary_failure()
                    .map(|(stage, text)| failure_type_of(&text, Some(&stage)))
            })
        };
        result
    }
}

/// Runs every enabled group for one server without stage policies.
pub struct TestSuite {
    config: Arc<TestConfig>,
    metrics: Arc<MetricsRegistry>,
}

impl TestSuite {
    /// Creates a suite with its own counters.
    #[must_use]
    pub fn new(config: Arc<TestConfig>) -> Self {
        Self::with_metrics(config, Arc::new(MetricsRegistry::new()))
    }

    /// Creates a suite recording into `metrics`.
    #[must_use]
    pub const fn with_metrics(config: Arc<TestConfig>, metrics: Arc<MetricsRegistry>) -> Self {
        Self { config, metrics }
    }

    /// The counters this suite records into.
    #[must_use]
    pub const fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    /// Tests one server.
    ///
    /// Validators run first; a server that does not build is never started.
    /// A group that fails fatally stops the run, other failures are recorded
    /// and the next group runs. The server is closed before returning.
    pub async fn run(&self, server_path: &Path, cancel: &CancelSignal) -> TestResult {
        let ctx = RunContext::new(
            Arc::clone(&self.config),
            server_path,
            cancel.clone(),
            Arc::clone(&self.metrics),
        );
        let mut builder = ResultBuilder::new(server_path);
        info!(server = %server_path.display(), test_id = %builder.test_id(), "Test run started");

        for group in TestGroup::enabled(&self.config.features) {
            let verdict = match group.run(&ctx).await {
                Ok(output) => {
                    builder.merge(output);
                    group.check(&builder.snapshot())
                }
                Err(e) => Err(e),
            };
            match verdict {
                Ok(()) => debug!(group = %group, "Group passed"),
                Err(e) if e.is_fatal() => {
                    builder.record_error(e.to_string(), e.failure_type());
                    warn!(group = %group, error = %e, "Run stopped");
                    break;
                }
                Err(e) => debug!(group = %group, error = %e, "Group failed"),
            }
        }

        let stderr = ctx.recent_stderr();
        ctx.close().await;
        let result = builder.finish(stderr);
        info!(
            server = %server_path.display(),
            success = result.success,
            passed = result.counts.passed,
            failed = result.counts.failed,
            skipped = result.counts.skipped,
            "Test run finished"
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::results::MethodTest;

    fn compilation(success: bool, environment: bool) -> ValidationResult {
        if environment {
            return ValidationResult::environment_failure(
                "compilation",
                "required tool 'go' was not found on PATH".to_string(),
            );
        }
        ValidationResult::from_findings(
            "compilation",
            if success {
                Vec::new()
            } else {
                vec!["./main.go:3:2: undefined: x".to_string()]
            },
            Vec::new(),
            Duration::ZERO,
            IndexMap::new(),
        )
    }

    fn builder_with(result: ValidationResult) -> ResultBuilder {
        let mut builder = ResultBuilder::new("/tmp/server");
        let mut validation = IndexMap::new();
        validation.insert(result.validator.clone(), result);
        builder.merge(GroupOutput::Validation(validation));
        builder
    }

    #[test]
    fn compile_failure_is_fatal() {
        let snapshot = builder_with(compilation(false, false)).snapshot();
        let err = TestGroup::Validation.check(&snapshot).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(err.failure_type(), Some(FailureType::Compilation));
        assert_eq!(snapshot.failure_type, Some(FailureType::Compilation));
        assert!(!snapshot.success);
    }

    #[test]
    fn missing_build_tool_is_a_dependency_failure() {
        let snapshot = builder_with(compilation(false, true)).snapshot();
        let err = TestGroup::Validation.check(&snapshot).unwrap_err();
        assert_eq!(err.failure_type(), Some(FailureType::Dependency));
    }

    #[test]
    fn passing_build_passes_check() {
        let snapshot = builder_with(compilation(true, false)).snapshot();
        assert!(TestGroup::Validation.check(&snapshot).is_ok());
        assert!(snapshot.success);
        assert_eq!(snapshot.failure_type, None);
        assert_eq!(snapshot.counts.total, 1);
    }

    #[test]
    fn failed_method_is_a_retryable_protocol_failure() {
        let mut builder = ResultBuilder::new("/tmp/server");
        let mut method_tests = IndexMap::new();
        method_tests.insert(
            "tools/list".to_string(),
            MethodTest {
                success: false,
                skipped: false,
                ..MethodTest::skipped("tools/list", "server error [-32601]: Method not found")
            },
        );
        builder.merge(GroupOutput::Protocol(ProtocolTestResult {
            success: false,
            state: ProtocolState::Done,
            handshake: MethodTest::skipped("initialize", "n/a"),
            negotiated_version: None,
            server_info: None,
            method_tests,
            capability_tests: IndexMap::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
            duration: Duration::ZERO,
        }));
        let snapshot = builder.snapshot();
        let err = TestGroup::Protocol.check(&snapshot).unwrap_err();
        assert!(!err.is_fatal());
        assert!(err.to_string().contains("tools/list"));
        assert_eq!(snapshot.failure_type, Some(FailureType::Protocol));
    }

    #[test]
    fn first_recorded_failure_type_wins() {
        let mut builder = ResultBuilder::new("/tmp/server");
        builder.record_error("stage 'protocol' timed out after 10ms", Some(FailureType::Timeout));
        builder.record_error("later", Some(FailureType::Network));
        let result = builder.finish(Vec::new());
        assert_eq!(result.failure_type, Some(FailureType::Timeout));
        assert_eq!(result.errors.len(), 2);
        assert!(result.counts.is_consistent());
    }

    #[test]
    fn toggles_select_groups() {
        let features = FeatureToggles {
            integration: false,
            performance: false,
            ..FeatureToggles::default()
        };
        assert_eq!(
            TestGroup::enabled(&features),
            vec![TestGroup::Validation, TestGroup::Protocol]
        );
        assert!(!TestGroup::Validation.is_dynamic());
    }
}
