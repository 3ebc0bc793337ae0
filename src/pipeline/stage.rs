//! Pipeline stages.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::TestConfig;
use crate::diagnostics::classify::failure_type_of;
use crate::error::{FailureType, StageError};
use crate::metrics::Counter;
use crate::results::{duration_ms, TestResult};
use crate::suite::{GroupOutput, ResultBuilder, RunContext, TestGroup};

/// The work a stage performs.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    /// Runs one attempt.
    ///
    /// # Errors
    ///
    /// Returns a [`StageError`] if the attempt could not produce an output.
    async fn execute(&self, ctx: &RunContext) -> Result<GroupOutput, StageError>;

    /// Post-condition over the accumulated result, including this attempt's
    /// output. The default accepts everything.
    ///
    /// # Errors
    ///
    /// Returns a [`StageError`] describing the violated condition.
    fn validate(&self, _result: &TestResult) -> Result<(), StageError> {
        Ok(())
    }
}

/// Runs one [`TestGroup`] as a stage.
#[derive(Debug, Clone, Copy)]
pub struct GroupStage(pub TestGroup);

#[async_trait]
impl StageExecutor for GroupStage {
    async fn execute(&self, ctx: &RunContext) -> Result<GroupOutput, StageError> {
        self.0.run(ctx).await
    }

    fn validate(&self, result: &TestResult) -> Result<(), StageError> {
        self.0.check(result)
    }
}

/// What happens when a stage fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Record the failure and run the next stage.
    #[default]
    Continue,
    /// Skip every remaining stage.
    Stop,
    /// Re-run up to the stage's retry count, then continue.
    Retry,
}

/// A named unit of work with its own timeout and failure policy.
#[derive(Clone)]
pub struct Stage {
    name: String,
    executor: Arc<dyn StageExecutor>,
    timeout: Duration,
    retries: u32,
    on_failure: FailurePolicy,
    parallel: bool,
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .field("retries", &self.retries)
            .field("on_failure", &self.on_failure)
            .field("parallel", &self.parallel)
            .finish_non_exhaustive()
    }
}

impl Stage {
    /// Default timeout of a single attempt.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

    /// Creates a stage that runs once, with the `continue` policy.
    pub fn new(name: impl Into<String>, executor: impl StageExecutor + 'static) -> Self {
        Self {
            name: name.into(),
            executor: Arc::new(executor),
            timeout: Self::DEFAULT_TIMEOUT,
            retries: 0,
            on_failure: FailurePolicy::Continue,
            parallel: false,
        }
    }

    /// A stage running `group` with the configured timeout and retry count.
    #[must_use]
    pub fn for_group(group: TestGroup, config: &TestConfig) -> Self {
        Self::new(group.name(), GroupStage(group))
            .with_timeout(config.timeouts.stage())
            .with_retries(config.retry.attempts)
    }

    /// Sets the per-attempt timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets how many extra attempts the `retry` policy may make.
    #[must_use]
    pub const fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Sets the failure policy.
    #[must_use]
    pub const fn on_failure(mut self, policy: FailurePolicy) -> Self {
        self.on_failure = policy;
        self
    }

    /// Allows the stage to overlap with the next one. Only set this when
    /// neither stage reads the other's output.
    #[must_use]
    pub const fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Stage name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Failure policy.
    #[must_use]
    pub const fn policy(&self) -> FailurePolicy {
        self.on_failure
    }

    /// Whether the stage may overlap with the next one.
    #[must_use]
    pub const fn is_parallel(&self) -> bool {
        self.parallel
    }

    /// Runs the stage's attempts against `ctx`.
    ///
    /// `base` is the result accumulated before this stage; the post-condition
    /// sees it with the attempt's output merged in. Returns the stage result
    /// and the output of the last attempt that produced one.
    pub(crate) async fn run(
        &self,
        ctx: &RunContext,
        base: &ResultBuilder,
        retry_delay: Duration,
    ) -> (StageResult, Option<GroupOutput>) {
        let started_at = Utc::now();
        let started = Instant::now();
        let attempts = match self.on_failure {
            FailurePolicy::Retry => self.retries.saturating_add(1),
            _ => 1,
        };

        let mut retry_count = 0;
        let mut output = None;
        let mut last_error = None;
        for attempt in 0..attempts {
            if attempt > 0 {
                retry_count += 1;
                ctx.metrics().incr(Counter::StageRetry);
                info!(stage = %self.name, attempt = attempt + 1, "Retrying stage");
                tokio::time::sleep(retry_delay).await;
            }
            ctx.metrics().incr(Counter::StageRun);

            let verdict = match tokio::time::timeout(self.timeout, self.executor.execute(ctx)).await
            {
                Ok(Ok(produced)) => {
                    let mut accumulated = base.clone();
                    accumulated.merge(produced.clone());
                    output = Some(produced);
                    self.executor.validate(&accumulated.snapshot())
                }
                Ok(Err(e)) => Err(e),
                Err(_) => Err(StageError::Timeout {
                    stage: self.name.clone(),
                    after: self.timeout,
                }),
            };

            match verdict {
                Ok(()) => {
                    last_error = None;
                    break;
                }
                Err(e) => {
                    let fatal = e.is_fatal();
                    warn!(stage = %self.name, attempt = attempt + 1, fatal, error = %e, "Stage attempt failed");
                    last_error = Some(e);
                    if fatal {
                        break;
                    }
                }
            }
        }

        let result = match last_error {
            None => {
                debug!(stage = %self.name, retry_count, "Stage passed");
                StageResult {
                    name: self.name.clone(),
                    success: true,
                    skipped: false,
                    started_at: Some(started_at),
                    duration: started.elapsed(),
                    retry_count,
                    error: None,
                    failure_type: None,
                    fatal: false,
                }
            }
            Some(e) => {
                ctx.metrics().incr(Counter::StageFailed);
                StageResult::failed(&self.name, started_at, started.elapsed(), retry_count, &e)
            }
        };
        (result, output)
    }
}

/// Outcome of one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageResult {
    /// Stage name.
    pub name: String,
    /// Whether the stage (after retries) passed.
    pub success: bool,
    /// Whether the stage never ran.
    pub skipped: bool,
    /// When the first attempt started.
    pub started_at: Option<DateTime<Utc>>,
    /// Time across every attempt; zero for skipped stages.
    #[serde(with = "duration_ms")]
    pub duration: Duration,
    /// Attempts beyond the first.
    pub retry_count: u32,
    /// Error of the last attempt.
    pub error: Option<String>,
    /// Classified failure.
    pub failure_type: Option<FailureType>,
    /// Whether the failure could not be fixed by retrying.
    pub fatal: bool,
}

impl StageResult {
    /// A failed stage.
    #[must_use]
    pub fn failed(
        name: &str,
        started_at: DateTime<Utc>,
        duration: Duration,
        retry_count: u32,
        error: &StageError,
    ) -> Self {
        let message = error.to_string();
        let failure_type = error
            .failure_type()
            .unwrap_or_else(|| failure_type_of(&message, Some(name)));
        Self {
            name: name.to_string(),
            success: false,
            skipped: false,
            started_at: Some(started_at),
            duration,
            retry_count,
            error: Some(message),
            failure_type: Some(failure_type),
            fatal: error.is_fatal(),
        }
    }

    /// A stage that never ran.
    #[must_use]
    pub fn skipped(name: &str, reason: Option<String>) -> Self {
        Self {
            name: name.to_string(),
            success: false,
            skipped: true,
            started_at: None,
            duration: Duration::ZERO,
            retry_count: 0,
            error: reason,
            failure_type: None,
            fatal: false,
        }
    }

    /// Whether the stage ran and failed.
    #[must_use]
    pub const fn is_failure(&self) -> bool {
        !self.success && !self.skipped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_result_classifies_timeouts() {
        let err = StageError::Timeout {
            stage: "protocol".to_string(),
            after: Duration::from_millis(5),
        };
        let result = StageResult::failed("protocol", Utc::now(), Duration::from_millis(5), 0, &err);
        assert_eq!(result.failure_type, Some(FailureType::Timeout));
        assert!(result.is_failure());
        assert!(!result.fatal);
    }

    #[test]
    fn skipped_result_has_no_timing() {
        let result = StageResult::skipped("performance", None);
        assert!(result.skipped);
        assert!(!result.is_failure());
        assert_eq!(result.duration, Duration::ZERO);
        assert!(result.started_at.is_none());
    }

    #[test]
    fn group_stages_take_configured_limits() {
        let mut config = TestConfig::default();
        config.timeouts.stage_ms = 1_234;
        config.retry.attempts = 3;
        let stage = Stage::for_group(TestGroup::Integration, &config).on_failure(FailurePolicy::Retry);
        assert_eq!(stage.name(), "integration");
        assert_eq!(stage.timeout, Duration::from_millis(1_234));
        assert_eq!(stage.retries, 3);
        assert_eq!(stage.policy(), FailurePolicy::Retry);
        assert!(!stage.is_parallel());
    }
}
