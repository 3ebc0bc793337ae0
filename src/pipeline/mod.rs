//! Staged execution of a test run.
//!
//! A [`Pipeline`] is an ordered list of [`Stage`]s sharing one
//! [`RunContext`]. Stages run in declared order; a stage marked `parallel`
//! starts together with the stage after it, forming a wave that is joined
//! before anything later starts.
//!
//! # Failure policies
//!
//! | policy     | on failure                                              |
//! |------------|---------------------------------------------------------|
//! | `continue` | record it, run the next stage                           |
//! | `stop`     | record it, mark every later stage skipped               |
//! | `retry`    | re-run after the retry delay, up to `retries` more times |
//!
//! Fatal errors (the server does not build, a tool is missing, the run was
//! cancelled) are never retried. A pipeline timeout or cancellation fails
//! the in-flight stages, skips the rest and closes the server.

mod stage;

pub use stage::{FailurePolicy, GroupStage, Stage, StageExecutor, StageResult};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cancel::CancelSignal;
use crate::config::TestConfig;
use crate::error::FailureType;
use crate::metrics::{Counter, MetricsRegistry, MetricsSnapshot};
use crate::results::{duration_ms, TestResult};
use crate::suite::{GroupOutput, ResultBuilder, RunContext, TestGroup};

/// Callback invoked as each stage result becomes final.
pub type StageCallback = Arc<dyn Fn(&StageResult) + Send + Sync>;

/// Outcome of a pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineResult {
    /// Unique id (UUID v4).
    pub pipeline_id: String,
    /// Server project directory.
    pub server_path: PathBuf,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run finished.
    pub finished_at: DateTime<Utc>,
    /// Wall-clock time.
    #[serde(with = "duration_ms")]
    pub duration: Duration,
    /// `true` when every stage passed and the test result is clean.
    pub success: bool,
    /// Stage results in execution order.
    pub stages: Vec<StageResult>,
    /// The accumulated test result.
    pub test_result: TestResult,
    /// Counters recorded during the run.
    pub metrics: MetricsSnapshot,
}

impl PipelineResult {
    /// The result of stage `name`.
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&StageResult> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// The first stage that ran and failed.
    #[must_use]
    pub fn first_failed_stage(&self) -> Option<&StageResult> {
        self.stages.iter().find(|s| s.is_failure())
    }

    /// Stages that actually ran.
    pub fn executed_stages(&self) -> impl Iterator<Item = &StageResult> {
        self.stages.iter().filter(|s| !s.skipped)
    }
}

enum Interruption {
    Cancelled,
    TimedOut(Duration),
}

impl Interruption {
    fn message(&self) -> String {
        match self {
            Self::Cancelled => "pipeline cancelled".to_string(),
            Self::TimedOut(after) => format!("pipeline timed out after {}ms", after.as_millis()),
        }
    }

    const fn failure_type(&self) -> Option<FailureType> {
        match self {
            Self::Cancelled => None,
            Self::TimedOut(_) => Some(FailureType::Timeout),
        }
    }
}

struct InFlight {
    index: usize,
    started_at: DateTime<Utc>,
    started: Instant,
}

impl InFlight {
    /// Result for a stage whose task ended without reporting.
    fn abandon(&self, name: &str, error: String, failure_type: Option<FailureType>) -> StageResult {
        StageResult {
            name: name.to_string(),
            success: false,
            skipped: false,
            started_at: Some(self.started_at),
            duration: self.started.elapsed(),
            retry_count: 0,
            error: Some(error),
            failure_type: Some(failure_type.unwrap_or(FailureType::Unknown)),
            fatal: true,
        }
    }
}

struct RunState {
    builder: ResultBuilder,
    results: Vec<Option<StageResult>>,
    in_flight: Vec<InFlight>,
    stopped_by: Option<String>,
}

/// Ordered stages over one server.
pub struct Pipeline {
    config: Arc<TestConfig>,
    stages: Vec<Stage>,
    on_stage_complete: Option<StageCallback>,
}

impl Pipeline {
    /// An empty pipeline.
    #[must_use]
    pub const fn new(config: Arc<TestConfig>) -> Self {
        Self {
            config,
            stages: Vec::new(),
            on_stage_complete: None,
        }
    }

    /// The standard pipeline: `validation (stop) → protocol (stop) →
    /// integration (continue) → performance (continue)`, without the groups
    /// the feature toggles disable.
    #[must_use]
    pub fn for_config(config: Arc<TestConfig>) -> Self {
        let groups = TestGroup::enabled(&config.features);
        let stages = groups
            .into_iter()
            .map(|group| {
                let policy = match group {
                    TestGroup::Validation | TestGroup::Protocol => FailurePolicy::Stop,
                    TestGroup::Integration | TestGroup::Performance => FailurePolicy::Continue,
                };
                Stage::for_group(group, &config).on_failure(policy)
            })
            .collect();
        Self {
            config,
            stages,
            on_stage_complete: None,
        }
    }

    /// Appends a stage.
    #[must_use]
    pub fn add_stage(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    /// Registers a callback run as each stage result becomes final.
    #[must_use]
    pub fn on_stage_complete(mut self, callback: impl Fn(&StageResult) + Send + Sync + 'static) -> Self {
        self.on_stage_complete = Some(Arc::new(callback));
        self
    }

    /// The stages in declared order.
    #[must_use]
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// The run configuration.
    #[must_use]
    pub const fn config(&self) -> &Arc<TestConfig> {
        &self.config
    }

    /// Runs every stage against `server_path` with fresh counters.
    pub async fn run(&self, server_path: &Path, cancel: &CancelSignal) -> PipelineResult {
        self.run_with_metrics(server_path, cancel, Arc::new(MetricsRegistry::new()))
            .await
    }

    /// Runs every stage, recording into `metrics`.
    pub async fn run_with_metrics(
        &self,
        server_path: &Path,
        cancel: &CancelSignal,
        metrics: Arc<MetricsRegistry>,
    ) -> PipelineResult {
        let started_at = Utc::now();
        let started = Instant::now();
        let pipeline_id = Uuid::new_v4().to_string();
        let ctx = Arc::new(RunContext::new(
            Arc::clone(&self.config),
            server_path,
            cancel.clone(),
            Arc::clone(&metrics),
        ));
        let mut state = RunState {
            builder: ResultBuilder::new(server_path),
            results: vec![None; self.stages.len()],
            in_flight: Vec::new(),
            stopped_by: None,
        };
        info!(
            server = %server_path.display(),
            pipeline_id = %pipeline_id,
            stages = self.stages.len(),
            "Pipeline started"
        );

        let limit = self.config.timeouts.pipeline();
        let interruption = {
            let deadline = async move {
                match limit {
                    Some(after) => tokio::time::sleep(after).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                () = self.run_stages(&ctx, &mut state) => None,
                () = cancel.cancelled() => Some(Interruption::Cancelled),
                () = deadline => limit.map(Interruption::TimedOut),
            }
        };

        if let Some(interruption) = interruption {
            let message = interruption.message();
            warn!(server = %server_path.display(), %message, "Pipeline interrupted");
            state
                .builder
                .record_error(message.clone(), interruption.failure_type());
            for flight in std::mem::take(&mut state.in_flight) {
                let result = flight.abandon(
                    self.stages[flight.index].name(),
                    message.clone(),
                    interruption.failure_type(),
                );
                metrics.incr(Counter::StageFailed);
                self.complete(&mut state, flight.index, result);
            }
            state.stopped_by.get_or_insert(message);
        }

        for index in 0..self.stages.len() {
            if state.results[index].is_none() {
                metrics.incr(Counter::StageSkipped);
                let reason = state.stopped_by.clone();
                self.complete(
                    &mut state,
                    index,
                    StageResult::skipped(self.stages[index].name(), reason),
                );
            }
        }

        let stderr = ctx.recent_stderr();
        ctx.close().await;

        let stages: Vec<StageResult> = state.results.into_iter().flatten().collect();
        let test_result = state.builder.finish(stderr);
        let success = test_result.success && stages.iter().all(|s| !s.is_failure());
        let result = PipelineResult {
            pipeline_id,
            server_path: server_path.to_path_buf(),
            started_at,
            finished_at: Utc::now(),
            duration: started.elapsed(),
            success,
            stages,
            test_result,
            metrics: metrics.snapshot(),
        };
        info!(
            server = %server_path.display(),
            success = result.success,
            elapsed_ms = result.duration.as_millis(),
            "Pipeline finished"
        );
        result
    }

    /// Runs waves of stages until the list is exhausted or a `stop` stage
    /// fails.
    async fn run_stages(&self, ctx: &Arc<RunContext>, state: &mut RunState) {
        let retry_delay = self.config.retry.delay();
        let mut next = 0;
        while next < self.stages.len() {
            let end = self.wave_end(next);
            let mut wave = JoinSet::new();
            for index in next..end {
                let stage = self.stages[index].clone();
                let ctx = Arc::clone(ctx);
                let base = state.builder.clone();
                state.in_flight.push(InFlight {
                    index,
                    started_at: Utc::now(),
                    started: Instant::now(),
                });
                wave.spawn(async move {
                    let (result, output) = stage.run(&ctx, &base, retry_delay).await;
                    (index, result, output)
                });
            }

            let mut finished = Vec::with_capacity(end - next);
            while let Some(joined) = wave.join_next().await {
                match joined {
                    Ok(done) => finished.push(done),
                    Err(e) => warn!(error = %e, "Stage task panicked"),
                }
            }
            finished.sort_by_key(|(index, ..)| *index);

            for (index, result, output) in finished {
                state.in_flight.retain(|f| f.index != index);
                self.absorb(state, index, result, output);
            }
            for flight in std::mem::take(&mut state.in_flight) {
                let name = self.stages[flight.index].name().to_string();
                let result = flight.abandon(&name, "stage task panicked".to_string(), None);
                ctx.metrics().incr(Counter::StageFailed);
                state.builder.record_error(format!("stage '{name}' panicked"), None);
                self.complete(state, flight.index, result);
                state
                    .stopped_by
                    .get_or_insert_with(|| format!("skipped after stage '{name}' failed"));
            }

            if state.stopped_by.is_some() {
                return;
            }
            next = end;
        }
    }

    /// Index one past the last stage of the wave starting at `start`.
    fn wave_end(&self, start: usize) -> usize {
        let mut end = start;
        while end < self.stages.len() {
            let parallel = self.stages[end].is_parallel();
            end += 1;
            if !parallel {
                break;
            }
        }
        end
    }

    fn absorb(
        &self,
        state: &mut RunState,
        index: usize,
        result: StageResult,
        output: Option<GroupOutput>,
    ) {
        let produced = output.is_some();
        if let Some(output) = output {
            state.builder.merge(output);
        }
        if result.is_failure() {
            // Failures that left no output, or that make later stages
            // meaningless, are run-level errors; the rest are already data.
            if !produced || result.fatal {
                if let Some(error) = &result.error {
                    state.builder.record_error(error.clone(), result.failure_type);
                }
            }
            if self.stages[index].policy() == FailurePolicy::Stop || result.fatal {
                info!(stage = %result.name, "Stopping pipeline after failed stage");
                state
                    .stopped_by
                    .get_or_insert_with(|| format!("skipped after stage '{}' failed", result.name));
            }
        }
        self.complete(state, index, result);
    }

    fn complete(&self, state: &mut RunState, index: usize, result: StageResult) {
        if let Some(callback) = &self.on_stage_complete {
            callback(&result);
        }
        state.results[index] = Some(result);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::config::FeatureToggles;
    use crate::error::StageError;

    struct Flaky {
        failures_left: AtomicU32,
    }

    #[async_trait]
    impl StageExecutor for Flaky {
        async fn execute(&self, _ctx: &RunContext) -> Result<GroupOutput, StageError> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(StageError::Failed {
                    message: "transient".to_string(),
                });
            }
            Ok(GroupOutput::Empty)
        }
    }

    struct Fails(StageError);

    #[async_trait]
    impl StageExecutor for Fails {
        async fn execute(&self, _ctx: &RunContext) -> Result<GroupOutput, StageError> {
            Err(self.0.clone())
        }
    }

    struct Passes;

    #[async_trait]
    impl StageExecutor for Passes {
        async fn execute(&self, _ctx: &RunContext) -> Result<GroupOutput, StageError> {
            Ok(GroupOutput::Empty)
        }
    }

    struct Sleeps(Duration);

    #[async_trait]
    impl StageExecutor for Sleeps {
        async fn execute(&self, _ctx: &RunContext) -> Result<GroupOutput, StageError> {
            tokio::time::sleep(self.0).await;
            Ok(GroupOutput::Empty)
        }
    }

    fn config() -> Arc<TestConfig> {
        let mut config = TestConfig::default();
        config.retry.delay_ms = 1;
        Arc::new(config)
    }

    #[tokio::test]
    async fn retry_records_retry_count() {
        let pipeline = Pipeline::new(config()).add_stage(
            Stage::new(
                "flaky",
                Flaky {
                    failures_left: AtomicU32::new(2),
                },
            )
            .with_retries(2)
            .on_failure(FailurePolicy::Retry),
        );
        let result = pipeline.run(Path::new("/nonexistent"), &CancelSignal::new()).await;

        let stage = result.stage("flaky").unwrap();
        assert!(stage.success);
        assert_eq!(stage.retry_count, 2);
        assert_eq!(result.metrics.stage_retries, 2);
        assert_eq!(result.metrics.stages_run, 3);
    }

    #[tokio::test]
    async fn retries_exhausted_fail_the_stage() {
        let pipeline = Pipeline::new(config()).add_stage(
            Stage::new(
                "flaky",
                Flaky {
                    failures_left: AtomicU32::new(5),
                },
            )
            .with_retries(1)
            .on_failure(FailurePolicy::Retry),
        );
        let result = pipeline.run(Path::new("/nonexistent"), &CancelSignal::new()).await;
        let stage = result.stage("flaky").unwrap();
        assert!(stage.is_failure());
        assert_eq!(stage.retry_count, 1);
        assert!(!result.success);
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let pipeline = Pipeline::new(config()).add_stage(
            Stage::new(
                "build",
                Fails(StageError::Fatal {
                    kind: FailureType::Compilation,
                    message: "main.go:1:1: undefined: x".to_string(),
                }),
            )
            .with_retries(3)
            .on_failure(FailurePolicy::Retry),
        );
        let result = pipeline.run(Path::new("/nonexistent"), &CancelSignal::new()).await;
        let stage = result.stage("build").unwrap();
        assert_eq!(stage.retry_count, 0);
        assert_eq!(stage.failure_type, Some(FailureType::Compilation));
        assert_eq!(result.test_result.failure_type, Some(FailureType::Compilation));
    }

    #[tokio::test]
    async fn stop_skips_later_stages_with_zero_duration() {
        let pipeline = Pipeline::new(config())
            .add_stage(Stage::new("first", Passes))
            .add_stage(
                Stage::new(
                    "second",
                    Fails(StageError::Failed {
                        message: "nope".to_string(),
                    }),
                )
                .on_failure(FailurePolicy::Stop),
            )
            .add_stage(Stage::new("third", Passes))
            .add_stage(Stage::new("fourth", Passes));
        let result = pipeline.run(Path::new("/nonexistent"), &CancelSignal::new()).await;

        assert!(result.stage("first").unwrap().success);
        assert!(result.stage("second").unwrap().is_failure());
        for name in ["third", "fourth"] {
            let stage = result.stage(name).unwrap();
            assert!(stage.skipped);
            assert_eq!(stage.duration, Duration::ZERO);
            assert!(stage.started_at.is_none());
        }
        assert_eq!(result.metrics.stages_skipped, 2);
        assert_eq!(result.executed_stages().count(), 2);
        assert!(!result.success);
    }

    #[tokio::test]
    async fn continue_runs_the_next_stage() {
        let pipeline = Pipeline::new(config())
            .add_stage(Stage::new(
                "first",
                Fails(StageError::Failed {
                    message: "nope".to_string(),
                }),
            ))
            .add_stage(Stage::new("second", Passes));
        let result = pipeline.run(Path::new("/nonexistent"), &CancelSignal::new()).await;
        assert!(result.stage("first").unwrap().is_failure());
        assert!(result.stage("second").unwrap().success);
        assert_eq!(result.first_failed_stage().unwrap().name, "first");
    }

    #[tokio::test]
    async fn stage_timeout_is_a_timeout_failure() {
        let pipeline = Pipeline::new(config()).add_stage(
            Stage::new("slow", Sleeps(Duration::from_secs(5))).with_timeout(Duration::from_millis(20)),
        );
        let result = pipeline.run(Path::new("/nonexistent"), &CancelSignal::new()).await;
        let stage = result.stage("slow").unwrap();
        assert_eq!(stage.failure_type, Some(FailureType::Timeout));
        assert_eq!(result.test_result.failure_type, Some(FailureType::Timeout));
    }

    #[tokio::test]
    async fn parallel_stages_overlap() {
        let pipeline = Pipeline::new(config())
            .add_stage(Stage::new("a", Sleeps(Duration::from_millis(200))).parallel(true))
            .add_stage(Stage::new("b", Sleeps(Duration::from_millis(200))));
        let result = pipeline.run(Path::new("/nonexistent"), &CancelSignal::new()).await;
        assert!(result.success);
        assert_eq!(result.stages.len(), 2);
        assert!(result.duration < Duration::from_millis(390));
    }

    #[tokio::test]
    async fn cancellation_fails_in_flight_and_skips_the_rest() {
        let cancel = CancelSignal::new();
        let pipeline = Pipeline::new(config())
            .add_stage(Stage::new("slow", Sleeps(Duration::from_secs(30))))
            .add_stage(Stage::new("after", Passes));
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            pipeline.run(Path::new("/nonexistent"), &cancel),
        )
        .await
        .expect("cancellation should end the run");

        assert!(result.stage("slow").unwrap().is_failure());
        assert!(result.stage("after").unwrap().skipped);
        assert!(result
            .test_result
            .errors
            .iter()
            .any(|e| e.contains("cancelled")));
    }

    #[tokio::test]
    async fn callback_sees_every_stage() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let pipeline = Pipeline::new(config())
            .add_stage(Stage::new("one", Passes))
            .add_stage(Stage::new("two", Passes))
            .on_stage_complete(move |r| sink.lock().unwrap().push(r.name.clone()));
        pipeline.run(Path::new("/nonexistent"), &CancelSignal::new()).await;
        assert_eq!(*seen.lock().unwrap(), vec!["one".to_string(), "two".to_string()]);
    }

    #[test]
    fn default_pipeline_follows_toggles() {
        let mut config = TestConfig::default();
        config.features = FeatureToggles {
            performance: false,
            ..FeatureToggles::default()
        };
        let pipeline = Pipeline::for_config(Arc::new(config));
        let names: Vec<&str> = pipeline.stages().iter().map(Stage::name).collect();
        assert_eq!(names, vec!["validation", "protocol", "integration"]);
        assert_eq!(pipeline.stages()[0].policy(), FailurePolicy::Stop);
        assert_eq!(pipeline.stages()[1].policy(), FailurePolicy::Stop);
        assert_eq!(pipeline.stages()[2].policy(), FailurePolicy::Continue);
    }
}
