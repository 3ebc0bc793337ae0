//! Concurrent pipeline runs over many servers.
//!
//! Workers are bounded by a semaphore; a permit is taken before each run is
//! spawned, so servers still waiting for a permit are the "queued" work that
//! `stop_on_failure` (or cancellation) abandons. Runs already in flight are
//! left to finish. The summary is computed once every run has joined.
//!
//! Results are keyed by path, so a path listed twice runs once; the repeat
//! is reported as not run.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cancel::CancelSignal;
use crate::error::FailureType;
use crate::pipeline::{Pipeline, PipelineResult};
use crate::results::duration_ms;

/// One server's run time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerTiming {
    /// Server project directory.
    pub server_path: PathBuf,
    /// Pipeline wall-clock time.
    #[serde(with = "duration_ms")]
    pub duration: Duration,
}

/// Cross-server statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchTestSummary {
    /// Servers whose pipeline ran.
    pub total: usize,
    /// Pipelines that succeeded.
    pub passed: usize,
    /// Pipelines that failed.
    pub failed: usize,
    /// Servers abandoned before their run started.
    pub not_run: usize,
    /// `passed / total`, or 0 when nothing ran.
    pub success_rate: f64,
    /// Mean pipeline time.
    #[serde(with = "duration_ms")]
    pub avg_duration: Duration,
    /// Quickest run.
    pub fastest: Option<ServerTiming>,
    /// Slowest run.
    pub slowest: Option<ServerTiming>,
    /// `failure_type@stage` to number of servers, most frequent first.
    pub failure_signatures: IndexMap<String, usize>,
    /// Fraction of executed runs of each stage that succeeded.
    pub stage_success_rates: IndexMap<String, f64>,
}

impl BatchTestSummary {
    /// Aggregates finished runs.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn from_results(results: &IndexMap<PathBuf, PipelineResult>, not_run: usize) -> Self {
        let total = results.len();
        let passed = results.values().filter(|r| r.success).count();

        let timings: Vec<ServerTiming> = results
            .values()
            .map(|r| ServerTiming {
                server_path: r.server_path.clone(),
                duration: r.duration,
            })
            .collect();
        let avg_duration = if total == 0 {
            Duration::ZERO
        } else {
            timings.iter().map(|t| t.duration).sum::<Duration>() / u32::try_from(total).unwrap_or(u32::MAX)
        };

        let mut failure_signatures: IndexMap<String, usize> = IndexMap::new();
        for result in results.values().filter(|r| !r.success) {
            *failure_signatures.entry(signature(result)).or_insert(0) += 1;
        }
        failure_signatures.sort_by(|ka, a, kb, b| b.cmp(a).then_with(|| ka.cmp(kb)));

        let mut executed: IndexMap<String, (usize, usize)> = IndexMap::new();
        for stage in results.values().flat_map(PipelineResult::executed_stages) {
            let entry = executed.entry(stage.name.clone()).or_insert((0, 0));
            entry.0 += usize::from(stage.success);
            entry.1 += 1;
        }
        let stage_success_rates = executed
            .into_iter()
            .map(|(name, (ok, ran))| (name, ok as f64 / ran as f64))
            .collect();

        Self {
            total,
            passed,
            failed: total - passed,
            not_run,
            success_rate: if total == 0 { 0.0 } else { passed as f64 / total as f64 },
            avg_duration,
            fastest: timings.iter().min_by_key(|t| t.duration).cloned(),
            slowest: timings.iter().max_by_key(|t| t.duration).cloned(),
            failure_signatures,
            stage_success_rates,
        }
    }
}

/// `failure_type@stage` of a failed run.
#[must_use]
pub fn signature(result: &PipelineResult) -> String {
    let failed = result.first_failed_stage();
    let failure_type = result
        .test_result
        .failure_type
        .or_else(|| failed.and_then(|s| s.failure_type))
        .unwrap_or(FailureType::Unknown);
    let stage = failed.map_or("run", |s| s.name.as_str());
    format!("{failure_type}@{stage}")
}

/// Outcome of a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchTestResult {
    /// Unique id (UUID v4).
    pub batch_id: String,
    /// When the batch started.
    pub started_at: DateTime<Utc>,
    /// When the last run joined.
    pub finished_at: DateTime<Utc>,
    /// Wall-clock time.
    #[serde(with = "duration_ms")]
    pub duration: Duration,
    /// Results of the runs that happened, in input order.
    pub server_results: IndexMap<PathBuf, PipelineResult>,
    /// Servers abandoned before their run started, and repeats of a path
    /// already in the batch.
    pub not_run: Vec<PathBuf>,
    /// Aggregate statistics.
    pub summary: BatchTestSummary,
}

impl BatchTestResult {
    /// `true` when every requested server ran and passed.
    #[must_use]
    pub fn success(&self) -> bool {
        self.not_run.is_empty() && self.server_results.values().all(|r| r.success)
    }
}

/// Runs one [`Pipeline`] over many servers.
pub struct BatchRunner {
    pipeline: Arc<Pipeline>,
    workers: usize,
    stop_on_failure: bool,
}

impl BatchRunner {
    /// Uses the pipeline's configured worker count.
    #[must_use]
    pub fn new(pipeline: Pipeline) -> Self {
        let workers = pipeline.config().concurrency.batch_workers;
        Self {
            pipeline: Arc::new(pipeline),
            workers: workers.max(1),
            stop_on_failure: false,
        }
    }

    /// Overrides the worker count (at least one).
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Abandons queued servers after the first failed run.
    #[must_use]
    pub const fn stop_on_failure(mut self, stop: bool) -> Self {
        self.stop_on_failure = stop;
        self
    }

    /// Runs the pipeline over every path.
    pub async fn run(&self, paths: &[PathBuf], cancel: &CancelSignal) -> BatchTestResult {
        let batch_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let started = Instant::now();
        info!(
            batch_id = %batch_id,
            servers = paths.len(),
            workers = self.workers,
            "Batch started"
        );

        let slots = Arc::new(Semaphore::new(self.workers));
        let halt = CancelSignal::new();
        let mut tasks = JoinSet::new();
        let mut not_run = Vec::new();
        let mut seen = HashSet::new();
        let unique: Vec<&PathBuf> = paths
            .iter()
            .filter(|path| {
                let first = seen.insert(*path);
                if !first {
                    warn!(server = %path.display(), "Server listed more than once; running it once");
                    not_run.push((*path).clone());
                }
                first
            })
            .collect();
        let mut queued = unique.into_iter().enumerate();

        for (index, path) in queued.by_ref() {
            let permit = tokio::select! {
                permit = Arc::clone(&slots).acquire_owned() => permit.ok(),
                () = cancel.cancelled() => None,
            };
            let Some(permit) = permit else {
                not_run.push(path.clone());
                break;
            };
            if halt.is_cancelled() || cancel.is_cancelled() {
                not_run.push(path.clone());
                break;
            }

            let pipeline = Arc::clone(&self.pipeline);
            let cancel = cancel.clone();
            let halt = halt.clone();
            let stop_on_failure = self.stop_on_failure;
            let path = path.clone();
            tasks.spawn(async move {
                let result = pipeline.run(&path, &cancel).await;
                if stop_on_failure && !result.success {
                    warn!(server = %path.display(), "Run failed; abandoning queued servers");
                    halt.cancel();
                }
                drop(permit);
                (index, path, result)
            });
        }
        not_run.extend(queued.map(|(_, path)| path.clone()));

        let mut finished = Vec::with_capacity(paths.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(entry) => finished.push(entry),
                Err(e) => warn!(error = %e, "Pipeline task did not complete"),
            }
        }
        finished.sort_by_key(|(index, _, _)| *index);
        let server_results: IndexMap<PathBuf, PipelineResult> = finished
            .into_iter()
            .map(|(_, path, result)| (path, result))
            .collect();

        let summary = BatchTestSummary::from_results(&server_results, not_run.len());
        info!(
            batch_id = %batch_id,
            passed = summary.passed,
            failed = summary.failed,
            not_run = summary.not_run,
            "Batch finished"
        );
        BatchTestResult {
            batch_id,
            started_at,
            finished_at: Utc::now(),
            duration: started.elapsed(),
            server_results,
            not_run,
            summary,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::config::TestConfig;
    use crate::error::StageError;
    use crate::pipeline::{FailurePolicy, Stage, StageExecutor};
    use crate::suite::{GroupOutput, RunContext};

    /// Fails for paths containing "bad"; tracks peak concurrency.
    struct ByPath {
        running: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl StageExecutor for ByPath {
        async fn execute(&self, ctx: &RunContext) -> Result<GroupOutput, StageError> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            if ctx.server_path().to_string_lossy().contains("bad") {
                Err(StageError::Fatal {
                    kind: FailureType::Compilation,
                    message: "undefined: handler".to_string(),
                })
            } else {
                Ok(GroupOutput::Empty)
            }
        }
    }

    fn runner(peak: &Arc<AtomicUsize>) -> BatchRunner {
        let pipeline = Pipeline::new(Arc::new(TestConfig::default())).add_stage(
            Stage::new(
                "build",
                ByPath {
                    running: Arc::new(AtomicUsize::new(0)),
                    peak: Arc::clone(peak),
                },
            )
            .on_failure(FailurePolicy::Stop),
        );
        BatchRunner::new(pipeline)
    }

    fn paths(names: &[&str]) -> Vec<PathBuf> {
        names.iter().map(|n| PathBuf::from(format!("/srv/{n}"))).collect()
    }

    #[tokio::test]
    async fn workers_bound_concurrency_and_summary_aggregates() {
        let peak = Arc::new(AtomicUsize::new(0));
        let result = runner(&peak)
            .with_workers(2)
            .run(&paths(&["a", "bad1", "b", "bad2", "c"]), &CancelSignal::new())
            .await;

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(result.server_results.len(), 5);
        assert!(result.not_run.is_empty());
        let keys: Vec<_> = result.server_results.keys().cloned().collect();
        assert_eq!(keys, paths(&["a", "bad1", "b", "bad2", "c"]));

        let summary = &result.summary;
        assert_eq!((summary.total, summary.passed, summary.failed), (5, 3, 2));
        assert!((summary.success_rate - 0.6).abs() < f64::EPSILON);
        assert_eq!(summary.failure_signatures.get("compilation_error@build"), Some(&2));
        assert!((summary.stage_success_rates["build"] - 0.6).abs() < f64::EPSILON);
        assert!(summary.fastest.is_some() && summary.slowest.is_some());
        assert!(!result.success());
    }

    #[tokio::test]
    async fn stop_on_failure_abandons_queued_servers() {
        let peak = Arc::new(AtomicUsize::new(0));
        let result = runner(&peak)
            .with_workers(1)
            .stop_on_failure(true)
            .run(&paths(&["bad", "a", "b"]), &CancelSignal::new())
            .await;

        assert_eq!(result.server_results.len(), 1);
        assert_eq!(result.not_run, paths(&["a", "b"]));
        assert_eq!(result.summary.not_run, 2);
    }

    #[tokio::test]
    async fn repeated_path_runs_once() {
        let peak = Arc::new(AtomicUsize::new(0));
        let result = runner(&peak)
            .run(&paths(&["a", "bad", "a"]), &CancelSignal::new())
            .await;

        assert_eq!(
            result.server_results.keys().cloned().collect::<Vec<_>>(),
            paths(&["a", "bad"])
        );
        assert!(result.server_results[&PathBuf::from("/srv/a")].success);
        assert!(!result.server_results[&PathBuf::from("/srv/bad")].success);
        assert_eq!(result.not_run, paths(&["a"]));
        assert_eq!(result.summary.total, 2);
        assert_eq!(result.summary.failed, 1);
        assert_eq!(result.summary.not_run, 1);
    }

    #[tokio::test]
    async fn empty_batch_has_empty_summary() {
        let peak = Arc::new(AtomicUsize::new(0));
        let result = runner(&peak).run(&[], &CancelSignal::new()).await;
        assert_eq!(result.summary, BatchTestSummary::default());
        assert!(result.success());
    }
}
