//! Failure diagnostics.
//!
//! The engine reads a finished [`TestResult`] (and optionally the
//! [`PipelineResult`] around it) and explains the failure:
//!
//! 1. [`classify`] assigns a [`FailureType`] from the primary error text
//!    and the failing stage
//! 2. the tree and manifest are scanned for signals that support or
//!    sharpen the hypothesis ([`analysis`])
//! 3. [`catalog`] supplies ranked recommendations and a troubleshooting
//!    guide for the type
//!
//! The engine is advisory only. It never changes its inputs, and the
//! report copies the result's counts so the two cannot disagree.

pub mod analysis;
pub mod catalog;
pub mod classify;
pub mod environment;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

pub use analysis::{CodeAnalysis, DependencyAnalysis};
pub use catalog::{Action, DiagnosticRecommendation, FixEffort, TroubleshootingGuide};
pub use classify::{classify, Classification};
pub use environment::EnvironmentInfo;

use crate::config::TestConfig;
use crate::error::{FailureType, Severity};
use crate::pipeline::PipelineResult;
use crate::results::{TestCounts, TestResult};

const MAX_SECONDARY_ERRORS: usize = 10;

/// How likely the failure is to recur on an identical re-run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reproducibility {
    /// Same input, same failure.
    Deterministic,
    /// Depends on timing or load.
    Intermittent,
    /// Not enough information.
    Unknown,
}

impl Reproducibility {
    /// Expected reproducibility of a failure type.
    #[must_use]
    pub const fn of(failure_type: FailureType) -> Self {
        match failure_type {
            FailureType::Compilation
            | FailureType::Syntax
            | FailureType::Dependency
            | FailureType::Permission => Self::Deterministic,
            FailureType::Timeout | FailureType::Network | FailureType::Memory => {
                Self::Intermittent
            }
            FailureType::Protocol | FailureType::Unknown => Self::Unknown,
        }
    }
}

/// Confidence in a root-cause hypothesis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    /// A guess from the failure type alone.
    Low,
    /// The error text matched a known signature.
    Medium,
    /// A second, independent signal agrees.
    High,
}

/// The most likely explanation and what supports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RootCause {
    /// One-sentence hypothesis.
    pub hypothesis: String,
    /// How sure the engine is.
    pub confidence: Confidence,
    /// Signals behind the hypothesis.
    pub evidence: Vec<String>,
}

/// What failed and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureAnalysis {
    /// Classified type.
    pub failure_type: FailureType,
    /// Broad category of the type.
    pub category: String,
    /// Primary error text.
    pub primary_error: String,
    /// Other failures, most relevant first.
    pub secondary_errors: Vec<String>,
    /// Stages (or groups) that failed.
    pub failed_stages: Vec<String>,
    /// Root-cause hypothesis.
    pub root_cause: RootCause,
    /// Likelihood of recurrence.
    pub reproducibility: Reproducibility,
}

/// Everything the engine learned about one failed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticReport {
    /// Unique id (UUID v4).
    pub report_id: String,
    /// Id of the diagnosed test result.
    pub test_id: String,
    /// Server project directory.
    pub server_path: PathBuf,
    /// When the report was produced.
    pub generated_at: DateTime<Utc>,
    /// Counts copied from the test result.
    pub counts: TestCounts,
    /// Failure classification and hypothesis.
    pub failure_analysis: FailureAnalysis,
    /// Host facts, when collected.
    pub environment: Option<EnvironmentInfo>,
    /// Source tree facts.
    pub code_analysis: CodeAnalysis,
    /// Manifest facts.
    pub dependency_analysis: DependencyAnalysis,
    /// Remediations, highest priority first.
    pub recommendations: Vec<DiagnosticRecommendation>,
    /// Guide for the failure type.
    pub troubleshooting: TroubleshootingGuide,
    /// Reference documentation.
    pub related_issues: Vec<String>,
    /// Worst severity across failed stages.
    pub severity: Severity,
    /// Effort estimate of the top recommendation.
    pub estimated_fix_time: String,
}

/// Produces [`DiagnosticReport`]s.
#[derive(Debug, Clone)]
pub struct DiagnosticsEngine {
    config: Arc<TestConfig>,
    collect_environment: bool,
}

impl DiagnosticsEngine {
    /// Creates an engine that also probes host and toolchain.
    #[must_use]
    pub const fn new(config: Arc<TestConfig>) -> Self {
        Self {
            config,
            collect_environment: true,
        }
    }

    /// Skips host and toolchain probing.
    #[must_use]
    pub const fn without_environment(mut self) -> Self {
        self.collect_environment = false;
        self
    }

    /// Diagnoses a failed run. Returns `None` when the run succeeded.
    pub async fn diagnose(
        &self,
        result: &TestResult,
        pipeline: Option<&PipelineResult>,
    ) -> Option<DiagnosticReport> {
        if result.success {
            return None;
        }
        let root = &result.server_path;
        let (code_analysis, dependency_analysis) =
            scan_tree(root, &self.config.validators.source_globs).await;
        let failure_analysis = analyze(result, pipeline, &dependency_analysis);
        let severity = severity(result, pipeline, failure_analysis.failure_type);

        let recommendations = catalog::recommendations(failure_analysis.failure_type, severity);
        let estimated_fix_time = recommendations
            .first()
            .map_or("unknown", |r| r.effort.estimate())
            .to_string();
        let environment = if self.collect_environment {
            Some(EnvironmentInfo::collect(&self.config, root).await)
        } else {
            None
        };

        info!(
            server = %root.display(),
            failure_type = %failure_analysis.failure_type,
            severity = %severity,
            confidence = ?failure_analysis.root_cause.confidence,
            "Diagnosis complete"
        );
        Some(DiagnosticReport {
            report_id: Uuid::new_v4().to_string(),
            test_id: result.test_id.clone(),
            server_path: root.clone(),
            generated_at: Utc::now(),
            counts: result.counts,
            troubleshooting: catalog::troubleshooting(failure_analysis.failure_type),
            related_issues: catalog::related_links(failure_analysis.failure_type),
            failure_analysis,
            environment,
            code_analysis,
            dependency_analysis,
            recommendations,
            severity,
            estimated_fix_time,
        })
    }
}

/// Walks the server tree on the blocking pool. A scan that panics yields
/// empty analyses.
async fn scan_tree(root: &Path, patterns: &[String]) -> (CodeAnalysis, DependencyAnalysis) {
    let root = root.to_path_buf();
    let patterns = patterns.to_vec();
    tokio::task::spawn_blocking(move || {
        (
            CodeAnalysis::scan(&root, &patterns),
            DependencyAnalysis::scan(&root),
        )
    })
    .await
    .unwrap_or_else(|e| {
        warn!(error = %e, "Source scan did not complete");
        (CodeAnalysis::default(), DependencyAnalysis::default())
    })
}

/// Classifies the failure of `result` and forms a hypothesis.
#[must_use]
pub fn analyze(
    result: &TestResult,
    pipeline: Option<&PipelineResult>,
    dependencies: &DependencyAnalysis,
) -> FailureAnalysis {
    let (stage, primary_error) = result
        .primary_failure()
        .unwrap_or_else(|| ("run".to_string(), "run failed without an error message".to_string()));
    let classification = classify(&primary_error, Some(&stage));
    let failure_type = result.failure_type.unwrap_or(classification.failure_type);

    let mut evidence = Vec::new();
    let mut confidence = if failure_type == FailureType::Unknown {
        Confidence::Low
    } else if result.failure_type.is_some() || classification.matched_text.is_some() {
        Confidence::Medium
    } else {
        Confidence::Low
    };
    if let Some(text) = &classification.matched_text {
        evidence.push(format!("error text matches '{text}'"));
    }

    let hypothesis = match failure_type {
        FailureType::Compilation | FailureType::Dependency
            if !dependencies.recently_modified.is_empty() =>
        {
            confidence = Confidence::High;
            evidence.push(format!(
                "recently modified: {}",
                dependencies.recently_modified.join(", ")
            ));
            "A recent dependency change broke the build".to_string()
        }
        FailureType::Dependency if dependencies.manifest.is_some() && dependencies.lock_file.is_none() => {
            evidence.push("no lock file next to the manifest".to_string());
            "Dependencies are not pinned and resolved to an incompatible set".to_string()
        }
        FailureType::Compilation => "The generated code does not compile".to_string(),
        FailureType::Syntax => "A generated file is structurally malformed".to_string(),
        FailureType::Timeout => {
            if result
                .performance
                .as_ref()
                .and_then(|p| p.memory)
                .is_some_and(|m| m.leak_detected)
            {
                confidence = Confidence::High;
                evidence.push("memory grows steadily under load".to_string());
                "The server slows down as its memory grows".to_string()
            } else {
                "A handler blocks or never writes its response".to_string()
            }
        }
        FailureType::Network => {
            if result.server_stderr.iter().any(|l| l.contains("panic")) {
                confidence = Confidence::High;
                evidence.push("server stderr contains a panic".to_string());
                "The server crashed while handling a request".to_string()
            } else {
                "The server closed its output stream or wrote non-protocol output".to_string()
            }
        }
        FailureType::Permission => "The server or one of its files is not accessible".to_string(),
        FailureType::Memory => "The server exceeds its memory budget".to_string(),
        FailureType::Dependency => "A dependency is missing or cannot be resolved".to_string(),
        FailureType::Protocol => {
            let missing = result.protocol.as_ref().is_some_and(|p| {
                p.method_tests
                    .values()
                    .any(|m| m.error.as_deref().is_some_and(|e| e.contains("-32601")))
            });
            if missing {
                confidence = Confidence::High;
                evidence.push("server answered -32601 (method not found)".to_string());
                "A required MCP method is not implemented".to_string()
            } else {
                "The server's responses do not follow the MCP schema".to_string()
            }
        }
        FailureType::Unknown => "No known failure pattern matched".to_string(),
    };

    FailureAnalysis {
        failure_type,
        category: failure_type.category().to_string(),
        secondary_errors: secondary_errors(result, &primary_error),
        failed_stages: failed_stages(result, pipeline),
        root_cause: RootCause {
            hypothesis,
            confidence,
            evidence,
        },
        reproducibility: Reproducibility::of(failure_type),
        primary_error,
    }
}

fn secondary_errors(result: &TestResult, primary: &str) -> Vec<String> {
    let validation = result
        .validation
        .values()
        .filter(|v| !v.success)
        .flat_map(|v| v.errors.iter().take(3).map(move |e| format!("{}: {e}", v.validator)));
    let protocol = result.protocol.iter().flat_map(|p| {
        p.method_tests
            .values()
            .filter(|m| !m.success && !m.skipped)
            .map(|m| format!("{}: {}", m.method, m.error.as_deref().unwrap_or("failed")))
    });
    let integration = result.integration.iter().flat_map(|i| {
        i.scenarios
            .values()
            .filter(|s| !s.success)
            .map(|s| format!("scenario {}: {}", s.scenario, s.error.as_deref().unwrap_or("failed")))
    });
    let performance = result.performance.iter().flat_map(|p| {
        p.scenarios
            .values()
            .flat_map(|s| s.failures.iter().cloned())
            .chain(p.memory_check.iter().flat_map(|c| c.failures.iter().cloned()))
    });

    let mut out: Vec<String> = Vec::new();
    for error in result
        .errors
        .iter()
        .cloned()
        .chain(validation)
        .chain(protocol)
        .chain(integration)
        .chain(performance)
    {
        if error != primary && !out.contains(&error) {
            out.push(error);
        }
        if out.len() == MAX_SECONDARY_ERRORS {
            break;
        }
    }
    out
}

fn failed_stages(result: &TestResult, pipeline: Option<&PipelineResult>) -> Vec<String> {
    if let Some(pipeline) = pipeline {
        return pipeline
            .stages
            .iter()
            .filter(|s| s.is_failure())
            .map(|s| s.name.clone())
            .collect();
    }
    let mut out = Vec::new();
    if result.validation.values().any(|v| !v.success) {
        out.push("validation".to_string());
    }
    if result.protocol.as_ref().is_some_and(|p| !p.success) {
        out.push("protocol".to_string());
    }
    if result.integration.as_ref().is_some_and(|i| !i.success) {
        out.push("integration".to_string());
    }
    if result.performance.as_ref().is_some_and(|p| !p.success) {
        out.push("performance".to_string());
    }
    out
}

/// Worst severity across the primary failure and every failed stage.
fn severity(
    result: &TestResult,
    pipeline: Option<&PipelineResult>,
    primary: FailureType,
) -> Severity {
    let stages = pipeline
        .into_iter()
        .flat_map(|p| p.stages.iter())
        .filter(|s| s.is_failure())
        .filter_map(|s| s.failure_type);
    let validators = result
        .validation
        .values()
        .filter(|v| !v.success)
        .map(|v| {
            classify::failure_type_of(
                v.errors.first().map_or("", String::as_str),
                Some(&v.validator),
            )
        });
    std::iter::once(primary)
        .chain(stages)
        .chain(validators)
        .map(FailureType::severity)
        .max()
        .unwrap_or_default()
}
