//! Report rendering and composite scores.
//!
//! A [`TestReport`] wraps one finished [`TestResult`], its scores and the
//! optional diagnosis. [`Reporter`] renders it as JSON, HTML or XML and
//! writes it to `<output_dir>/<test_id>.<ext>`.
//!
//! # Scores
//!
//! All scores are 0-100.
//!
//! | Score       | Source                                          | Weight |
//! |-------------|-------------------------------------------------|--------|
//! | quality     | validator and integration pass ratio            | 0.35   |
//! | performance | p95 latency and peak memory against limits      | 0.25   |
//! | compliance  | protocol method and capability pass ratio       | 0.40   |
//!
//! A group that did not run has no score, and the overall score is the
//! weighted mean of the scores that exist.

mod export;
mod html;
mod xml;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

pub use export::write_batch_csv;

use crate::config::{PerformanceConfig, ReportFormat, TestConfig};
use crate::diagnostics::DiagnosticReport;
use crate::error::ReportError;
use crate::results::{Outcome, TestCounts, TestResult};

/// Weight of the quality score in the overall score.
pub const QUALITY_WEIGHT: f64 = 0.35;
/// Weight of the performance score in the overall score.
pub const PERFORMANCE_WEIGHT: f64 = 0.25;
/// Weight of the compliance score in the overall score.
pub const COMPLIANCE_WEIGHT: f64 = 0.40;

/// Composite 0-100 scores. `None` marks a group that did not run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityScores {
    /// Validator and integration pass ratio.
    pub quality: Option<f64>,
    /// Latency and memory against thresholds.
    pub performance: Option<f64>,
    /// Protocol pass ratio.
    pub compliance: Option<f64>,
    /// Weighted mean of the present scores.
    pub overall: Option<f64>,
}

impl QualityScores {
    /// Scores a finished result.
    #[must_use]
    pub fn compute(result: &TestResult, limits: &PerformanceConfig) -> Self {
        let quality = TestCounts::tally(
            result
                .validation
                .values()
                .map(crate::results::ValidationResult::outcome)
                .chain(
                    result
                        .integration
                        .iter()
                        .flat_map(crate::results::IntegrationTestResult::outcomes),
                ),
        )
        .pass_ratio()
        .map(percent);
        let compliance = result
            .protocol
            .as_ref()
            .and_then(|p| TestCounts::tally(p.outcomes()).pass_ratio())
            .map(percent);
        let performance = result.performance.as_ref().map(|p| {
            #[allow(clippy::cast_precision_loss)]
            let latency = inverse_normalized(p.latency.p95_ms, limits.max_response_time_ms as f64);
            let memory = p.memory.map(|m| {
                #[allow(clippy::cast_precision_loss)]
                let limit = limits.max_memory_mb as f64;
                inverse_normalized(m.peak_mb, limit)
            });
            // Load scenarios that failed outright cap the score at their pass ratio.
            let scenarios = TestCounts::tally(p.outcomes())
                .pass_ratio()
                .unwrap_or(1.0);
            let parts = memory.map_or(latency, |m| (latency + m) / 2.0);
            percent(parts.min(1.0) * scenarios)
        });

        let weighted = [
            (quality, QUALITY_WEIGHT),
            (performance, PERFORMANCE_WEIGHT),
            (compliance, COMPLIANCE_WEIGHT),
        ];
        let (sum, weight) = weighted
            .iter()
            .filter_map(|(score, w)| score.map(|s| (s * w, *w)))
            .fold((0.0, 0.0), |(sum, total), (s, w)| (sum + s, total + w));
        let overall = (weight > 0.0).then(|| round(sum / weight));

        Self {
            quality,
            performance,
            compliance,
            overall,
        }
    }
}

/// `1 - value / limit`, clamped to `[0, 1]`. A zero limit scores zero.
fn inverse_normalized(value: f64, limit: f64) -> f64 {
    if limit <= 0.0 {
        return 0.0;
    }
    (1.0 - value / limit).clamp(0.0, 1.0)
}

fn percent(ratio: f64) -> f64 {
    round(ratio * 100.0)
}

fn round(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// One rendered report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestReport {
    /// When the report was rendered.
    pub generated_at: DateTime<Utc>,
    /// Composite scores.
    pub scores: QualityScores,
    /// The scored result.
    pub test_result: TestResult,
    /// Diagnosis, for failed runs.
    pub diagnostics: Option<DiagnosticReport>,
}

impl TestReport {
    /// Number of counted tests with the given outcome.
    #[must_use]
    pub const fn count(&self, outcome: Outcome) -> usize {
        match outcome {
            Outcome::Passed => self.test_result.counts.passed,
            Outcome::Failed => self.test_result.counts.failed,
            Outcome::Skipped => self.test_result.counts.skipped,
        }
    }
}

/// Renders and writes reports.
#[derive(Debug, Clone)]
pub struct Reporter {
    config: Arc<TestConfig>,
}

impl Reporter {
    /// Creates a reporter for the run configuration.
    #[must_use]
    pub const fn new(config: Arc<TestConfig>) -> Self {
        Self { config }
    }

    /// Builds the report for `result`.
    #[must_use]
    pub fn report(&self, result: &TestResult, diagnostics: Option<&DiagnosticReport>) -> TestReport {
        TestReport {
            generated_at: Utc::now(),
            scores: QualityScores::compute(result, &self.config.performance),
            test_result: result.clone(),
            diagnostics: diagnostics.cloned(),
        }
    }

    /// Renders `report` in `format`.
    ///
    /// # Errors
    ///
    /// Returns [`ReportError::Serialise`] if JSON serialisation fails, or
    /// [`ReportError::Template`] if an HTML or XML template fails to render.
    pub fn render(report: &TestReport, format: ReportFormat) -> Result<String, ReportError> {
        let body = match format {
            ReportFormat::Json => serde_json::to_string_pretty(report)?,
            ReportFormat::Html => html::render(report)?,
            ReportFormat::Xml => xml::render(report)?,
        };
        Ok(body)
    }

    /// Path the report for `test_id` is written to, if an output directory
    /// is configured.
    #[must_use]
    pub fn output_path(&self, test_id: &str) -> Option<PathBuf> {
        let format = self.config.report.format;
        self.config
            .report
            .output_dir
            .as_ref()
            .map(|dir| dir.join(format!("{test_id}.{}", format.extension())))
    }

    /// Renders `report` in the configured format and writes it to
    /// [`Self::output_path`]. Returns the written path, or `None` when no
    /// output directory is configured.
    ///
    /// # Errors
    ///
    /// Returns an error if rendering fails or the file cannot be written.
    pub async fn write(&self, report: &TestReport) -> Result<Option<PathBuf>, ReportError> {
        let Some(path) = self.output_path(&report.test_result.test_id) else {
            return Ok(None);
        };
        let body = Self::render(report, self.config.report.format)?;
        write_file(&path, body.as_bytes()).await?;
        info!(path = %path.display(), "Report written");
        Ok(Some(path))
    }
}

async fn write_file(path: &Path, contents: &[u8]) -> Result<(), ReportError> {
    let to_error = |source| ReportError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(to_error)?;
    }
    tokio::fs::write(path, contents).await.map_err(to_error)
}

/// Replaces characters XML 1.0 forbids outright (C0 controls other than
/// tab, newline and carriage return, and the two non-characters) with
/// U+FFFD. Markup escaping is left to the templates.
fn clean(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '\t' | '\n' | '\r' => c,
            '\u{0}'..='\u{1f}' | '\u{fffe}' | '\u{ffff}' => char::REPLACEMENT_CHARACTER,
            c => c,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use indexmap::IndexMap;

    use super::*;
    use crate::results::{LatencyStats, PerformanceTestResult, ValidationResult};
    use crate::suite::{GroupOutput, ResultBuilder};

    fn validation(name: &str, ok: bool) -> ValidationResult {
        ValidationResult::from_findings(
            name,
            if ok { Vec::new() } else { vec!["<bad> & \"worse\"".to_string()] },
            Vec::new(),
            Duration::ZERO,
            IndexMap::new(),
        )
    }

    fn result_with(validators: &[(&str, bool)]) -> TestResult {
        let mut builder = ResultBuilder::new("/srv/server");
        builder.merge(GroupOutput::Validation(
            validators
                .iter()
                .map(|(n, ok)| ((*n).to_string(), validation(n, *ok)))
                .collect(),
        ));
        builder.finish(Vec::new())
    }

    #[test]
    fn overall_renormalises_over_present_groups() {
        let result = result_with(&[("compilation", true), ("lint", false)]);
        let scores = QualityScores::compute(&result, &PerformanceConfig::default());
        assert_eq!(scores.quality, Some(50.0));
        assert_eq!(scores.compliance, None);
        assert_eq!(scores.performance, None);
        assert_eq!(scores.overall, Some(50.0));
    }

    #[test]
    fn nothing_ran_means_no_scores() {
        let result = ResultBuilder::new("/srv/server").finish(Vec::new());
        assert_eq!(
            QualityScores::compute(&result, &PerformanceConfig::default()),
            QualityScores::default()
        );
    }

    #[test]
    fn performance_is_inverse_to_latency() {
        let mut builder = ResultBuilder::new("/srv/server");
        builder.merge(GroupOutput::Performance(PerformanceTestResult {
            success: true,
            latency: LatencyStats {
                p95_ms: 250.0,
                ..LatencyStats::default()
            },
            memory: None,
            memory_check: None,
            throughput_per_sec: 0.0,
            scenarios: IndexMap::new(),
            duration: Duration::ZERO,
        }));
        let result = builder.finish(Vec::new());
        let limits = PerformanceConfig {
            max_response_time_ms: 1_000,
            ..PerformanceConfig::default()
        };
        let scores = QualityScores::compute(&result, &limits);
        assert_eq!(scores.performance, Some(75.0));
        assert_eq!(scores.overall, Some(75.0));
    }

    #[test]
    fn renders_every_format_with_escaping() {
        let result = result_with(&[("syntax", false)]);
        let report = Reporter::new(Arc::new(TestConfig::default())).report(&result, None);

        let json = Reporter::render(&report, ReportFormat::Json).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["testResult"]["counts"]["failed"], 1);

        let html = Reporter::render(&report, ReportFormat::Html).unwrap();
        assert!(html.starts_with("<!DOCTYPE html>"));
        assert!(html.contains("&lt;bad&gt; &amp;"));
        assert!(!html.contains("<bad>"));
        assert!(!html.contains("\"worse\""));
        assert!(html.contains("<h2>Validation</h2>"));

        let xml = Reporter::render(&report, ReportFormat::Xml).unwrap();
        assert!(xml.starts_with("<?xml"));
        assert!(xml.contains("&lt;bad&gt;"));
        assert!(xml.contains(&format!("testId=\"{}\"", result.test_id)));
        assert!(xml.contains("<validator name=\"syntax\" success=\"false\""));
        assert!(xml.trim_end().ends_with("</testReport>"));
    }

    #[test]
    fn control_characters_never_reach_xml() {
        let mut result = result_with(&[("lint", false)]);
        result.errors.push("exit\u{1b}[31m code\u{0} 2".to_string());
        result.server_stderr = vec!["\u{7}panic:\tboom".to_string()];
        let report = Reporter::new(Arc::new(TestConfig::default())).report(&result, None);

        for format in [ReportFormat::Xml, ReportFormat::Html] {
            let body = Reporter::render(&report, format).unwrap();
            assert!(
                !body.chars().any(|c| c.is_control() && !matches!(c, '\t' | '\n' | '\r')),
                "{format:?} output carries a control character"
            );
            assert!(body.contains("exit\u{fffd}[31m code\u{fffd} 2"));
        }
    }

    #[tokio::test]
    async fn writes_to_output_dir_by_test_id() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = TestConfig::default();
        config.report.format = ReportFormat::Html;
        config.report.output_dir = Some(dir.path().join("reports"));
        let reporter = Reporter::new(Arc::new(config));

        let result = result_with(&[("compilation", true)]);
        let report = reporter.report(&result, None);
        let path = reporter.write(&report).await.unwrap().unwrap();
        assert_eq!(path, dir.path().join("reports").join(format!("{}.html", result.test_id)));
        assert!(std::fs::read_to_string(path).unwrap().contains("compilation"));
    }

    #[tokio::test]
    async fn no_output_dir_writes_nothing() {
        let reporter = Reporter::new(Arc::new(TestConfig::default()));
        let report = reporter.report(&result_with(&[]), None);
        assert_eq!(reporter.write(&report).await.unwrap(), None);
    }

    #[test]
    fn clean_keeps_whitespace_and_markup() {
        assert_eq!(clean("a<b>\t&\r\n\u{c}\u{ffff}"), "a<b>\t&\r\n\u{fffd}\u{fffd}");
    }
}
