//! Standalone HTML rendering.
//!
//! The page is `templates/report.html`; askama escapes every interpolated
//! value. Text from the server passes through [`clean`] first.

use askama::Template;

use super::{clean, TestReport};
use crate::results::Outcome;

/// `pass`, `fail` or `skip`; doubles as the CSS class.
const fn status(success: bool, skipped: bool) -> &'static str {
    if skipped {
        "skip"
    } else if success {
        "pass"
    } else {
        "fail"
    }
}

fn score(value: Option<f64>) -> String {
    value.map_or_else(|| "n/a".to_string(), |v| format!("{v:.1}"))
}

fn opt(text: Option<&str>) -> String {
    text.map(clean).unwrap_or_default()
}

struct ValidatorRow {
    name: String,
    status: &'static str,
    errors: Vec<String>,
    warnings: usize,
}

struct CheckRow {
    name: String,
    status: &'static str,
    latency_ms: String,
    detail: String,
}

struct ProtocolSection {
    handshake: &'static str,
    version: String,
    checks: Vec<CheckRow>,
}

struct ScenarioRow {
    name: String,
    status: &'static str,
    passed_steps: usize,
    planned_steps: usize,
    detail: String,
}

struct IntegrationSection {
    scenarios: Vec<ScenarioRow>,
    clients: Vec<(String, &'static str)>,
}

struct PerformanceSection {
    avg: String,
    median: String,
    p95: String,
    p99: String,
    max: String,
    throughput: String,
    memory: Option<String>,
}

struct ActionItem {
    description: String,
    command: Option<String>,
}

struct RecommendationItem {
    title: String,
    priority: u32,
    description: String,
    actions: Vec<ActionItem>,
}

struct DiagnosisSection {
    failure_type: String,
    severity: String,
    category: String,
    primary_error: String,
    hypothesis: String,
    confidence: String,
    fix_time: String,
    recommendations: Vec<RecommendationItem>,
}

#[derive(Template)]
#[template(path = "report.html")]
struct HtmlReport {
    title: String,
    test_id: String,
    status: &'static str,
    duration_ms: u128,
    generated_at: String,
    failure_type: Option<String>,
    total: usize,
    passed: usize,
    failed: usize,
    skipped: usize,
    overall: String,
    quality: String,
    performance_score: String,
    compliance: String,
    errors: Vec<String>,
    validators: Vec<ValidatorRow>,
    protocol: Option<ProtocolSection>,
    integration: Option<IntegrationSection>,
    performance: Option<PerformanceSection>,
    diagnosis: Option<DiagnosisSection>,
    stderr: String,
}

impl HtmlReport {
    fn new(report: &TestReport) -> Self {
        let result = &report.test_result;
        let scores = &report.scores;

        let validators = result
            .validation
            .values()
            .map(|v| ValidatorRow {
                name: clean(&v.validator),
                status: status(v.success, false),
                errors: v.errors.iter().map(|e| clean(e)).collect(),
                warnings: v.warnings.len(),
            })
            .collect();

        let protocol = result.protocol.as_ref().map(|p| {
            let methods = p.method_tests.values().map(|m| CheckRow {
                name: clean(&m.method),
                status: status(m.success, m.skipped),
                latency_ms: m.latency.as_millis().to_string(),
                detail: opt(m.error.as_deref()),
            });
            let capabilities = p.capability_tests.values().map(|c| CheckRow {
                name: format!("capability {}", clean(&c.capability)),
                status: status(c.success, c.skipped),
                latency_ms: String::new(),
                detail: opt(c.error.as_deref()),
            });
            ProtocolSection {
                handshake: status(p.handshake.success, false),
                version: opt(p.negotiated_version.as_deref()),
                checks: methods.chain(capabilities).collect(),
            }
        });

        let integration = result.integration.as_ref().map(|i| IntegrationSection {
            scenarios: i
                .scenarios
                .values()
                .map(|sc| ScenarioRow {
                    name: clean(&sc.scenario),
                    status: status(sc.success, false),
                    passed_steps: sc.steps.iter().filter(|st| st.success).count(),
                    planned_steps: sc.steps.len() + sc.skipped_steps.len(),
                    detail: opt(sc.error.as_deref()),
                })
                .collect(),
            clients: i
                .client_compatibility
                .iter()
                .map(|(client, ok)| (clean(client), status(*ok, false)))
                .collect(),
        });

        let performance = result.performance.as_ref().map(|perf| {
            let l = &perf.latency;
            PerformanceSection {
                avg: format!("{:.1}", l.avg_ms),
                median: format!("{:.1}", l.median_ms),
                p95: format!("{:.1}", l.p95_ms),
                p99: format!("{:.1}", l.p99_ms),
                max: format!("{:.1}", l.max_ms),
                throughput: format!("{:.1}", perf.throughput_per_sec),
                memory: perf.memory.map(|m| {
                    format!(
                        "avg {:.1} MB, peak {:.1} MB{}",
                        m.avg_mb,
                        m.peak_mb,
                        if m.leak_detected { ", possible leak" } else { "" }
                    )
                }),
            }
        });

        let diagnosis = report.diagnostics.as_ref().map(|d| {
            let fa = &d.failure_analysis;
            DiagnosisSection {
                failure_type: fa.failure_type.to_string(),
                severity: d.severity.to_string(),
                category: clean(&fa.category),
                primary_error: clean(&fa.primary_error),
                hypothesis: clean(&fa.root_cause.hypothesis),
                confidence: format!("{:?}", fa.root_cause.confidence),
                fix_time: clean(&d.estimated_fix_time),
                recommendations: d
                    .recommendations
                    .iter()
                    .map(|rec| RecommendationItem {
                        title: clean(&rec.title),
                        priority: rec.priority,
                        description: clean(&rec.description),
                        actions: rec
                            .actions
                            .iter()
                            .map(|a| ActionItem {
                                description: clean(&a.description),
                                command: a.command.as_deref().map(clean),
                            })
                            .collect(),
                    })
                    .collect(),
            }
        });

        Self {
            title: format!(
                "MCP server report: {}",
                clean(&result.server_path.display().to_string())
            ),
            test_id: clean(&result.test_id),
            status: status(result.success, false),
            duration_ms: result.duration.as_millis(),
            generated_at: report.generated_at.to_rfc3339(),
            failure_type: result.failure_type.map(|ft| ft.to_string()),
            total: result.counts.total,
            passed: report.count(Outcome::Passed),
            failed: report.count(Outcome::Failed),
            skipped: report.count(Outcome::Skipped),
            overall: score(scores.overall),
            quality: score(scores.quality),
            performance_score: score(scores.performance),
            compliance: score(scores.compliance),
            errors: result.errors.iter().map(|e| clean(e)).collect(),
            validators,
            protocol,
            integration,
            performance,
            diagnosis,
            stderr: clean(&result.server_stderr.join("\n")),
        }
    }
}

/// Renders `report` as a complete HTML document.
pub(super) fn render(report: &TestReport) -> askama::Result<String> {
    HtmlReport::new(report).render()
}
