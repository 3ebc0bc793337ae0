//! XML rendering.
//!
//! The document is `templates/report.xml`. Element text and attribute
//! values are escaped by askama; [`clean`] drops the control characters
//! XML 1.0 cannot carry even as references.

use askama::Template;

use super::{clean, TestReport};

fn lower_debug(value: impl std::fmt::Debug) -> String {
    format!("{value:?}").to_lowercase()
}

fn cleaned(items: &[String]) -> Vec<String> {
    items.iter().map(|item| clean(item)).collect()
}

struct Validator {
    name: String,
    success: bool,
    duration_ms: u128,
    errors: Vec<String>,
    warnings: Vec<String>,
}

struct Method {
    name: String,
    success: bool,
    skipped: bool,
    latency_ms: u128,
    error: Option<String>,
}

struct Capability {
    name: String,
    required: bool,
    supported: bool,
    success: bool,
    skipped: bool,
    error: Option<String>,
}

struct Protocol {
    success: bool,
    state: String,
    negotiated_version: Option<String>,
    methods: Vec<Method>,
    capabilities: Vec<Capability>,
    errors: Vec<String>,
    warnings: Vec<String>,
}

struct Step {
    name: String,
    method: String,
    success: bool,
    latency_ms: u128,
    error: Option<String>,
}

struct Scenario {
    name: String,
    success: bool,
    error: Option<String>,
    steps: Vec<Step>,
    skipped_steps: Vec<String>,
}

struct Integration {
    success: bool,
    scenarios: Vec<Scenario>,
    clients: Vec<(String, bool)>,
}

struct Memory {
    avg_mb: String,
    peak_mb: String,
    leak_detected: bool,
}

struct LoadScenario {
    name: String,
    method: String,
    success: bool,
    total_calls: usize,
    failed_calls: usize,
    failures: Vec<String>,
}

struct Performance {
    success: bool,
    throughput: String,
    samples: usize,
    avg_ms: String,
    median_ms: String,
    p95_ms: String,
    p99_ms: String,
    max_ms: String,
    memory: Option<Memory>,
    scenarios: Vec<LoadScenario>,
}

struct Action {
    command: Option<String>,
    description: String,
}

struct Recommendation {
    priority: u32,
    title: String,
    actions: Vec<Action>,
}

struct Diagnosis {
    failure_type: String,
    severity: String,
    reproducibility: String,
    estimated_fix_time: String,
    primary_error: String,
    confidence: String,
    hypothesis: String,
    recommendations: Vec<Recommendation>,
}

#[derive(Template)]
#[template(path = "report.xml", escape = "html")]
struct XmlReport {
    test_id: String,
    server_path: String,
    success: bool,
    duration_ms: u128,
    failure_type: Option<String>,
    generated_at: String,
    total: usize,
    passed: usize,
    failed: usize,
    skipped: usize,
    overall: Option<f64>,
    quality: Option<f64>,
    performance_score: Option<f64>,
    compliance: Option<f64>,
    errors: Vec<String>,
    validators: Vec<Validator>,
    protocol: Option<Protocol>,
    integration: Option<Integration>,
    performance: Option<Performance>,
    diagnosis: Option<Diagnosis>,
}

impl XmlReport {
    fn new(report: &TestReport) -> Self {
        let result = &report.test_result;
        let counts = &result.counts;
        let scores = &report.scores;

        let validators = result
            .validation
            .values()
            .map(|v| Validator {
                name: clean(&v.validator),
                success: v.success,
                duration_ms: v.duration.as_millis(),
                errors: cleaned(&v.errors),
                warnings: cleaned(&v.warnings),
            })
            .collect();

        let protocol = result.protocol.as_ref().map(|p| Protocol {
            success: p.success,
            state: lower_debug(&p.state),
            negotiated_version: p.negotiated_version.as_deref().map(clean),
            methods: std::iter::once(&p.handshake)
                .chain(p.method_tests.values())
                .map(|m| Method {
                    name: clean(&m.method),
                    success: m.success,
                    skipped: m.skipped,
                    latency_ms: m.latency.as_millis(),
                    error: m.error.as_deref().map(clean),
                })
                .collect(),
            capabilities: p
                .capability_tests
                .values()
                .map(|c| Capability {
                    name: clean(&c.capability),
                    required: c.required,
                    supported: c.supported,
                    success: c.success,
                    skipped: c.skipped,
                    error: c.error.as_deref().map(clean),
                })
                .collect(),
            errors: cleaned(&p.errors),
            warnings: cleaned(&p.warnings),
        });

        let integration = result.integration.as_ref().map(|i| Integration {
            success: i.success,
            scenarios: i
                .scenarios
                .values()
                .map(|sc| Scenario {
                    name: clean(&sc.scenario),
                    success: sc.success,
                    error: sc.error.as_deref().map(clean),
                    steps: sc
                        .steps
                        .iter()
                        .map(|step| Step {
                            name: clean(&step.step),
                            method: clean(&step.method),
                            success: step.success,
                            latency_ms: step.latency.as_millis(),
                            error: step.error.as_deref().map(clean),
                        })
                        .collect(),
                    skipped_steps: cleaned(&sc.skipped_steps),
                })
                .collect(),
            clients: i
                .client_compatibility
                .iter()
                .map(|(client, ok)| (clean(client), *ok))
                .collect(),
        });

        let performance = result.performance.as_ref().map(|perf| {
            let l = &perf.latency;
            Performance {
                success: perf.success,
                throughput: format!("{:.2}", perf.throughput_per_sec),
                samples: l.samples,
                avg_ms: format!("{:.2}", l.avg_ms),
                median_ms: format!("{:.2}", l.median_ms),
                p95_ms: format!("{:.2}", l.p95_ms),
                p99_ms: format!("{:.2}", l.p99_ms),
                max_ms: format!("{:.2}", l.max_ms),
                memory: perf.memory.map(|m| Memory {
                    avg_mb: format!("{:.1}", m.avg_mb),
                    peak_mb: format!("{:.1}", m.peak_mb),
                    leak_detected: m.leak_detected,
                }),
                scenarios: perf
                    .scenarios
                    .values()
                    .map(|sc| LoadScenario {
                        name: clean(&sc.scenario),
                        method: clean(&sc.method),
                        success: sc.success,
                        total_calls: sc.total_calls,
                        failed_calls: sc.failed_calls,
                        failures: cleaned(&sc.failures),
                    })
                    .collect(),
            }
        });

        let diagnosis = report.diagnostics.as_ref().map(|d| {
            let fa = &d.failure_analysis;
            Diagnosis {
                failure_type: fa.failure_type.to_string(),
                severity: d.severity.to_string(),
                reproducibility: lower_debug(&fa.reproducibility),
                estimated_fix_time: clean(&d.estimated_fix_time),
                primary_error: clean(&fa.primary_error),
                confidence: lower_debug(&fa.root_cause.confidence),
                hypothesis: clean(&fa.root_cause.hypothesis),
                recommendations: d
                    .recommendations
                    .iter()
                    .map(|rec| Recommendation {
                        priority: rec.priority,
                        title: clean(&rec.title),
                        actions: rec
                            .actions
                            .iter()
                            .map(|a| Action {
                                command: a.command.as_deref().map(clean),
                                description: clean(&a.description),
                            })
                            .collect(),
                    })
                    .collect(),
            }
        });

        Self {
            test_id: clean(&result.test_id),
            server_path: clean(&result.server_path.display().to_string()),
            success: result.success,
            duration_ms: result.duration.as_millis(),
            failure_type: result.failure_type.map(|ft| ft.to_string()),
            generated_at: report.generated_at.to_rfc3339(),
            total: counts.total,
            passed: counts.passed,
            failed: counts.failed,
            skipped: counts.skipped,
            overall: scores.overall,
            quality: scores.quality,
            performance_score: scores.performance,
            compliance: scores.compliance,
            errors: cleaned(&result.errors),
            validators,
            protocol,
            integration,
            performance,
            diagnosis,
        }
    }
}

/// Renders `report` as an XML document.
pub(super) fn render(report: &TestReport) -> askama::Result<String> {
    XmlReport::new(report).render()
}
