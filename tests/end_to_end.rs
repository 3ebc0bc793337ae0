//! End-to-end pipeline runs against real subprocesses.
//!
//! The server under test is the `stub_mcp_server` binary built with this
//! crate; its behaviour is selected with `STUB_*` environment variables.
//! Build and lint commands are plain shell commands so no toolchain for the
//! generated language is needed.

#![cfg(unix)]

use std::fs;
use std::sync::Arc;

use serde_json::json;
use tempfile::TempDir;

use mcp_server_validator::config::{LoadScenario, TestConfig};
use mcp_server_validator::diagnostics::{DiagnosticsEngine, Reproducibility};
use mcp_server_validator::error::FailureType;
use mcp_server_validator::pipeline::Pipeline;
use mcp_server_validator::report::{Reporter, TestReport};
use mcp_server_validator::{BatchRunner, CancelSignal};

const STUB: &str = env!("CARGO_BIN_EXE_stub_mcp_server");

fn server_dir() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("go.mod"), "module example.com/stub\n\ngo 1.22\n").unwrap();
    fs::write(dir.path().join("go.sum"), "").unwrap();
    fs::write(
        dir.path().join("main.go"),
        "package main\n\nfunc main() {\n\tserve()\n}\n",
    )
    .unwrap();
    dir
}

fn stub_config(env: &[(&str, &str)]) -> TestConfig {
    let mut config = TestConfig::default();
    config.server.command = vec![STUB.to_string()];
    config.server.env = env
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect();
    config.validators.build_command = vec!["true".to_string()];
    config.validators.lint_command = vec!["true".to_string()];
    config.features.security_scan = false;
    config.performance.load_scenarios = vec![LoadScenario {
        name: "smoke".to_string(),
        method: "ping".to_string(),
        params: json!({}),
        callers: 2,
        iterations: 5,
        duration_ms: 0,
    }];
    config.timeouts.call_ms = 5_000;
    config.retry.delay_ms = 10;
    config
}

// =============================================================================
// Scenario 1: the server does not compile
// =============================================================================

#[tokio::test]
async fn compile_failure_skips_dynamic_stages_and_is_diagnosed() {
    let dir = server_dir();
    let mut config = stub_config(&[]);
    config.validators.build_command = vec![
        "sh".to_string(),
        "-c".to_string(),
        "echo './main.go:4:2: undefined: serve' >&2; exit 1".to_string(),
    ];
    let config = Arc::new(config);

    let result = Pipeline::for_config(Arc::clone(&config))
        .run(dir.path(), &CancelSignal::new())
        .await;

    assert!(!result.success);
    let test_result = &result.test_result;
    assert!(!test_result.validation["compilation"].success);
    assert!(test_result.protocol.is_none());
    assert!(test_result.integration.is_none());
    assert!(test_result.performance.is_none());
    assert_eq!(test_result.failure_type, Some(FailureType::Compilation));
    assert!(test_result.counts.is_consistent());

    let executed: Vec<&str> = result.executed_stages().map(|s| s.name.as_str()).collect();
    assert_eq!(executed, vec!["validation"]);
    for name in ["protocol", "integration", "performance"] {
        let stage = result.stage(name).unwrap();
        assert!(stage.skipped);
        assert!(stage.duration.is_zero());
    }
    assert_eq!(result.metrics.requests_sent, 0);

    let report = DiagnosticsEngine::new(Arc::clone(&config))
        .without_environment()
        .diagnose(test_result, Some(&result))
        .await
        .unwrap();
    assert_eq!(report.failure_analysis.failure_type, FailureType::Compilation);
    assert_eq!(report.failure_analysis.failure_type.as_str(), "compilation_error");
    assert_eq!(report.failure_analysis.reproducibility, Reproducibility::Deterministic);
    assert!(report.failure_analysis.primary_error.contains("undefined: serve"));
    assert_eq!(report.counts, test_result.counts);
    assert_eq!(report.dependency_analysis.manifest.as_deref(), Some("go.mod"));
    assert!(report.code_analysis.entry_points.contains(&"main.go".to_string()));
}

// =============================================================================
// Scenario 2: one required method is missing
// =============================================================================

#[tokio::test]
async fn missing_required_method_is_reported_on_its_own() {
    let dir = server_dir();
    let mut config = stub_config(&[("STUB_OMIT_METHODS", "tools/list")]);
    config.protocol.required_methods = vec![
        "ping".to_string(),
        "tools/list".to_string(),
        "logging/setLevel".to_string(),
    ];
    config.protocol.required_capabilities = Vec::new();
    config
        .protocol
        .method_params
        .insert("logging/setLevel".to_string(), json!({ "level": "info" }));

    let result = Pipeline::for_config(Arc::new(config))
        .run(dir.path(), &CancelSignal::new())
        .await;

    assert!(!result.success);
    let protocol = result.test_result.protocol.as_ref().unwrap();
    assert!(protocol.handshake.success);
    assert!(!protocol.method_tests["tools/list"].success);
    assert!(protocol.method_tests["tools/list"]
        .error
        .as_deref()
        .unwrap()
        .contains("-32601"));
    assert!(protocol.method_tests["ping"].success);
    assert!(protocol.method_tests["logging/setLevel"].success);
    assert_eq!(result.test_result.failure_type, Some(FailureType::Protocol));
    assert!(result.test_result.counts.is_consistent());
}

// =============================================================================
// A conforming server
// =============================================================================

#[tokio::test]
async fn conforming_server_passes_every_stage() {
    let dir = server_dir();
    let config = Arc::new(stub_config(&[]));

    let result = Pipeline::for_config(Arc::clone(&config))
        .run(dir.path(), &CancelSignal::new())
        .await;

    assert!(result.success, "stages: {:?}", result.stages);
    let test_result = &result.test_result;
    assert_eq!(test_result.failure_type, None);
    assert_eq!(test_result.counts.failed, 0);
    assert!(test_result.counts.total > 0);

    let integration = test_result.integration.as_ref().unwrap();
    assert!(integration.scenarios.values().all(|s| s.success));
    assert!(integration.client_compatibility.values().all(|ok| *ok));

    let performance = test_result.performance.as_ref().unwrap();
    assert_eq!(performance.scenarios["smoke"].total_calls, 10);
    assert_eq!(performance.scenarios["smoke"].failed_calls, 0);
    assert!(result.metrics.requests_sent >= 10);

    let none = DiagnosticsEngine::new(Arc::clone(&config))
        .diagnose(test_result, Some(&result))
        .await;
    assert!(none.is_none());

    let report: TestReport = Reporter::new(config).report(test_result, None);
    assert_eq!(report.scores.compliance, Some(100.0));
    assert_eq!(report.scores.quality, Some(100.0));
    assert!(report.scores.overall.unwrap() > 0.0);
}

#[tokio::test]
async fn crashing_server_fails_remaining_methods() {
    let dir = server_dir();
    let mut config = stub_config(&[("STUB_EXIT_AFTER", "1")]);
    config.features.validation = false;

    let result = Pipeline::for_config(Arc::new(config))
        .run(dir.path(), &CancelSignal::new())
        .await;

    assert!(!result.success);
    let protocol = result.test_result.protocol.as_ref().unwrap();
    assert!(protocol.handshake.success);
    assert!(protocol.method_tests.values().any(|m| !m.success));
    assert!(result
        .test_result
        .server_stderr
        .iter()
        .any(|l| l.contains("exiting after")));
}

#[tokio::test]
async fn batch_of_mixed_servers() {
    let good = server_dir();
    let bad = server_dir();
    fs::write(bad.path().join("go.mod"), "").unwrap();

    let mut config = stub_config(&[]);
    config.features.integration = false;
    config.features.performance = false;
    let batch = BatchRunner::new(Pipeline::for_config(Arc::new(config)))
        .with_workers(2)
        .run(
            &[good.path().to_path_buf(), bad.path().to_path_buf()],
            &CancelSignal::new(),
        )
        .await;

    assert_eq!(batch.summary.total, 2);
    assert_eq!(batch.summary.passed, 1);
    assert!(batch.server_results[good.path()].success);
    assert!(!batch.server_results[bad.path()].success);
    assert_eq!(batch.summary.failure_signatures.len(), 1);
    assert!(batch.summary.stage_success_rates.contains_key("validation"));
}
