//! Scenario definitions for the integration and performance testers.
//!
//! Scenarios are part of the configuration file. When none are configured
//! the built-in sets returned by [`default_scenarios`] and
//! [`default_load_scenarios`] are used.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// An ordered, dependent sequence of calls simulating one client workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    /// Unique scenario name.
    pub name: String,
    /// Free-form description shown in reports.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Steps, executed in order.
    pub steps: Vec<ScenarioStep>,
    /// Client profiles that replay this scenario.
    #[serde(default)]
    pub tags: Vec<String>,
}

/// One call inside a scenario.
///
/// String values in `params` may reference earlier step results with
/// `${step_name.json.path}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScenarioStep {
    /// Step name, used as the reference prefix for later steps.
    pub name: String,
    /// JSON-RPC method.
    pub method: String,
    /// Params template.
    #[serde(default = "empty_object")]
    pub params: Value,
    /// Expected response shape.
    #[serde(default)]
    pub expect: StepExpectation,
}

/// Expected shape of a step's response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepExpectation {
    /// Dotted JSON paths that must exist in the result.
    #[serde(default)]
    pub has_paths: Vec<String>,
    /// The step passes only if the server answers with a JSON-RPC error.
    #[serde(default)]
    pub expect_error: bool,
    /// Any response, result or error, is acceptable.
    #[serde(default)]
    pub allow_error: bool,
    /// Upper bound on the step's round-trip latency.
    #[serde(default)]
    pub max_latency_ms: Option<u64>,
}

/// A synthetic load pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoadScenario {
    /// Unique scenario name.
    pub name: String,
    /// Method every caller invokes.
    pub method: String,
    /// Params sent with every call.
    #[serde(default = "empty_object")]
    pub params: Value,
    /// Concurrent callers.
    #[serde(default = "default_callers")]
    pub callers: usize,
    /// Calls per caller; `0` means run until `duration_ms` elapses.
    #[serde(default = "default_iterations")]
    pub iterations: usize,
    /// Wall-clock bound in milliseconds; `0` means iterations only.
    #[serde(default)]
    pub duration_ms: u64,
}

fn empty_object() -> Value {
    json!({})
}

const fn default_callers() -> usize {
    1
}

const fn default_iterations() -> usize {
    50
}

/// Profile name for a desktop chat client.
pub const PROFILE_DESKTOP: &str = "claude-desktop";

/// Profile name for a minimal protocol-conformant client.
pub const PROFILE_GENERIC: &str = "generic";

/// The built-in integration scenarios.
#[must_use]
pub fn default_scenarios() -> Vec<Scenario> {
    vec![
        Scenario {
            name: "tool_discovery".to_string(),
            description: Some("List tools, then invoke the first one".to_string()),
            steps: vec![
                ScenarioStep {
                    name: "list".to_string(),
                    method: "tools/list".to_string(),
                    params: empty_object(),
                    expect: StepExpectation {
                        has_paths: vec!["tools".to_string()],
                        ..StepExpectation::default()
                    },
                },
                ScenarioStep {
                    name: "call".to_string(),
                    method: "tools/call".to_string(),
                    params: json!({ "name": "${list.tools.0.name}", "arguments": {} }),
                    expect: StepExpectation {
                        allow_error: true,
                        ..StepExpectation::default()
                    },
                },
            ],
            tags: vec![PROFILE_DESKTOP.to_string(), PROFILE_GENERIC.to_string()],
        },
        Scenario {
            name: "ping".to_string(),
            description: Some("Liveness check".to_string()),
            steps: vec![ScenarioStep {
                name: "ping".to_string(),
                method: "ping".to_string(),
                params: empty_object(),
                expect: StepExpectation::default(),
            }],
            tags: vec![PROFILE_DESKTOP.to_string(), PROFILE_GENERIC.to_string()],
        },
        Scenario {
            name: "error_handling".to_string(),
            description: Some("Unknown methods must produce a JSON-RPC error".to_string()),
            steps: vec![ScenarioStep {
                name: "unknown".to_string(),
                method: "validator/does-not-exist".to_string(),
                params: empty_object(),
                expect: StepExpectation {
                    expect_error: true,
                    ..StepExpectation::default()
                },
            }],
            tags: vec![PROFILE_GENERIC.to_string()],
        },
    ]
}

/// The built-in load scenarios.
#[must_use]
pub fn default_load_scenarios(max_concurrency: usize) -> Vec<LoadScenario> {
    vec![
        LoadScenario {
            name: "baseline".to_string(),
            method: "ping".to_string(),
            params: empty_object(),
            callers: 1,
            iterations: default_iterations(),
            duration_ms: 0,
        },
        LoadScenario {
            name: "concurrent".to_string(),
            method: "tools/list".to_string(),
            params: empty_object(),
            callers: max_concurrency.max(1),
            iterations: default_iterations(),
            duration_ms: 0,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_defaults() {
        let json = r#"{ "name": "s", "method": "ping" }"#;
        let step: ScenarioStep = serde_json::from_str(json).unwrap();
        assert_eq!(step.params, json!({}));
        assert!(!step.expect.expect_error);
        assert!(step.expect.has_paths.is_empty());
    }

    #[test]
    fn load_scenario_defaults() {
        let json = r#"{ "name": "l", "method": "ping" }"#;
        let scenario: LoadScenario = serde_json::from_str(json).unwrap();
        assert_eq!(scenario.callers, 1);
        assert_eq!(scenario.iterations, 50);
        assert_eq!(scenario.duration_ms, 0);
    }

    #[test]
    fn built_in_scenarios_are_tagged() {
        let scenarios = default_scenarios();
        assert!(scenarios
            .iter()
            .all(|s| s.tags.iter().any(|t| t == PROFILE_GENERIC)));
        assert!(scenarios
            .iter()
            .any(|s| s.tags.iter().any(|t| t == PROFILE_DESKTOP)));
    }

    #[test]
    fn concurrent_load_scenario_uses_limit() {
        let scenarios = default_load_scenarios(8);
        assert_eq!(scenarios[1].callers, 8);
        assert_eq!(default_load_scenarios(0)[1].callers, 1);
    }
}
