//! Scripted multi-step client scenarios.
//!
//! A scenario is an ordered list of calls. Later steps may use values from
//! earlier results through `${step.json.path}` placeholders:
//!
//! - a string that is exactly one placeholder becomes the referenced JSON
//!   value (objects and numbers keep their type)
//! - placeholders embedded in a longer string are interpolated as text
//!
//! The first failing step aborts its scenario; the next scenario still runs.

use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use regex::{Captures, Regex};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::{error_payload, json_path};
use crate::cancel::CancelSignal;
use crate::config::{default_scenarios, Scenario, ScenarioStep, TestConfig};
use crate::mcp::{McpError, ServerSession};
use crate::results::{IntegrationTestResult, ScenarioTestResult, StepResult};

fn placeholder_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{([A-Za-z0-9_\-]+(?:\.[A-Za-z0-9_\-]+)*)\}").ok())
        .as_ref()
}

/// Scenarios to run: the configured ones, else the built-in set.
#[must_use]
pub fn scenarios_for(config: &TestConfig) -> Vec<Scenario> {
    if config.integration.scenarios.is_empty() {
        default_scenarios()
    } else {
        config.integration.scenarios.clone()
    }
}

/// Client profiles to evaluate: the configured ones, else every tag in
/// order of first appearance.
#[must_use]
pub fn profiles_for(config: &TestConfig, scenarios: &[Scenario]) -> Vec<String> {
    if !config.integration.client_profiles.is_empty() {
        return config.integration.client_profiles.clone();
    }
    let mut profiles: Vec<String> = Vec::new();
    for tag in scenarios.iter().flat_map(|s| &s.tags) {
        if !profiles.contains(tag) {
            profiles.push(tag.clone());
        }
    }
    profiles
}

/// Runs every scenario against a session.
pub async fn run(session: &ServerSession, cancel: &CancelSignal) -> IntegrationTestResult {
    let started = Instant::now();
    let config = session.config();
    let scenarios = scenarios_for(config);
    info!(server = %session.client().label(), scenarios = scenarios.len(), "Integration testing started");

    let mut results = IndexMap::new();
    match session.ready(cancel).await {
        Ok(_) => {
            for scenario in &scenarios {
                let result = run_scenario(session, scenario, cancel).await;
                results.insert(scenario.name.clone(), result);
            }
        }
        Err(e) => {
            warn!(server = %session.client().label(), error = %e, "Integration testing without a usable session");
            for scenario in &scenarios {
                results.insert(
                    scenario.name.clone(),
                    not_run(scenario, &format!("session not ready: {e}")),
                );
            }
        }
    }

    let client_compatibility = profiles_for(config, &scenarios)
        .into_iter()
        .map(|profile| {
            let compatible = is_compatible(&profile, &scenarios, &results);
            (profile, compatible)
        })
        .collect();

    let result = IntegrationTestResult {
        success: results.values().all(|r| r.success),
        scenarios: results,
        client_compatibility,
        duration: started.elapsed(),
    };
    info!(
        server = %session.client().label(),
        success = result.success,
        elapsed_ms = result.duration.as_millis(),
        "Integration testing finished"
    );
    result
}

/// A profile is compatible when it has at least one tagged scenario and all
/// of them succeeded.
///
/// Profiles are judged from the scenario results already recorded in this
/// run. No scenario is replayed per profile, so a scenario tagged with two
/// profiles counts once for both.
fn is_compatible(
    profile: &str,
    scenarios: &[Scenario],
    results: &IndexMap<String, ScenarioTestResult>,
) -> bool {
    let mut tagged = scenarios
        .iter()
        .filter(|s| s.tags.iter().any(|t| t == profile))
        .peekable();
    if tagged.peek().is_none() {
        return false;
    }
    tagged.all(|s| results.get(&s.name).is_some_and(|r| r.success))
}

fn not_run(scenario: &Scenario, reason: &str) -> ScenarioTestResult {
    ScenarioTestResult {
        scenario: scenario.name.clone(),
        success: false,
        steps: Vec::new(),
        skipped_steps: scenario.steps.iter().map(|s| s.name.clone()).collect(),
        error: Some(reason.to_string()),
        duration: Duration::ZERO,
    }
}

async fn run_scenario(
    session: &ServerSession,
    scenario: &Scenario,
    cancel: &CancelSignal,
) -> ScenarioTestResult {
    let started = Instant::now();
    let mut outputs: HashMap<String, Value> = HashMap::new();
    let mut steps = Vec::new();
    let mut failure = None;

    for (idx, step) in scenario.steps.iter().enumerate() {
        if cancel.is_cancelled() {
            failure = Some((idx, "cancelled".to_string()));
            break;
        }
        let result = run_step(session, step, &outputs, cancel).await;
        let succeeded = result.success;
        if let Some(response) = &result.response {
            outputs.insert(step.name.clone(), response.clone());
        }
        let error = result.error.clone();
        steps.push(result);
        if !succeeded {
            failure = Some((
                idx + 1,
                format!(
                    "step '{}' failed: {}",
                    step.name,
                    error.unwrap_or_else(|| "unknown".to_string())
                ),
            ));
            break;
        }
    }

    let (skipped_steps, error) = match failure {
        Some((next, message)) => (
            scenario.steps[next..]
                .iter()
                .map(|s| s.name.clone())
                .collect(),
            Some(message),
        ),
        None => (Vec::new(), None),
    };

    debug!(scenario = %scenario.name, success = error.is_none(), "Scenario finished");
    ScenarioTestResult {
        scenario: scenario.name.clone(),
        success: error.is_none(),
        steps,
        skipped_steps,
        error,
        duration: started.elapsed(),
    }
}

async fn run_step(
    session: &ServerSession,
    step: &ScenarioStep,
    outputs: &HashMap<String, Value>,
    cancel: &CancelSignal,
) -> StepResult {
    let mut result = StepResult {
        step: step.name.clone(),
        method: step.method.clone(),
        success: false,
        latency: Duration::ZERO,
        request: step.params.clone(),
        response: None,
        error: None,
    };

    let params = match substitute(&step.params, outputs) {
        Ok(params) => params,
        Err(e) => {
            result.error = Some(e);
            return result;
        }
    };
    result.request = params.clone();

    let started = Instant::now();
    let outcome = session.call(&step.method, params, cancel).await;
    result.latency = started.elapsed();

    let expect = &step.expect;
    let verdict = match outcome {
        Ok(response) => {
            let verdict = if expect.expect_error {
                Err("expected an error response, got a result".to_string())
            } else {
                expect
                    .has_paths
                    .iter()
                    .find(|path| json_path(&response, path).is_none())
                    .map_or(Ok(()), |path| Err(format!("result has no '{path}'")))
            };
            result.response = Some(response);
            verdict
        }
        Err(e @ McpError::Server { .. }) => {
            result.response = error_payload(&e);
            if expect.expect_error || expect.allow_error {
                Ok(())
            } else {
                Err(e.to_string())
            }
        }
        Err(e) => Err(e.to_string()),
    };

    let verdict = verdict.and_then(|()| match expect.max_latency_ms {
        Some(limit) if result.latency > Duration::from_millis(limit) => Err(format!(
            "latency {}ms exceeds {limit}ms",
            result.latency.as_millis()
        )),
        _ => Ok(()),
    });

    match verdict {
        Ok(()) => result.success = true,
        Err(e) => result.error = Some(e),
    }
    result
}

/// Replaces placeholders in every string of `template`.
///
/// # Errors
///
/// Returns a message naming the first placeholder that cannot be resolved.
pub fn substitute(template: &Value, outputs: &HashMap<String, Value>) -> Result<Value, String> {
    match template {
        Value::String(s) => substitute_str(s, outputs),
        Value::Array(items) => items
            .iter()
            .map(|item| substitute(item, outputs))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| substitute(v, outputs).map(|v| (k.clone(), v)))
            .collect::<Result<serde_json::Map<_, _>, _>>()
            .map(Value::Object),
        other => Ok(other.clone()),
    }
}

fn resolve<'a>(reference: &str, outputs: &'a HashMap<String, Value>) -> Option<&'a Value> {
    let (step, path) = reference.split_once('.').unwrap_or((reference, ""));
    json_path(outputs.get(step)?, path)
}

fn substitute_str(s: &str, outputs: &HashMap<String, Value>) -> Result<Value, String> {
    let Some(re) = placeholder_regex() else {
        return Ok(Value::String(s.to_string()));
    };

    if let Some(caps) = re.captures(s) {
        if caps.get(0).is_some_and(|m| m.as_str() == s) {
            let reference = &caps[1];
            return resolve(reference, outputs)
                .cloned()
                .ok_or_else(|| format!("unresolved reference ${{{reference}}}"));
        }
    } else {
        return Ok(Value::String(s.to_string()));
    }

    let mut missing = None;
    let replaced = re.replace_all(s, |caps: &Captures<'_>| {
        match resolve(&caps[1], outputs) {
            Some(Value::String(text)) => text.clone(),
            Some(value) => value.to_string(),
            None => {
                missing.get_or_insert_with(|| caps[1].to_string());
                String::new()
            }
        }
    });
    match missing {
        Some(reference) => Err(format!("unresolved reference ${{{reference}}}")),
        None => Ok(Value::String(replaced.into_owned())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IntegrationConfig, PROFILE_DESKTOP, PROFILE_GENERIC};
    use serde_json::json;

    fn outputs() -> HashMap<String, Value> {
        let mut outputs = HashMap::new();
        outputs.insert(
            "list".to_string(),
            json!({ "tools": [ { "name": "echo", "inputSchema": { "type": "object" } } ] }),
        );
        outputs
    }

    #[test]
    fn whole_string_placeholder_keeps_json_type() {
        let template = json!({ "schema": "${list.tools.0.inputSchema}", "n": 1 });
        assert_eq!(
            substitute(&template, &outputs()).unwrap(),
            json!({ "schema": { "type": "object" }, "n": 1 })
        );
    }

    #[test]
    fn embedded_placeholders_are_interpolated() {
        let template = json!(["calling ${list.tools.0.name} now"]);
        assert_eq!(
            substitute(&template, &outputs()).unwrap(),
            json!(["calling echo now"])
        );
    }

    #[test]
    fn unresolved_reference_is_an_error() {
        let template = json!({ "name": "${list.tools.5.name}" });
        assert_eq!(
            substitute(&template, &outputs()),
            Err("unresolved reference ${list.tools.5.name}".to_string())
        );
    }

    #[test]
    fn profiles_default_to_tags() {
        let config = TestConfig::default();
        let scenarios = scenarios_for(&config);
        assert_eq!(
            profiles_for(&config, &scenarios),
            vec![PROFILE_DESKTOP.to_string(), PROFILE_GENERIC.to_string()]
        );

        let mut config = TestConfig::default();
        config.integration = IntegrationConfig {
            scenarios: Vec::new(),
            client_profiles: vec!["custom".to_string()],
        };
        assert_eq!(profiles_for(&config, &scenarios), vec!["custom".to_string()]);
    }

    #[test]
    fn profile_without_scenarios_is_incompatible() {
        let scenarios = default_scenarios();
        let results: IndexMap<String, ScenarioTestResult> = scenarios
            .iter()
            .map(|s| {
                (
                    s.name.clone(),
                    ScenarioTestResult {
                        scenario: s.name.clone(),
                        success: s.name != "error_handling",
                        steps: Vec::new(),
                        skipped_steps: Vec::new(),
                        error: None,
                        duration: Duration::ZERO,
                    },
                )
            })
            .collect();
        assert!(is_compatible(PROFILE_DESKTOP, &scenarios, &results));
        assert!(!is_compatible(PROFILE_GENERIC, &scenarios, &results));
        assert!(!is_compatible("custom", &scenarios, &results));
    }
}
