//! MCP protocol compliance.
//!
//! ```text
//! Uninitialized ─▶ Handshaking ─┬─▶ MethodTesting ─▶ CapabilityTesting ─▶ Done
//!                               └─▶ Failed
//! ```
//!
//! A failed handshake (no answer, error answer or unsupported version) is
//! fatal: every required method and capability is recorded as skipped.

use std::time::Instant;

use indexmap::IndexMap;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::{error_payload, json_path};
use crate::cancel::CancelSignal;
use crate::config::{CapabilityPolicy, ProtocolConfig};
use crate::mcp::{Handshake, ServerSession};
use crate::results::{CapabilityTest, MethodTest, ProtocolState, ProtocolTestResult};

/// Method used to exercise a capability, if one is known.
#[must_use]
pub fn probe_method(capability: &str) -> Option<&'static str> {
    match capability {
        "tools" => Some("tools/list"),
        "resources" => Some("resources/list"),
        "prompts" => Some("prompts/list"),
        "logging" => Some("logging/setLevel"),
        _ => None,
    }
}

/// Checks that a result has the shape MCP prescribes for `method`.
///
/// # Errors
///
/// Returns a description of the first violation.
pub fn check_result_schema(method: &str, result: &Value) -> Result<(), String> {
    let list = |key: &str, required: &[&str]| -> Result<(), String> {
        let items = json_path(result, key)
            .and_then(Value::as_array)
            .ok_or_else(|| format!("result has no '{key}' array"))?;
        for (idx, item) in items.iter().enumerate() {
            for field in required {
                if item.get(*field).is_none() {
                    return Err(format!("{key}[{idx}] is missing '{field}'"));
                }
            }
        }
        Ok(())
    };

    match method {
        "tools/list" => list("tools", &["name", "inputSchema"]),
        "resources/list" => list("resources", &["uri"]),
        "prompts/list" => list("prompts", &["name"]),
        "tools/call" => list("content", &[]),
        "ping" | "logging/setLevel" => {
            if result.is_object() {
                Ok(())
            } else {
                Err("result must be an object".to_string())
            }
        }
        _ if result.is_null() => Err("result is null".to_string()),
        _ => Ok(()),
    }
}

/// Runs the protocol checks against a session.
pub async fn run(session: &ServerSession, cancel: &CancelSignal) -> ProtocolTestResult {
    let started = Instant::now();
    let protocol = &session.config().protocol;
    info!(server = %session.client().label(), "Protocol testing started");

    let handshake = session.handshake(cancel).await;
    let handshake_test = handshake_test(protocol, handshake);
    let negotiated_version = handshake.protocol_version.clone();
    let server_info = handshake.server_info().cloned();

    if !handshake.is_ready() {
        let reason = handshake_test
            .error
            .clone()
            .unwrap_or_else(|| "handshake failed".to_string());
        warn!(server = %session.client().label(), %reason, "Protocol testing aborted");
        return ProtocolTestResult {
            success: false,
            state: ProtocolState::Failed,
            handshake: handshake_test,
            negotiated_version,
            server_info,
            method_tests: skipped_methods(protocol, &reason),
            capability_tests: skipped_capabilities(protocol, &reason),
            errors: vec![reason],
            warnings: Vec::new(),
            duration: started.elapsed(),
        };
    }

    let mut method_tests = IndexMap::new();
    for method in &protocol.required_methods {
        let test = if cancel.is_cancelled() {
            MethodTest::skipped(method, "cancelled")
        } else {
            method_test(session, method, protocol.params_for(method), cancel).await
        };
        method_tests.insert(method.clone(), test);
    }

    let mut warnings = Vec::new();
    let mut capability_tests = IndexMap::new();
    for (capability, required) in capabilities(protocol) {
        let test = if cancel.is_cancelled() {
            CapabilityTest {
                capability: capability.to_string(),
                required,
                supported: handshake.advertises(capability),
                success: false,
                skipped: true,
                probe_method: probe_method(capability).map(String::from),
                error: Some("cancelled".to_string()),
            }
        } else {
            capability_test(session, handshake, capability, required, cancel, &mut warnings).await
        };
        capability_tests.insert(capability.to_string(), test);
    }

    let success = method_tests.values().all(|t| t.success)
        && capability_tests.values().all(|t| t.success || t.skipped);
    let result = ProtocolTestResult {
        success,
        state: ProtocolState::Done,
        handshake: handshake_test,
        negotiated_version,
        server_info,
        method_tests,
        capability_tests,
        errors: Vec::new(),
        warnings,
        duration: started.elapsed(),
    };
    info!(
        server = %session.client().label(),
        success = result.success,
        elapsed_ms = result.duration.as_millis(),
        "Protocol testing finished"
    );
    result
}

fn handshake_test(protocol: &ProtocolConfig, handshake: &Handshake) -> MethodTest {
    let error = if handshake.is_ready() {
        None
    } else {
        Some(handshake.error.clone().unwrap_or_else(|| {
            format!(
                "server answered with unsupported protocol version '{}'",
                handshake.protocol_version.as_deref().unwrap_or("<none>")
            )
        }))
    };
    MethodTest {
        method: protocol.handshake_method.clone(),
        success: error.is_none(),
        skipped: false,
        latency: handshake.latency,
        request: handshake.request.clone(),
        response: handshake.response.clone(),
        error,
    }
}

/// Required capabilities first, then optional ones not already listed.
fn capabilities(protocol: &ProtocolConfig) -> Vec<(&str, bool)> {
    let mut all: Vec<(&str, bool)> = protocol
        .required_capabilities
        .iter()
        .map(|c| (c.as_str(), true))
        .collect();
    for optional in &protocol.optional_capabilities {
        if !all.iter().any(|(c, _)| *c == optional.as_str()) {
            all.push((optional.as_str(), false));
        }
    }
    all
}

fn skipped_methods(protocol: &ProtocolConfig, reason: &str) -> IndexMap<String, MethodTest> {
    protocol
        .required_methods
        .iter()
        .map(|m| (m.clone(), MethodTest::skipped(m, reason)))
        .collect()
}

fn skipped_capabilities(
    protocol: &ProtocolConfig,
    reason: &str,
) -> IndexMap<String, CapabilityTest> {
    capabilities(protocol)
        .into_iter()
        .map(|(capability, required)| {
            (
                capability.to_string(),
                CapabilityTest {
                    capability: capability.to_string(),
                    required,
                    supported: false,
                    success: false,
                    skipped: true,
                    probe_method: probe_method(capability).map(String::from),
                    error: Some(reason.to_string()),
                },
            )
        })
        .collect()
}

async fn method_test(
    session: &ServerSession,
    method: &str,
    params: Value,
    cancel: &CancelSignal,
) -> MethodTest {
    let started = Instant::now();
    let outcome = session.call(method, params.clone(), cancel).await;
    let latency = started.elapsed();

    let (success, response, error) = match outcome {
        Ok(result) => match check_result_schema(method, &result) {
            Ok(()) => (true, Some(result), None),
            Err(violation) => (
                false,
                Some(result),
                Some(format!("non-conformant result: {violation}")),
            ),
        },
        Err(e) => (false, error_payload(&e), Some(e.to_string())),
    };

    debug!(method, success, latency_ms = latency.as_millis(), "Method tested");
    MethodTest {
        method: method.to_string(),
        success,
        skipped: false,
        latency,
        request: params,
        response,
        error,
    }
}

async fn capability_test(
    session: &ServerSession,
    handshake: &Handshake,
    capability: &str,
    required: bool,
    cancel: &CancelSignal,
    warnings: &mut Vec<String>,
) -> CapabilityTest {
    let supported = handshake.advertises(capability);
    let probe = probe_method(capability);
    let mut test = CapabilityTest {
        capability: capability.to_string(),
        required,
        supported,
        success: false,
        skipped: false,
        probe_method: probe.map(String::from),
        error: None,
    };

    if !supported {
        let message = format!("capability '{capability}' is not advertised");
        if !required {
            test.skipped = true;
            test.error = Some(message);
        } else {
            match session.config().protocol.capability_policy {
                CapabilityPolicy::Fail => test.error = Some(message),
                CapabilityPolicy::Warn => {
                    warnings.push(format!("required {message}"));
                    test.skipped = true;
                    test.error = Some(message);
                }
            }
        }
        return test;
    }

    let Some(method) = probe else {
        test.success = true;
        return test;
    };

    let params = probe_params(&session.config().protocol, method);
    match session.call(method, params, cancel).await {
        Ok(result) => match check_result_schema(method, &result) {
            Ok(()) => test.success = true,
            Err(violation) => {
                test.error = Some(format!("{method} returned a non-conformant result: {violation}"));
            }
        },
        Err(e) => test.error = Some(format!("{method} failed: {e}")),
    }
    test
}

fn probe_params(protocol: &ProtocolConfig, method: &str) -> Value {
    if protocol.method_params.contains_key(method) {
        return protocol.params_for(method);
    }
    match method {
        "logging/setLevel" => json!({ "level": "info" }),
        _ => json!({}),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tools_list_requires_input_schema() {
        let ok = json!({ "tools": [ { "name": "echo", "inputSchema": { "type": "object" } } ] });
        assert!(check_result_schema("tools/list", &ok).is_ok());

        let missing = json!({ "tools": [ { "name": "echo" } ] });
        assert_eq!(
            check_result_schema("tools/list", &missing),
            Err("tools[0] is missing 'inputSchema'".to_string())
        );

        assert!(check_result_schema("tools/list", &json!({})).is_err());
    }

    #[test]
    fn ping_and_unknown_methods() {
        assert!(check_result_schema("ping", &json!({})).is_ok());
        assert!(check_result_schema("ping", &json!("pong")).is_err());
        assert!(check_result_schema("custom/thing", &json!(42)).is_ok());
        assert!(check_result_schema("custom/thing", &Value::Null).is_err());
    }

    #[test]
    fn capability_order_dedupes_optional() {
        let protocol = ProtocolConfig {
            required_capabilities: vec!["tools".to_string()],
            optional_capabilities: vec!["tools".to_string(), "prompts".to_string()],
            ..ProtocolConfig::default()
        };
        assert_eq!(
            capabilities(&protocol),
            vec![("tools", true), ("prompts", false)]
        );
    }

    #[test]
    fn known_probes() {
        assert_eq!(probe_method("resources"), Some("resources/list"));
        assert_eq!(probe_method("sampling"), None);
    }
}
