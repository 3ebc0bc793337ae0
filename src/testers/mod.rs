//! Dynamic testers.
//!
//! Each tester drives the shared [`ServerSession`](crate::mcp::ServerSession)
//! and returns an immutable result:
//!
//! - [`protocol`]: handshake, required methods and capabilities
//! - [`integration`]: scripted multi-step client scenarios
//! - [`performance`]: load, latency, memory and throughput

pub mod integration;
pub mod performance;
pub mod protocol;

use serde_json::Value;

use crate::mcp::McpError;

/// Looks up a dotted path (`tools.0.name`) in a JSON value.
///
/// Numeric segments index arrays; an empty path returns `value` itself.
#[must_use]
pub fn json_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// JSON representation of an error response, for recording in results.
#[must_use]
pub fn error_payload(error: &McpError) -> Option<Value> {
    match error {
        McpError::Server {
            code,
            message,
            data,
        } => {
            let mut payload = serde_json::json!({ "code": code, "message": message });
            if let Some(data) = data {
                payload["data"] = data.clone();
            }
            Some(payload)
        }
        _ => None,
    }
}
