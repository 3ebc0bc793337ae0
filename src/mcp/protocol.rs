//! JSON-RPC 2.0 message types for the MCP protocol.
//!
//! This module defines the message types exchanged with the server under
//! test. All messages follow the JSON-RPC 2.0 specification with
//! MCP-specific extensions.
//!
//! # Message Types
//!
//! - **Request**: A message expecting a response (has `id`)
//! - **Response**: A reply to a request (success or error)
//! - **Notification**: A one-way message (no `id`, no response expected)
//!
//! # MCP-Specific Constraints
//!
//! - Request IDs must be strings or integers (never `null`)
//! - Request IDs must be unique within a session

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// The MCP protocol version offered by default.
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

/// Method of the notification that completes the handshake.
pub const INITIALIZED_NOTIFICATION: &str = "notifications/initialized";

/// A JSON-RPC 2.0 request ID.
///
/// Per the MCP specification, IDs must be strings or integers, never `null`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Numeric request ID.
    Number(i64),
    /// String request ID.
    String(String),
}

impl RequestId {
    /// The numeric value of this id, if it is a non-negative integer.
    ///
    /// The client only ever issues numeric ids, so string ids in responses
    /// cannot belong to one of its calls.
    #[must_use]
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Number(n) => u64::try_from(*n).ok(),
            Self::String(_) => None,
        }
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s}"),
        }
    }
}

/// A JSON-RPC 2.0 request message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// Must be "2.0".
    pub jsonrpc: String,

    /// Unique request identifier.
    pub id: RequestId,

    /// The method to invoke.
    pub method: String,

    /// Optional parameters for the method.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Creates a request with a numeric id.
    #[must_use]
    pub fn new(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: RequestId::Number(i64::try_from(id).unwrap_or(i64::MAX)),
            method: method.into(),
            params,
        }
    }
}

/// A JSON-RPC 2.0 notification message.
///
/// Notifications do not have an ID and do not expect a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    /// Must be "2.0".
    pub jsonrpc: String,

    /// The notification method.
    pub method: String,

    /// Optional parameters for the notification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    /// Creates a new notification.
    #[must_use]
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.into(),
            params,
        }
    }
}

/// Standard JSON-RPC 2.0 error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Invalid JSON was received by the server.
    ParseError,
    /// The JSON sent is not a valid Request object.
    InvalidRequest,
    /// The method does not exist or is not available.
    MethodNotFound,
    /// Invalid method parameters.
    InvalidParams,
    /// Internal JSON-RPC error.
    InternalError,
    /// Server-defined error.
    ServerError(i32),
}

impl ErrorCode {
    /// Returns the numeric code for this error.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::ParseError => -32700,
            Self::InvalidRequest => -32600,
            Self::MethodNotFound => -32601,
            Self::InvalidParams => -32602,
            Self::InternalError => -32603,
            Self::ServerError(code) => code,
        }
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcErrorData {
    /// The error code.
    pub code: i32,

    /// A short description of the error.
    pub message: String,

    /// Additional information about the error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcErrorData {
    /// Creates a new error with a custom message.
    #[must_use]
    pub fn with_message(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.code(),
            message: message.into(),
            data: None,
        }
    }
}

/// A JSON-RPC 2.0 response, either carrying a result or an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// Always "2.0".
    pub jsonrpc: String,

    /// The request ID this response corresponds to (absent for parse errors).
    pub id: Option<RequestId>,

    /// The result of the method call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// The error details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcErrorData>,
}

impl JsonRpcResponse {
    /// Creates a new success response.
    #[must_use]
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(id),
            result: Some(result),
            error: None,
        }
    }

    /// Creates a new error response.
    #[must_use]
    pub fn failure(id: Option<RequestId>, error: JsonRpcErrorData) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// A frame read from the server's stdout.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// A reply to one of our requests.
    Response(JsonRpcResponse),
    /// A server-initiated request.
    Request(JsonRpcRequest),
    /// A server-initiated notification.
    Notification(JsonRpcNotification),
}

/// Reasons a line could not be parsed as a JSON-RPC frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// The line is not JSON.
    #[error("frame is not valid JSON")]
    NotJson,
    /// The JSON is not an object.
    #[error("frame is not a JSON object")]
    NotObject,
    /// `jsonrpc` is missing or not "2.0".
    #[error("frame does not declare jsonrpc \"2.0\"")]
    BadVersion,
    /// The object has the wrong shape.
    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// Parses one line of server output into a frame.
///
/// A response must carry exactly one of `result` and `error`; a literal
/// `"result": null` counts as a result.
///
/// # Errors
///
/// Returns a [`FrameError`] if the line is not a JSON-RPC 2.0 message.
pub fn parse_frame(line: &str) -> Result<Frame, FrameError> {
    let value: Value = serde_json::from_str(line).map_err(|_| FrameError::NotJson)?;
    let Value::Object(obj) = value else {
        return Err(FrameError::NotObject);
    };

    if obj.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
        return Err(FrameError::BadVersion);
    }

    if obj.contains_key("method") {
        return parse_incoming_call(obj);
    }

    let has_result = obj.contains_key("result");
    let has_error = obj.contains_key("error");
    if has_result == has_error {
        return Err(FrameError::Malformed(
            "response must carry exactly one of result and error".to_string(),
        ));
    }

    let id = match obj.get("id") {
        None | Some(Value::Null) => None,
        Some(raw) => Some(
            serde_json::from_value::<RequestId>(raw.clone())
                .map_err(|_| FrameError::Malformed(format!("invalid id: {raw}")))?,
        ),
    };

    let error = obj
        .get("error")
        .map(|raw| {
            serde_json::from_value::<JsonRpcErrorData>(raw.clone())
                .map_err(|e| FrameError::Malformed(format!("invalid error object: {e}")))
        })
        .transpose()?;

    Ok(Frame::Response(JsonRpcResponse {
        jsonrpc: "2.0".to_string(),
        id,
        result: obj.get("result").cloned(),
        error,
    }))
}

fn parse_incoming_call(obj: Map<String, Value>) -> Result<Frame, FrameError> {
    let is_request = obj.contains_key("id");
    let value = Value::Object(obj);
    if is_request {
        serde_json::from_value(value)
            .map(Frame::Request)
            .map_err(|e| FrameError::Malformed(e.to_string()))
    } else {
        serde_json::from_value(value)
            .map(Frame::Notification)
            .map_err(|e| FrameError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_success_response() {
        let json = r#"{"jsonrpc": "2.0", "id": 1, "result": {"tools": []}}"#;
        let Frame::Response(resp) = parse_frame(json).unwrap() else {
            panic!("Expected Response");
        };
        assert_eq!(resp.id, Some(RequestId::Number(1)));
        assert_eq!(resp.result, Some(serde_json::json!({"tools": []})));
        assert!(resp.error.is_none());
    }

    #[test]
    fn parse_null_result_is_a_result() {
        let json = r#"{"jsonrpc": "2.0", "id": 7, "result": null}"#;
        let Frame::Response(resp) = parse_frame(json).unwrap() else {
            panic!("Expected Response");
        };
        assert_eq!(resp.result, Some(Value::Null));
    }

    #[test]
    fn parse_error_response() {
        let json =
            r#"{"jsonrpc": "2.0", "id": 2, "error": {"code": -32601, "message": "Method not found"}}"#;
        let Frame::Response(resp) = parse_frame(json).unwrap() else {
            panic!("Expected Response");
        };
        let error = resp.error.unwrap();
        assert_eq!(error.code, ErrorCode::MethodNotFound.code());
    }

    #[test]
    fn parse_server_notification() {
        let json = r#"{"jsonrpc": "2.0", "method": "notifications/message", "params": {}}"#;
        assert!(matches!(parse_frame(json), Ok(Frame::Notification(_))));
    }

    #[test]
    fn parse_server_request() {
        let json = r#"{"jsonrpc": "2.0", "id": "srv-1", "method": "roots/list"}"#;
        let Frame::Request(req) = parse_frame(json).unwrap() else {
            panic!("Expected Request");
        };
        assert_eq!(req.id, RequestId::String("srv-1".to_string()));
        assert_eq!(req.id.as_u64(), None);
    }

    #[test]
    fn reject_invalid_frames() {
        assert_eq!(parse_frame("not json"), Err(FrameError::NotJson));
        assert_eq!(parse_frame("[1, 2]"), Err(FrameError::NotObject));
        assert_eq!(
            parse_frame(r#"{"id": 1, "result": {}}"#),
            Err(FrameError::BadVersion)
        );
        assert!(matches!(
            parse_frame(r#"{"jsonrpc": "2.0", "id": 1}"#),
            Err(FrameError::Malformed(_))
        ));
    }

    #[test]
    fn serialise_request() {
        let request = JsonRpcRequest::new(42, "tools/call", Some(serde_json::json!({"a": 1})));
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains(r#""jsonrpc":"2.0""#));
        assert!(json.contains(r#""id":42"#));
        assert!(json.contains(r#""method":"tools/call""#));
    }

    #[test]
    fn serialise_request_without_params() {
        let request = JsonRpcRequest::new(1, "ping", None);
        let json = serde_json::to_string(&request).unwrap();
        assert!(!json.contains("params"));
    }

    #[test]
    fn request_id_display() {
        assert_eq!(format!("{}", RequestId::Number(42)), "42");
        assert_eq!(format!("{}", RequestId::String("abc".to_string())), "abc");
        assert_eq!(RequestId::Number(-1).as_u64(), None);
    }
}
