//! Minimal MCP server speaking newline-delimited JSON-RPC on stdio.
//!
//! Used by the end-to-end tests as a real subprocess. Behaviour is selected
//! with environment variables:
//!
//! | Variable              | Effect                                              |
//! |-----------------------|-----------------------------------------------------|
//! | `STUB_OMIT_METHODS`   | comma-separated methods answered with -32601        |
//! | `STUB_CAPABILITIES`   | comma-separated capabilities to advertise (`tools`) |
//! | `STUB_VERSION`        | protocol version to answer with                     |
//! | `STUB_DELAY_MS`       | delay before every response                         |
//! | `STUB_EXIT_AFTER`     | exit after answering this many requests             |
//! | `STUB_NOISE`          | write a non-JSON line to stdout before answering    |

use std::collections::HashSet;
use std::env;
use std::time::Duration;

use mcp_server_validator::mcp::protocol::{ErrorCode, JsonRpcErrorData};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

struct Behaviour {
    omit: HashSet<String>,
    capabilities: Vec<String>,
    version: Option<String>,
    delay: Duration,
    exit_after: Option<usize>,
    noise: bool,
}

impl Behaviour {
    fn from_env() -> Self {
        let list = |name: &str| -> Vec<String> {
            env::var(name)
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default()
        };
        let capabilities = list("STUB_CAPABILITIES");
        Self {
            omit: list("STUB_OMIT_METHODS").into_iter().collect(),
            capabilities: if capabilities.is_empty() {
                vec!["tools".to_string()]
            } else {
                capabilities
            },
            version: env::var("STUB_VERSION").ok(),
            delay: Duration::from_millis(
                env::var("STUB_DELAY_MS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0),
            ),
            exit_after: env::var("STUB_EXIT_AFTER").ok().and_then(|v| v.parse().ok()),
            noise: env::var("STUB_NOISE").is_ok(),
        }
    }

    fn answer(&self, method: &str, params: &Value) -> Result<Value, JsonRpcErrorData> {
        if self.omit.contains(method) {
            return Err(not_found(method));
        }
        match method {
            "initialize" => {
                let requested = params
                    .get("protocolVersion")
                    .and_then(Value::as_str)
                    .unwrap_or("2024-11-05");
                let capabilities: serde_json::Map<String, Value> = self
                    .capabilities
                    .iter()
                    .map(|c| (c.clone(), json!({})))
                    .collect();
                Ok(json!({
                    "protocolVersion": self.version.as_deref().unwrap_or(requested),
                    "capabilities": capabilities,
                    "serverInfo": { "name": "stub-mcp-server", "version": env!("CARGO_PKG_VERSION") },
                }))
            }
            "ping" | "logging/setLevel" => Ok(json!({})),
            "tools/list" => Ok(json!({
                "tools": [{
                    "name": "echo",
                    "description": "Echoes its text argument",
                    "inputSchema": {
                        "type": "object",
                        "properties": { "text": { "type": "string" } },
                    },
                }],
            })),
            "tools/call" => match params.get("name").and_then(Value::as_str) {
                Some("echo") => {
                    let text = params
                        .pointer("/arguments/text")
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    Ok(json!({ "content": [{ "type": "text", "text": text }] }))
                }
                other => Err(JsonRpcErrorData::with_message(
                    ErrorCode::InvalidParams,
                    format!("Unknown tool: {}", other.unwrap_or("<none>")),
                )),
            },
            "resources/list" => Ok(json!({ "resources": [] })),
            "prompts/list" => Ok(json!({ "prompts": [] })),
            _ => Err(not_found(method)),
        }
    }
}

fn not_found(method: &str) -> JsonRpcErrorData {
    JsonRpcErrorData::with_message(ErrorCode::MethodNotFound, format!("Method not found: {method}"))
}

fn response(id: Value, outcome: Result<Value, JsonRpcErrorData>) -> Value {
    match outcome {
        Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
        Err(error) => json!({ "jsonrpc": "2.0", "id": id, "error": error }),
    }
}

#[tokio::main]
async fn main() {
    let behaviour = std::sync::Arc::new(Behaviour::from_env());
    eprintln!("stub-mcp-server ready");

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = rx.recv().await {
            if stdout.write_all(line.as_bytes()).await.is_err()
                || stdout.write_all(b"\n").await.is_err()
                || stdout.flush().await.is_err()
            {
                break;
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut answered = 0usize;
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        let Ok(message) = serde_json::from_str::<Value>(&line) else {
            let parse_error = JsonRpcErrorData::with_message(ErrorCode::ParseError, "Parse error");
            let _ = tx.send(response(Value::Null, Err(parse_error)).to_string());
            continue;
        };
        let (Some(id), Some(method)) = (message.get("id").cloned(), message.get("method").and_then(Value::as_str)) else {
            // Notifications need no answer.
            continue;
        };
        let params = message.get("params").cloned().unwrap_or(Value::Null);
        let outcome = behaviour.answer(method, &params);
        if behaviour.noise {
            let _ = tx.send("stub: not json".to_string());
        }

        let tx = tx.clone();
        let delay = behaviour.delay;
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let _ = tx.send(response(id, outcome).to_string());
        });

        answered += 1;
        if behaviour.exit_after.is_some_and(|n| answered >= n) {
            eprintln!("stub-mcp-server exiting after {answered} requests");
            tokio::time::sleep(delay + Duration::from_millis(50)).await;
            std::process::exit(0);
        }
    }
    drop(tx);
    let _ = writer.await;
}
