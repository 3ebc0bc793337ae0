//! One spawned server plus its completed handshake.
//!
//! The protocol, integration and performance testers of a run share a single
//! [`ServerSession`]. The handshake is performed at most once, lazily, by
//! whichever tester needs the server first; the others observe the stored
//! outcome.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Map, Value};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::client::ProtocolClient;
use super::error::{McpError, McpResult};
use super::protocol::INITIALIZED_NOTIFICATION;
use crate::cancel::CancelSignal;
use crate::config::TestConfig;
use crate::error::FailureType;
use crate::metrics::MetricsRegistry;

/// Outcome of the initialisation exchange.
#[derive(Debug, Clone)]
pub struct Handshake {
    /// Params sent with the handshake request.
    pub request: Value,
    /// The server's result, when it answered successfully.
    pub response: Option<Value>,
    /// Error text, when the exchange failed.
    pub error: Option<String>,
    /// Classified failure, when the exchange failed.
    pub failure_type: Option<FailureType>,
    /// Round-trip latency.
    pub latency: Duration,
    /// Version the server answered with.
    pub protocol_version: Option<String>,
    /// Whether that version is in the accepted list.
    pub version_accepted: bool,
}

impl Handshake {
    /// Returns `true` if the server answered and its version is acceptable.
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        self.response.is_some() && self.version_accepted
    }

    /// The `capabilities` object advertised by the server.
    #[must_use]
    pub fn capabilities(&self) -> Option<&Map<String, Value>> {
        self.response
            .as_ref()
            .and_then(|r| r.get("capabilities"))
            .and_then(Value::as_object)
    }

    /// Returns `true` if the server advertises `capability`.
    ///
    /// A capability counts as advertised when its key is present and not
    /// `false` or `null`.
    #[must_use]
    pub fn advertises(&self, capability: &str) -> bool {
        self.capabilities()
            .and_then(|caps| caps.get(capability))
            .is_some_and(|flag| !matches!(flag, Value::Null | Value::Bool(false)))
    }

    /// The `serverInfo` object, if present.
    #[must_use]
    pub fn server_info(&self) -> Option<&Value> {
        self.response.as_ref().and_then(|r| r.get("serverInfo"))
    }

    fn failed(request: Value, latency: Duration, error: &McpError) -> Self {
        Self {
            request,
            response: None,
            error: Some(error.to_string()),
            failure_type: Some(error.failure_type()),
            latency,
            protocol_version: None,
            version_accepted: false,
        }
    }
}

/// A running server shared by the dynamic testers of one run.
pub struct ServerSession {
    client: Arc<ProtocolClient>,
    config: Arc<TestConfig>,
    handshake: OnceCell<Handshake>,
}

impl ServerSession {
    /// Spawns the server in `server_path` with the configured launch command.
    ///
    /// # Errors
    ///
    /// Returns [`McpError::Spawn`] if the process cannot be started.
    pub fn start(
        config: Arc<TestConfig>,
        server_path: &Path,
        metrics: Arc<MetricsRegistry>,
    ) -> McpResult<Self> {
        let client = ProtocolClient::spawn(&config.server, server_path, metrics)?;
        Ok(Self::with_client(Arc::new(client), config))
    }

    /// Wraps an already connected client.
    #[must_use]
    pub fn with_client(client: Arc<ProtocolClient>, config: Arc<TestConfig>) -> Self {
        Self {
            client,
            config,
            handshake: OnceCell::new(),
        }
    }

    /// The underlying client.
    #[must_use]
    pub const fn client(&self) -> &Arc<ProtocolClient> {
        &self.client
    }

    /// The run configuration.
    #[must_use]
    pub const fn config(&self) -> &Arc<TestConfig> {
        &self.config
    }

    /// Performs the handshake on first use and returns its outcome.
    pub async fn handshake(&self, cancel: &CancelSignal) -> &Handshake {
        self.handshake
            .get_or_init(|| self.perform_handshake(cancel))
            .await
    }

    /// The handshake outcome, if it has been performed.
    #[must_use]
    pub fn completed_handshake(&self) -> Option<&Handshake> {
        self.handshake.get()
    }

    /// Returns the handshake if the session can be used for further calls.
    ///
    /// # Errors
    ///
    /// Returns [`McpError::NotInitialised`] if the handshake failed or the
    /// negotiated version is not accepted.
    pub async fn ready(&self, cancel: &CancelSignal) -> McpResult<&Handshake> {
        let handshake = self.handshake(cancel).await;
        if handshake.is_ready() {
            return Ok(handshake);
        }
        let reason = handshake.error.clone().unwrap_or_else(|| {
            format!(
                "unsupported protocol version '{}'",
                handshake.protocol_version.as_deref().unwrap_or("<none>")
            )
        });
        Err(McpError::NotInitialised { reason })
    }

    /// Issues a call bounded by the configured call timeout.
    ///
    /// # Errors
    ///
    /// See [`ProtocolClient::call`].
    pub async fn call(
        &self,
        method: &str,
        params: Value,
        cancel: &CancelSignal,
    ) -> McpResult<Value> {
        self.client
            .call_bounded(method, Some(params), self.config.timeouts.call(), cancel)
            .await
    }

    /// Terminates the server. Idempotent.
    pub async fn close(&self) {
        self.client.close().await;
    }

    async fn perform_handshake(&self, cancel: &CancelSignal) -> Handshake {
        let protocol = &self.config.protocol;
        let request = json!({
            "protocolVersion": protocol.protocol_version,
            "capabilities": {},
            "clientInfo": {
                "name": protocol.client_name,
                "version": env!("CARGO_PKG_VERSION"),
            },
        });

        debug!(server = %self.client.label(), method = %protocol.handshake_method, "Handshake started");
        let started = Instant::now();
        let outcome = self
            .client
            .call_bounded(
                &protocol.handshake_method,
                Some(request.clone()),
                self.config.timeouts.startup(),
                cancel,
            )
            .await;
        let latency = started.elapsed();

        let response = match outcome {
            Ok(response) => response,
            Err(e) => {
                warn!(server = %self.client.label(), error = %e, "Handshake failed");
                return Handshake::failed(request, latency, &e);
            }
        };

        let protocol_version = response
            .get("protocolVersion")
            .and_then(Value::as_str)
            .map(String::from);
        let version_accepted = protocol_version
            .as_deref()
            .is_some_and(|v| protocol.accepts_version(v));

        let mut error = None;
        if version_accepted {
            if let Err(e) = self.client.notify(INITIALIZED_NOTIFICATION, None).await {
                warn!(server = %self.client.label(), error = %e, "Failed to send initialized notification");
                error = Some(e.to_string());
            }
            info!(
                server = %self.client.label(),
                version = protocol_version.as_deref().unwrap_or_default(),
                latency_ms = latency.as_millis(),
                "Handshake complete"
            );
        } else {
            warn!(server = %self.client.label(), version = ?protocol_version, "Server negotiated an unsupported protocol version");
        }

        Handshake {
            request,
            response: error.is_none().then_some(response),
            failure_type: error.as_ref().map(|_| FailureType::Network),
            error,
            latency,
            protocol_version,
            version_accepted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::protocol::{JsonRpcRequest, JsonRpcResponse};
    use crate::mcp::transport::{FrameReader, FrameWriter};

    fn session() -> (
        ServerSession,
        FrameReader<tokio::io::ReadHalf<tokio::io::DuplexStream>>,
        FrameWriter<tokio::io::WriteHalf<tokio::io::DuplexStream>>,
    ) {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client_io);
        let (server_read, server_write) = tokio::io::split(server_io);
        let client = ProtocolClient::connect(
            "test",
            client_read,
            client_write,
            Arc::new(MetricsRegistry::new()),
        );
        (
            ServerSession::with_client(Arc::new(client), Arc::new(TestConfig::default())),
            FrameReader::new(server_read),
            FrameWriter::new(server_write),
        )
    }

    #[tokio::test]
    async fn handshake_runs_once_and_sends_initialized() {
        let (session, mut peer_in, mut peer_out) = session();
        let session = Arc::new(session);
        let cancel = CancelSignal::new();

        let first = {
            let session = Arc::clone(&session);
            let cancel = cancel.clone();
            tokio::spawn(async move { session.handshake(&cancel).await.is_ready() })
        };

        let line = peer_in.read_line().await.unwrap().unwrap();
        let request: JsonRpcRequest = serde_json::from_str(&line).unwrap();
        assert_eq!(request.method, "initialize");
        peer_out
            .write_message(&JsonRpcResponse::success(
                request.id,
                json!({
                    "protocolVersion": "2024-11-05",
                    "capabilities": { "tools": {}, "logging": false },
                    "serverInfo": { "name": "stub" }
                }),
            ))
            .await
            .unwrap();

        assert!(first.await.unwrap());
        let notification = peer_in.read_line().await.unwrap().unwrap();
        assert!(notification.contains(INITIALIZED_NOTIFICATION));

        let handshake = session.ready(&cancel).await.unwrap();
        assert!(handshake.advertises("tools"));
        assert!(!handshake.advertises("logging"));
        assert!(!handshake.advertises("prompts"));
    }

    #[tokio::test]
    async fn unsupported_version_is_not_ready() {
        let (session, mut peer_in, mut peer_out) = session();
        let session = Arc::new(session);
        let cancel = CancelSignal::new();

        let ready = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.ready(&cancel).await.map(|_| ()) })
        };
        let line = peer_in.read_line().await.unwrap().unwrap();
        let request: JsonRpcRequest = serde_json::from_str(&line).unwrap();
        peer_out
            .write_message(&JsonRpcResponse::success(
                request.id,
                json!({ "protocolVersion": "1999-01-01", "capabilities": {} }),
            ))
            .await
            .unwrap();

        match ready.await.unwrap() {
            Err(McpError::NotInitialised { reason }) => assert!(reason.contains("1999-01-01")),
            other => panic!("expected NotInitialised, got {other:?}"),
        }
    }
}
