//! JSON-RPC 2.0 client bound to the server under test.
//!
//! The client owns the server's stdio pipes (and, when it spawned it, the
//! process itself). Requests are written under a writer lock; a single
//! background reader task demultiplexes responses to their callers through
//! one `oneshot` completion slot per outstanding request id.
//!
//! ```text
//!   call() ──write──▶ stdin ─────▶ server
//!     ▲                              │
//!     └── oneshot ◀── reader task ◀──┘ stdout
//! ```
//!
//! Teardown has a single path, [`ProtocolClient::close`]: pending calls fail
//! with [`McpError::Closed`], stdin is closed, the process is given a short
//! grace period and then killed, and the reader task is joined. Dropping the
//! client without closing it still kills the process (`kill_on_drop`).

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::error::{McpError, McpResult};
use super::protocol::{parse_frame, Frame, JsonRpcNotification, JsonRpcRequest, RequestId};
use super::transport::{FrameReader, FrameWriter};
use crate::cancel::CancelSignal;
use crate::config::ServerLaunchConfig;
use crate::metrics::{Counter, MetricsRegistry};

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type Completion = oneshot::Sender<McpResult<Value>>;

/// Lines of server stderr kept for diagnostics.
const STDERR_TAIL_LINES: usize = 50;

/// Time a server gets to exit after stdin closes before it is killed.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Time the reader task gets to observe EOF before it is aborted.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
enum TableState {
    Open,
    Closed,
    Lost(String),
}

#[derive(Debug)]
struct CallTable {
    slots: HashMap<u64, Completion>,
    state: TableState,
}

/// Outstanding calls keyed by request id.
#[derive(Debug)]
struct PendingCalls {
    table: StdMutex<CallTable>,
}

impl PendingCalls {
    fn new() -> Self {
        Self {
            table: StdMutex::new(CallTable {
                slots: HashMap::new(),
                state: TableState::Open,
            }),
        }
    }

    fn register(&self, id: u64) -> McpResult<oneshot::Receiver<McpResult<Value>>> {
        let mut table = lock(&self.table);
        match &table.state {
            TableState::Open => {}
            TableState::Closed => return Err(McpError::Closed),
            TableState::Lost(reason) => {
                return Err(McpError::ConnectionLost {
                    reason: reason.clone(),
                })
            }
        }
        let (tx, rx) = oneshot::channel();
        table.slots.insert(id, tx);
        Ok(rx)
    }

    /// Delivers `outcome` to the caller waiting on `id`.
    ///
    /// Returns `false` if no call is waiting (unknown, cancelled or already
    /// answered), in which case the outcome is dropped.
    fn complete(&self, id: u64, outcome: McpResult<Value>) -> bool {
        let slot = lock(&self.table).slots.remove(&id);
        slot.is_some_and(|tx| {
            // A receiver dropped between removal and send is a cancelled call.
            let _ = tx.send(outcome);
            true
        })
    }

    fn remove(&self, id: u64) {
        lock(&self.table).slots.remove(&id);
    }

    fn len(&self) -> usize {
        lock(&self.table).slots.len()
    }

    /// Fails every pending call and refuses new ones.
    ///
    /// The first shutdown wins: a reader hitting EOF after `close` does not
    /// turn the closed state into a lost connection.
    fn shut(&self, state: TableState) -> usize {
        let (drained, lost): (Vec<Completion>, Option<String>) = {
            let mut table = lock(&self.table);
            if matches!(table.state, TableState::Open) {
                table.state = state;
            }
            let lost = match &table.state {
                TableState::Lost(reason) => Some(reason.clone()),
                _ => None,
            };
            (table.slots.drain().map(|(_, tx)| tx).collect(), lost)
        };
        let count = drained.len();
        for tx in drained {
            let error = lost.clone().map_or(McpError::Closed, |reason| {
                McpError::ConnectionLost { reason }
            });
            let _ = tx.send(Err(error));
        }
        count
    }
}

/// Removes a call's slot when the call future finishes or is dropped.
struct SlotGuard {
    pending: Arc<PendingCalls>,
    id: u64,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.pending.remove(self.id);
    }
}

/// A JSON-RPC client speaking to one server instance.
///
/// All methods take `&self`; share the client between testers with an `Arc`.
pub struct ProtocolClient {
    label: String,
    writer: Mutex<Option<FrameWriter<BoxedWriter>>>,
    pending: Arc<PendingCalls>,
    next_id: AtomicU64,
    reader_task: StdMutex<Option<JoinHandle<()>>>,
    stderr_task: StdMutex<Option<JoinHandle<()>>>,
    stderr_tail: Arc<StdMutex<VecDeque<String>>>,
    child: Mutex<Option<Child>>,
    pid: Option<u32>,
    metrics: Arc<MetricsRegistry>,
}

impl ProtocolClient {
    /// Binds a client to an already-connected pair of streams.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn connect<R, W>(
        label: impl Into<String>,
        reader: R,
        writer: W,
        metrics: Arc<MetricsRegistry>,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let label = label.into();
        let pending = Arc::new(PendingCalls::new());
        let reader_task = tokio::spawn(read_loop(
            FrameReader::new(reader),
            Arc::clone(&pending),
            Arc::clone(&metrics),
            label.clone(),
        ));
        let writer: BoxedWriter = Box::new(writer);

        Self {
            label,
            writer: Mutex::new(Some(FrameWriter::new(writer))),
            pending,
            next_id: AtomicU64::new(1),
            reader_task: StdMutex::new(Some(reader_task)),
            stderr_task: StdMutex::new(None),
            stderr_tail: Arc::new(StdMutex::new(VecDeque::new())),
            child: Mutex::new(None),
            pid: None,
            metrics,
        }
    }

    /// Starts the server in `server_path` and binds a client to its stdio.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`McpError::Spawn`] if the process cannot be started.
    pub fn spawn(
        launch: &ServerLaunchConfig,
        server_path: &Path,
        metrics: Arc<MetricsRegistry>,
    ) -> McpResult<Self> {
        let command_line = launch.command.join(" ");
        let Some((program, args)) = launch.command.split_first() else {
            return Err(McpError::Spawn {
                command: command_line,
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "empty launch command",
                ),
            });
        };

        let mut child = Command::new(program)
            .args(args)
            .current_dir(server_path)
            .envs(&launch.env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| McpError::Spawn {
                command: command_line.clone(),
                source,
            })?;

        let missing = |stream: &str| McpError::Spawn {
            command: command_line.clone(),
            source: std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                format!("failed to capture {stream}"),
            ),
        };
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

        let label = server_path.display().to_string();
        let mut client = Self::connect(label.clone(), stdout, stdin, metrics);
        client.pid = child.id();
        client.stderr_task = StdMutex::new(Some(tokio::spawn(drain_stderr(
            stderr,
            Arc::clone(&client.stderr_tail),
            label,
        ))));
        client.child = Mutex::new(Some(child));

        info!(server = %client.label, pid = ?client.pid, command = %command_line, "Server started");
        Ok(client)
    }

    /// Human-readable name of the server (its path).
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// OS process id, when the client spawned the server.
    #[must_use]
    pub const fn process_id(&self) -> Option<u32> {
        self.pid
    }

    /// Number of calls waiting for a response.
    #[must_use]
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    /// The most recent stderr lines of the server.
    #[must_use]
    pub fn recent_stderr(&self) -> Vec<String> {
        lock(&self.stderr_tail).iter().cloned().collect()
    }

    /// Sends a request and waits for its response.
    ///
    /// # Errors
    ///
    /// Returns [`McpError::Server`] for JSON-RPC error responses, and
    /// transport errors if the request cannot be written or the connection
    /// is lost or closed before the response arrives.
    pub async fn call(&self, method: &str, params: Option<Value>) -> McpResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let rx = self.pending.register(id)?;
        let _slot = SlotGuard {
            pending: Arc::clone(&self.pending),
            id,
        };

        let request = JsonRpcRequest::new(id, method, params);
        self.write(&request, method).await?;
        self.metrics.incr(Counter::RequestSent);
        trace!(server = %self.label, id, method, "Request sent");

        rx.await.unwrap_or(Err(McpError::Closed))
    }

    /// Like [`call`](Self::call), failing with [`McpError::Timeout`] after `timeout`.
    ///
    /// # Errors
    ///
    /// See [`call`](Self::call).
    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> McpResult<Value> {
        if let Ok(outcome) = tokio::time::timeout(timeout, self.call(method, params)).await {
            outcome
        } else {
            self.metrics.incr(Counter::CallTimeout);
            Err(McpError::Timeout {
                method: method.to_string(),
                after: timeout,
            })
        }
    }

    /// Like [`call`](Self::call), failing with [`McpError::Cancelled`] when
    /// `cancel` fires first. Other in-flight calls are unaffected.
    ///
    /// # Errors
    ///
    /// See [`call`](Self::call).
    pub async fn call_with_cancel(
        &self,
        method: &str,
        params: Option<Value>,
        cancel: &CancelSignal,
    ) -> McpResult<Value> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(self.cancelled(method)),
            outcome = self.call(method, params) => outcome,
        }
    }

    /// A call bounded by both a timeout and a cancellation signal.
    ///
    /// # Errors
    ///
    /// See [`call`](Self::call).
    pub async fn call_bounded(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
        cancel: &CancelSignal,
    ) -> McpResult<Value> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(self.cancelled(method)),
            outcome = self.call_with_timeout(method, params, timeout) => outcome,
        }
    }

    /// Sends a notification.
    ///
    /// # Errors
    ///
    /// Returns an error if the notification cannot be written.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> McpResult<()> {
        let notification = JsonRpcNotification::new(method, params);
        self.write(&notification, method).await
    }

    /// Shuts the client down and terminates the server.
    ///
    /// Safe to call more than once.
    pub async fn close(&self) {
        let failed = self.pending.shut(TableState::Closed);
        if failed > 0 {
            debug!(server = %self.label, failed, "Pending calls cancelled by close");
        }

        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                debug!(server = %self.label, error = %e, "Closing server stdin failed");
            }
        }

        if let Some(mut child) = self.child.lock().await.take() {
            match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
                Ok(Ok(status)) => debug!(server = %self.label, %status, "Server exited"),
                _ => {
                    if let Err(e) = child.kill().await {
                        warn!(server = %self.label, error = %e, "Failed to kill server");
                    } else {
                        debug!(server = %self.label, "Server killed after grace period");
                    }
                }
            }
        }

        let reader = lock(&self.reader_task).take();
        if let Some(handle) = reader {
            join_or_abort(handle).await;
        }
        let stderr = lock(&self.stderr_task).take();
        if let Some(handle) = stderr {
            join_or_abort(handle).await;
        }
    }

    async fn write<T: Serialize + Sync>(&self, message: &T, context: &str) -> McpResult<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(McpError::Closed)?;
        writer
            .write_message(message)
            .await
            .map_err(|source| McpError::Io {
                context: context.to_string(),
                source,
            })
    }

    fn cancelled(&self, method: &str) -> McpError {
        self.metrics.incr(Counter::CallCancelled);
        McpError::Cancelled {
            method: method.to_string(),
        }
    }
}

impl Drop for ProtocolClient {
    fn drop(&mut self) {
        for slot in [&self.reader_task, &self.stderr_task] {
            if let Some(handle) = lock(slot).take() {
                handle.abort();
            }
        }
    }
}

async fn join_or_abort(mut handle: JoinHandle<()>) {
    if tokio::time::timeout(READER_DRAIN_TIMEOUT, &mut handle)
        .await
        .is_err()
    {
        handle.abort();
        let _ = handle.await;
    }
}

async fn read_loop<R: AsyncRead + Unpin>(
    mut reader: FrameReader<R>,
    pending: Arc<PendingCalls>,
    metrics: Arc<MetricsRegistry>,
    label: String,
) {
    let reason = loop {
        match reader.read_bytes().await {
            Ok(Some(bytes)) => match String::from_utf8(bytes) {
                Ok(line) => {
                    if !line.trim().is_empty() {
                        route_frame(&line, &pending, &metrics, &label);
                    }
                }
                Err(e) => {
                    metrics.incr(Counter::MalformedFrame);
                    let preview = String::from_utf8_lossy(e.as_bytes());
                    let preview: String = preview.chars().take(120).collect();
                    warn!(server = %label, line = %preview, "Protocol warning: frame is not UTF-8, dropped");
                }
            },
            Ok(None) => break "server closed stdout".to_string(),
            Err(e) => break format!("failed to read from stdout: {e}"),
        }
    };

    let failed = pending.shut(TableState::Lost(reason.clone()));
    debug!(server = %label, failed, %reason, "Reader stopped");
}

fn route_frame(line: &str, pending: &PendingCalls, metrics: &MetricsRegistry, label: &str) {
    match parse_frame(line) {
        Ok(Frame::Response(response)) => {
            let Some(id) = response.id.as_ref().and_then(RequestId::as_u64) else {
                metrics.incr(Counter::UnmatchedFrame);
                warn!(server = %label, id = ?response.id, "Protocol warning: response without a usable id dropped");
                return;
            };
            let outcome = match response.error {
                Some(error) => {
                    metrics.incr(Counter::ServerError);
                    Err(McpError::Server {
                        code: error.code,
                        message: error.message,
                        data: error.data,
                    })
                }
                None => Ok(response.result.unwrap_or(Value::Null)),
            };
            if pending.complete(id, outcome) {
                metrics.incr(Counter::ResponseRouted);
            } else {
                metrics.incr(Counter::UnmatchedFrame);
                warn!(server = %label, id, "Protocol warning: response for unknown request id dropped");
            }
        }
        Ok(Frame::Notification(notification)) => {
            debug!(server = %label, method = %notification.method, "Server notification");
        }
        Ok(Frame::Request(request)) => {
            debug!(server = %label, method = %request.method, id = %request.id, "Server request ignored");
        }
        Err(e) => {
            metrics.incr(Counter::MalformedFrame);
            let preview: String = line.chars().take(120).collect();
            warn!(server = %label, error = %e, line = %preview, "Protocol warning: malformed frame dropped");
        }
    }
}

async fn drain_stderr(stderr: ChildStderr, tail: Arc<StdMutex<VecDeque<String>>>, label: String) {
    let mut reader = FrameReader::new(stderr);
    while let Ok(Some(bytes)) = reader.read_bytes().await {
        let line = String::from_utf8_lossy(&bytes).into_owned();
        debug!(target: "server_stderr", server = %label, "{line}");
        let mut tail = lock(&tail);
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::protocol::{ErrorCode, JsonRpcErrorData, JsonRpcResponse};
    use serde_json::json;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

    type PeerReader = FrameReader<ReadHalf<DuplexStream>>;
    type PeerWriter = FrameWriter<WriteHalf<DuplexStream>>;

    fn pair() -> (Arc<ProtocolClient>, PeerReader, PeerWriter, Arc<MetricsRegistry>) {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client_io);
        let (server_read, server_write) = tokio::io::split(server_io);
        let metrics = Arc::new(MetricsRegistry::new());
        let client =
            ProtocolClient::connect("test", client_read, client_write, Arc::clone(&metrics));
        (
            Arc::new(client),
            FrameReader::new(server_read),
            FrameWriter::new(server_write),
            metrics,
        )
    }

    async fn next_request(reader: &mut PeerReader) -> JsonRpcRequest {
        let line = reader.read_line().await.unwrap().unwrap();
        serde_json::from_str(&line).unwrap()
    }

    #[tokio::test]
    async fn out_of_order_responses_reach_their_callers() {
        let (client, mut peer_in, mut peer_out, metrics) = pair();

        let mut calls = Vec::new();
        for n in 0..5 {
            let client = Arc::clone(&client);
            calls.push(tokio::spawn(async move {
                let method = format!("method/{n}");
                let result = client.call(&method, None).await.unwrap();
                (method, result)
            }));
        }

        let mut requests = Vec::new();
        for _ in 0..5 {
            requests.push(next_request(&mut peer_in).await);
        }
        for request in requests.iter().rev() {
            let response =
                JsonRpcResponse::success(request.id.clone(), json!({ "method": request.method }));
            peer_out.write_message(&response).await.unwrap();
        }

        for call in calls {
            let (method, result) = call.await.unwrap();
            assert_eq!(result["method"], json!(method));
        }
        assert_eq!(metrics.get(Counter::ResponseRouted), 5);
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn duplicate_response_is_not_delivered_twice() {
        let (client, mut peer_in, mut peer_out, metrics) = pair();
        let call = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.call("ping", None).await })
        };

        let request = next_request(&mut peer_in).await;
        let response = JsonRpcResponse::success(request.id.clone(), json!({}));
        peer_out.write_message(&response).await.unwrap();
        peer_out.write_message(&response).await.unwrap();

        assert_eq!(call.await.unwrap().unwrap(), json!({}));
        // Round-trip another call so the reader has processed the duplicate.
        let second = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.call("ping", None).await })
        };
        let request = next_request(&mut peer_in).await;
        peer_out
            .write_message(&JsonRpcResponse::success(request.id, json!({})))
            .await
            .unwrap();
        second.await.unwrap().unwrap();

        assert_eq!(metrics.get(Counter::ResponseRouted), 2);
        assert_eq!(metrics.get(Counter::UnmatchedFrame), 1);
    }

    #[tokio::test]
    async fn cancelled_call_does_not_block_others() {
        let (client, mut peer_in, mut peer_out, _metrics) = pair();
        let cancel = CancelSignal::new();

        let slow = {
            let client = Arc::clone(&client);
            let cancel = cancel.clone();
            tokio::spawn(async move { client.call_with_cancel("slow", None, &cancel).await })
        };
        let slow_request = next_request(&mut peer_in).await;

        let fast = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.call("fast", None).await })
        };
        let fast_request = next_request(&mut peer_in).await;

        cancel.cancel();
        let slow_outcome = slow.await.unwrap();
        assert!(matches!(slow_outcome, Err(McpError::Cancelled { .. })));

        peer_out
            .write_message(&JsonRpcResponse::success(fast_request.id, json!("ok")))
            .await
            .unwrap();
        assert_eq!(fast.await.unwrap().unwrap(), json!("ok"));

        // A late answer for the cancelled call is dropped.
        peer_out
            .write_message(&JsonRpcResponse::success(slow_request.id, json!("late")))
            .await
            .unwrap();
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn server_error_is_surfaced() {
        let (client, mut peer_in, mut peer_out, _metrics) = pair();
        let call = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.call("missing", None).await })
        };
        let request = next_request(&mut peer_in).await;
        let response = JsonRpcResponse::failure(
            Some(request.id),
            JsonRpcErrorData::with_message(ErrorCode::MethodNotFound, "Method not found"),
        );
        peer_out.write_message(&response).await.unwrap();

        match call.await.unwrap() {
            Err(McpError::Server { code, .. }) => assert_eq!(code, -32601),
            other => panic!("expected server error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_frames_are_not_fatal() {
        let (client, mut peer_in, mut peer_out, metrics) = pair();
        let call = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.call("ping", None).await })
        };
        let request = next_request(&mut peer_in).await;
        peer_out.write_raw("starting server...").await.unwrap();
        peer_out.write_raw(r#"{"jsonrpc":"2.0","id":999,"result":{}}"#).await.unwrap();
        peer_out
            .write_message(&JsonRpcResponse::success(request.id, json!({"pong": true})))
            .await
            .unwrap();

        assert_eq!(call.await.unwrap().unwrap(), json!({"pong": true}));
        assert_eq!(metrics.get(Counter::MalformedFrame), 1);
        assert_eq!(metrics.get(Counter::UnmatchedFrame), 1);
    }

    #[tokio::test]
    async fn non_utf8_frame_is_not_fatal() {
        use tokio::io::AsyncWriteExt;

        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client_io);
        let (server_read, mut server_write) = tokio::io::split(server_io);
        let metrics = Arc::new(MetricsRegistry::new());
        let client = Arc::new(ProtocolClient::connect(
            "raw",
            client_read,
            client_write,
            Arc::clone(&metrics),
        ));
        let mut peer_in = FrameReader::new(server_read);

        for round in 0..2 {
            let call = {
                let client = Arc::clone(&client);
                tokio::spawn(async move { client.call("ping", None).await })
            };
            let request = next_request(&mut peer_in).await;
            server_write.write_all(b"garbage \xff\xfe line\n").await.unwrap();
            let response = serde_json::to_string(&JsonRpcResponse::success(
                request.id,
                json!({ "round": round }),
            ))
            .unwrap();
            server_write.write_all(response.as_bytes()).await.unwrap();
            server_write.write_all(b"\n").await.unwrap();

            assert_eq!(call.await.unwrap().unwrap(), json!({ "round": round }));
        }
        assert_eq!(metrics.get(Counter::MalformedFrame), 2);
    }

    #[tokio::test]
    async fn timeout_leaves_no_pending_slot() {
        let (client, mut peer_in, _peer_out, metrics) = pair();
        let outcome = {
            let client = Arc::clone(&client);
            tokio::spawn(async move {
                client
                    .call_with_timeout("slow", None, Duration::from_millis(20))
                    .await
            })
        };
        let _ = next_request(&mut peer_in).await;
        assert!(matches!(
            outcome.await.unwrap(),
            Err(McpError::Timeout { .. })
        ));
        assert_eq!(client.pending_calls(), 0);
        assert_eq!(metrics.get(Counter::CallTimeout), 1);
    }

    #[tokio::test]
    async fn close_fails_pending_calls() {
        let (client, mut peer_in, _peer_out, _metrics) = pair();
        let call = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.call("never", None).await })
        };
        let _ = next_request(&mut peer_in).await;

        client.close().await;
        assert!(matches!(call.await.unwrap(), Err(McpError::Closed)));
        assert!(matches!(
            client.call("after", None).await,
            Err(McpError::Closed)
        ));
        // The write side is closed too.
        assert_eq!(peer_in.read_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn eof_fails_pending_calls() {
        let (client, mut peer_in, mut peer_out, _metrics) = pair();
        let call = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.call("never", None).await })
        };
        let _ = next_request(&mut peer_in).await;
        peer_out.shutdown().await.unwrap();

        assert!(matches!(
            call.await.unwrap(),
            Err(McpError::ConnectionLost { .. })
        ));
    }
}
