//! Error types for the protocol client.

use std::time::Duration;

use thiserror::Error;

use crate::error::FailureType;

/// Result type for protocol client operations.
pub type McpResult<T> = Result<T, McpError>;

/// Errors that can occur while talking to the server under test.
#[derive(Debug, Error)]
pub enum McpError {
    /// The server process failed to start.
    #[error("failed to start server '{command}'")]
    Spawn {
        /// The program that was started.
        command: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Writing to the server failed (broken pipe and friends).
    #[error("failed to write to server: {context}")]
    Io {
        /// What was being written.
        context: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The server's stdout closed or could not be read.
    #[error("connection to server lost: {reason}")]
    ConnectionLost {
        /// Why the reader stopped.
        reason: String,
    },

    /// The client was closed while the call was pending.
    #[error("client closed")]
    Closed,

    /// The caller cancelled the call.
    #[error("call to '{method}' cancelled")]
    Cancelled {
        /// Method of the cancelled call.
        method: String,
    },

    /// No response arrived in time.
    #[error("call to '{method}' timed out after {}ms", .after.as_millis())]
    Timeout {
        /// Method of the call.
        method: String,
        /// The timeout that elapsed.
        after: Duration,
    },

    /// The server answered with a JSON-RPC error object.
    #[error("server error [{code}]: {message}")]
    Server {
        /// JSON-RPC error code.
        code: i32,
        /// Error message.
        message: String,
        /// Optional error data.
        data: Option<serde_json::Value>,
    },

    /// The server has not completed the handshake.
    #[error("server not initialised: {reason}")]
    NotInitialised {
        /// Why the session is unusable.
        reason: String,
    },
}

impl McpError {
    /// The failure type this error is reported as.
    #[must_use]
    pub fn failure_type(&self) -> FailureType {
        match self {
            Self::Spawn { source, .. } => match source.kind() {
                std::io::ErrorKind::PermissionDenied => FailureType::Permission,
                std::io::ErrorKind::NotFound => FailureType::Dependency,
                _ => FailureType::Unknown,
            },
            Self::Io { .. } | Self::ConnectionLost { .. } | Self::Closed => FailureType::Network,
            Self::Timeout { .. } => FailureType::Timeout,
            Self::Server { .. } | Self::NotInitialised { .. } => FailureType::Protocol,
            Self::Cancelled { .. } => FailureType::Unknown,
        }
    }

    /// Returns `true` if the server answered with a JSON-RPC error.
    #[must_use]
    pub const fn is_server_error(&self) -> bool {
        matches!(self, Self::Server { .. })
    }
}
