//! Model Context Protocol (MCP) client side.
//!
//! This module drives the server under test as a black-box subprocess. The
//! server communicates over stdio transport using JSON-RPC 2.0 messages.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                        Server Session                         │
//! │                                                               │
//! │   ┌─────────────┐    ┌─────────────┐    ┌─────────────────┐   │
//! │   │  Handshake  │───▶│   Client    │───▶│    Transport    │   │
//! │   │  (once/run) │    │ (call table)│    │ (stdio framing) │   │
//! │   └─────────────┘    └─────────────┘    └─────────────────┘   │
//! │                             │                    │            │
//! │                             ▼                    ▼            │
//! │                      ┌─────────────┐     ┌──────────────┐     │
//! │                      │ reader task │◀────│  subprocess  │     │
//! │                      └─────────────┘     └──────────────┘     │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Protocol Version
//!
//! The client offers MCP protocol version 2024-11-05 by default and accepts
//! any version listed in the configuration.

pub mod client;
pub mod error;
pub mod protocol;
pub mod session;
pub mod transport;

pub use client::ProtocolClient;
pub use error::{McpError, McpResult};
pub use protocol::{JsonRpcRequest, JsonRpcResponse, MCP_PROTOCOL_VERSION};
pub use session::{Handshake, ServerSession};
pub use transport::{FrameReader, FrameWriter};
