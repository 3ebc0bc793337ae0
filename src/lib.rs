//! mcp-server-validator: validation pipeline for generated MCP servers
//!
//! Given the directory of a generated Model Context Protocol server, this
//! library answers four questions and, when the answer is "no", explains why:
//!
//! - **Static checks**: does it compile, lint and pass security and
//!   dependency checks?
//! - **Protocol**: does it complete the MCP handshake and answer the required
//!   methods and capabilities?
//! - **Integration**: does it behave across multi-step client workflows?
//! - **Performance**: does it meet latency, memory and throughput targets?
//!
//! # Architecture
//!
//! ```text
//! BatchRunner ─▶ Pipeline ─▶ stages ─▶ {validators, testers} ─▶ ServerSession ─▶ subprocess
//!                   │
//!                   └─▶ PipelineResult ─▶ DiagnosticsEngine ─▶ Reporter
//! ```
//!
//! # Modules
//!
//! - [`config`]: configuration loading and validation
//! - [`error`]: error types and the failure taxonomy
//! - [`mcp`]: JSON-RPC client bound to the server's stdio
//! - [`validators`]: static checks over the source tree
//! - [`testers`]: protocol, integration and performance testers
//! - [`suite`]: one run over one server
//! - [`pipeline`]: named stages with timeout, retry and failure policy
//! - [`diagnostics`]: failure classification and remediation
//! - [`batch`]: concurrent runs over many servers
//! - [`report`]: rendering and composite scores

pub mod batch;
pub mod cancel;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod mcp;
pub mod metrics;
pub mod pipeline;
pub mod report;
pub mod results;
pub mod suite;
pub mod testers;
pub mod validators;

pub use batch::{BatchRunner, BatchTestResult, BatchTestSummary};
pub use cancel::CancelSignal;
pub use config::TestConfig;
pub use diagnostics::{DiagnosticReport, DiagnosticsEngine};
pub use error::{FailureType, Severity};
pub use metrics::MetricsRegistry;
pub use pipeline::{Pipeline, PipelineResult};
pub use report::{QualityScores, Reporter, TestReport};
pub use results::TestResult;
pub use suite::TestSuite;
