//! Static remediation catalog.
//!
//! Each failure type has a few recommendations, a troubleshooting guide and
//! reference links. Nothing here inspects the server; the engine picks
//! entries by failure type and ranks them.

use serde::{Deserialize, Serialize};

use crate::error::{FailureType, Severity};

/// How much work a fix is expected to take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FixEffort {
    /// Minutes.
    Trivial,
    /// Under an hour.
    Small,
    /// A few hours.
    Medium,
    /// A day or more.
    Large,
}

impl FixEffort {
    /// Human estimate used in reports.
    #[must_use]
    pub const fn estimate(self) -> &'static str {
        match self {
            Self::Trivial => "under 15 minutes",
            Self::Small => "15-60 minutes",
            Self::Medium => "1-4 hours",
            Self::Large => "1 day or more",
        }
    }

    const fn penalty(self) -> u32 {
        match self {
            Self::Trivial => 0,
            Self::Small => 1,
            Self::Medium => 2,
            Self::Large => 3,
        }
    }
}

/// Priority from severity and effort: severe, cheap fixes first.
#[must_use]
pub const fn priority(severity: Severity, effort: FixEffort) -> u32 {
    let weight = match severity {
        Severity::Critical => 3,
        Severity::Major => 2,
        Severity::Minor => 1,
    };
    weight * 10 - effort.penalty() * 2
}

/// One concrete step of a recommendation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    /// What to do.
    pub description: String,
    /// A command to run, if one applies.
    pub command: Option<String>,
    /// Example snippet.
    pub example: Option<String>,
    /// Caution to read before acting.
    pub warning: Option<String>,
}

/// A ranked remediation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticRecommendation {
    /// Higher runs first.
    pub priority: u32,
    /// Recommendation category, e.g. `build`.
    pub category: String,
    /// Short title.
    pub title: String,
    /// Why this helps.
    pub description: String,
    /// Expected effort.
    pub effort: FixEffort,
    /// Ordered steps.
    pub actions: Vec<Action>,
}

/// Steps, pitfalls and escalation hints for one failure type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TroubleshootingGuide {
    /// Ordered diagnostic steps.
    pub steps: Vec<String>,
    /// Mistakes commonly behind this failure.
    pub common_pitfalls: Vec<String>,
    /// When to stop and ask for help.
    pub escalate_when: Vec<String>,
}

struct ActionEntry {
    description: &'static str,
    command: Option<&'static str>,
    example: Option<&'static str>,
    warning: Option<&'static str>,
}

struct Entry {
    failure_type: FailureType,
    title: &'static str,
    description: &'static str,
    effort: FixEffort,
    actions: &'static [ActionEntry],
}

const fn step(description: &'static str) -> ActionEntry {
    ActionEntry {
        description,
        command: None,
        example: None,
        warning: None,
    }
}

const fn run(description: &'static str, command: &'static str) -> ActionEntry {
    ActionEntry {
        description,
        command: Some(command),
        example: None,
        warning: None,
    }
}

const CATALOG: &[Entry] = &[
    Entry {
        failure_type: FailureType::Compilation,
        title: "Fix the first compiler error",
        description: "Later compiler errors are often caused by the first one.",
        effort: FixEffort::Small,
        actions: &[
            run("Rebuild and read the first error only", "go build ./..."),
            step("Open the file and line named in the error and correct the code"),
            step("Rebuild until the project compiles"),
        ],
    },
    Entry {
        failure_type: FailureType::Compilation,
        title: "Regenerate the server from a corrected specification",
        description: "Type errors in generated code usually trace back to the input schema.",
        effort: FixEffort::Medium,
        actions: &[
            step("Check the schema of the operation named in the error"),
            ActionEntry {
                description: "Regenerate the server",
                command: None,
                example: None,
                warning: Some("Regeneration overwrites manual edits"),
            },
        ],
    },
    Entry {
        failure_type: FailureType::Syntax,
        title: "Repair the malformed file",
        description: "A source or JSON file is structurally invalid.",
        effort: FixEffort::Trivial,
        actions: &[
            step("Open the file at the reported line and column"),
            step("Balance the bracket, quote or comment the report points at"),
            ActionEntry {
                description: "Validate JSON files separately",
                command: Some("python3 -m json.tool <file>"),
                example: None,
                warning: None,
            },
        ],
    },
    Entry {
        failure_type: FailureType::Timeout,
        title: "Find the slow or blocked handler",
        description: "The server did not answer within the configured timeout.",
        effort: FixEffort::Medium,
        actions: &[
            step("Check the server's stderr for the last request it logged"),
            step("Make sure the handler writes exactly one response line per request"),
            ActionEntry {
                description: "Raise the timeout only after ruling out a hang",
                command: None,
                example: Some(r#"{ "timeouts": { "call_ms": 30000 } }"#),
                warning: Some("A larger timeout hides real latency problems"),
            },
        ],
    },
    Entry {
        failure_type: FailureType::Network,
        title: "Keep stdout reserved for protocol messages",
        description: "The connection to the server broke or stdout carried non-protocol output.",
        effort: FixEffort::Small,
        actions: &[
            step("Send all logging to stderr"),
            step("Check that the server does not exit after the first request"),
            step("Look for panics or crashes in the captured stderr"),
        ],
    },
    Entry {
        failure_type: FailureType::Permission,
        title: "Fix file permissions",
        description: "The operating system refused access to a file or program.",
        effort: FixEffort::Trivial,
        actions: &[
            run("Make the server binary executable", "chmod +x <binary>"),
            ActionEntry {
                description: "Check ownership of the project directory",
                command: Some("ls -la <server_path>"),
                example: None,
                warning: Some("Do not run the validator as root to work around this"),
            },
        ],
    },
    Entry {
        failure_type: FailureType::Memory,
        title: "Bound memory growth",
        description: "Memory use exceeded the limit or kept growing under load.",
        effort: FixEffort::Large,
        actions: &[
            step("Look for caches or buffers that grow per request"),
            step("Release per-request allocations after the response is written"),
            step("Profile the server under the same load scenario"),
        ],
    },
    Entry {
        failure_type: FailureType::Dependency,
        title: "Restore the dependency set",
        description: "A dependency is missing, unresolvable or not pinned.",
        effort: FixEffort::Small,
        actions: &[
            run("Resolve and pin dependencies", "go mod tidy"),
            step("Commit the lock file next to the manifest"),
            ActionEntry {
                description: "Install the missing toolchain if a tool was not found",
                command: None,
                example: None,
                warning: Some("Match the toolchain version the generator targets"),
            },
        ],
    },
    Entry {
        failure_type: FailureType::Protocol,
        title: "Implement the missing or non-conformant method",
        description: "The server does not answer a required MCP method the way clients expect.",
        effort: FixEffort::Medium,
        actions: &[
            step("Register a handler for every required method"),
            step("Return results with the fields MCP requires, e.g. `tools[].inputSchema`"),
            step("Answer unknown methods with JSON-RPC error -32601"),
        ],
    },
    Entry {
        failure_type: FailureType::Protocol,
        title: "Check the handshake",
        description: "Clients refuse servers that negotiate an unexpected protocol version.",
        effort: FixEffort::Small,
        actions: &[
            step("Echo a supported protocolVersion in the initialize result"),
            step("Advertise every capability the server implements"),
        ],
    },
    Entry {
        failure_type: FailureType::Unknown,
        title: "Reproduce the failure manually",
        description: "The failure matched no known pattern.",
        effort: FixEffort::Medium,
        actions: &[
            step("Re-run the validator with -vv to capture debug logs"),
            step("Start the server by hand and send an initialize request"),
        ],
    },
];

/// Recommendations for `failure_type`, ranked by priority, highest first.
#[must_use]
pub fn recommendations(failure_type: FailureType, severity: Severity) -> Vec<DiagnosticRecommendation> {
    let mut out: Vec<DiagnosticRecommendation> = CATALOG
        .iter()
        .filter(|e| e.failure_type == failure_type)
        .map(|e| DiagnosticRecommendation {
            priority: priority(severity, e.effort),
            category: failure_type.category().to_string(),
            title: e.title.to_string(),
            description: e.description.to_string(),
            effort: e.effort,
            actions: e
                .actions
                .iter()
                .map(|a| Action {
                    description: a.description.to_string(),
                    command: a.command.map(String::from),
                    example: a.example.map(String::from),
                    warning: a.warning.map(String::from),
                })
                .collect(),
        })
        .collect();
    out.sort_by(|a, b| b.priority.cmp(&a.priority));
    out
}

/// Troubleshooting guide for `failure_type`.
#[must_use]
pub fn troubleshooting(failure_type: FailureType) -> TroubleshootingGuide {
    let (steps, pitfalls, escalate): (&[&str], &[&str], &[&str]) = match failure_type {
        FailureType::Compilation | FailureType::Syntax => (
            &[
                "Run the build command by hand in the server directory",
                "Fix errors top to bottom, rebuilding after each fix",
            ],
            &[
                "Editing generated code that the next generation overwrites",
                "Building with a different toolchain version than the generator targets",
            ],
            &["The same error appears in every server generated from one template"],
        ),
        FailureType::Timeout | FailureType::Network => (
            &[
                "Start the server by hand and send one initialize request",
                "Watch stderr while the request is pending",
            ],
            &[
                "Logging to stdout, which corrupts the message stream",
                "Buffered stdout that is never flushed",
            ],
            &["The server answers by hand but not under the validator"],
        ),
        FailureType::Permission => (
            &["Check file modes and ownership of the server directory"],
            &["Running the generator and the validator as different users"],
            &["Permissions are correct and access is still denied"],
        ),
        FailureType::Memory => (
            &[
                "Run the load scenario again and watch resident memory",
                "Compare memory before and after a burst of calls",
            ],
            &["Unbounded caches keyed by request data"],
            &["Memory keeps growing with an idle server"],
        ),
        FailureType::Dependency => (
            &[
                "Resolve dependencies with the ecosystem's tool",
                "Check that the lock file matches the manifest",
            ],
            &["Manifests edited without regenerating the lock file"],
            &["A dependency cannot be fetched from any mirror"],
        ),
        FailureType::Protocol => (
            &[
                "Compare the failing response with the MCP schema",
                "Check the handshake result for protocolVersion and capabilities",
            ],
            &[
                "Returning `null` instead of an empty object",
                "Omitting `inputSchema` from tool descriptions",
            ],
            &["The server follows the schema and clients still reject it"],
        ),
        FailureType::Unknown => (
            &["Collect debug logs and the server's stderr"],
            &["Assuming the first error in the log is the cause"],
            &["The failure cannot be reproduced outside the validator"],
        ),
    };
    TroubleshootingGuide {
        steps: owned(steps),
        common_pitfalls: owned(pitfalls),
        escalate_when: owned(escalate),
    }
}

fn owned(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

/// Reference documentation for `failure_type`.
#[must_use]
pub fn related_links(failure_type: FailureType) -> Vec<String> {
    owned(match failure_type {
        FailureType::Protocol | FailureType::Timeout | FailureType::Network => &[
            "https://modelcontextprotocol.io/specification",
            "https://www.jsonrpc.org/specification",
        ],
        FailureType::Dependency => &["https://go.dev/ref/mod"],
        FailureType::Compilation | FailureType::Syntax => &["https://go.dev/doc/effective_go"],
        _ => &[],
    })
}
