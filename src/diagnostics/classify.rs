//! Failure classification.
//!
//! Rules are tried in a fixed order (compilation, syntax, timeout, network,
//! permission, memory, dependency, protocol); the first rule whose pattern
//! matches the error text, or whose stage list names the failing stage,
//! wins. Anything else is [`FailureType::Unknown`].

use std::sync::OnceLock;

use regex::Regex;

use crate::error::FailureType;

struct Rule {
    failure_type: FailureType,
    stages: &'static [&'static str],
    patterns: &'static [&'static str],
}

const RULES: &[Rule] = &[
    Rule {
        failure_type: FailureType::Compilation,
        stages: &["compilation", "build"],
        patterns: &[
            r"(?i)\bcompil(e|ation|er)\b.*\b(error|failed|failure)\b",
            r"(?i)\bbuild (command )?failed\b",
            r"(?i)\bundefined: \w+",
            r"(?i)\bcannot find (symbol|value|type)\b",
            r"error\[E\d{4}\]",
            r"(?i)\bcannot use .* as .* value\b",
            r"(?m)^\S+\.(go|rs|ts|tsx|js|py|java):\d+(:\d+)?: ",
        ],
    },
    Rule {
        failure_type: FailureType::Syntax,
        stages: &["syntax"],
        patterns: &[
            r"(?i)\bsyntax ?error\b",
            r"(?i)\bunexpected (token|eof|end of (file|input))\b",
            r"(?i)\b(unclosed|unmatched|mismatched) '.'",
            r"(?i)\bunterminated (string|block comment)",
            r"(?i)\binvalid JSON\b",
            r"(?i)\bnot valid UTF-8\b",
        ],
    },
    Rule {
        failure_type: FailureType::Timeout,
        stages: &[],
        patterns: &[
            r"(?i)\btimed? ?out\b",
            r"(?i)\bdeadline exceeded\b",
            r"(?i)\btimeout\b",
        ],
    },
    Rule {
        failure_type: FailureType::Network,
        stages: &[],
        patterns: &[
            r"(?i)\bconnection (refused|reset|lost|closed)\b",
            r"(?i)\bbroken pipe\b",
            r"(?i)\bclosed stdout\b",
            r"(?i)\bnetwork (is )?unreachable\b",
            r"(?i)\bfailed to write to server\b",
            r"(?i)\bclient closed\b",
            r"\bEOF\b",
        ],
    },
    Rule {
        failure_type: FailureType::Permission,
        stages: &[],
        patterns: &[
            r"(?i)\bpermission denied\b",
            r"(?i)\baccess (is )?denied\b",
            r"(?i)\boperation not permitted\b",
            r"\b(EACCES|EPERM)\b",
        ],
    },
    Rule {
        failure_type: FailureType::Memory,
        stages: &[],
        patterns: &[
            r"(?i)\bout of memory\b",
            r"\bOOM\b",
            r"(?i)\bcannot allocate memory\b",
            r"(?i)\bmemory (grows|leak|limit)\b",
            r"(?i)\bpeak memory\b",
        ],
    },
    Rule {
        failure_type: FailureType::Dependency,
        stages: &["dependency"],
        patterns: &[
            r"(?i)\bno required module provides\b",
            r"(?i)\bmissing go\.sum entry\b",
            r"(?i)\bmodule .* not found\b",
            r"(?i)\bcannot find (module|package)\b",
            r"(?i)\bcould not resolve dependenc",
            r"(?i)\bno matching version\b",
            r"(?i)\bdependency manifest\b",
            r"(?i)\brequired tool '.*' was not found\b",
            r"\bModuleNotFoundError\b",
        ],
    },
    Rule {
        failure_type: FailureType::Protocol,
        stages: &["protocol", "integration"],
        patterns: &[
            r"(?i)\bjson-?rpc\b",
            r"(?i)\bmethod not found\b",
            r"\[-32\d{3}\]",
            r"(?i)\bprotocol version\b",
            r"(?i)\bnot initiali[sz]ed\b",
            r"(?i)\bnon-conformant\b",
            r"(?i)\bhandshake\b",
        ],
    },
];

struct CompiledRule {
    rule: &'static Rule,
    patterns: Vec<(&'static str, Regex)>,
}

fn compiled_rules() -> &'static [CompiledRule] {
    static RULESET: OnceLock<Vec<CompiledRule>> = OnceLock::new();
    RULESET.get_or_init(|| {
        RULES
            .iter()
            .map(|rule| CompiledRule {
                rule,
                patterns: rule
                    .patterns
                    .iter()
                    .filter_map(|p| Regex::new(p).ok().map(|re| (*p, re)))
                    .collect(),
            })
            .collect()
    })
}

/// Why a failure received its type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    /// The assigned type.
    pub failure_type: FailureType,
    /// Text matched by the winning pattern.
    pub matched_text: Option<String>,
    /// `true` when the stage identity, not the text, decided.
    pub by_stage: bool,
}

/// Classifies an error message, optionally knowing which stage produced it.
#[must_use]
pub fn classify(text: &str, stage: Option<&str>) -> Classification {
    for compiled in compiled_rules() {
        if let Some(hit) = compiled.patterns.iter().find_map(|(_, re)| re.find(text)) {
            return Classification {
                failure_type: compiled.rule.failure_type,
                matched_text: Some(hit.as_str().to_string()),
                by_stage: false,
            };
        }
        if stage.is_some_and(|s| compiled.rule.stages.contains(&s)) {
            return Classification {
                failure_type: compiled.rule.failure_type,
                matched_text: None,
                by_stage: true,
            };
        }
    }
    Classification {
        failure_type: FailureType::Unknown,
        matched_text: None,
        by_stage: false,
    }
}

/// Shorthand for [`classify`] returning only the type.
#[must_use]
pub fn failure_type_of(text: &str, stage: Option<&str>) -> FailureType {
    classify(text, stage).failure_type
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_pattern_compiles() {
        for compiled in compiled_rules() {
            assert_eq!(compiled.patterns.len(), compiled.rule.patterns.len());
        }
    }

    #[test]
    fn compiler_errors() {
        assert_eq!(
            failure_type_of("./main.go:12:5: undefined: handler", None),
            FailureType::Compilation
        );
        assert_eq!(
            failure_type_of("error[E0425]: cannot find value `x` in this scope", None),
            FailureType::Compilation
        );
    }

    #[test]
    fn unknown_fallback() {
        let c = classify("the server hummed quietly", None);
        assert_eq!(c.failure_type, FailureType::Unknown);
        assert!(c.matched_text.is_none());
    }

    #[test]
    fn earlier_rules_win() {
        // A timeout inside the protocol stage is a timeout, not a protocol error.
        assert_eq!(
            failure_type_of("call to 'initialize' timed out after 30000ms", Some("protocol")),
            FailureType::Timeout
        );
        assert_eq!(
            failure_type_of("open /etc/secret: permission denied", None),
            FailureType::Permission
        );
    }

    #[test]
    fn stage_identity_is_a_fallback_signal() {
        let c = classify("tools/list: something odd", Some("protocol"));
        assert_eq!(c.failure_type, FailureType::Protocol);
        assert!(c.by_stage);
    }

    #[test]
    fn protocol_and_dependency_text() {
        assert_eq!(
            failure_type_of("server error [-32601]: Method not found", None),
            FailureType::Protocol
        );
        assert_eq!(
            failure_type_of("main.go:4:2: no required module provides package github.com/x/y", Some("dependency")),
            FailureType::Compilation
        );
        assert_eq!(
            failure_type_of("go: missing go.sum entry for module providing package", None),
            FailureType::Dependency
        );
    }
}
