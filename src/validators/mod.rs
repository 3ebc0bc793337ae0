//! Static validators.
//!
//! Validators inspect the generated source tree and never start the server.
//! Problems they find are data in the returned [`ValidationResult`]; a
//! [`ValidatorError`] means the validator could not run at all (missing tool,
//! unreadable directory).
//!
//! | Validator   | Source              | Concurrent |
//! |-------------|---------------------|------------|
//! | compilation | build command       | no         |
//! | syntax      | native scan         | yes        |
//! | lint        | lint command        | no         |
//! | security    | rules + scanner     | yes        |
//! | dependency  | manifest + audit    | no         |
//!
//! Build and lint share the toolchain's build cache, so they run one after
//! the other; the native scans run alongside them.

pub mod command;
mod compilation;
pub mod dependency;
mod lint;
mod security;
pub mod sources;
mod syntax;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::cancel::CancelSignal;
use crate::config::{FeatureToggles, TestConfig};
use crate::error::ValidatorError;
use crate::results::ValidationResult;

/// The closed set of static checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Validator {
    /// Builds the server.
    Compilation,
    /// Structural check of source files.
    Syntax,
    /// Runs the linter.
    Lint,
    /// Scans for insecure patterns.
    Security,
    /// Checks dependency manifests.
    Dependency,
}

impl Validator {
    /// Every validator, in run order.
    pub const ALL: [Self; 5] = [
        Self::Compilation,
        Self::Syntax,
        Self::Lint,
        Self::Security,
        Self::Dependency,
    ];

    /// Stable name used as the result key.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Compilation => "compilation",
            Self::Syntax => "syntax",
            Self::Lint => "lint",
            Self::Security => "security",
            Self::Dependency => "dependency",
        }
    }

    /// Whether this validator may run concurrently with others.
    #[must_use]
    pub const fn supports_async(self) -> bool {
        matches!(self, Self::Syntax | Self::Security)
    }

    /// Validators enabled by the feature toggles, in run order.
    #[must_use]
    pub fn enabled(features: &FeatureToggles) -> Vec<Self> {
        Self::ALL
            .into_iter()
            .filter(|v| match v {
                Self::Lint => features.lint,
                Self::Security => features.security_scan,
                _ => true,
            })
            .collect()
    }

    /// Runs the validator against `server_path`.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidatorError`] if the validator cannot run.
    pub async fn validate(
        self,
        config: &TestConfig,
        server_path: &Path,
        cancel: &CancelSignal,
    ) -> Result<ValidationResult, ValidatorError> {
        if cancel.is_cancelled() {
            return Err(ValidatorError::Cancelled);
        }
        match self {
            Self::Compilation => compilation::validate(config, server_path, cancel).await,
            Self::Syntax => syntax::validate(config, server_path, cancel).await,
            Self::Lint => lint::validate(config, server_path, cancel).await,
            Self::Security => security::validate(config, server_path, cancel).await,
            Self::Dependency => dependency::validate(config, server_path, cancel).await,
        }
    }
}

impl std::fmt::Display for Validator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Outcome of one validator in a run.
pub type ValidatorOutcome = (Validator, Result<ValidationResult, ValidatorError>);

/// Runs `validators` and returns their outcomes in the order given.
///
/// Async-capable validators run concurrently on the runtime while the
/// others run sequentially.
pub async fn run_validators(
    validators: &[Validator],
    config: Arc<TestConfig>,
    server_path: &Path,
    cancel: &CancelSignal,
) -> Vec<ValidatorOutcome> {
    info!(server = %server_path.display(), count = validators.len(), "Running validators");

    let mut concurrent = JoinSet::new();
    for &validator in validators.iter().filter(|v| v.supports_async()) {
        let config = Arc::clone(&config);
        let path: PathBuf = server_path.to_path_buf();
        let cancel = cancel.clone();
        concurrent.spawn(async move {
            let outcome = validator.validate(&config, &path, &cancel).await;
            (validator, outcome)
        });
    }

    let mut outcomes: Vec<ValidatorOutcome> = Vec::with_capacity(validators.len());
    for &validator in validators.iter().filter(|v| !v.supports_async()) {
        let outcome = validator.validate(&config, server_path, cancel).await;
        log_outcome(validator, &outcome);
        outcomes.push((validator, outcome));
    }

    while let Some(joined) = concurrent.join_next().await {
        match joined {
            Ok((validator, outcome)) => {
                log_outcome(validator, &outcome);
                outcomes.push((validator, outcome));
            }
            Err(e) => warn!(error = %e, "Validator task panicked"),
        }
    }

    outcomes.sort_by_key(|(v, _)| validators.iter().position(|x| x == v));
    outcomes
}

fn log_outcome(validator: Validator, outcome: &Result<ValidationResult, ValidatorError>) {
    match outcome {
        Ok(result) => debug!(
            validator = %validator,
            success = result.success,
            errors = result.errors.len(),
            warnings = result.warnings.len(),
            "Validator finished"
        ),
        Err(e) => warn!(validator = %validator, error = %e, "Validator could not run"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toggles_remove_optional_validators() {
        let features = FeatureToggles {
            lint: false,
            security_scan: false,
            ..FeatureToggles::default()
        };
        assert_eq!(
            Validator::enabled(&features),
            vec![Validator::Compilation, Validator::Syntax, Validator::Dependency]
        );
    }

    #[test]
    fn only_native_scans_are_concurrent() {
        let concurrent: Vec<_> = Validator::ALL
            .into_iter()
            .filter(|v| v.supports_async())
            .collect();
        assert_eq!(concurrent, vec![Validator::Syntax, Validator::Security]);
    }

    #[tokio::test]
    async fn outcomes_keep_declared_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("go.mod"), "module x\n").unwrap();
        std::fs::write(dir.path().join("main.go"), "package main\nfunc main() {}\n").unwrap();

        let validators = [Validator::Security, Validator::Dependency, Validator::Syntax];
        let outcomes = run_validators(
            &validators,
            Arc::new(TestConfig::default()),
            dir.path(),
            &CancelSignal::new(),
        )
        .await;

        let order: Vec<Validator> = outcomes.iter().map(|(v, _)| *v).collect();
        assert_eq!(order, validators);
        assert!(outcomes.iter().all(|(_, o)| o.as_ref().is_ok_and(|r| r.success)));
    }
}
