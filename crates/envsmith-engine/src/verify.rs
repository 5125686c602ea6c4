//! Evaluation of catalog verify actions
//!
//! Shared by the installer's Verifying phase and by detection. Actions
//! combine with OR: one passing action is enough.

use crate::install::ProcessRunner;
use envsmith_core::types::VerifyAction;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

/// Result of evaluating one verify action
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOutcome {
    pub passed: bool,
    /// Filesystem location the check observed, when it has one
    pub observed_path: Option<PathBuf>,
    /// Trailing output of a command check
    pub output: Option<String>,
    pub detail: String,
}

impl CheckOutcome {
    fn pass(detail: impl Into<String>) -> Self {
        Self {
            passed: true,
            observed_path: None,
            output: None,
            detail: detail.into(),
        }
    }

    fn fail(detail: impl Into<String>) -> Self {
        Self {
            passed: false,
            observed_path: None,
            output: None,
            detail: detail.into(),
        }
    }

    fn at(mut self, path: PathBuf) -> Self {
        self.observed_path = Some(path);
        self
    }
}

/// Result of evaluating a list of verify actions
#[derive(Debug, Clone, Default)]
pub struct VerifyOutcome {
    /// The first action that passed
    pub passed_by: Option<String>,
    /// Every action evaluated, with its result
    pub checks: Vec<String>,
}

impl VerifyOutcome {
    pub fn passed(&self) -> bool {
        self.passed_by.is_some()
    }
}

/// Evaluate actions in order, stopping at the first that passes
///
/// An empty action list passes vacuously.
pub async fn verify_any(
    actions: &[VerifyAction],
    runner: &ProcessRunner,
    cancel: &CancellationToken,
) -> VerifyOutcome {
    if actions.is_empty() {
        return VerifyOutcome {
            passed_by: Some("no verify actions declared".to_string()),
            checks: Vec::new(),
        };
    }

    let mut outcome = VerifyOutcome::default();
    for action in actions {
        let result = check(action, runner, cancel).await;
        outcome
            .checks
            .push(format!("{} ({})", action, result.detail));
        if result.passed {
            outcome.passed_by = Some(action.to_string());
            break;
        }
    }
    outcome
}

/// Evaluate a single verify action
pub async fn check(
    action: &VerifyAction,
    runner: &ProcessRunner,
    cancel: &CancellationToken,
) -> CheckOutcome {
    match action {
        VerifyAction::PathExists { path } => {
            let path = expand_home(path);
            match tokio::fs::try_exists(&path).await {
                Ok(true) => CheckOutcome::pass("exists").at(path),
                Ok(false) => CheckOutcome::fail("missing"),
                Err(e) => CheckOutcome::fail(e.to_string()),
            }
        }
        VerifyAction::CommandSucceeds { command, args } => {
            let resolved = match which::which(command) {
                Ok(p) => p,
                Err(_) => return CheckOutcome::fail("not on PATH"),
            };
            let program = resolved.display().to_string();
            match runner.run(&program, args, None, cancel).await {
                Ok(output) => CheckOutcome {
                    output: Some(output.text()),
                    ..CheckOutcome::pass("exit 0").at(resolved)
                },
                Err(e) => CheckOutcome::fail(e.to_string()),
            }
        }
        VerifyAction::EnvVarSet { name, value } => match (runner.env().get(name), value) {
            (Some(actual), Some(expected)) if &actual == expected => CheckOutcome::pass("matches"),
            (Some(_), Some(_)) => CheckOutcome::fail("different value"),
            (Some(_), None) => CheckOutcome::pass("set"),
            (None, _) => CheckOutcome::fail("unset"),
        },
    }
}

/// Expand a leading `~` to the home directory
pub fn expand_home(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match envsmith_core::get_home_dir() {
        Ok(home) => home.join(rest),
        Err(_) => path.to_path_buf(),
    }
}
