//! Detection strategies
//!
//! Each strategy observes one kind of evidence and yields at most one
//! result. Confidence is fixed per strategy. Verify actions are
//! alternatives: an observation of envsmith's own files does not stop a
//! strategy from trying the next one.

use super::guard::SelfGuard;
use super::DetectionResult;
use crate::error::{EngineError, Result};
use crate::install::{ProcessError, ProcessRunner};
use crate::platform::PackageManager;
use crate::verify::check;
use async_trait::async_trait;
use envsmith_core::types::{Component, VerifyAction};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::LazyLock;
use tokio_util::sync::CancellationToken;

static VERSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"v?(\d+\.\d+(?:\.\d+)?)").expect("version regex is valid"));

/// Strategy identifiers, declared from highest to lowest priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    PackageInventory,
    Command,
    Path,
    EnvVar,
}

impl StrategyKind {
    pub fn confidence(&self) -> f32 {
        match self {
            StrategyKind::PackageInventory => 0.95,
            StrategyKind::Command => 0.85,
            StrategyKind::Path => 0.70,
            StrategyKind::EnvVar => 0.50,
        }
    }

    /// Tie-break rank; lower wins
    pub fn priority(&self) -> u8 {
        *self as u8
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::PackageInventory => "package_inventory",
            StrategyKind::Command => "command",
            StrategyKind::Path => "path",
            StrategyKind::EnvVar => "env_var",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What a strategy is allowed to look at
pub struct DetectionContext<'a> {
    pub component: &'a Component,
    pub runner: &'a ProcessRunner,
    pub guard: &'a SelfGuard,
    pub cancel: &'a CancellationToken,
}

impl DetectionContext<'_> {
    fn observed(&self, kind: StrategyKind) -> DetectionResult {
        DetectionResult::observed(&self.component.id, kind)
    }

    /// Whether `result` observed envsmith's own files
    pub fn is_own(&self, result: &DetectionResult) -> bool {
        let own = result
            .observed_path
            .as_deref()
            .is_some_and(|p| self.guard.covers(p));
        if own {
            tracing::debug!(
                "{} observation for {} is envsmith's own, trying other alternatives",
                result.strategy,
                self.component.id
            );
        }
        own
    }

    fn error(&self, kind: StrategyKind, message: impl Into<String>) -> EngineError {
        EngineError::Detection {
            component: self.component.id.clone(),
            strategy: kind.to_string(),
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait DetectionStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// `Ok(None)` means nothing was observed; `Err` means the strategy
    /// itself could not run. An observation of envsmith's own files is
    /// returned only when no other alternative matched.
    async fn detect(&self, ctx: &DetectionContext<'_>) -> Result<Option<DetectionResult>>;
}

/// The four built-in strategies in priority order
pub fn default_strategies() -> Vec<std::sync::Arc<dyn DetectionStrategy>> {
    vec![
        std::sync::Arc::new(PackageInventoryStrategy),
        std::sync::Arc::new(CommandStrategy),
        std::sync::Arc::new(PathStrategy),
        std::sync::Arc::new(EnvVarStrategy),
    ]
}

/// Asks dpkg, rpm, brew or winget for the installed version
pub struct PackageInventoryStrategy;

#[async_trait]
impl DetectionStrategy for PackageInventoryStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::PackageInventory
    }

    async fn detect(&self, ctx: &DetectionContext<'_>) -> Result<Option<DetectionResult>> {
        let package = ctx.component.inventory_name();
        for pm in PackageManager::available() {
            let (program, args) = pm.query_command(package);
            match ctx.runner.run(&program, &args, None, ctx.cancel).await {
                Ok(output) => {
                    if let Some(version) = pm.parse_version(package, &output.text()) {
                        tracing::debug!("{} reports {} {}", pm, package, version);
                        let mut result = ctx.observed(self.kind());
                        result.version = Some(version);
                        return Ok(Some(result));
                    }
                }
                // Non-zero exit is how these tools say "not installed"
                Err(ProcessError::Failed { .. }) => {}
                Err(e) => return Err(ctx.error(self.kind(), format!("{}: {}", pm, e))),
            }
        }
        Ok(None)
    }
}

/// Resolves `command_succeeds` actions on PATH, runs them and parses a version
pub struct CommandStrategy;

#[async_trait]
impl DetectionStrategy for CommandStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Command
    }

    async fn detect(&self, ctx: &DetectionContext<'_>) -> Result<Option<DetectionResult>> {
        let mut own = None;
        for action in &ctx.component.verify_actions {
            let VerifyAction::CommandSucceeds { command, args } = action else {
                continue;
            };
            let Ok(candidates) = which::which_all(command) else {
                continue;
            };

            // Every match on PATH, so a bundled copy first on PATH does not hide a real one
            for resolved in candidates {
                let mut result = ctx.observed(self.kind());
                result.observed_path = Some(resolved.clone());
                if ctx.is_own(&result) {
                    own = Some(result);
                    continue;
                }

                let program = resolved.display().to_string();
                match ctx.runner.run(&program, args, None, ctx.cancel).await {
                    Ok(output) => {
                        result.version = parse_version(&output.text());
                        return Ok(Some(result));
                    }
                    Err(ProcessError::Failed { .. }) => {}
                    Err(e) => return Err(ctx.error(self.kind(), e.to_string())),
                }
            }
        }
        Ok(own)
    }
}

/// Checks `path_exists` actions
pub struct PathStrategy;

#[async_trait]
impl DetectionStrategy for PathStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Path
    }

    async fn detect(&self, ctx: &DetectionContext<'_>) -> Result<Option<DetectionResult>> {
        let mut own = None;
        for action in &ctx.component.verify_actions {
            if !matches!(action, VerifyAction::PathExists { .. }) {
                continue;
            }
            let outcome = check(action, ctx.runner, ctx.cancel).await;
            if !outcome.passed {
                continue;
            }
            let mut result = ctx.observed(self.kind());
            result.observed_path = outcome.observed_path;
            if ctx.is_own(&result) {
                own = Some(result);
                continue;
            }
            return Ok(Some(result));
        }
        Ok(own)
    }
}

/// Checks `env_var_set` actions
pub struct EnvVarStrategy;

#[async_trait]
impl DetectionStrategy for EnvVarStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::EnvVar
    }

    async fn detect(&self, ctx: &DetectionContext<'_>) -> Result<Option<DetectionResult>> {
        let mut own = None;
        for action in &ctx.component.verify_actions {
            let VerifyAction::EnvVarSet { name, .. } = action else {
                continue;
            };
            if !check(action, ctx.runner, ctx.cancel).await.passed {
                continue;
            }
            let mut result = ctx.observed(self.kind());
            // A variable pointing at a directory is subject to the self-reference guard
            result.observed_path = ctx
                .runner
                .env()
                .get(name)
                .map(PathBuf::from)
                .filter(|p| p.is_absolute());
            if ctx.is_own(&result) {
                own = Some(result);
                continue;
            }
            return Ok(Some(result));
        }
        Ok(own)
    }
}

/// First `major.minor[.patch]` in command output
pub fn parse_version(text: &str) -> Option<String> {
    VERSION_RE
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("git version 2.39.0", Some("2.39.0") ; "git")]
    #[test_case("Docker version 24.0.6, build ed223bc", Some("24.0.6") ; "docker")]
    #[test_case("flyctl v0.1.130", Some("0.1.130") ; "v prefix")]
    #[test_case("go1.22 linux/amd64", Some("1.22") ; "two parts")]
    #[test_case("no digits here", None ; "none")]
    fn test_parse_version(output: &str, expected: Option<&str>) {
        assert_eq!(parse_version(output).as_deref(), expected);
    }

    #[test]
    fn test_priority_follows_confidence() {
        let kinds = [
            StrategyKind::PackageInventory,
            StrategyKind::Command,
            StrategyKind::Path,
            StrategyKind::EnvVar,
        ];
        for pair in kinds.windows(2) {
            assert!(pair[0].priority() < pair[1].priority());
            assert!(pair[0].confidence() > pair[1].confidence());
        }
    }

    #[test]
    fn test_default_strategies_cover_every_kind() {
        let kinds: Vec<StrategyKind> = default_strategies().iter().map(|s| s.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                StrategyKind::PackageInventory,
                StrategyKind::Command,
                StrategyKind::Path,
                StrategyKind::EnvVar
            ]
        );
    }
}
