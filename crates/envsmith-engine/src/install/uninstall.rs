//! Uninstall resolution
//!
//! Tried in order: the declared hint, then whichever platform package
//! manager reports the package installed, then deleting only the paths
//! envsmith itself created.

use super::process::ProcessRunner;
use super::undo::remove_path;
use crate::platform::PackageManager;
use anyhow::{Context, Result};
use envsmith_core::types::UninstallHint;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const INVENTORY_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Inputs for one uninstall
#[derive(Debug, Clone, Copy)]
pub struct UninstallPlan<'a> {
    pub component_id: &'a str,
    pub hint: Option<&'a UninstallHint>,
    pub package_name: &'a str,
    pub created_paths: &'a [PathBuf],
}

/// How the component was removed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UninstallMethod {
    Hint,
    PackageManager(PackageManager),
    /// Only envsmith-created paths were removed; the result may be partial
    CreatedPaths { removed: usize },
}

impl fmt::Display for UninstallMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UninstallMethod::Hint => write!(f, "uninstall hint"),
            UninstallMethod::PackageManager(pm) => write!(f, "{}", pm),
            UninstallMethod::CreatedPaths { removed } => {
                write!(f, "removed {} created path(s)", removed)
            }
        }
    }
}

pub async fn run_uninstall(
    plan: &UninstallPlan<'_>,
    runner: &ProcessRunner,
    cancel: &CancellationToken,
) -> Result<UninstallMethod> {
    if let Some(hint) = plan.hint {
        tracing::info!("Uninstalling {} via declared hint", plan.component_id);
        runner
            .run(&hint.command, &hint.args, None, cancel)
            .await
            .with_context(|| format!("uninstall hint for {} failed", plan.component_id))?;
        return Ok(UninstallMethod::Hint);
    }

    let query_runner = runner.with_timeout(INVENTORY_QUERY_TIMEOUT);
    for pm in PackageManager::available() {
        let (program, args) = pm.query_command(plan.package_name);
        let installed = match query_runner.run(&program, &args, None, cancel).await {
            Ok(output) => pm.parse_version(plan.package_name, &output.text()).is_some(),
            Err(e) => {
                tracing::debug!("{} query for {} failed: {}", pm, plan.package_name, e);
                false
            }
        };
        if !installed {
            continue;
        }

        tracing::info!("Uninstalling {} via {}", plan.component_id, pm);
        let (program, args) = pm.remove_command(plan.package_name);
        runner
            .run(&program, &args, None, cancel)
            .await
            .with_context(|| format!("{} could not remove {}", pm, plan.package_name))?;
        return Ok(UninstallMethod::PackageManager(pm));
    }

    tracing::warn!(
        "No uninstaller found for {}; removing only paths envsmith created. Full rollback could not be guaranteed",
        plan.component_id
    );
    let mut removed = 0;
    for path in plan.created_paths {
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            remove_path(path)
                .await
                .with_context(|| format!("failed to remove {}", path.display()))?;
            removed += 1;
        }
    }
    Ok(UninstallMethod::CreatedPaths { removed })
}
