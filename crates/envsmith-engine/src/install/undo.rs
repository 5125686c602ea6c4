//! Undo actions recorded before each mutating step
//!
//! An undo action carries every parameter it needs, so a journal written
//! by a crashed process can be replayed by a fresh one.

use super::process::ProcessRunner;
use super::uninstall::{run_uninstall, UninstallPlan};
use crate::error::RollbackError;
use envsmith_core::types::UninstallHint;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "undo", rename_all = "snake_case")]
pub enum UndoAction {
    /// Delete a path the step created
    RemovePath { path: PathBuf },

    /// Put back what the step moved aside
    RestoreBackup { backup: PathBuf, original: PathBuf },

    /// Reverse a program run through the uninstall resolution chain
    Uninstall {
        component_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hint: Option<UninstallHint>,
        package_name: String,
        #[serde(default)]
        created_paths: Vec<PathBuf>,
    },

    /// Restore a session variable and drop its profile line
    UnsetEnvVar {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        previous: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        profile: Option<PathBuf>,
        line: String,
    },
}

impl UndoAction {
    pub fn describe(&self) -> String {
        match self {
            UndoAction::RemovePath { path } => format!("remove {}", path.display()),
            UndoAction::RestoreBackup { original, .. } => {
                format!("restore {}", original.display())
            }
            UndoAction::Uninstall { component_id, .. } => format!("uninstall {}", component_id),
            UndoAction::UnsetEnvVar { name, .. } => format!("unset {}", name),
        }
    }

    /// Execute the undo; missing paths count as already undone
    pub async fn execute(&self, runner: &ProcessRunner) -> Result<(), RollbackError> {
        let result: anyhow::Result<()> = match self {
            UndoAction::RemovePath { path } => remove_path(path).await.map_err(Into::into),
            UndoAction::RestoreBackup { backup, original } => {
                restore_backup(backup, original).await.map_err(Into::into)
            }
            UndoAction::Uninstall {
                component_id,
                hint,
                package_name,
                created_paths,
            } => run_uninstall(
                &UninstallPlan {
                    component_id,
                    hint: hint.as_ref(),
                    package_name,
                    created_paths,
                },
                runner,
                &CancellationToken::new(),
            )
            .await
            .map(|_| ()),
            UndoAction::UnsetEnvVar {
                name,
                previous,
                profile,
                line,
            } => {
                runner.env().restore(name, previous.as_deref());
                drop_profile_line(profile.as_deref(), line)
                    .await
                    .map_err(Into::into)
            }
        };

        result.map_err(|e| RollbackError {
            action: self.describe(),
            message: format!("{:#}", e),
        })
    }
}

pub(crate) async fn remove_path(path: &Path) -> io::Result<()> {
    let metadata = match tokio::fs::symlink_metadata(path).await {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    if metadata.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    }
}

/// No-op when the backup was never taken
async fn restore_backup(backup: &Path, original: &Path) -> io::Result<()> {
    if !tokio::fs::try_exists(backup).await? {
        return Ok(());
    }
    remove_path(original).await?;
    tokio::fs::rename(backup, original).await
}

async fn drop_profile_line(profile: Option<&Path>, line: &str) -> io::Result<()> {
    let Some(profile) = profile else {
        return Ok(());
    };
    let content = match tokio::fs::read_to_string(profile).await {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    let kept: Vec<&str> = content.lines().filter(|l| *l != line).collect();
    let mut rewritten = kept.join("\n");
    if !rewritten.is_empty() {
        rewritten.push('\n');
    }
    tokio::fs::write(profile, rewritten).await
}
