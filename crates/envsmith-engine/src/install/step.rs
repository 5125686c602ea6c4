//! Forward install actions and their undo derivation

use super::process::{ProcessError, ProcessRunner};
use super::undo::{remove_path, UndoAction};
use anyhow::{bail, Context};
use envsmith_core::types::UninstallHint;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// One forward action in an install plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum StepAction {
    /// Ensure an empty destination directory, moving any existing one aside
    PrepareDestination { path: PathBuf },

    ExtractArchive {
        archive: PathBuf,
        destination: PathBuf,
    },

    CopyFile {
        source: PathBuf,
        destination: PathBuf,
        executable: bool,
    },

    RunProgram {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        /// Mark this file executable before running
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ensure_executable: Option<PathBuf>,
    },

    /// Set in the session environment and persist an `export` line to the profile
    SetEnvVar {
        name: String,
        value: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        profile: Option<PathBuf>,
    },

    WriteFile { path: PathBuf, contents: String },

    /// Non-mutating; logged for the operator
    ManualNote { message: String },
}

#[derive(Error, Debug)]
pub enum StepError {
    #[error("cancelled")]
    Cancelled,

    #[error("{0}")]
    Failed(String),
}

impl From<anyhow::Error> for StepError {
    fn from(err: anyhow::Error) -> Self {
        StepError::Failed(format!("{:#}", err))
    }
}

/// What a step needs to know about the running transaction
pub struct StepContext<'a> {
    pub component_id: &'a str,
    pub transaction_id: Uuid,
    pub uninstall_hint: Option<&'a UninstallHint>,
    pub package_name: &'a str,
    pub runner: &'a ProcessRunner,
    pub cancel: &'a CancellationToken,
}

impl StepAction {
    pub fn describe(&self) -> String {
        match self {
            StepAction::PrepareDestination { path } => {
                format!("prepare destination {}", path.display())
            }
            StepAction::ExtractArchive {
                archive,
                destination,
            } => format!(
                "extract {} into {}",
                file_name(archive),
                destination.display()
            ),
            StepAction::CopyFile {
                source,
                destination,
                ..
            } => format!("copy {} to {}", file_name(source), destination.display()),
            StepAction::RunProgram { program, args, .. } if args.is_empty() => {
                format!("run {}", program)
            }
            StepAction::RunProgram { program, args, .. } => {
                format!("run {} {}", program, args.join(" "))
            }
            StepAction::SetEnvVar { name, .. } => format!("set {}", name),
            StepAction::WriteFile { path, .. } => format!("write {}", path.display()),
            StepAction::ManualNote { message } => format!("note: {}", message),
        }
    }

    /// Compute the undo action before the step runs
    ///
    /// `created_paths` are paths earlier steps of the same transaction
    /// created; a program's undo falls back to removing them.
    pub async fn plan_undo(
        &self,
        ctx: &StepContext<'_>,
        created_paths: &[PathBuf],
    ) -> std::io::Result<Option<UndoAction>> {
        let undo = match self {
            StepAction::PrepareDestination { path }
            | StepAction::WriteFile { path, .. }
            | StepAction::CopyFile {
                destination: path, ..
            } => Some(replace_undo(path, ctx.transaction_id).await?),
            StepAction::ExtractArchive { destination, .. } => Some(UndoAction::RemovePath {
                path: destination.clone(),
            }),
            StepAction::RunProgram { .. } => Some(UndoAction::Uninstall {
                component_id: ctx.component_id.to_string(),
                hint: ctx.uninstall_hint.cloned(),
                package_name: ctx.package_name.to_string(),
                created_paths: created_paths.to_vec(),
            }),
            StepAction::SetEnvVar { name, value, profile } => Some(UndoAction::UnsetEnvVar {
                name: name.clone(),
                previous: ctx.runner.env().get(name),
                profile: profile.clone(),
                line: profile_line(name, value, ctx.component_id),
            }),
            StepAction::ManualNote { .. } => None,
        };
        Ok(undo)
    }

    /// Perform the forward action
    ///
    /// A failing action cleans up its own partial effects before returning;
    /// the undo recorded for it is never run.
    pub async fn execute(&self, ctx: &StepContext<'_>) -> Result<(), StepError> {
        match self {
            StepAction::PrepareDestination { path } => {
                replace_path(path, ctx.transaction_id, || async move {
                    tokio::fs::create_dir_all(path)
                        .await
                        .with_context(|| format!("failed to create {}", path.display()))
                })
                .await?;
            }
            StepAction::ExtractArchive {
                archive,
                destination,
            } => extract_into(archive, destination, ctx.transaction_id).await?,
            StepAction::CopyFile {
                source,
                destination,
                executable,
            } => {
                replace_path(destination, ctx.transaction_id, || async move {
                    if let Some(parent) = destination.parent() {
                        tokio::fs::create_dir_all(parent).await.with_context(|| {
                            format!("failed to create {}", parent.display())
                        })?;
                    }
                    tokio::fs::copy(source, destination).await.with_context(|| {
                        format!(
                            "failed to copy {} to {}",
                            source.display(),
                            destination.display()
                        )
                    })?;
                    if *executable {
                        make_executable(destination).await?;
                    }
                    Ok(())
                })
                .await?;
            }
            StepAction::RunProgram {
                program,
                args,
                ensure_executable,
            } => {
                if let Some(path) = ensure_executable {
                    make_executable(path).await?;
                }
                ctx.runner
                    .run(program, args, None, ctx.cancel)
                    .await
                    .map_err(|e| match e {
                        ProcessError::Cancelled { .. } => StepError::Cancelled,
                        other => {
                            let tail = other.output_tail();
                            if tail.is_empty() {
                                StepError::Failed(other.to_string())
                            } else {
                                StepError::Failed(format!("{}\n{}", other, tail.join("\n")))
                            }
                        }
                    })?;
            }
            StepAction::SetEnvVar {
                name,
                value,
                profile,
            } => {
                let env = ctx.runner.env();
                let previous = env.get(name);
                env.set(name, value);
                if let Some(profile) = profile {
                    if let Err(e) =
                        append_line(profile, &profile_line(name, value, ctx.component_id)).await
                    {
                        env.restore(name, previous.as_deref());
                        return Err(e.into());
                    }
                }
            }
            StepAction::WriteFile { path, contents } => {
                replace_path(path, ctx.transaction_id, || async move {
                    if let Some(parent) = path.parent() {
                        tokio::fs::create_dir_all(parent).await.with_context(|| {
                            format!("failed to create {}", parent.display())
                        })?;
                    }
                    tokio::fs::write(path, contents)
                        .await
                        .with_context(|| format!("failed to write {}", path.display()))
                })
                .await?;
            }
            StepAction::ManualNote { message } => {
                tracing::info!("{}: {}", ctx.component_id, message);
            }
        }
        Ok(())
    }
}

/// Sibling path an existing target is moved to for the duration of a transaction
pub fn backup_path(path: &Path, transaction_id: Uuid) -> PathBuf {
    sibling_path(path, "backup", transaction_id)
}

fn sibling_path(path: &Path, tag: &str, transaction_id: Uuid) -> PathBuf {
    let id = transaction_id.simple().to_string();
    path.with_file_name(format!(
        "{}.envsmith-{}-{}",
        file_name(path),
        tag,
        &id[..8]
    ))
}

async fn replace_undo(path: &Path, transaction_id: Uuid) -> std::io::Result<UndoAction> {
    if tokio::fs::try_exists(path).await? {
        Ok(UndoAction::RestoreBackup {
            backup: backup_path(path, transaction_id),
            original: path.to_path_buf(),
        })
    } else {
        Ok(UndoAction::RemovePath {
            path: path.to_path_buf(),
        })
    }
}

/// Returns the backup location when something was moved
async fn move_aside(path: &Path, transaction_id: Uuid) -> anyhow::Result<Option<PathBuf>> {
    if !tokio::fs::try_exists(path).await? {
        return Ok(None);
    }
    let backup = backup_path(path, transaction_id);
    remove_path(&backup).await?;
    tokio::fs::rename(path, &backup)
        .await
        .with_context(|| format!("failed to move {} aside", path.display()))?;
    Ok(Some(backup))
}

/// Move `path` aside, then write it; on failure the partial write is
/// removed and the original put back
async fn replace_path<F, Fut>(path: &Path, transaction_id: Uuid, write: F) -> anyhow::Result<()>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let backup = move_aside(path, transaction_id).await?;
    let result = write().await;
    if let Err(e) = &result {
        if let Err(cleanup) = discard_partial(path, backup.as_deref()).await {
            tracing::warn!(
                "Could not clean up {} after a failed write ({:#}): {}",
                path.display(),
                e,
                cleanup
            );
        }
    }
    result
}

async fn discard_partial(path: &Path, backup: Option<&Path>) -> std::io::Result<()> {
    remove_path(path).await?;
    if let Some(backup) = backup {
        tokio::fs::rename(backup, path).await?;
    }
    Ok(())
}

/// Unpack into a staging sibling, then move the entries into `destination`
async fn extract_into(
    archive: &Path,
    destination: &Path,
    transaction_id: Uuid,
) -> anyhow::Result<()> {
    let staging = sibling_path(destination, "staging", transaction_id);
    remove_path(&staging).await?;
    tokio::fs::create_dir_all(&staging)
        .await
        .with_context(|| format!("failed to create {}", staging.display()))?;

    let result: anyhow::Result<()> = async {
        extract_archive(archive, &staging).await?;
        tokio::fs::create_dir_all(destination)
            .await
            .with_context(|| format!("failed to create {}", destination.display()))?;
        move_entries(&staging, destination).await
    }
    .await;

    if let Err(e) = remove_path(&staging).await {
        tracing::warn!("Failed to remove {}: {}", staging.display(), e);
    }
    result
}

/// All or nothing: entries already moved are removed again on failure
async fn move_entries(from: &Path, to: &Path) -> anyhow::Result<()> {
    let mut moved: Vec<PathBuf> = Vec::new();
    let result: anyhow::Result<()> = async {
        let mut entries = tokio::fs::read_dir(from).await?;
        while let Some(entry) = entries.next_entry().await? {
            let target = to.join(entry.file_name());
            if tokio::fs::try_exists(&target).await? {
                bail!("{} already exists", target.display());
            }
            tokio::fs::rename(entry.path(), &target)
                .await
                .with_context(|| format!("failed to move {} into place", target.display()))?;
            moved.push(target);
        }
        Ok(())
    }
    .await;

    if result.is_err() {
        for path in &moved {
            if let Err(e) = remove_path(path).await {
                tracing::warn!("Failed to remove {}: {}", path.display(), e);
            }
        }
    }
    result
}

fn profile_line(name: &str, value: &str, component_id: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("export {}=\"{}\" # envsmith:{}", name, escaped, component_id)
}

async fn append_line(path: &Path, line: &str) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("failed to open {}", path.display()))?;
    file.write_all(format!("{}\n", line).as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

#[cfg(unix)]
async fn make_executable(path: &Path) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .await
        .with_context(|| format!("failed to mark {} executable", path.display()))
}

#[cfg(not(unix))]
async fn make_executable(_path: &Path) -> anyhow::Result<()> {
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArchiveFormat {
    TarGz,
    Tar,
    Zip,
}

fn archive_format(path: &Path) -> Option<ArchiveFormat> {
    let name = file_name(path).to_ascii_lowercase();
    if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        Some(ArchiveFormat::TarGz)
    } else if name.ends_with(".tar") {
        Some(ArchiveFormat::Tar)
    } else if name.ends_with(".zip") {
        Some(ArchiveFormat::Zip)
    } else {
        None
    }
}

async fn extract_archive(archive: &Path, destination: &Path) -> anyhow::Result<()> {
    let Some(format) = archive_format(archive) else {
        bail!(
            "unsupported archive format: {} (expected .tar.gz, .tgz, .tar or .zip)",
            file_name(archive)
        );
    };

    let archive = archive.to_path_buf();
    let dest = destination.to_path_buf();
    tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
        let file = std::fs::File::open(&archive)
            .with_context(|| format!("failed to open {}", archive.display()))?;
        match format {
            ArchiveFormat::TarGz => tar::Archive::new(flate2::read::GzDecoder::new(file))
                .unpack(&dest)
                .context("Failed to extract tarball"),
            ArchiveFormat::Tar => tar::Archive::new(file)
                .unpack(&dest)
                .context("Failed to extract tarball"),
            ArchiveFormat::Zip => zip::ZipArchive::new(file)
                .and_then(|mut zip| zip.extract(&dest))
                .context("Failed to extract zip archive"),
        }
    })
    .await
    .context("Extraction task failed")?
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
