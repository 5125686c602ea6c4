//! Install strategies, one per install method
//!
//! A strategy only plans. Step execution and undo derivation are shared by
//! the installer regardless of method.

use super::step::StepAction;
use crate::download::DownloadedArtifact;
use crate::error::{EngineError, Result};
use envsmith_core::types::{Component, InstallMethod};
use serde::Serialize;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Receipt file written into archive and executable targets
pub const RECEIPT_FILE: &str = ".envsmith-receipt.json";

/// Inputs a strategy plans from
pub struct PlanContext<'a> {
    pub component: &'a Component,
    pub artifact: Option<&'a DownloadedArtifact>,
    pub target_dir: PathBuf,
    pub env_profile: Option<PathBuf>,
    pub transaction_id: Uuid,
}

impl PlanContext<'_> {
    fn require_artifact(&self) -> Result<&DownloadedArtifact> {
        self.artifact.ok_or_else(|| {
            EngineError::configuration(format!(
                "'{}' ({}) requires a downloaded artifact",
                self.component.id, self.component.install_method
            ))
        })
    }

    /// One `SetEnvVar` per declared variable, sorted by name
    fn env_steps(&self) -> Vec<StepAction> {
        self.component
            .install
            .env
            .iter()
            .map(|(name, value)| StepAction::SetEnvVar {
                name: name.clone(),
                value: value.clone(),
                profile: self.env_profile.clone(),
            })
            .collect()
    }

    fn receipt_step(&self) -> Result<StepAction> {
        #[derive(Serialize)]
        struct Receipt<'r> {
            component_id: &'r str,
            version: Option<&'r str>,
            install_method: InstallMethod,
            transaction_id: Uuid,
            source_url: Option<&'r str>,
            installed_at: chrono::DateTime<chrono::Utc>,
        }

        let receipt = Receipt {
            component_id: &self.component.id,
            version: self.component.version.as_deref(),
            install_method: self.component.install_method,
            transaction_id: self.transaction_id,
            source_url: self.artifact.map(|a| a.url.as_str()),
            installed_at: chrono::Utc::now(),
        };
        let contents = serde_json::to_string_pretty(&receipt)
            .map_err(|e| EngineError::configuration(format!("failed to encode receipt: {}", e)))?;

        Ok(StepAction::WriteFile {
            path: self.target_dir.join(RECEIPT_FILE),
            contents,
        })
    }
}

pub trait InstallStrategy: Send + Sync {
    fn method(&self) -> InstallMethod;

    /// Ordered steps for this component
    fn plan(&self, ctx: &PlanContext<'_>) -> Result<Vec<StepAction>>;
}

/// Select the strategy for an install method
pub fn strategy_for(method: InstallMethod) -> Box<dyn InstallStrategy> {
    match method {
        InstallMethod::Archive => Box::new(ArchiveStrategy),
        InstallMethod::Executable => Box::new(ExecutableStrategy),
        InstallMethod::InstallerPackage => Box::new(InstallerPackageStrategy),
        InstallMethod::Script => Box::new(ScriptStrategy),
        InstallMethod::Manual => Box::new(ManualStrategy),
    }
}

/// Extract a tarball or zip into the target directory
pub struct ArchiveStrategy;

impl InstallStrategy for ArchiveStrategy {
    fn method(&self) -> InstallMethod {
        InstallMethod::Archive
    }

    fn plan(&self, ctx: &PlanContext<'_>) -> Result<Vec<StepAction>> {
        let artifact = ctx.require_artifact()?;
        let mut steps = vec![
            StepAction::PrepareDestination {
                path: ctx.target_dir.clone(),
            },
            StepAction::ExtractArchive {
                archive: artifact.path.clone(),
                destination: ctx.target_dir.clone(),
            },
        ];
        steps.extend(ctx.env_steps());
        steps.push(ctx.receipt_step()?);
        Ok(steps)
    }
}

/// Copy a single binary into the target directory
pub struct ExecutableStrategy;

impl InstallStrategy for ExecutableStrategy {
    fn method(&self) -> InstallMethod {
        InstallMethod::Executable
    }

    fn plan(&self, ctx: &PlanContext<'_>) -> Result<Vec<StepAction>> {
        let artifact = ctx.require_artifact()?;
        let mut steps = vec![
            StepAction::PrepareDestination {
                path: ctx.target_dir.clone(),
            },
            StepAction::CopyFile {
                source: artifact.path.clone(),
                destination: ctx.target_dir.join(&artifact.file_name),
                executable: true,
            },
        ];
        steps.extend(ctx.env_steps());
        steps.push(ctx.receipt_step()?);
        Ok(steps)
    }
}

/// Hand the artifact to the platform installer
pub struct InstallerPackageStrategy;

impl InstallerPackageStrategy {
    fn command_for(path: &Path, file_name: &str, extra: &[String]) -> StepAction {
        let path_arg = path.display().to_string();
        let lower = file_name.to_ascii_lowercase();
        let (program, mut args, ensure_executable) = match extension(&lower) {
            Some("deb") => ("dpkg".to_string(), vec!["-i".to_string(), path_arg], None),
            Some("rpm") => ("rpm".to_string(), vec!["-i".to_string(), path_arg], None),
            Some("msi") => (
                "msiexec".to_string(),
                vec!["/i".to_string(), path_arg, "/qn".to_string()],
                None,
            ),
            Some("pkg") => (
                "installer".to_string(),
                vec![
                    "-pkg".to_string(),
                    path_arg,
                    "-target".to_string(),
                    "/".to_string(),
                ],
                None,
            ),
            _ => (path_arg, Vec::new(), Some(path.to_path_buf())),
        };
        args.extend(extra.iter().cloned());
        StepAction::RunProgram {
            program,
            args,
            ensure_executable,
        }
    }
}

impl InstallStrategy for InstallerPackageStrategy {
    fn method(&self) -> InstallMethod {
        InstallMethod::InstallerPackage
    }

    fn plan(&self, ctx: &PlanContext<'_>) -> Result<Vec<StepAction>> {
        let artifact = ctx.require_artifact()?;
        let mut steps = vec![Self::command_for(
            &artifact.path,
            &artifact.file_name,
            &ctx.component.install.args,
        )];
        steps.extend(ctx.env_steps());
        Ok(steps)
    }
}

/// Run a downloaded script with the interpreter its extension implies
pub struct ScriptStrategy;

impl ScriptStrategy {
    fn command_for(path: &Path, file_name: &str, extra: &[String]) -> StepAction {
        let path_arg = path.display().to_string();
        let lower = file_name.to_ascii_lowercase();
        let (program, mut args): (&str, Vec<String>) = match extension(&lower) {
            Some("ps1") => (
                if cfg!(windows) { "powershell" } else { "pwsh" },
                vec![
                    "-NoProfile".to_string(),
                    "-ExecutionPolicy".to_string(),
                    "Bypass".to_string(),
                    "-File".to_string(),
                    path_arg,
                ],
            ),
            Some("py") => (if cfg!(windows) { "python" } else { "python3" }, vec![path_arg]),
            Some("cmd") | Some("bat") => ("cmd", vec!["/C".to_string(), path_arg]),
            _ => ("bash", vec![path_arg]),
        };
        args.extend(extra.iter().cloned());
        StepAction::RunProgram {
            program: program.to_string(),
            args,
            ensure_executable: None,
        }
    }
}

impl InstallStrategy for ScriptStrategy {
    fn method(&self) -> InstallMethod {
        InstallMethod::Script
    }

    fn plan(&self, ctx: &PlanContext<'_>) -> Result<Vec<StepAction>> {
        let artifact = ctx.require_artifact()?;
        let mut steps = vec![Self::command_for(
            &artifact.path,
            &artifact.file_name,
            &ctx.component.install.args,
        )];
        steps.extend(ctx.env_steps());
        Ok(steps)
    }
}

/// Nothing to run; verification decides whether the operator finished
pub struct ManualStrategy;

impl InstallStrategy for ManualStrategy {
    fn method(&self) -> InstallMethod {
        InstallMethod::Manual
    }

    fn plan(&self, ctx: &PlanContext<'_>) -> Result<Vec<StepAction>> {
        let mut message = format!("{} must be installed manually", ctx.component.id);
        if let Some(source) = &ctx.component.source {
            message.push_str(&format!(" (see {})", source.url));
        }
        let mut steps = vec![StepAction::ManualNote { message }];
        steps.extend(ctx.env_steps());
        Ok(steps)
    }
}

fn extension(file_name: &str) -> Option<&str> {
    Path::new(file_name).extension().and_then(|e| e.to_str())
}
