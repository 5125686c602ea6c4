//! Transactional installation
//!
//! One component per transaction: `Pending → Staged → Executing →
//! Verifying → {Committed | RolledBack}`. The undo for each mutating step
//! is recorded and journaled before the step runs, and any failure or
//! cancellation unwinds the undos of completed steps in LIFO order. A step
//! that fails cleans up after itself; its own undo never runs.

mod process;
mod step;
mod strategy;
mod transaction;
mod undo;
mod uninstall;

pub use process::{ProcessError, ProcessOutput, ProcessRunner, OUTPUT_TAIL_LINES};
pub use step::{backup_path, StepAction, StepContext, StepError};
pub use strategy::{strategy_for, InstallStrategy, PlanContext, RECEIPT_FILE};
pub use transaction::{
    InstallStep, InstallationTransaction, StepStatus, TransactionJournal, TransactionState,
    UndoRecord,
};
pub use undo::UndoAction;
pub use uninstall::{run_uninstall, UninstallMethod, UninstallPlan};

use crate::download::DownloadedArtifact;
use crate::env::EnvOverlay;
use crate::error::{EngineError, InstallationError, Result, RollbackError};
use crate::events::{report, ProgressCallback, ProgressStage, ProgressUpdate};
use crate::status::StatusStore;
use crate::verify::{expand_home, verify_any};
use envsmith_core::config::ResolvedPaths;
use envsmith_core::types::{Component, ComponentState, ComponentStatus, InstallMethod, RuntimeConfig};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Installer settings resolved from the runtime configuration
#[derive(Debug, Clone)]
pub struct InstallerConfig {
    pub install_root: PathBuf,
    pub env_profile: Option<PathBuf>,
    pub journal_dir: PathBuf,
    pub step_timeout: Duration,
    pub verify_timeout: Duration,
}

impl InstallerConfig {
    pub fn from_runtime(config: &RuntimeConfig, paths: &ResolvedPaths) -> Self {
        Self {
            install_root: paths.install_root.clone().into_std_path_buf(),
            env_profile: config
                .install
                .env_profile
                .as_ref()
                .map(|p| expand_home(p.as_std_path())),
            journal_dir: paths.journal_dir().into_std_path_buf(),
            step_timeout: Duration::from_secs(config.install.step_timeout_secs),
            verify_timeout: Duration::from_secs(config.detection.command_timeout_secs),
        }
    }

    /// Declared target directory, else `<install-root>/<id>`
    pub fn target_dir_for(&self, component: &Component) -> PathBuf {
        match &component.install.target_dir {
            Some(dir) => expand_home(dir),
            None => self.install_root.join(&component.id),
        }
    }
}

/// One install invocation
pub struct InstallRequest<'a> {
    pub component: &'a Component,
    pub artifact: Option<&'a DownloadedArtifact>,
    pub force: bool,
    pub cancel: CancellationToken,
    pub progress: Option<ProgressCallback>,
}

#[derive(Debug, Clone)]
pub enum InstallOutcome {
    Committed {
        transaction_id: Uuid,
        /// Steps performed, in order
        steps: Vec<String>,
        version: Option<String>,
    },
    /// Status was already `Installed` and `force` was not set; nothing ran
    AlreadyInstalled { status: ComponentStatus },
}

/// Transactions found in the journal at startup and unwound
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    pub rolled_back: Vec<String>,
    pub rollback_errors: Vec<RollbackError>,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.rolled_back.is_empty()
    }
}

enum Abort {
    Cancelled,
    Failed(InstallationError),
}

/// Which recorded undos a rollback replays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Unwind {
    /// Only steps whose forward action completed
    Completed,
    /// After a crash a `Started` step may have run, so it is undone too
    Recovery,
}

impl Unwind {
    fn covers(self, status: Option<StepStatus>) -> bool {
        match status {
            Some(StepStatus::Completed) => true,
            Some(StepStatus::Started) => self == Unwind::Recovery,
            _ => false,
        }
    }
}

/// Marks a component as having a live transaction until dropped
struct ActiveGuard {
    active: Arc<Mutex<HashSet<String>>>,
    component_id: String,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        active.remove(&self.component_id);
    }
}

pub struct TransactionalInstaller {
    config: InstallerConfig,
    status: Arc<StatusStore>,
    journal: TransactionJournal,
    active: Arc<Mutex<HashSet<String>>>,
    runner: ProcessRunner,
    verify_runner: ProcessRunner,
}

impl TransactionalInstaller {
    pub fn new(config: InstallerConfig, status: Arc<StatusStore>) -> Self {
        let journal = TransactionJournal::new(&config.journal_dir);
        let env = EnvOverlay::new();
        let runner = ProcessRunner::new(config.step_timeout).with_env(env.clone());
        let verify_runner = ProcessRunner::new(config.verify_timeout).with_env(env);
        Self {
            config,
            status,
            journal,
            active: Arc::new(Mutex::new(HashSet::new())),
            runner,
            verify_runner,
        }
    }

    /// Share a session environment with detection and verification
    pub fn with_env(mut self, env: EnvOverlay) -> Self {
        self.runner = self.runner.with_env(env.clone());
        self.verify_runner = self.verify_runner.with_env(env);
        self
    }

    pub fn config(&self) -> &InstallerConfig {
        &self.config
    }

    /// Variables set by committed installs this session
    pub fn env(&self) -> &EnvOverlay {
        self.runner.env()
    }

    fn begin(&self, component_id: &str) -> Result<ActiveGuard> {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if !active.insert(component_id.to_string()) {
            return Err(EngineError::TransactionInProgress {
                component: component_id.to_string(),
            });
        }
        Ok(ActiveGuard {
            active: Arc::clone(&self.active),
            component_id: component_id.to_string(),
        })
    }

    /// Install one component as an atomic unit
    pub async fn install(&self, request: InstallRequest<'_>) -> Result<InstallOutcome> {
        let component = request.component;
        let id = component.id.as_str();
        let progress = request.progress.as_ref();
        let cancel = &request.cancel;
        let _guard = self.begin(id)?;

        if !request.force {
            let status = self.status.get(id).await?;
            if status.state == ComponentState::Installed {
                tracing::info!("{} is already installed", id);
                return Ok(InstallOutcome::AlreadyInstalled { status });
            }
        }
        if cancel.is_cancelled() {
            return Err(EngineError::cancelled(id));
        }

        let mut tx = InstallationTransaction::new(id);
        let plan = strategy_for(component.install_method).plan(&PlanContext {
            component,
            artifact: request.artifact,
            target_dir: self.config.target_dir_for(component),
            env_profile: self.config.env_profile.clone(),
            transaction_id: tx.id,
        })?;
        tx.stage(plan)?;
        if let Err(e) = self.journal.save(&tx).await {
            return Err(EngineError::status(format!("failed to journal transaction: {:#}", e)));
        }
        report(
            progress,
            ProgressUpdate::stage(
                id,
                ProgressStage::Staging,
                format!("{} step(s) planned", tx.steps.len()),
            ),
        );

        tx.transition(TransactionState::Executing)?;
        let ctx = StepContext {
            component_id: id,
            transaction_id: tx.id,
            uninstall_hint: component.uninstall_hint.as_ref(),
            package_name: component.inventory_name(),
            runner: &self.runner,
            cancel,
        };

        let total = tx.steps.len();
        for index in 0..total {
            if cancel.is_cancelled() {
                return Err(self.abort(tx, Abort::Cancelled, progress).await);
            }

            let action = tx.steps[index].action.clone();
            let description = action.describe();
            report(
                progress,
                ProgressUpdate::stage(id, ProgressStage::Installing, description.clone())
                    .with_percent(((index * 100) / total.max(1)) as u8),
            );

            let created = tx.created_paths();
            let undo = match action.plan_undo(&ctx, &created).await {
                Ok(undo) => undo,
                Err(e) => {
                    tx.set_step_status(index, StepStatus::Failed);
                    let failure = InstallationError::StepFailed {
                        step: description,
                        message: format!("could not record undo: {}", e),
                    };
                    return Err(self.abort(tx, Abort::Failed(failure), progress).await);
                }
            };
            tx.record_undo(index, undo);
            if let Err(e) = self.journal.save(&tx).await {
                tx.set_step_status(index, StepStatus::Failed);
                let failure = InstallationError::StepFailed {
                    step: description,
                    message: format!("could not journal undo: {:#}", e),
                };
                return Err(self.abort(tx, Abort::Failed(failure), progress).await);
            }

            match action.execute(&ctx).await {
                Ok(()) => tx.set_step_status(index, StepStatus::Completed),
                Err(StepError::Cancelled) => {
                    tx.set_step_status(index, StepStatus::Failed);
                    return Err(self.abort(tx, Abort::Cancelled, progress).await);
                }
                Err(StepError::Failed(message)) => {
                    tracing::warn!("{}: step '{}' failed: {}", id, description, message);
                    tx.set_step_status(index, StepStatus::Failed);
                    let failure = InstallationError::StepFailed {
                        step: description,
                        message,
                    };
                    return Err(self.abort(tx, Abort::Failed(failure), progress).await);
                }
            }
        }

        tx.transition(TransactionState::Verifying)?;
        report(
            progress,
            ProgressUpdate::stage(id, ProgressStage::Verifying, "checking verify actions"),
        );
        if component.verify_actions.is_empty() {
            tracing::warn!("{} declares no verify actions; treating install as verified", id);
        }
        let verified = verify_any(&component.verify_actions, &self.verify_runner, cancel).await;
        if cancel.is_cancelled() {
            return Err(self.abort(tx, Abort::Cancelled, progress).await);
        }
        if !verified.passed() {
            let failure = InstallationError::VerificationFailed {
                checks: verified.checks,
            };
            return Err(self.abort(tx, Abort::Failed(failure), progress).await);
        }

        tx.transition(TransactionState::Committed)?;
        self.discard_backups(&tx).await;
        if let Err(e) = self.journal.remove(tx.id).await {
            tracing::warn!("Failed to clear journal for {}: {:#}", id, e);
        }
        self.status
            .mark_installed(id, component.version.clone())
            .await?;
        tracing::info!("Installed {} (transaction {})", id, tx.id);

        Ok(InstallOutcome::Committed {
            transaction_id: tx.id,
            steps: tx.trail(),
            version: component.version.clone(),
        })
    }

    /// Roll back, record the outcome and build the error to surface
    async fn abort(
        &self,
        mut tx: InstallationTransaction,
        reason: Abort,
        progress: Option<&ProgressCallback>,
    ) -> EngineError {
        let id = tx.component_id.clone();
        report(
            progress,
            ProgressUpdate::stage(&id, ProgressStage::RollingBack, "undoing completed steps"),
        );

        let rollback_errors = self.rollback(&mut tx, Unwind::Completed).await;
        if let Err(e) = tx.transition(TransactionState::RolledBack) {
            tracing::debug!("{}", e);
        }
        if let Err(e) = self.journal.remove(tx.id).await {
            tracing::warn!("Failed to clear journal for {}: {:#}", id, e);
        }

        let trail = tx.trail();
        let (error, recorded) = match reason {
            Abort::Cancelled => {
                let recorded = self.status.record_error(&id, "install cancelled").await;
                (
                    EngineError::Cancelled {
                        component: id.clone(),
                        trail,
                    },
                    recorded,
                )
            }
            Abort::Failed(source) => {
                let recorded = self.status.mark_failed(&id, source.to_string()).await;
                (
                    EngineError::Installation {
                        component: id.clone(),
                        source,
                        trail,
                        rollback_errors,
                    },
                    recorded,
                )
            }
        };
        if let Err(e) = recorded {
            tracing::warn!("Failed to record status for {}: {}", id, e);
        }
        error
    }

    /// Pop the undo stack, running the records `unwind` covers; failures
    /// are collected, not fatal
    async fn rollback(&self, tx: &mut InstallationTransaction, unwind: Unwind) -> Vec<RollbackError> {
        tracing::warn!("Rolling back transaction {} for {}", tx.id, tx.component_id);
        let mut errors = Vec::new();

        while let Some(record) = tx.pop_undo() {
            let status = tx.steps.get(record.step).map(|s| s.status);
            if !unwind.covers(status) {
                tracing::debug!(
                    "Not undoing step {} ({:?}): {}",
                    record.step,
                    status,
                    record.action.describe()
                );
                continue;
            }
            match record.action.execute(&self.runner).await {
                Ok(()) => tracing::debug!("Undid step {}: {}", record.step, record.action.describe()),
                Err(e) => {
                    tracing::warn!("Rollback step failed for {}: {}", tx.component_id, e);
                    errors.push(e);
                }
            }
            if let Err(e) = self.journal.save(tx).await {
                tracing::debug!("Failed to journal rollback progress: {:#}", e);
            }
        }
        errors
    }

    async fn discard_backups(&self, tx: &InstallationTransaction) {
        for record in &tx.undo_stack {
            if let UndoAction::RestoreBackup { backup, .. } = &record.action {
                if let Err(e) = undo::remove_path(backup).await {
                    tracing::warn!("Failed to remove backup {}: {}", backup.display(), e);
                }
            }
        }
    }

    /// Remove an installed component outside any transaction
    pub async fn uninstall(
        &self,
        component: &Component,
        cancel: &CancellationToken,
    ) -> Result<UninstallMethod> {
        let id = component.id.as_str();
        let _guard = self.begin(id)?;

        let created_paths = match component.install_method {
            InstallMethod::Archive | InstallMethod::Executable => {
                vec![self.config.target_dir_for(component)]
            }
            _ => Vec::new(),
        };
        let plan = UninstallPlan {
            component_id: id,
            hint: component.uninstall_hint.as_ref(),
            package_name: component.inventory_name(),
            created_paths: &created_paths,
        };

        let method = match run_uninstall(&plan, &self.runner, cancel).await {
            Ok(method) => method,
            Err(_) if cancel.is_cancelled() => return Err(EngineError::cancelled(id)),
            Err(e) => {
                return Err(EngineError::Rollback {
                    component: id.to_string(),
                    errors: vec![RollbackError {
                        action: format!("uninstall {}", id),
                        message: format!("{:#}", e),
                    }],
                })
            }
        };

        for name in component.install.env.keys() {
            self.runner.env().unset(name);
        }
        if let Some(profile) = &self.config.env_profile {
            if let Err(e) = strip_profile_lines(profile, id).await {
                tracing::warn!("Failed to clean {}: {}", profile.display(), e);
            }
        }

        self.status.mark_not_detected(id).await?;
        tracing::info!("Uninstalled {} via {}", id, method);
        Ok(method)
    }

    /// Roll back transactions a previous process left unfinished
    pub async fn recover_incomplete(&self) -> Result<RecoveryReport> {
        let pending = self
            .journal
            .load_all()
            .await
            .map_err(|e| EngineError::status(format!("failed to read transaction journal: {:#}", e)))?;

        let mut report = RecoveryReport::default();
        for mut tx in pending {
            if tx.state.is_terminal() {
                if let Err(e) = self.journal.remove(tx.id).await {
                    tracing::warn!("Failed to clear finished journal {}: {:#}", tx.id, e);
                }
                continue;
            }

            let _guard = self.begin(&tx.component_id)?;
            tracing::warn!(
                "Found interrupted transaction {} for {} ({}); rolling back",
                tx.id,
                tx.component_id,
                tx.state
            );
            report
                .rollback_errors
                .extend(self.rollback(&mut tx, Unwind::Recovery).await);
            if let Err(e) = tx.transition(TransactionState::RolledBack) {
                tracing::debug!("{}", e);
            }
            if let Err(e) = self.journal.remove(tx.id).await {
                tracing::warn!("Failed to clear journal {}: {:#}", tx.id, e);
            }
            if let Err(e) = self
                .status
                .record_error(&tx.component_id, "interrupted install was rolled back")
                .await
            {
                tracing::warn!("Failed to record recovery for {}: {}", tx.component_id, e);
            }
            report.rolled_back.push(tx.component_id.clone());
        }
        Ok(report)
    }
}

/// Drop every `export` line tagged for `component_id`
async fn strip_profile_lines(profile: &Path, component_id: &str) -> std::io::Result<()> {
    let content = match tokio::fs::read_to_string(profile).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    let marker = format!("# envsmith:{}", component_id);
    let kept: Vec<&str> = content
        .lines()
        .filter(|line| !line.trim_end().ends_with(&marker))
        .collect();
    if kept.len() == content.lines().count() {
        return Ok(());
    }
    let mut rewritten = kept.join("\n");
    if !rewritten.is_empty() {
        rewritten.push('\n');
    }
    tokio::fs::write(profile, rewritten).await
}
