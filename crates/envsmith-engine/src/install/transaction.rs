//! Installation transactions and their on-disk journal

use super::step::StepAction;
use super::undo::UndoAction;
use crate::error::{EngineError, Result};
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    Pending,
    Staged,
    Executing,
    Verifying,
    Committed,
    RolledBack,
}

impl TransactionState {
    fn can_transition_to(self, next: TransactionState) -> bool {
        use TransactionState::*;
        matches!(
            (self, next),
            (Pending, Staged)
                | (Staged, Executing)
                | (Executing, Verifying)
                | (Verifying, Committed)
                | (Pending | Staged | Executing | Verifying, RolledBack)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TransactionState::Committed | TransactionState::RolledBack)
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransactionState::Pending => "pending",
            TransactionState::Staged => "staged",
            TransactionState::Executing => "executing",
            TransactionState::Verifying => "verifying",
            TransactionState::Committed => "committed",
            TransactionState::RolledBack => "rolled_back",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    /// Undo recorded, forward action not yet finished
    Started,
    Completed,
    Failed,
}

/// A forward action paired with its recorded undo
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallStep {
    pub action: StepAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub undo: Option<UndoAction>,
    pub status: StepStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UndoRecord {
    pub step: usize,
    pub action: UndoAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallationTransaction {
    pub id: Uuid,
    pub component_id: String,
    pub state: TransactionState,
    pub steps: Vec<InstallStep>,
    pub undo_stack: Vec<UndoRecord>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InstallationTransaction {
    pub fn new(component_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            component_id: component_id.into(),
            state: TransactionState::Pending,
            steps: Vec::new(),
            undo_stack: Vec::new(),
            started_at: now,
            updated_at: now,
        }
    }

    pub fn transition(&mut self, next: TransactionState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(EngineError::configuration(format!(
                "transaction {} for '{}' cannot move from {} to {}",
                self.id, self.component_id, self.state, next
            )));
        }
        tracing::debug!(
            "Transaction {} ({}): {} -> {}",
            self.id,
            self.component_id,
            self.state,
            next
        );
        self.state = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Attach the planned steps and move to `Staged`
    pub fn stage(&mut self, actions: Vec<StepAction>) -> Result<()> {
        self.steps = actions
            .into_iter()
            .map(|action| InstallStep {
                action,
                undo: None,
                status: StepStatus::Pending,
            })
            .collect();
        self.transition(TransactionState::Staged)
    }

    /// Push the undo for `step` before its forward action runs
    pub fn record_undo(&mut self, step: usize, undo: Option<UndoAction>) {
        if let Some(action) = &undo {
            self.undo_stack.push(UndoRecord {
                step,
                action: action.clone(),
            });
        }
        if let Some(s) = self.steps.get_mut(step) {
            s.undo = undo;
            s.status = StepStatus::Started;
        }
        self.updated_at = Utc::now();
    }

    pub fn set_step_status(&mut self, step: usize, status: StepStatus) {
        if let Some(s) = self.steps.get_mut(step) {
            s.status = status;
        }
        self.updated_at = Utc::now();
    }

    pub fn pop_undo(&mut self) -> Option<UndoRecord> {
        self.undo_stack.pop()
    }

    /// Steps attempted so far, in order
    pub fn trail(&self) -> Vec<String> {
        self.steps
            .iter()
            .filter(|s| s.status != StepStatus::Pending)
            .map(|s| {
                let outcome = match s.status {
                    StepStatus::Completed => "ok",
                    StepStatus::Failed => "failed",
                    _ => "interrupted",
                };
                format!("{} [{}]", s.action.describe(), outcome)
            })
            .collect()
    }

    /// Paths this transaction created from nothing
    pub fn created_paths(&self) -> Vec<PathBuf> {
        self.undo_stack
            .iter()
            .filter_map(|r| match &r.action {
                UndoAction::RemovePath { path } => Some(path.clone()),
                _ => None,
            })
            .collect()
    }
}

/// Persists in-flight transactions so a crash can be rolled back later
#[derive(Debug, Clone)]
pub struct TransactionJournal {
    dir: PathBuf,
}

impl TransactionJournal {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    /// Atomic write: temp file, fsync, rename
    pub async fn save(&self, tx: &InstallationTransaction) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec_pretty(tx).context("failed to encode transaction")?;
        let dir = self.dir.clone();
        let path = self.path_for(tx.id);

        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
            let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
            tmp.write_all(&bytes)?;
            tmp.as_file().sync_all()?;
            tmp.persist(&path)
                .with_context(|| format!("failed to persist {}", path.display()))?;
            Ok(())
        })
        .await
        .context("journal writer panicked")?
    }

    pub async fn remove(&self, id: Uuid) -> anyhow::Result<()> {
        match tokio::fs::remove_file(self.path_for(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context("failed to remove journal entry"),
        }
    }

    /// Every journaled transaction; unreadable entries are skipped with a warning
    pub async fn load_all(&self) -> anyhow::Result<Vec<InstallationTransaction>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).context("failed to read journal directory"),
        };

        let mut transactions = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let parsed = tokio::fs::read(&path)
                .await
                .map_err(anyhow::Error::from)
                .and_then(|bytes| {
                    serde_json::from_slice::<InstallationTransaction>(&bytes).map_err(Into::into)
                });
            match parsed {
                Ok(tx) => transactions.push(tx),
                Err(e) => tracing::warn!("Skipping unreadable journal {}: {}", path.display(), e),
            }
        }
        transactions.sort_by_key(|tx| tx.started_at);
        Ok(transactions)
    }
}
