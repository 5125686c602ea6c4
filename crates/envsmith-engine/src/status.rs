//! Durable per-component status store
//!
//! One JSON file per component under `<state-dir>/status/`. Writers for the
//! same id serialize on an in-process async lock and an fs4 lock file, so
//! separate processes sharing a state dir also stay consistent. Writers for
//! different ids never contend. Files are replaced atomically
//! (temp file, fsync, rename).

use crate::error::{EngineError, Result};
use crate::events::{EngineEvent, EventSink};
use chrono::Utc;
use envsmith_core::types::{ComponentState, ComponentStatus};
use fs4::fs_std::FileExt;
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Outcome of a status update
#[derive(Debug, Clone, PartialEq)]
pub struct StatusTransition {
    pub old_state: ComponentState,
    pub status: ComponentStatus,
}

impl StatusTransition {
    pub fn changed(&self) -> bool {
        self.old_state != self.status.state
    }
}

pub struct StatusStore {
    dir: PathBuf,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    sink: EventSink,
}

impl StatusStore {
    /// Open (creating if needed) a store rooted at `dir`
    pub fn open(dir: impl Into<PathBuf>, sink: EventSink) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            locks: Mutex::new(HashMap::new()),
            sink,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn lock_for(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(id.to_string()).or_default())
    }

    /// Current status, or a fresh `NotDetected` record if none was written
    pub async fn get(&self, id: &str) -> Result<ComponentStatus> {
        validate_id(id)?;
        let path = status_path(&self.dir, id);
        tokio::task::spawn_blocking(move || read_status(&path))
            .await
            .map_err(|e| EngineError::status(format!("status read task failed: {}", e)))?
            .map(|status| status.unwrap_or_else(|| ComponentStatus::new(id)))
    }

    /// Every persisted status, sorted by id
    pub async fn all(&self) -> Result<Vec<ComponentStatus>> {
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<ComponentStatus>> {
            let mut statuses = Vec::new();
            for entry in fs::read_dir(&dir)? {
                let path = entry?.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                if let Some(status) = read_status(&path)? {
                    statuses.push(status);
                }
            }
            statuses.sort_by(|a, b| a.component_id.cmp(&b.component_id));
            Ok(statuses)
        })
        .await
        .map_err(|e| EngineError::status(format!("status scan task failed: {}", e)))?
    }

    /// Read-modify-write one component's status
    ///
    /// Emits `StatusChanged` when the state differs from before.
    pub async fn update<F>(&self, id: &str, mutate: F) -> Result<StatusTransition>
    where
        F: FnOnce(&mut ComponentStatus) + Send + 'static,
    {
        validate_id(id)?;
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let dir = self.dir.clone();
        let owned_id = id.to_string();
        let transition = tokio::task::spawn_blocking(move || write_locked(&dir, &owned_id, mutate))
            .await
            .map_err(|e| EngineError::status(format!("status write task failed: {}", e)))??;

        if transition.changed() {
            tracing::debug!(
                "{}: {} -> {}",
                id,
                transition.old_state,
                transition.status.state
            );
            self.sink
                .emit(EngineEvent::StatusChanged {
                    component_id: id.to_string(),
                    old_state: transition.old_state,
                    new_state: transition.status.state,
                })
                .await;
        }
        Ok(transition)
    }

    pub async fn mark_installed(&self, id: &str, version: Option<String>) -> Result<StatusTransition> {
        self.update(id, move |status| {
            let now = Utc::now();
            status.state = ComponentState::Installed;
            status.confidence = 1.0;
            if version.is_some() {
                status.version = version;
            }
            status.last_installed = Some(now);
            status.last_checked = Some(now);
            status.last_error = None;
        })
        .await
    }

    pub async fn mark_failed(&self, id: &str, error: impl Into<String>) -> Result<StatusTransition> {
        let error = error.into();
        self.update(id, move |status| {
            status.state = ComponentState::Failed;
            status.last_error = Some(error);
        })
        .await
    }

    /// Record an error without changing the state
    pub async fn record_error(&self, id: &str, error: impl Into<String>) -> Result<StatusTransition> {
        let error = error.into();
        self.update(id, move |status| status.last_error = Some(error))
            .await
    }

    pub async fn mark_not_detected(&self, id: &str) -> Result<StatusTransition> {
        self.update(id, |status| {
            status.state = ComponentState::NotDetected;
            status.confidence = 0.0;
            status.version = None;
            status.last_checked = Some(Utc::now());
            status.last_error = None;
        })
        .await
    }

    /// Persist the outcome of a detection pass
    pub async fn record_detection(
        &self,
        id: &str,
        state: ComponentState,
        confidence: f32,
        version: Option<String>,
    ) -> Result<StatusTransition> {
        self.update(id, move |status| {
            status.state = state;
            status.confidence = confidence;
            if version.is_some() || state == ComponentState::NotDetected {
                status.version = version;
            }
            status.last_checked = Some(Utc::now());
            if state != ComponentState::Failed {
                status.last_error = None;
            }
        })
        .await
    }
}

fn validate_id(id: &str) -> Result<()> {
    let safe = !id.is_empty()
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if safe {
        Ok(())
    } else {
        Err(EngineError::status(format!(
            "'{}' is not a filesystem-safe component id",
            id
        )))
    }
}

fn status_path(dir: &Path, id: &str) -> PathBuf {
    dir.join(format!("{}.json", id))
}

fn read_status(path: &Path) -> Result<Option<ComponentStatus>> {
    match fs::read_to_string(path) {
        Ok(content) => serde_json::from_str(&content).map(Some).map_err(|e| {
            EngineError::status(format!("corrupt status file {}: {}", path.display(), e))
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Blocking read-modify-write under the cross-process lock file
fn write_locked<F>(dir: &Path, id: &str, mutate: F) -> Result<StatusTransition>
where
    F: FnOnce(&mut ComponentStatus),
{
    let lock_file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(dir.join(format!("{}.lock", id)))?;
    lock_file.lock_exclusive()?;

    let path = status_path(dir, id);
    let mut status = read_status(&path)?.unwrap_or_else(|| ComponentStatus::new(id));
    let old_state = status.state;
    mutate(&mut status);
    status.component_id = id.to_string();

    let json = serde_json::to_vec_pretty(&status)
        .map_err(|e| EngineError::status(format!("failed to serialize status: {}", e)))?;
    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    temp.write_all(&json)?;
    temp.as_file().sync_all()?;
    temp.persist(&path).map_err(|e| EngineError::Io(e.error))?;

    Ok(StatusTransition { old_state, status })
}
