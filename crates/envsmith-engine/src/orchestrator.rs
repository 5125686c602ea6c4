//! Provisioning facade
//!
//! Wires the resolver, detection, downloads, the installer and the status
//! store behind one cloneable handle. Every failure surfaced here is also
//! published as a `Failure` event.

use crate::detection::{DetectionEngine, DetectionReport};
use crate::download::{DownloadManager, DownloadRequest};
use crate::env::EnvOverlay;
use crate::error::{EngineError, Failure, Result};
use crate::events::{report, EngineEvent, EventSink, ProgressCallback, ProgressStage, ProgressUpdate};
use crate::install::{
    InstallOutcome, InstallRequest, InstallerConfig, RecoveryReport, TransactionalInstaller,
    UninstallMethod,
};
use crate::resolver::{DependencyResolver, Resolution};
use crate::status::StatusStore;
use envsmith_core::config::ResolvedPaths;
use envsmith_core::types::{Component, ComponentState, ComponentStatus, RuntimeConfig};
use envsmith_core::Catalog;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Per-call install options
#[derive(Clone, Default)]
pub struct InstallOptions {
    /// Reinstall even when the component is already installed
    pub force: bool,
    /// Forwarded verbatim through download and install
    pub progress: Option<ProgressCallback>,
}

impl InstallOptions {
    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = Some(progress);
        self
    }
}

/// What happened to one component during a provision run
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProvisionResult {
    Installed {
        transaction_id: Uuid,
        #[serde(skip_serializing_if = "Option::is_none")]
        version: Option<String>,
    },
    AlreadyPresent { state: ComponentState },
    Failed { failure: Failure },
    /// Never attempted because resolution or a dependency failed
    Skipped { failure: Failure },
}

impl ProvisionResult {
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            ProvisionResult::Installed { .. } | ProvisionResult::AlreadyPresent { .. }
        )
    }

    pub fn failure(&self) -> Option<&Failure> {
        match self {
            ProvisionResult::Failed { failure } | ProvisionResult::Skipped { failure } => {
                Some(failure)
            }
            _ => None,
        }
    }

    fn from_install(result: std::result::Result<InstallOutcome, Failure>) -> Self {
        match result {
            Ok(InstallOutcome::Committed {
                transaction_id,
                version,
                ..
            }) => ProvisionResult::Installed {
                transaction_id,
                version,
            },
            Ok(InstallOutcome::AlreadyInstalled { status }) => ProvisionResult::AlreadyPresent {
                state: status.state,
            },
            Err(failure) => ProvisionResult::Failed { failure },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentOutcome {
    pub component_id: String,
    #[serde(flatten)]
    pub result: ProvisionResult,
}

/// Outcome of a provision run
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProvisionReport {
    pub resolution: Resolution,
    /// In completion order
    pub outcomes: Vec<ComponentOutcome>,
}

impl ProvisionReport {
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|o| o.result.is_success())
    }

    pub fn outcome_for(&self, id: &str) -> Option<&ProvisionResult> {
        self.outcomes
            .iter()
            .find(|o| o.component_id == id)
            .map(|o| &o.result)
    }

    pub fn failures(&self) -> impl Iterator<Item = &Failure> {
        self.outcomes.iter().filter_map(|o| o.result.failure())
    }
}

struct Inner {
    catalog: Catalog,
    config: RuntimeConfig,
    sink: EventSink,
    status: Arc<StatusStore>,
    detection: DetectionEngine,
    downloads: DownloadManager,
    installer: TransactionalInstaller,
}

/// Cloneable handle to the provisioning engine
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Build every engine part from a validated catalog
    pub fn new(
        catalog: Catalog,
        config: RuntimeConfig,
        paths: ResolvedPaths,
        sink: EventSink,
    ) -> Result<Self> {
        let problems = catalog.validate();
        if !problems.is_empty() {
            let listed: Vec<String> = problems.iter().map(|e| e.to_string()).collect();
            return Err(EngineError::configuration(format!(
                "invalid catalog:\n  {}",
                listed.join("\n  ")
            )));
        }

        let status = Arc::new(StatusStore::open(
            paths.status_dir().into_std_path_buf(),
            sink.clone(),
        )?);
        let env = EnvOverlay::new();
        let detection =
            DetectionEngine::new(&config, &paths, Arc::clone(&status)).with_env(env.clone());
        let downloads = DownloadManager::new(
            &config,
            paths.scratch_dir.clone().into_std_path_buf(),
            sink.clone(),
        )?;
        let installer = TransactionalInstaller::new(
            InstallerConfig::from_runtime(&config, &paths),
            Arc::clone(&status),
        )
        .with_env(env);

        tracing::debug!(
            "Orchestrator ready: {} component(s), state dir {}",
            catalog.len(),
            paths.state_dir
        );

        Ok(Self {
            inner: Arc::new(Inner {
                catalog,
                config,
                sink,
                status,
                detection,
                downloads,
                installer,
            }),
        })
    }

    pub fn catalog(&self) -> &Catalog {
        &self.inner.catalog
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn status_store(&self) -> &StatusStore {
        &self.inner.status
    }

    fn component(&self, id: &str) -> Result<&Component> {
        self.inner
            .catalog
            .get(id)
            .ok_or_else(|| EngineError::UnknownComponent(id.to_string()))
    }

    /// Roll back transactions a crashed process left behind
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let report = self.inner.installer.recover_incomplete().await?;
        for id in &report.rolled_back {
            self.inner.detection.invalidate(id);
        }
        Ok(report)
    }

    /// Install order for the whole catalog
    pub fn resolve(&self) -> Resolution {
        DependencyResolver::new(&self.inner.catalog).resolve()
    }

    /// Install order for `targets` and their transitive dependencies
    pub fn resolve_for<S: AsRef<str>>(&self, targets: &[S]) -> Result<Resolution> {
        DependencyResolver::new(&self.inner.catalog).resolve_for(targets)
    }

    /// Detect the listed components, or the whole catalog when `ids` is empty
    pub async fn detect<S: AsRef<str>>(
        &self,
        ids: &[S],
        cancel: &CancellationToken,
    ) -> Result<Vec<DetectionReport>> {
        let components: Vec<&Component> = if ids.is_empty() {
            self.inner.catalog.iter().collect()
        } else {
            ids.iter()
                .map(|id| self.component(id.as_ref()))
                .collect::<Result<_>>()?
        };
        Ok(self.inner.detection.detect_many(&components, cancel).await)
    }

    pub async fn get_status(&self, id: &str) -> Result<ComponentStatus> {
        self.component(id)?;
        self.inner.status.get(id).await
    }

    /// Status of every catalog component, in catalog order
    pub async fn all_status(&self) -> Result<Vec<ComponentStatus>> {
        let mut statuses = Vec::with_capacity(self.inner.catalog.len());
        for component in self.inner.catalog.iter() {
            statuses.push(self.inner.status.get(&component.id).await?);
        }
        Ok(statuses)
    }

    /// Install one component whose dependencies are already satisfied
    pub async fn install(
        &self,
        id: &str,
        options: &InstallOptions,
        cancel: &CancellationToken,
    ) -> std::result::Result<InstallOutcome, Failure> {
        match self.install_component(id, options, cancel).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => Err(self.publish_failure(id, &e).await),
        }
    }

    async fn install_component(
        &self,
        id: &str,
        options: &InstallOptions,
        cancel: &CancellationToken,
    ) -> Result<InstallOutcome> {
        let inner = &self.inner;
        let component = self.component(id)?;
        if cancel.is_cancelled() {
            return Err(EngineError::cancelled(id));
        }

        let progress = inner.sink.progress_callback(options.progress.clone());
        report(
            Some(&progress),
            ProgressUpdate::stage(id, ProgressStage::Resolving, "checking dependencies"),
        );
        let resolution = self.resolve_for(&[id])?;
        if let Some(failure) = resolution.failure_for(id) {
            return Err(failure.to_error());
        }
        self.check_dependencies(component, cancel).await?;

        if !options.force {
            report(
                Some(&progress),
                ProgressUpdate::stage(id, ProgressStage::Detecting, "checking current state"),
            );
            let detected = inner.detection.detect(component, cancel).await;
            if matches!(
                detected.state,
                ComponentState::Installed | ComponentState::Detected
            ) {
                let status = inner.status.get(id).await?;
                tracing::info!("{} is already {}", id, detected.state);
                return Ok(InstallOutcome::AlreadyInstalled { status });
            }
        }

        let artifact = if component.needs_artifact() {
            let request = DownloadRequest::for_component(component)?
                .with_progress(Arc::clone(&progress))
                .with_cancel(cancel.clone());
            Some(inner.downloads.download(request).await?)
        } else {
            None
        };

        let result = inner
            .installer
            .install(InstallRequest {
                component,
                artifact: artifact.as_ref(),
                force: options.force,
                cancel: cancel.clone(),
                progress: Some(progress),
            })
            .await;

        if let Some(artifact) = &artifact {
            artifact.discard().await;
        }
        inner.detection.invalidate(id);
        result
    }

    /// Every dependency must be Installed or Detected
    async fn check_dependencies(
        &self,
        component: &Component,
        cancel: &CancellationToken,
    ) -> Result<()> {
        for dependency in &component.dependencies {
            let status = self.inner.status.get(dependency).await?;
            if status.state.satisfies_dependents() {
                continue;
            }
            let dep = self.component(dependency)?;
            let detected = self.inner.detection.detect(dep, cancel).await;
            if !detected.state.satisfies_dependents() {
                return Err(EngineError::DependencyFailed {
                    component: component.id.clone(),
                    dependency: dependency.clone(),
                });
            }
        }
        Ok(())
    }

    /// Remove an installed component and reset its status to NotDetected
    pub async fn uninstall(
        &self,
        id: &str,
        cancel: &CancellationToken,
    ) -> std::result::Result<UninstallMethod, Failure> {
        let result = async {
            let component = self.component(id)?;
            let method = self.inner.installer.uninstall(component, cancel).await;
            self.inner.detection.invalidate(id);
            method
        }
        .await;

        match result {
            Ok(method) => Ok(method),
            Err(e) => Err(self.publish_failure(id, &e).await),
        }
    }

    async fn publish_failure(&self, id: &str, error: &EngineError) -> Failure {
        let mut failure = error.to_failure();
        if failure.component_id.is_none() {
            failure.component_id = Some(id.to_string());
        }
        tracing::error!("{}", failure.message);
        self.inner
            .sink
            .emit(EngineEvent::failure(id, &failure))
            .await;
        failure
    }

    /// Install `targets` (or the whole catalog) in dependency waves
    ///
    /// A component starts once every dependency is satisfied. Dependents of a
    /// failure are skipped with `DependencyFailed`. At most
    /// `max-parallel-installs` installs run at once.
    pub async fn provision<S: AsRef<str>>(
        &self,
        targets: &[S],
        options: &InstallOptions,
        cancel: &CancellationToken,
    ) -> ProvisionReport {
        let mut report = ProvisionReport::default();

        let (known, unknown): (Vec<&str>, Vec<&str>) = targets
            .iter()
            .map(AsRef::as_ref)
            .partition(|id| self.inner.catalog.contains(id));
        for id in unknown {
            let failure = self
                .publish_failure(id, &EngineError::UnknownComponent(id.to_string()))
                .await;
            report.outcomes.push(ComponentOutcome {
                component_id: id.to_string(),
                result: ProvisionResult::Skipped { failure },
            });
        }
        if known.is_empty() && !targets.is_empty() {
            return report;
        }

        let resolution = if known.is_empty() {
            self.resolve()
        } else {
            match self.resolve_for(&known) {
                Ok(resolution) => resolution,
                Err(e) => {
                    tracing::error!("{}", e);
                    return report;
                }
            }
        };

        let mut failed: HashSet<String> = HashSet::new();
        for failure in &resolution.failures {
            let id = failure.component();
            let failure = self.publish_failure(id, &failure.to_error()).await;
            failed.insert(id.to_string());
            report.outcomes.push(ComponentOutcome {
                component_id: id.to_string(),
                result: ProvisionResult::Skipped { failure },
            });
        }

        self.run_waves(&resolution.order, failed, options, cancel, &mut report)
            .await;
        report.resolution = resolution;
        report
    }

    async fn run_waves(
        &self,
        order: &[String],
        mut failed: HashSet<String>,
        options: &InstallOptions,
        cancel: &CancellationToken,
        report: &mut ProvisionReport,
    ) {
        let max_parallel = self.inner.config.concurrency.max_parallel_installs.max(1);
        let deps: HashMap<&str, Vec<&str>> = order
            .iter()
            .filter_map(|id| self.inner.catalog.get(id))
            .map(|c| {
                (
                    c.id.as_str(),
                    c.dependencies.iter().map(String::as_str).collect(),
                )
            })
            .collect();

        let mut waiting: Vec<&str> = order.iter().map(String::as_str).collect();
        let mut satisfied: HashSet<String> = HashSet::new();
        let mut running: JoinSet<std::result::Result<InstallOutcome, Failure>> = JoinSet::new();
        let mut task_ids: HashMap<tokio::task::Id, String> = HashMap::new();

        loop {
            // Skip anything downstream of a failure, then start whatever is ready
            let mut index = 0;
            while index < waiting.len() {
                let id = waiting[index];
                let requires = deps.get(id).map(Vec::as_slice).unwrap_or(&[]);

                if let Some(dependency) = requires.iter().find(|d| failed.contains(**d)) {
                    let error = EngineError::DependencyFailed {
                        component: id.to_string(),
                        dependency: dependency.to_string(),
                    };
                    let failure = self.publish_failure(id, &error).await;
                    failed.insert(id.to_string());
                    report.outcomes.push(ComponentOutcome {
                        component_id: id.to_string(),
                        result: ProvisionResult::Skipped { failure },
                    });
                    waiting.remove(index);
                    // Restart: this may unblock more skips earlier in the list
                    index = 0;
                    continue;
                }

                let ready = requires.iter().all(|d| satisfied.contains(*d));
                if ready && running.len() < max_parallel && !cancel.is_cancelled() {
                    let orchestrator = self.clone();
                    let options = options.clone();
                    let cancel = cancel.clone();
                    let owned = id.to_string();
                    let handle = running.spawn(async move {
                        orchestrator.install(&owned, &options, &cancel).await
                    });
                    task_ids.insert(handle.id(), id.to_string());
                    waiting.remove(index);
                    continue;
                }
                index += 1;
            }

            let Some(joined) = running.join_next_with_id().await else {
                break;
            };
            let (id, result) = match joined {
                Ok((task, result)) => (task_ids.remove(&task).unwrap_or_default(), result),
                Err(e) => {
                    let id = task_ids.remove(&e.id()).unwrap_or_default();
                    tracing::error!("Install task for {} aborted: {}", id, e);
                    let error = EngineError::status(format!("install task aborted: {}", e));
                    (id.clone(), Err(self.publish_failure(&id, &error).await))
                }
            };

            let result = ProvisionResult::from_install(result);
            if result.is_success() {
                satisfied.insert(id.clone());
            } else {
                failed.insert(id.clone());
            }
            report.outcomes.push(ComponentOutcome {
                component_id: id,
                result,
            });
        }

        // Whatever never started was cut off by cancellation
        for id in waiting {
            let failure = self
                .publish_failure(id, &EngineError::cancelled(id))
                .await;
            report.outcomes.push(ComponentOutcome {
                component_id: id.to_string(),
                result: ProvisionResult::Skipped { failure },
            });
        }
    }
}
