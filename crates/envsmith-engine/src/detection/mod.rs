//! Component detection
//!
//! Strategies run concurrently per component. Results that point inside
//! envsmith's own directories are discarded, the survivor with the highest
//! confidence wins (ties go to strategy priority), and the outcome is
//! reconciled with the persisted status.

mod cache;
mod guard;
mod strategies;

pub use cache::DetectionCache;
pub use guard::SelfGuard;
pub use strategies::{
    default_strategies, parse_version, CommandStrategy, DetectionContext, DetectionStrategy,
    EnvVarStrategy, PackageInventoryStrategy, PathStrategy, StrategyKind,
};

use crate::env::EnvOverlay;
use crate::install::ProcessRunner;
use crate::status::StatusStore;
use chrono::{DateTime, Utc};
use envsmith_core::config::ResolvedPaths;
use envsmith_core::types::{Component, ComponentState, RuntimeConfig};
use futures::future::join_all;
use serde::Serialize;
use std::cmp::Ordering;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// One strategy's observation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionResult {
    pub component_id: String,
    pub state: ComponentState,
    pub confidence: f32,
    pub strategy: StrategyKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_path: Option<PathBuf>,
    pub timestamp: DateTime<Utc>,
}

impl DetectionResult {
    pub fn observed(component_id: &str, strategy: StrategyKind) -> Self {
        Self {
            component_id: component_id.to_string(),
            state: ComponentState::Detected,
            confidence: strategy.confidence(),
            strategy,
            version: None,
            observed_path: None,
            timestamp: Utc::now(),
        }
    }

    /// Highest confidence first, then strategy priority
    fn rank(&self, other: &Self) -> Ordering {
        other
            .confidence
            .partial_cmp(&self.confidence)
            .unwrap_or(Ordering::Equal)
            .then_with(|| self.strategy.priority().cmp(&other.strategy.priority()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObservedVersion {
    pub strategy: StrategyKind,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StrategyFailure {
    pub strategy: StrategyKind,
    pub message: String,
}

/// Merged detection outcome for one component
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionReport {
    pub component_id: String,
    pub state: ComponentState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub winner: Option<DetectionResult>,
    /// Surviving results, best first
    pub results: Vec<DetectionResult>,
    /// Results rejected because they observed envsmith's own files
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub discarded: Vec<DetectionResult>,
    /// Every version seen when surviving results disagree
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub version_conflicts: Vec<ObservedVersion>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub strategy_errors: Vec<StrategyFailure>,
    pub checked_at: DateTime<Utc>,
}

impl DetectionReport {
    pub fn empty(component_id: &str, state: ComponentState) -> Self {
        Self {
            component_id: component_id.to_string(),
            state,
            winner: None,
            results: Vec::new(),
            discarded: Vec::new(),
            version_conflicts: Vec::new(),
            strategy_errors: Vec::new(),
            checked_at: Utc::now(),
        }
    }

    pub fn confidence(&self) -> f32 {
        self.winner.as_ref().map(|w| w.confidence).unwrap_or(0.0)
    }

    pub fn version(&self) -> Option<&str> {
        self.winner.as_ref().and_then(|w| w.version.as_deref())
    }
}

/// Parse `1.2`, `v1.2.3` or `1.2.3-4` loosely
pub fn parse_lenient_version(raw: &str) -> Option<semver::Version> {
    let trimmed = raw.trim().trim_start_matches('v');
    if let Ok(v) = semver::Version::parse(trimmed) {
        return Some(v);
    }
    let core = parse_version(trimmed)?;
    let padded = match core.matches('.').count() {
        1 => format!("{}.0", core),
        _ => core,
    };
    semver::Version::parse(&padded).ok()
}

/// State for a winning observation against the desired version
fn derive_state(component: &Component, winner: Option<&DetectionResult>) -> ComponentState {
    let Some(winner) = winner else {
        return ComponentState::NotDetected;
    };
    let outdated = match (component.version.as_deref(), winner.version.as_deref()) {
        (Some(desired), Some(observed)) => {
            match (parse_lenient_version(desired), parse_lenient_version(observed)) {
                // Distro revision suffixes are not upstream prereleases
                (Some(desired), Some(observed)) => {
                    semver::Version::new(observed.major, observed.minor, observed.patch)
                        < semver::Version::new(desired.major, desired.minor, desired.patch)
                }
                _ => false,
            }
        }
        _ => false,
    };
    if outdated {
        ComponentState::NeedsUpdate
    } else {
        ComponentState::Detected
    }
}

pub struct DetectionEngine {
    strategies: Vec<Arc<dyn DetectionStrategy>>,
    guard: SelfGuard,
    cache: DetectionCache,
    pool: Arc<Semaphore>,
    runner: ProcessRunner,
    status: Arc<StatusStore>,
}

impl DetectionEngine {
    pub fn new(config: &RuntimeConfig, paths: &ResolvedPaths, status: Arc<StatusStore>) -> Self {
        Self {
            strategies: default_strategies(),
            guard: SelfGuard::for_paths(config, paths),
            cache: DetectionCache::new(Duration::from_secs(config.detection.cache_ttl_secs)),
            pool: Arc::new(Semaphore::new(config.concurrency.max_parallel_detections.max(1))),
            runner: ProcessRunner::new(Duration::from_secs(config.detection.command_timeout_secs)),
            status,
        }
    }

    /// Replace the strategy set
    pub fn with_strategies(mut self, strategies: Vec<Arc<dyn DetectionStrategy>>) -> Self {
        self.strategies = strategies;
        self
    }

    /// Replace the set of paths that never count as an external install
    pub fn with_guard(mut self, guard: SelfGuard) -> Self {
        self.guard = guard;
        self
    }

    /// Share the installer's session environment
    pub fn with_env(mut self, env: EnvOverlay) -> Self {
        self.runner = self.runner.with_env(env);
        self
    }

    pub fn guard(&self) -> &SelfGuard {
        &self.guard
    }

    pub fn invalidate(&self, component_id: &str) {
        self.cache.invalidate(component_id);
    }

    /// Detect one component, serving from cache within the TTL
    pub async fn detect(&self, component: &Component, cancel: &CancellationToken) -> DetectionReport {
        if let Some(report) = self.cache.get(&component.id) {
            tracing::debug!("Detection cache hit for {}", component.id);
            return report;
        }

        let _permit = self.pool.acquire().await.ok();
        let ctx = DetectionContext {
            component,
            runner: &self.runner,
            guard: &self.guard,
            cancel,
        };

        let outcomes = join_all(self.strategies.iter().map(|strategy| {
            let ctx = &ctx;
            async move { (strategy.kind(), strategy.detect(ctx).await) }
        }))
        .await;

        let mut report = self.merge(component, outcomes);
        self.reconcile(component, &mut report).await;
        self.cache.insert(report.clone());
        report
    }

    /// Detect several components on the bounded pool; output follows input order
    pub async fn detect_many(
        &self,
        components: &[&Component],
        cancel: &CancellationToken,
    ) -> Vec<DetectionReport> {
        join_all(components.iter().map(|c| self.detect(c, cancel))).await
    }

    fn merge(
        &self,
        component: &Component,
        outcomes: Vec<(StrategyKind, crate::error::Result<Option<DetectionResult>>)>,
    ) -> DetectionReport {
        let mut report = DetectionReport::empty(&component.id, ComponentState::NotDetected);

        for (kind, outcome) in outcomes {
            match outcome {
                Ok(Some(result)) => {
                    let own = result
                        .observed_path
                        .as_deref()
                        .is_some_and(|p| self.guard.covers(p));
                    if own {
                        tracing::debug!(
                            "Ignoring {} result for {}: {} is inside envsmith's own directories",
                            kind,
                            component.id,
                            result.observed_path.as_deref().map(|p| p.display().to_string()).unwrap_or_default()
                        );
                        report.discarded.push(result);
                    } else {
                        report.results.push(result);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!("{}", e);
                    report.strategy_errors.push(StrategyFailure {
                        strategy: kind,
                        message: e.to_string(),
                    });
                }
            }
        }

        report.results.sort_by(|a, b| a.rank(b));
        report.winner = report.results.first().cloned();

        let versions: Vec<ObservedVersion> = report
            .results
            .iter()
            .filter_map(|r| {
                r.version.clone().map(|version| ObservedVersion {
                    strategy: r.strategy,
                    version,
                })
            })
            .collect();
        let first = versions.first().map(|v| v.version.clone());
        if versions.iter().any(|v| Some(&v.version) != first.as_ref()) {
            report.version_conflicts = versions;
        }

        report.state = derive_state(component, report.winner.as_ref());
        report
    }

    /// Fold the persisted status into the report and store the outcome
    async fn reconcile(&self, component: &Component, report: &mut DetectionReport) {
        let id = component.id.as_str();
        let persisted = match self.status.get(id).await {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!("Could not read status for {}: {}", id, e);
                return;
            }
        };

        match (persisted.state, report.state) {
            (ComponentState::Installed, ComponentState::Detected) => {
                report.state = ComponentState::Installed;
            }
            (ComponentState::Installed, ComponentState::NotDetected) => {
                tracing::warn!("{} was installed but is no longer observed", id);
            }
            (ComponentState::Failed, ComponentState::NotDetected) => {
                report.state = ComponentState::Failed;
            }
            _ => {}
        }

        let version = report
            .version()
            .map(str::to_string)
            .or_else(|| match report.state {
                ComponentState::Installed => persisted.version.clone(),
                _ => None,
            });
        if let Err(e) = self
            .status
            .record_detection(id, report.state, report.confidence(), version)
            .await
        {
            tracing::warn!("Could not record detection for {}: {}", id, e);
        }
    }
}
