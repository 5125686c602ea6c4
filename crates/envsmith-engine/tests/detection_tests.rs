//! Detection engine integration tests
//!
//! - Merging results from concurrent strategies
//! - Rejection of observations inside envsmith's own directories
//! - Strategy failures that do not affect other strategies
//! - Version comparison, caching and status reconciliation

#![cfg(unix)]

mod common;

use async_trait::async_trait;
use common::*;
use envsmith_core::types::{Component, ComponentState};
use envsmith_engine::detection::{
    CommandStrategy, DetectionContext, DetectionEngine, DetectionResult, DetectionStrategy,
    PathStrategy, SelfGuard, StrategyKind,
};
use envsmith_engine::error::{EngineError, Result};
use envsmith_engine::events::{EngineEvent, EventSink};
use envsmith_engine::status::StatusStore;
use envsmith_engine::EnvOverlay;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn engine(env: &TestEnv, status: Arc<StatusStore>) -> DetectionEngine {
    DetectionEngine::new(&env.config, &env.paths, status)
}

/// Always errors, as a broken package manager would
struct BrokenStrategy;

#[async_trait]
impl DetectionStrategy for BrokenStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::PackageInventory
    }

    async fn detect(&self, ctx: &DetectionContext<'_>) -> Result<Option<DetectionResult>> {
        Err(EngineError::Detection {
            component: ctx.component.id.clone(),
            strategy: self.kind().to_string(),
            message: "inventory database is locked".into(),
        })
    }
}

/// Reports a fixed version under the given strategy kind
struct FixedVersion(StrategyKind, &'static str);

#[async_trait]
impl DetectionStrategy for FixedVersion {
    fn kind(&self) -> StrategyKind {
        self.0
    }

    async fn detect(&self, ctx: &DetectionContext<'_>) -> Result<Option<DetectionResult>> {
        let mut result = DetectionResult::observed(&ctx.component.id, self.0);
        result.version = Some(self.1.to_string());
        Ok(Some(result))
    }
}

async fn detect(engine: &DetectionEngine, component: &Component) -> envsmith_engine::DetectionReport {
    engine.detect(component, &CancellationToken::new()).await
}

#[tokio::test]
async fn test_highest_confidence_result_wins() {
    let env = TestEnv::new();
    let overlay = EnvOverlay::new();
    overlay.set("ENVSMITH_TEST_DETECT_HOME", "relative/value");
    let engine = engine(&env, env.status_store(EventSink::disabled())).with_env(overlay);
    let marker = env.path().join("opt/tool");
    std::fs::create_dir_all(&marker).unwrap();

    let component = ComponentBuilder::new("tool")
        .verify_env("ENVSMITH_TEST_DETECT_HOME")
        .verify_path(&marker)
        .build();
    let report = detect(&engine, &component).await;

    assert_eq!(report.state, ComponentState::Detected);
    let winner = report.winner.as_ref().unwrap();
    assert_eq!(winner.strategy, StrategyKind::Path);
    assert_eq!(winner.observed_path.as_deref(), Some(marker.as_path()));
    assert_eq!(report.results.len(), 2);
    assert_eq!(report.results[1].strategy, StrategyKind::EnvVar);
    assert!((report.confidence() - 0.70).abs() < f32::EPSILON);
}

#[tokio::test]
async fn test_command_version_drives_needs_update() {
    let env = TestEnv::new();
    let engine = engine(&env, env.status_store(EventSink::disabled()));

    let outdated = ComponentBuilder::new("old")
        .version("3.0.0")
        .verify_command("sh", &["-c", "echo tool version 2.3.4"])
        .build();
    let report = detect(&engine, &outdated).await;
    assert_eq!(report.state, ComponentState::NeedsUpdate);
    assert_eq!(report.version(), Some("2.3.4"));
    assert_eq!(report.winner.as_ref().unwrap().strategy, StrategyKind::Command);

    let current = ComponentBuilder::new("current")
        .version("2.3")
        .verify_command("sh", &["-c", "echo tool version 2.3.4"])
        .build();
    assert_eq!(detect(&engine, &current).await.state, ComponentState::Detected);
}

#[tokio::test]
async fn test_own_directories_are_not_external_installs() {
    let env = TestEnv::new();
    let engine = engine(&env, env.status_store(EventSink::disabled()));
    let staged = env.scratch().join("tool");
    std::fs::create_dir_all(&staged).unwrap();

    let component = ComponentBuilder::new("tool").verify_path(&staged).build();
    let report = detect(&engine, &component).await;

    assert_eq!(report.state, ComponentState::NotDetected);
    assert!(report.winner.is_none());
    assert_eq!(report.discarded.len(), 1);
    assert_eq!(report.discarded[0].strategy, StrategyKind::Path);
}

#[tokio::test]
async fn test_own_copy_does_not_hide_real_install() {
    let env = TestEnv::new();
    let engine = engine(&env, env.status_store(EventSink::disabled()))
        .with_strategies(vec![Arc::new(PathStrategy)]);
    let bundled = env.scratch().join("tool");
    let real = env.path().join("opt/tool");
    std::fs::create_dir_all(&bundled).unwrap();
    std::fs::create_dir_all(&real).unwrap();

    let component = ComponentBuilder::new("tool")
        .verify_path(&bundled)
        .verify_path(&real)
        .build();
    let report = detect(&engine, &component).await;

    assert_eq!(report.state, ComponentState::Detected);
    let winner = report.winner.as_ref().unwrap();
    assert_eq!(winner.observed_path.as_deref(), Some(real.as_path()));
    assert!(report.discarded.is_empty());
}

#[tokio::test]
async fn test_one_satisfied_alternative_is_enough() {
    let env = TestEnv::new();
    let engine = engine(&env, env.status_store(EventSink::disabled()));
    let present = env.path().join("present");
    std::fs::write(&present, "x").unwrap();

    let component = ComponentBuilder::new("tool")
        .verify_path(env.path().join("absent"))
        .verify_command("envsmith-test-no-such-binary", &[])
        .verify_path(&present)
        .build();
    let report = detect(&engine, &component).await;

    assert_eq!(report.state, ComponentState::Detected);
    assert_eq!(report.winner.as_ref().unwrap().strategy, StrategyKind::Path);
}

#[tokio::test]
async fn test_tool_beside_own_executable_is_detected() {
    use std::os::unix::fs::PermissionsExt;

    let env = TestEnv::new();
    let bin = env.path().join("shared-bin");
    std::fs::create_dir_all(&bin).unwrap();
    let own = bin.join("envsmith");
    let tool = bin.join("tool");
    for (path, output) in [(&own, "envsmith 0.1.0"), (&tool, "tool 2.0.1")] {
        std::fs::write(path, format!("#!/bin/sh\necho {}\n", output)).unwrap();
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    let engine = engine(&env, env.status_store(EventSink::disabled()))
        .with_strategies(vec![Arc::new(CommandStrategy)])
        .with_guard(SelfGuard::new(vec![], vec![own.clone()]));

    let neighbour = ComponentBuilder::new("tool")
        .verify_command(tool.to_str().unwrap(), &[])
        .build();
    let report = detect(&engine, &neighbour).await;
    assert_eq!(report.state, ComponentState::Detected);
    assert_eq!(report.version(), Some("2.0.1"));

    let itself = ComponentBuilder::new("envsmith")
        .verify_command(own.to_str().unwrap(), &[])
        .build();
    let report = detect(&engine, &itself).await;
    assert_eq!(report.state, ComponentState::NotDetected);
    assert_eq!(report.discarded.len(), 1);
}

#[tokio::test]
async fn test_failing_strategy_is_isolated() {
    let env = TestEnv::new();
    let engine = engine(&env, env.status_store(EventSink::disabled()))
        .with_strategies(vec![Arc::new(BrokenStrategy), Arc::new(PathStrategy)]);
    let marker = env.path().join("present");
    std::fs::write(&marker, "x").unwrap();

    let component = ComponentBuilder::new("tool").verify_path(&marker).build();
    let report = detect(&engine, &component).await;

    assert_eq!(report.state, ComponentState::Detected);
    assert_eq!(report.strategy_errors.len(), 1);
    assert_eq!(report.strategy_errors[0].strategy, StrategyKind::PackageInventory);
    assert!(report.strategy_errors[0].message.contains("locked"));
}

#[tokio::test]
async fn test_disagreeing_versions_are_reported() {
    let env = TestEnv::new();
    let engine = engine(&env, env.status_store(EventSink::disabled())).with_strategies(vec![
        Arc::new(FixedVersion(StrategyKind::Command, "1.4.0")),
        Arc::new(FixedVersion(StrategyKind::PackageInventory, "1.2.0")),
    ]);

    let component = ComponentBuilder::new("tool").build();
    let report = detect(&engine, &component).await;

    assert_eq!(report.winner.as_ref().unwrap().strategy, StrategyKind::PackageInventory);
    assert_eq!(report.version(), Some("1.2.0"));
    assert_eq!(report.version_conflicts.len(), 2);
}

#[tokio::test]
async fn test_cache_serves_until_invalidated() {
    let mut env = TestEnv::new();
    env.config.detection.cache_ttl_secs = 300;
    let engine = engine(&env, env.status_store(EventSink::disabled()));
    let marker = env.path().join("later");
    let component = ComponentBuilder::new("tool").verify_path(&marker).build();

    assert_eq!(detect(&engine, &component).await.state, ComponentState::NotDetected);
    std::fs::write(&marker, "x").unwrap();
    assert_eq!(detect(&engine, &component).await.state, ComponentState::NotDetected);

    engine.invalidate("tool");
    assert_eq!(detect(&engine, &component).await.state, ComponentState::Detected);
}

#[tokio::test]
async fn test_installed_component_stays_installed_when_observed() {
    let env = TestEnv::new();
    let status = env.status_store(EventSink::disabled());
    status
        .mark_installed("tool", Some("1.0.0".into()))
        .await
        .unwrap();
    let engine = engine(&env, status.clone());
    let marker = env.path().join("tool");
    std::fs::write(&marker, "x").unwrap();

    let component = ComponentBuilder::new("tool").verify_path(&marker).build();
    let report = detect(&engine, &component).await;

    assert_eq!(report.state, ComponentState::Installed);
    let stored = status.get("tool").await.unwrap();
    assert_eq!(stored.state, ComponentState::Installed);
    assert_eq!(stored.version.as_deref(), Some("1.0.0"));
}

#[tokio::test]
async fn test_removed_install_is_recorded_as_not_detected() {
    let env = TestEnv::new();
    let (sink, mut rx) = EventSink::channel(32);
    let status = env.status_store(sink);
    status.mark_installed("tool", None).await.unwrap();
    drain_events(&mut rx);

    let engine = engine(&env, status.clone());
    let component = ComponentBuilder::new("tool")
        .verify_path(env.path().join("gone"))
        .build();
    let report = detect(&engine, &component).await;

    assert_eq!(report.state, ComponentState::NotDetected);
    assert_eq!(
        status.get("tool").await.unwrap().state,
        ComponentState::NotDetected
    );
    let events = drain_events(&mut rx);
    assert!(events.iter().any(|e| e.event
        == EngineEvent::StatusChanged {
            component_id: "tool".into(),
            old_state: ComponentState::Installed,
            new_state: ComponentState::NotDetected,
        }));
}

#[tokio::test]
async fn test_failed_component_keeps_failure_until_observed() {
    let env = TestEnv::new();
    let status = env.status_store(EventSink::disabled());
    status.mark_failed("tool", "step failed").await.unwrap();
    let engine = engine(&env, status.clone());

    let marker = env.path().join("tool");
    let component = ComponentBuilder::new("tool").verify_path(&marker).build();
    assert_eq!(detect(&engine, &component).await.state, ComponentState::Failed);
    let stored = status.get("tool").await.unwrap();
    assert_eq!(stored.state, ComponentState::Failed);
    assert_eq!(stored.last_error.as_deref(), Some("step failed"));

    std::fs::write(&marker, "x").unwrap();
    assert_eq!(detect(&engine, &component).await.state, ComponentState::Detected);
    assert!(status.get("tool").await.unwrap().last_error.is_none());
}

#[tokio::test]
async fn test_detect_many_preserves_input_order() {
    let env = TestEnv::new();
    let engine = engine(&env, env.status_store(EventSink::disabled()));
    let present = env.path().join("present");
    std::fs::write(&present, "x").unwrap();

    let components: Vec<Component> = (0..6)
        .map(|i| {
            let builder = ComponentBuilder::new(&format!("c{}", i));
            if i % 2 == 0 {
                builder.verify_path(&present).build()
            } else {
                builder.build()
            }
        })
        .collect();
    let refs: Vec<&Component> = components.iter().collect();

    let reports = engine.detect_many(&refs, &CancellationToken::new()).await;
    let ids: Vec<&str> = reports.iter().map(|r| r.component_id.as_str()).collect();
    assert_eq!(ids, vec!["c0", "c1", "c2", "c3", "c4", "c5"]);
    for (i, report) in reports.iter().enumerate() {
        let expected = if i % 2 == 0 {
            ComponentState::Detected
        } else {
            ComponentState::NotDetected
        };
        assert_eq!(report.state, expected);
    }
}
