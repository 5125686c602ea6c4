//! Orchestrator integration tests
//!
//! - Provisioning a catalog in dependency waves
//! - Skipping dependents of failures and unknown targets
//! - Dependency cycles failing before any download or journal write
//! - Failure events for every surfaced error
//! - Single-component install, uninstall and status queries

#![cfg(unix)]

mod common;

use common::*;
use envsmith_core::types::{Component, ComponentState, InstallMethod};
use envsmith_core::Catalog;
use envsmith_engine::events::{EngineEvent, EventEnvelope, EventSink};
use envsmith_engine::install::InstallOutcome;
use envsmith_engine::orchestrator::{InstallOptions, Orchestrator, ProvisionResult};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

const BINARY: &[u8] = b"#!/bin/sh\necho ok\n";

async fn artifact_server() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(BINARY))
        .mount(&server)
        .await;
    server
}

/// Executable component served by `server`, verified by its installed file
fn executable(env: &TestEnv, server: &MockServer, id: &str, deps: &[&str]) -> Component {
    let target = env.path().join(format!("bin-{}", id));
    ComponentBuilder::new(id)
        .method(InstallMethod::Executable)
        .depends_on(deps)
        .source(
            &format!("{}/dl/{}-tool", server.uri(), id),
            Some(&sha256_hex(BINARY)),
        )
        .target_dir(&target)
        .verify_path(target.join(format!("{}-tool", id)))
        .build()
}

/// Manual component that verifies only when `present` is true
fn manual(env: &TestEnv, id: &str, deps: &[&str], present: bool) -> Component {
    let marker = env.path().join(format!("manual-{}", id));
    if present {
        std::fs::write(&marker, "x").unwrap();
    }
    ComponentBuilder::new(id)
        .depends_on(deps)
        .verify_path(marker)
        .build()
}

fn orchestrator(
    env: &TestEnv,
    components: Vec<Component>,
) -> (Orchestrator, mpsc::Receiver<EventEnvelope>) {
    let (sink, rx) = EventSink::channel(1024);
    let orchestrator = Orchestrator::new(
        Catalog::new(components),
        env.config.clone(),
        env.paths.clone(),
        sink,
    )
    .unwrap();
    (orchestrator, rx)
}

fn failure_events(events: &[EventEnvelope]) -> Vec<(String, String)> {
    events
        .iter()
        .filter_map(|e| match &e.event {
            EngineEvent::Failure {
                component_id, kind, ..
            } => Some((component_id.clone(), kind.clone())),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_provision_installs_in_dependency_order() {
    let env = TestEnv::new();
    let server = artifact_server().await;
    let components = vec![
        executable(&env, &server, "app", &["lib"]),
        executable(&env, &server, "lib", &["base"]),
        executable(&env, &server, "base", &[]),
        manual(&env, "present", &[], true),
    ];
    let (orchestrator, mut rx) = orchestrator(&env, components);

    let report = orchestrator
        .provision::<&str>(&[], &InstallOptions::default(), &CancellationToken::new())
        .await;

    assert!(report.is_success(), "failures: {:?}", report.failures().collect::<Vec<_>>());
    assert_eq!(report.resolution.order, vec!["base", "lib", "app", "present"]);
    assert!(matches!(
        report.outcome_for("present"),
        Some(ProvisionResult::AlreadyPresent {
            state: ComponentState::Detected
        })
    ));

    let completed: Vec<&str> = report
        .outcomes
        .iter()
        .map(|o| o.component_id.as_str())
        .filter(|id| *id != "present")
        .collect();
    assert_eq!(completed, vec!["base", "lib", "app"]);

    for id in ["base", "lib", "app"] {
        assert!(matches!(
            report.outcome_for(id),
            Some(ProvisionResult::Installed { .. })
        ));
        assert_eq!(
            orchestrator.get_status(id).await.unwrap().state,
            ComponentState::Installed
        );
    }

    // Artifacts are consumed by the install
    let leftovers = std::fs::read_dir(env.scratch()).unwrap().count();
    assert_eq!(leftovers, 0);
    assert!(failure_events(&drain_events(&mut rx)).is_empty());
}

#[tokio::test]
async fn test_dependents_of_failed_install_are_skipped() {
    let env = TestEnv::new();
    let server = artifact_server().await;
    let components = vec![
        manual(&env, "broken", &[], false),
        executable(&env, &server, "needs-broken", &["broken"]),
        executable(&env, &server, "chained", &["needs-broken"]),
        executable(&env, &server, "independent", &[]),
    ];
    let (orchestrator, mut rx) = orchestrator(&env, components);

    let report = orchestrator
        .provision(
            &["chained", "independent"],
            &InstallOptions::default(),
            &CancellationToken::new(),
        )
        .await;

    assert!(!report.is_success());
    assert!(matches!(
        report.outcome_for("broken"),
        Some(ProvisionResult::Failed { failure }) if failure.kind == "verification_failed"
    ));
    for id in ["needs-broken", "chained"] {
        match report.outcome_for(id) {
            Some(ProvisionResult::Skipped { failure }) => {
                assert_eq!(failure.kind, "dependency_failed");
                assert!(failure.remedy.is_some());
            }
            other => panic!("{} should be skipped, got {:?}", id, other),
        }
    }
    assert!(matches!(
        report.outcome_for("independent"),
        Some(ProvisionResult::Installed { .. })
    ));

    let failures = failure_events(&drain_events(&mut rx));
    assert!(failures.contains(&("broken".into(), "verification_failed".into())));
    assert!(failures.contains(&("needs-broken".into(), "dependency_failed".into())));
    assert!(failures.contains(&("chained".into(), "dependency_failed".into())));
    assert_eq!(
        orchestrator.get_status("broken").await.unwrap().state,
        ComponentState::Failed
    );
    assert_eq!(
        orchestrator.get_status("chained").await.unwrap().state,
        ComponentState::NotDetected
    );
}

#[tokio::test]
async fn test_unknown_and_unresolvable_targets_are_skipped() {
    let env = TestEnv::new();
    let components = vec![
        manual(&env, "orphan", &["ghost"], true),
        manual(&env, "fine", &[], true),
    ];
    let (orchestrator, mut rx) = orchestrator(&env, components);

    let report = orchestrator
        .provision(
            &["nope", "orphan", "fine"],
            &InstallOptions::default(),
            &CancellationToken::new(),
        )
        .await;

    let kind = |id: &str| report.outcome_for(id).and_then(|r| r.failure()).map(|f| f.kind.clone());
    assert_eq!(kind("nope").as_deref(), Some("unknown_component"));
    assert_eq!(kind("orphan").as_deref(), Some("missing_dependency"));
    assert!(report.outcome_for("fine").unwrap().is_success());

    let failures = failure_events(&drain_events(&mut rx));
    assert_eq!(failures.len(), 2);
}

#[tokio::test]
async fn test_cancelled_provision_starts_nothing() {
    let env = TestEnv::new();
    let server = artifact_server().await;
    let components = vec![
        executable(&env, &server, "a", &[]),
        executable(&env, &server, "b", &["a"]),
    ];
    let (orchestrator, _rx) = orchestrator(&env, components);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = orchestrator
        .provision::<&str>(&[], &InstallOptions::default(), &cancel)
        .await;

    assert_eq!(report.outcomes.len(), 2);
    for outcome in &report.outcomes {
        match &outcome.result {
            ProvisionResult::Skipped { failure } => assert_eq!(failure.kind, "cancelled"),
            other => panic!("expected skip, got {:?}", other),
        }
    }
    assert!(server.received_requests().await.unwrap_or_default().is_empty());
}

#[tokio::test]
async fn test_dependency_cycle_fails_before_any_work() {
    let env = TestEnv::new();
    let server = artifact_server().await;
    let components = vec![
        executable(&env, &server, "a", &["b"]),
        executable(&env, &server, "b", &["c"]),
        executable(&env, &server, "c", &["a"]),
    ];
    let (orchestrator, mut rx) = orchestrator(&env, components);

    let report = orchestrator
        .provision::<&str>(&[], &InstallOptions::default(), &CancellationToken::new())
        .await;

    assert!(report.resolution.order.is_empty());
    assert_eq!(report.outcomes.len(), 3);
    for id in ["a", "b", "c"] {
        let failure = report
            .outcome_for(id)
            .and_then(|r| r.failure())
            .unwrap_or_else(|| panic!("{} should be skipped", id));
        assert_eq!(failure.kind, "circular_dependency");
    }
    let first = report.outcome_for("a").and_then(|r| r.failure()).unwrap();
    assert!(
        first.message.contains("a -> b -> c -> a"),
        "message: {}",
        first.message
    );
    assert_eq!(
        failure_events(&drain_events(&mut rx))
            .iter()
            .filter(|(_, kind)| kind == "circular_dependency")
            .count(),
        3
    );

    let failure = orchestrator
        .install("a", &InstallOptions::default(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(failure.kind, "circular_dependency");
    assert_eq!(failure.component_id.as_deref(), Some("a"));
    assert!(failure.message.contains("a -> b -> c -> a"));
    assert!(failure.remedy.unwrap().contains("a -> b -> c -> a"));

    assert!(server.received_requests().await.unwrap_or_default().is_empty());
    assert_eq!(env.journal_entries(), 0);
    for id in ["a", "b", "c"] {
        assert!(!env.path().join(format!("bin-{}", id)).exists());
    }
}

#[tokio::test]
async fn test_install_requires_satisfied_dependencies() {
    let env = TestEnv::new();
    let server = artifact_server().await;
    let components = vec![
        manual(&env, "base", &[], false),
        executable(&env, &server, "app", &["base"]),
    ];
    let (orchestrator, _rx) = orchestrator(&env, components);

    let failure = orchestrator
        .install("app", &InstallOptions::default(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(failure.kind, "dependency_failed");
    assert_eq!(failure.component_id.as_deref(), Some("app"));
    assert!(server.received_requests().await.unwrap_or_default().is_empty());
}

#[tokio::test]
async fn test_install_then_uninstall_round_trip() {
    let env = TestEnv::new();
    let server = artifact_server().await;
    let component = executable(&env, &server, "tool", &[]);
    let target = component.install.target_dir.clone().unwrap();
    let (orchestrator, _rx) = orchestrator(&env, vec![component]);
    let cancel = CancellationToken::new();

    let outcome = orchestrator
        .install("tool", &InstallOptions::default(), &cancel)
        .await
        .unwrap();
    assert!(matches!(outcome, InstallOutcome::Committed { .. }));
    assert!(target.join("tool-tool").is_file());

    let again = orchestrator
        .install("tool", &InstallOptions::default(), &cancel)
        .await
        .unwrap();
    assert!(matches!(again, InstallOutcome::AlreadyInstalled { .. }));

    orchestrator.uninstall("tool", &cancel).await.unwrap();
    assert!(!target.exists());
    assert_eq!(
        orchestrator.get_status("tool").await.unwrap().state,
        ComponentState::NotDetected
    );
}

#[tokio::test]
async fn test_detect_whole_catalog_and_status_listing() {
    let env = TestEnv::new();
    let components = vec![
        manual(&env, "here", &[], true),
        manual(&env, "missing", &[], false),
    ];
    let (orchestrator, _rx) = orchestrator(&env, components);

    let reports = orchestrator
        .detect::<&str>(&[], &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].state, ComponentState::Detected);
    assert_eq!(reports[1].state, ComponentState::NotDetected);

    let statuses = orchestrator.all_status().await.unwrap();
    let ids: Vec<&str> = statuses.iter().map(|s| s.component_id.as_str()).collect();
    assert_eq!(ids, vec!["here", "missing"]);
    assert_eq!(statuses[0].state, ComponentState::Detected);

    assert!(orchestrator.get_status("nope").await.is_err());
    assert!(orchestrator
        .detect(&["nope"], &CancellationToken::new())
        .await
        .is_err());
}

#[test]
fn test_invalid_catalog_is_rejected() {
    let env = TestEnv::new();
    let bad = ComponentBuilder::new("bad id").build();
    let result = Orchestrator::new(
        Catalog::new(vec![bad]),
        env.config.clone(),
        env.paths.clone(),
        EventSink::disabled(),
    );
    assert!(result.is_err());
}
