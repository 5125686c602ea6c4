//! Transactional install lifecycle integration tests
//!
//! - Archive and executable installs that commit
//! - Rollback after step and verification failures, in reverse order,
//!   without undoing the step that failed
//! - Cancellation of a running installer process
//! - Recovery of journaled transactions left by a crashed process
//! - Uninstall through hints and created-path removal

#![cfg(unix)]

mod common;

use common::*;
use envsmith_core::types::{ComponentState, InstallMethod};
use envsmith_engine::error::EngineError;
use envsmith_engine::events::EventSink;
use envsmith_engine::install::{
    InstallOutcome, InstallRequest, InstallationTransaction, StepAction, TransactionJournal,
    TransactionState, TransactionalInstaller, UndoAction, UninstallMethod, RECEIPT_FILE,
};
use serial_test::serial;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn request<'a>(
    component: &'a envsmith_core::types::Component,
    artifact: Option<&'a envsmith_engine::DownloadedArtifact>,
) -> InstallRequest<'a> {
    InstallRequest {
        component,
        artifact,
        force: false,
        cancel: CancellationToken::new(),
        progress: None,
    }
}

fn sh(script: &str) -> Vec<String> {
    vec!["-c".to_string(), script.to_string()]
}

#[tokio::test]
#[serial]
async fn test_archive_install_commits_with_receipt() {
    let env = TestEnv::new();
    let status = env.status_store(EventSink::disabled());
    let installer = env.installer(status.clone());

    let archive = env.path().join("tool-1.0.tar.gz");
    write_tar_gz(&archive, &[("bin/tool", "#!/bin/sh\necho tool 1.0\n")]);
    let artifact = local_artifact("tool", &archive);

    let target = env.path().join("opt/tool");
    let component = ComponentBuilder::new("tool")
        .method(InstallMethod::Archive)
        .version("1.0.0")
        .target_dir(&target)
        .verify_path(target.join("bin/tool"))
        .build();

    let outcome = installer
        .install(request(&component, Some(&artifact)))
        .await
        .unwrap();

    match outcome {
        InstallOutcome::Committed { steps, version, .. } => {
            assert_eq!(version.as_deref(), Some("1.0.0"));
            assert!(steps.iter().all(|s| s.ends_with("[ok]")));
            assert!(steps[0].starts_with("prepare destination"));
        }
        other => panic!("expected commit, got {:?}", other),
    }

    assert!(target.join("bin/tool").is_file());
    let receipt = std::fs::read_to_string(target.join(RECEIPT_FILE)).unwrap();
    let receipt: serde_json::Value = serde_json::from_str(&receipt).unwrap();
    assert_eq!(receipt["component_id"], "tool");
    assert_eq!(receipt["install_method"], "archive");

    let stored = status.get("tool").await.unwrap();
    assert_eq!(stored.state, ComponentState::Installed);
    assert_eq!(stored.version.as_deref(), Some("1.0.0"));
    assert!(stored.last_installed.is_some());
    assert_eq!(env.journal_entries(), 0);
}

#[tokio::test]
#[serial]
async fn test_already_installed_skips_unless_forced() {
    let env = TestEnv::new();
    let status = env.status_store(EventSink::disabled());
    let installer = env.installer(status.clone());

    let binary = env.path().join("tool");
    std::fs::write(&binary, "#!/bin/sh\nexit 0\n").unwrap();
    let artifact = local_artifact("tool", &binary);
    let target = env.path().join("bin");
    let component = ComponentBuilder::new("tool")
        .method(InstallMethod::Executable)
        .target_dir(&target)
        .verify_path(target.join("tool"))
        .build();

    let first = installer
        .install(request(&component, Some(&artifact)))
        .await
        .unwrap();
    assert!(matches!(first, InstallOutcome::Committed { .. }));

    let second = installer
        .install(request(&component, Some(&artifact)))
        .await
        .unwrap();
    match second {
        InstallOutcome::AlreadyInstalled { status } => {
            assert_eq!(status.state, ComponentState::Installed)
        }
        other => panic!("expected already installed, got {:?}", other),
    }

    let mut forced = request(&component, Some(&artifact));
    forced.force = true;
    let third = installer.install(forced).await.unwrap();
    assert!(matches!(third, InstallOutcome::Committed { .. }));

    // The previous install was moved aside during the reinstall and dropped on commit
    let siblings: Vec<String> = std::fs::read_dir(env.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|n| n.contains("envsmith-backup"))
        .collect();
    assert!(siblings.is_empty(), "leftover backups: {:?}", siblings);
}

#[tokio::test]
#[serial]
async fn test_failed_script_step_is_not_undone() {
    let env = TestEnv::new();
    let status = env.status_store(EventSink::disabled());
    let installer = env.installer(status.clone());

    let script = env.path().join("install.sh");
    std::fs::write(&script, "echo installing\necho boom >&2\nexit 3\n").unwrap();
    let artifact = local_artifact("broken", &script);
    let undone = env.path().join("undone");

    let component = ComponentBuilder::new("broken")
        .method(InstallMethod::Script)
        .uninstall_hint("sh", &sh(&format!("touch {}", undone.display())))
        .verify_path(env.path().join("never"))
        .build();

    let err = installer
        .install(request(&component, Some(&artifact)))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), "step_failed");
    assert!(err.to_string().contains("run bash"));
    match &err {
        EngineError::Installation {
            trail,
            rollback_errors,
            ..
        } => {
            assert_eq!(trail.len(), 1);
            assert!(trail[0].ends_with("[failed]"));
            assert!(rollback_errors.is_empty());
        }
        other => panic!("expected installation error, got {:?}", other),
    }
    // The script never completed, so its uninstall hint must not run
    assert!(!undone.exists());

    let stored = status.get("broken").await.unwrap();
    assert_eq!(stored.state, ComponentState::Failed);
    assert!(stored.last_error.is_some());
    assert_eq!(env.journal_entries(), 0);
}

#[tokio::test]
#[serial]
async fn test_verification_failure_restores_previous_target() {
    let env = TestEnv::new();
    let status = env.status_store(EventSink::disabled());
    let installer = env.installer(status.clone());

    let target = env.path().join("bin");
    std::fs::create_dir_all(&target).unwrap();
    std::fs::write(target.join("old.txt"), "previous install").unwrap();

    let binary = env.path().join("tool");
    std::fs::write(&binary, "#!/bin/sh\nexit 0\n").unwrap();
    let artifact = local_artifact("tool", &binary);
    let component = ComponentBuilder::new("tool")
        .method(InstallMethod::Executable)
        .target_dir(&target)
        .verify_path(env.path().join("does-not-exist"))
        .build();

    let err = installer
        .install(request(&component, Some(&artifact)))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "verification_failed");

    assert_eq!(
        std::fs::read_to_string(target.join("old.txt")).unwrap(),
        "previous install"
    );
    assert!(!target.join("tool").exists());
    assert!(!target.join(RECEIPT_FILE).exists());
    let leftovers = std::fs::read_dir(env.path())
        .unwrap()
        .filter(|e| {
            e.as_ref()
                .unwrap()
                .file_name()
                .to_string_lossy()
                .contains("envsmith-backup")
        })
        .count();
    assert_eq!(leftovers, 0);
    assert_eq!(
        status.get("tool").await.unwrap().state,
        ComponentState::Failed
    );
}

#[tokio::test]
#[serial]
async fn test_rollback_unsets_env_and_profile_in_reverse_order() {
    let env = TestEnv::new();
    let status = env.status_store(EventSink::disabled());
    let profile = env.path().join("profile.sh");
    std::fs::write(&profile, "export KEEP=1\n").unwrap();
    let mut config = env.installer_config();
    config.env_profile = Some(profile.clone());
    let installer = TransactionalInstaller::new(config, status.clone());

    let archive = env.path().join("sdk.tar.gz");
    write_tar_gz(&archive, &[("README", "sdk")]);
    let artifact = local_artifact("sdk", &archive);
    let target = env.path().join("sdk");

    let component = ComponentBuilder::new("sdk")
        .method(InstallMethod::Archive)
        .target_dir(&target)
        .env("ENVSMITH_TEST_SDK_HOME", "/opt/sdk")
        .verify_command("envsmith-test-no-such-binary", &[])
        .build();

    let err = installer
        .install(request(&component, Some(&artifact)))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "verification_failed");

    let trail = err.trail();
    assert_eq!(trail.len(), 4);
    assert!(trail[2].starts_with("set ENVSMITH_TEST_SDK_HOME"));

    assert!(installer.env().get("ENVSMITH_TEST_SDK_HOME").is_none());
    assert!(std::env::var("ENVSMITH_TEST_SDK_HOME").is_err());
    assert_eq!(std::fs::read_to_string(&profile).unwrap(), "export KEEP=1\n");
    assert!(!target.exists());
}

#[tokio::test]
#[serial]
async fn test_cancel_kills_running_installer() {
    let env = TestEnv::new();
    let status = env.status_store(EventSink::disabled());
    let installer = env.installer(status.clone());

    let script = env.path().join("slow.sh");
    std::fs::write(&script, "sleep 30\n").unwrap();
    let artifact = local_artifact("slow", &script);
    let component = ComponentBuilder::new("slow")
        .method(InstallMethod::Script)
        .verify_path(env.path().join("never"))
        .build();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });

    let mut req = request(&component, Some(&artifact));
    req.cancel = cancel;
    let started = std::time::Instant::now();
    let err = tokio::time::timeout(TEST_TIMEOUT, installer.install(req))
        .await
        .expect("install should stop after cancel")
        .unwrap_err();

    assert!(started.elapsed() < Duration::from_secs(15));
    match &err {
        EngineError::Cancelled { trail, .. } => {
            assert_eq!(trail.len(), 1);
            assert!(trail[0].starts_with("run bash"));
        }
        other => panic!("expected cancellation, got {:?}", other),
    }

    // Cancellation is not a failed install
    let stored = status.get("slow").await.unwrap();
    assert_eq!(stored.state, ComponentState::NotDetected);
    assert_eq!(stored.last_error.as_deref(), Some("install cancelled"));
    assert_eq!(env.journal_entries(), 0);
}

#[tokio::test]
#[serial]
async fn test_recover_rolls_back_interrupted_journal() {
    let env = TestEnv::new();
    let status = env.status_store(EventSink::disabled());
    let installer = env.installer(status.clone());
    let journal = TransactionJournal::new(env.paths.journal_dir().into_std_path_buf());

    // A process died after creating the target directory
    let target = env.path().join("tools/half");
    std::fs::create_dir_all(&target).unwrap();
    std::fs::write(target.join("partial"), "x").unwrap();

    let mut interrupted = InstallationTransaction::new("half");
    interrupted
        .stage(vec![StepAction::PrepareDestination {
            path: target.clone(),
        }])
        .unwrap();
    interrupted.transition(TransactionState::Executing).unwrap();
    interrupted.record_undo(
        0,
        Some(UndoAction::RemovePath {
            path: target.clone(),
        }),
    );
    journal.save(&interrupted).await.unwrap();

    // A committed transaction whose journal was never cleared needs no undo
    let kept = env.path().join("kept");
    std::fs::write(&kept, "x").unwrap();
    let mut finished = InstallationTransaction::new("done");
    finished
        .stage(vec![StepAction::WriteFile {
            path: kept.clone(),
            contents: "x".into(),
        }])
        .unwrap();
    for state in [
        TransactionState::Executing,
        TransactionState::Verifying,
        TransactionState::Committed,
    ] {
        finished.transition(state).unwrap();
    }
    finished.record_undo(0, Some(UndoAction::RemovePath { path: kept.clone() }));
    journal.save(&finished).await.unwrap();

    let report = installer.recover_incomplete().await.unwrap();
    assert_eq!(report.rolled_back, vec!["half".to_string()]);
    assert!(report.rollback_errors.is_empty());

    assert!(!target.exists());
    assert!(kept.exists());
    assert_eq!(env.journal_entries(), 0);
    assert!(status.get("half").await.unwrap().last_error.is_some());

    let again = installer.recover_incomplete().await.unwrap();
    assert!(again.is_empty());
}

#[tokio::test]
#[serial]
async fn test_uninstall_removes_created_paths_and_profile_lines() {
    let env = TestEnv::new();
    let status = env.status_store(EventSink::disabled());
    let profile = env.path().join("profile.sh");
    let mut config = env.installer_config();
    config.env_profile = Some(profile.clone());
    let installer = TransactionalInstaller::new(config, status.clone());

    let archive = env.path().join("lang.tgz");
    write_tar_gz(&archive, &[("bin/lang", "#!/bin/sh\n")]);
    let artifact = local_artifact("lang", &archive);
    let target = env.path().join("lang");
    let component = ComponentBuilder::new("lang")
        .method(InstallMethod::Archive)
        .target_dir(&target)
        .env("ENVSMITH_TEST_LANG_HOME", "/opt/lang")
        .verify_env("ENVSMITH_TEST_LANG_HOME")
        .build();

    installer
        .install(request(&component, Some(&artifact)))
        .await
        .unwrap();
    assert_eq!(
        installer.env().get("ENVSMITH_TEST_LANG_HOME").as_deref(),
        Some("/opt/lang")
    );
    assert!(std::env::var("ENVSMITH_TEST_LANG_HOME").is_err());
    assert!(std::fs::read_to_string(&profile)
        .unwrap()
        .contains("# envsmith:lang"));

    let method = installer
        .uninstall(&component, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(method, UninstallMethod::CreatedPaths { removed: 1 });
    assert!(!target.exists());
    assert!(installer.env().get("ENVSMITH_TEST_LANG_HOME").is_none());
    assert!(!std::fs::read_to_string(&profile)
        .unwrap()
        .contains("# envsmith:lang"));
    assert_eq!(
        status.get("lang").await.unwrap().state,
        ComponentState::NotDetected
    );
}

#[tokio::test]
#[serial]
async fn test_uninstall_prefers_hint() {
    let env = TestEnv::new();
    let status = env.status_store(EventSink::disabled());
    let installer = env.installer(status.clone());
    let marker = env.path().join("removed");

    let component = ComponentBuilder::new("hinted")
        .uninstall_hint("sh", &sh(&format!("touch {}", marker.display())))
        .build();
    status.mark_installed("hinted", None).await.unwrap();

    let method = installer
        .uninstall(&component, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(method, UninstallMethod::Hint);
    assert!(marker.exists());
    assert_eq!(
        status.get("hinted").await.unwrap().state,
        ComponentState::NotDetected
    );
}

#[tokio::test]
#[serial]
async fn test_failing_uninstall_hint_is_rollback_error() {
    let env = TestEnv::new();
    let status = env.status_store(EventSink::disabled());
    let installer = env.installer(status.clone());

    let component = ComponentBuilder::new("stubborn")
        .uninstall_hint("sh", &sh("exit 1"))
        .build();
    status.mark_installed("stubborn", None).await.unwrap();

    let err = installer
        .uninstall(&component, &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "rollback");
    assert_eq!(
        status.get("stubborn").await.unwrap().state,
        ComponentState::Installed
    );
}
