//! Engine session: config, catalog, event rendering and Ctrl-C handling

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use envsmith_core::config::ResolvedPaths;
use envsmith_core::types::RuntimeConfig;
use envsmith_core::HierarchicalConfigLoader;
use envsmith_engine::events::{EngineEvent, EventEnvelope, EventSink};
use envsmith_engine::{EventLedger, Orchestrator};
use indicatif::ProgressBar;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::commands::load_catalog;
use crate::output;

const CATALOG_FILE: &str = "catalog.yaml";

/// Runtime config plus where everything lives
pub struct Settings {
    pub loader: HierarchicalConfigLoader,
    pub config: RuntimeConfig,
    pub paths: ResolvedPaths,
}

impl Settings {
    pub fn load() -> Result<Self> {
        let loader = HierarchicalConfigLoader::new().context("Failed to locate config directory")?;
        let config = loader
            .load_runtime_config()
            .context("Failed to load runtime configuration")?;
        let paths = loader.resolve_paths(&config);
        Ok(Self {
            loader,
            config,
            paths,
        })
    }

    /// `--catalog` if given, else the catalog in the config directory
    pub fn catalog_path(&self, flag: Option<&Utf8Path>) -> Utf8PathBuf {
        flag.map(Utf8Path::to_path_buf)
            .unwrap_or_else(|| self.loader.config_dir().join(CATALOG_FILE))
    }

    pub fn ledger(&self) -> EventLedger {
        EventLedger::new(self.paths.ledger_path().into_std_path_buf())
    }
}

/// A running orchestrator whose events are drained to the terminal
pub struct Session {
    pub orchestrator: Orchestrator,
    pub cancel: CancellationToken,
    renderer: JoinHandle<()>,
    interrupt: JoinHandle<()>,
}

impl Session {
    /// Load config and catalog, then recover interrupted installs
    pub async fn open(catalog: Option<&Utf8Path>, quiet: bool) -> Result<Self> {
        let settings = Settings::load()?;
        let catalog = load_catalog(&settings, catalog)?;

        let ledger = Arc::new(settings.ledger());
        let (sink, rx) = EventSink::channel(settings.config.concurrency.event_channel_capacity);
        let sink = sink.with_ledger(ledger);

        // The receiver must be drained before the engine starts publishing
        let renderer = tokio::spawn(render_events(rx, output::spinner("starting", quiet)));

        let orchestrator = Orchestrator::new(catalog, settings.config, settings.paths, sink)
            .context("Failed to start provisioning engine")?;

        let cancel = CancellationToken::new();
        let interrupt = tokio::spawn(cancel_on_ctrl_c(cancel.clone()));

        let recovered = orchestrator
            .recover()
            .await
            .context("Failed to recover interrupted installs")?;
        if !recovered.is_empty() {
            output::warning(&format!(
                "Rolled back interrupted install(s): {}",
                recovered.rolled_back.join(", ")
            ));
        }
        for error in &recovered.rollback_errors {
            output::warning(&format!("Recovery left residue: {}", error));
        }

        Ok(Self {
            orchestrator,
            cancel,
            renderer,
            interrupt,
        })
    }

    /// Drop the engine and wait for its remaining events to render
    pub async fn close(self) {
        self.interrupt.abort();
        drop(self.orchestrator);
        if let Err(e) = self.renderer.await {
            tracing::debug!("event renderer stopped: {}", e);
        }
    }
}

async fn cancel_on_ctrl_c(cancel: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_ok() {
        output::warning("Interrupted, cancelling and rolling back...");
        cancel.cancel();
    }
}

/// Render engine events until every sender is dropped
async fn render_events(mut rx: mpsc::Receiver<EventEnvelope>, spinner: ProgressBar) {
    while let Some(envelope) = rx.recv().await {
        match envelope.event {
            EngineEvent::Progress {
                component_id,
                stage,
                percent,
                message,
            } => {
                let percent = percent.map(|p| format!(" {}%", p)).unwrap_or_default();
                spinner.set_message(format!("{} {}{}: {}", stage, component_id, percent, message));
            }
            EngineEvent::IntegrityWarning { component_id, url } => {
                spinner.suspend(|| {
                    output::warning(&format!(
                        "{}: {} has no checksum, integrity not verified",
                        component_id, url
                    ))
                });
            }
            EngineEvent::StatusChanged {
                component_id,
                old_state,
                new_state,
            } => {
                tracing::debug!("{}: {} -> {}", component_id, old_state, new_state);
            }
            // Commands render failures from their results
            EngineEvent::Failure {
                component_id, kind, ..
            } => {
                tracing::debug!("{} failed ({})", component_id, kind);
            }
        }
    }
    spinner.finish_and_clear();
}
