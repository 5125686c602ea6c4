//! Temporary environments and artifact fixtures

#![allow(dead_code)]

use camino::Utf8PathBuf;
use envsmith_core::config::ResolvedPaths;
use envsmith_core::types::{RetryPolicy, RetryStrategy, RuntimeConfig};
use envsmith_engine::download::DownloadedArtifact;
use envsmith_engine::events::{EventEnvelope, EventSink};
use envsmith_engine::install::{InstallerConfig, TransactionalInstaller};
use envsmith_engine::status::StatusStore;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;

/// Default timeout for test operations
pub const TEST_TIMEOUT: Duration = Duration::from_secs(30);

/// An isolated state, scratch and install root under one temp dir
pub struct TestEnv {
    pub temp: TempDir,
    pub paths: ResolvedPaths,
    pub config: RuntimeConfig,
}

impl TestEnv {
    pub fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let paths = ResolvedPaths {
            state_dir: root.join("state"),
            scratch_dir: root.join("scratch"),
            install_root: root.join("tools"),
        };
        Self {
            temp,
            paths,
            config: fast_config(),
        }
    }

    pub fn path(&self) -> &Path {
        self.temp.path()
    }

    pub fn scratch(&self) -> PathBuf {
        self.paths.scratch_dir.clone().into_std_path_buf()
    }

    pub fn status_store(&self, sink: EventSink) -> Arc<StatusStore> {
        Arc::new(StatusStore::open(self.paths.status_dir().into_std_path_buf(), sink).unwrap())
    }

    pub fn installer_config(&self) -> InstallerConfig {
        let mut config = InstallerConfig::from_runtime(&self.config, &self.paths);
        config.step_timeout = Duration::from_secs(20);
        config.verify_timeout = Duration::from_secs(5);
        config
    }

    pub fn installer(&self, status: Arc<StatusStore>) -> TransactionalInstaller {
        TransactionalInstaller::new(self.installer_config(), status)
    }

    /// Journal files still present
    pub fn journal_entries(&self) -> usize {
        std::fs::read_dir(self.paths.journal_dir().as_std_path())
            .map(|entries| entries.count())
            .unwrap_or(0)
    }
}

/// Runtime config with no retry backoff and a zero detection cache
pub fn fast_config() -> RuntimeConfig {
    let mut config = RuntimeConfig::default();
    config.retry_policies.operations.insert(
        "download".to_string(),
        RetryPolicy {
            max_attempts: 2,
            strategy: RetryStrategy::None,
            backoff_multiplier: 1.0,
            initial_delay_ms: 0,
            max_delay_ms: 0,
        },
    );
    config.network.download_timeout_secs = 10;
    config.detection.cache_ttl_secs = 0;
    config.detection.command_timeout_secs = 5;
    config
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Write `files` into a gzipped tarball at `path`
pub fn write_tar_gz(path: &Path, files: &[(&str, &str)]) {
    let file = std::fs::File::create(path).unwrap();
    let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (name, contents) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        builder
            .append_data(&mut header, name, contents.as_bytes())
            .unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap();
}

/// Treat a local file as if the download manager had fetched it
pub fn local_artifact(component_id: &str, path: &Path) -> DownloadedArtifact {
    let data = std::fs::read(path).unwrap();
    DownloadedArtifact {
        component_id: component_id.to_string(),
        path: path.to_path_buf(),
        file_name: path.file_name().unwrap().to_string_lossy().into_owned(),
        url: format!("file://{}", path.display()),
        size: data.len() as u64,
        digest: sha256_hex(&data),
    }
}

/// Collect whatever is currently buffered on an event receiver
pub fn drain_events(rx: &mut mpsc::Receiver<EventEnvelope>) -> Vec<EventEnvelope> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
