//! Verified artifact downloads with retry and mirror fallback
//!
//! Each URL gets the `download` retry policy; after that the next mirror is
//! tried. Bytes stream into a uniquely named temp file in the scratch
//! directory and are hashed as they arrive. A verified file is renamed to
//! `<uuid>-<file name>` and handed off by path.

use crate::error::{DownloadError, EngineError, Result};
use crate::events::{report, EngineEvent, EventSink, ProgressCallback, ProgressStage, ProgressUpdate};
use envsmith_core::retry::{ClosurePredicate, RetryError, RetryExecutorBuilder, TracingObserver};
use envsmith_core::types::{ChecksumAlgorithm, Component, RetryPolicy, RuntimeConfig, SourceDescriptor};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use sha2::{Digest, Sha256, Sha512};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// What to fetch for one component
#[derive(Clone)]
pub struct DownloadRequest {
    pub component_id: String,
    pub source: SourceDescriptor,
    /// Per-attempt timeout; the manager default applies when unset
    pub timeout: Option<Duration>,
    pub progress: Option<ProgressCallback>,
    pub cancel: CancellationToken,
}

impl DownloadRequest {
    pub fn new(component_id: impl Into<String>, source: SourceDescriptor) -> Self {
        Self {
            component_id: component_id.into(),
            source,
            timeout: None,
            progress: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Build a request from a catalog entry; the entry must declare a source
    pub fn for_component(component: &Component) -> Result<Self> {
        let source = component.source.clone().ok_or_else(|| {
            EngineError::configuration(format!(
                "'{}' uses {} but declares no source",
                component.id, component.install_method
            ))
        })?;
        Ok(Self::new(&component.id, source))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// A verified artifact in the scratch directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadedArtifact {
    pub component_id: String,
    pub path: PathBuf,
    /// File name taken from the URL; drives archive and package dispatch
    pub file_name: String,
    pub url: String,
    pub size: u64,
    /// Lowercase hex digest computed while streaming
    pub digest: String,
}

impl DownloadedArtifact {
    /// Delete the artifact; a missing file is not an error
    pub async fn discard(&self) {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to remove {}: {}", self.path.display(), e),
        }
    }
}

/// Failure of a single attempt against a single URL
#[derive(Error, Debug)]
enum AttemptError {
    #[error("HTTP {status}")]
    Http { status: u16 },

    #[error("{0}")]
    Transport(String),

    #[error("checksum mismatch (expected {expected}, got {actual})")]
    Integrity { expected: String, actual: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out after {}s", .0.as_secs())]
    TimedOut(Duration),

    #[error("cancelled")]
    Cancelled,
}

impl AttemptError {
    /// Client errors other than 408/429 will not change on retry
    fn is_retryable(&self) -> bool {
        match self {
            AttemptError::Http { status } => {
                !(400..500).contains(status) || *status == 408 || *status == 429
            }
            AttemptError::Cancelled => false,
            _ => true,
        }
    }
}

enum StreamingHasher {
    Sha256(Sha256),
    Sha512(Sha512),
}

impl StreamingHasher {
    fn new(algorithm: ChecksumAlgorithm) -> Self {
        match algorithm {
            ChecksumAlgorithm::Sha256 => StreamingHasher::Sha256(Sha256::new()),
            ChecksumAlgorithm::Sha512 => StreamingHasher::Sha512(Sha512::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            StreamingHasher::Sha256(h) => h.update(data),
            StreamingHasher::Sha512(h) => h.update(data),
        }
    }

    fn finalize_hex(self) -> String {
        match self {
            StreamingHasher::Sha256(h) => hex::encode(h.finalize()),
            StreamingHasher::Sha512(h) => hex::encode(h.finalize()),
        }
    }
}

/// Fetches and verifies component artifacts
pub struct DownloadManager {
    client: reqwest::Client,
    scratch_dir: PathBuf,
    pool: Arc<Semaphore>,
    max_parallel: usize,
    retry_policy: RetryPolicy,
    timeout: Duration,
    require_checksums: bool,
    sink: EventSink,
}

impl DownloadManager {
    pub fn new(config: &RuntimeConfig, scratch_dir: impl Into<PathBuf>, sink: EventSink) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(&config.network.user_agent)
            .connect_timeout(Duration::from_secs(config.network.connect_timeout_secs))
            .build()
            .map_err(|e| EngineError::configuration(format!("Failed to create HTTP client: {}", e)))?;

        let max_parallel = config.concurrency.max_parallel_downloads.max(1);
        Ok(Self {
            client,
            scratch_dir: scratch_dir.into(),
            pool: Arc::new(Semaphore::new(max_parallel)),
            max_parallel,
            retry_policy: config.retry_policy("download"),
            timeout: Duration::from_secs(config.network.download_timeout_secs),
            require_checksums: config.install.require_checksums,
            sink,
        })
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    /// Download and verify one artifact
    pub async fn download(&self, request: DownloadRequest) -> Result<DownloadedArtifact> {
        let id = request.component_id.as_str();
        let source = &request.source;

        let expected = source
            .checksum
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty());
        if expected.is_none() {
            if self.require_checksums {
                return Err(EngineError::configuration(format!(
                    "'{}' declares no checksum and require-checksums is enabled",
                    id
                )));
            }
            tracing::warn!("{} has no checksum; integrity cannot be verified", id);
            self.sink
                .emit(EngineEvent::IntegrityWarning {
                    component_id: id.to_string(),
                    url: source.url.clone(),
                })
                .await;
        }

        let _permit = tokio::select! {
            permit = self.pool.acquire() => permit.map_err(|_| EngineError::cancelled(id))?,
            _ = request.cancel.cancelled() => return Err(EngineError::cancelled(id)),
        };

        tokio::fs::create_dir_all(&self.scratch_dir).await?;

        let executor = RetryExecutorBuilder::new()
            .with_policy(self.retry_policy.clone())
            .with_predicate(ClosurePredicate::new(AttemptError::is_retryable))
            .with_observer(TracingObserver::new("download"))
            .with_cancellation(request.cancel.clone())
            .build();

        let mut tried: Vec<String> = Vec::new();
        let mut integrity: Option<(String, String)> = None;
        let mut last_error = String::new();

        for url in source.urls() {
            tried.push(url.to_string());
            report(
                request.progress.as_ref(),
                ProgressUpdate::stage(id, ProgressStage::Downloading, format!("fetching {}", url)),
            );

            let outcome = executor
                .execute(|| self.attempt(url, expected, &request))
                .await;

            let err = match outcome {
                Ok(artifact) => {
                    tracing::info!(
                        "Downloaded {} ({}) from {}",
                        id,
                        envsmith_core::utils::human_readable_size(artifact.size),
                        url
                    );
                    return Ok(artifact);
                }
                Err(RetryError::Cancelled { .. }) => return Err(EngineError::cancelled(id)),
                Err(e) => e,
            };

            match err.into_source() {
                Some(AttemptError::Cancelled) => return Err(EngineError::cancelled(id)),
                Some(AttemptError::Integrity { expected, actual }) => {
                    last_error = format!("checksum mismatch at {}", url);
                    integrity = Some((expected, actual));
                }
                Some(other) => last_error = format!("{}: {}", url, other),
                None => last_error = format!("{}: no attempt completed", url),
            }
            tracing::warn!("Source {} for {} failed: {}", url, id, last_error);
        }

        let error = if let Some((expected, actual)) = integrity {
            DownloadError::IntegrityMismatch {
                urls: tried,
                expected,
                actual,
            }
        } else if tried.len() > 1 {
            DownloadError::MirrorsExhausted {
                urls: tried,
                last_error,
            }
        } else {
            DownloadError::NetworkFailure {
                urls: tried,
                message: last_error,
            }
        };

        Err(EngineError::Download {
            component: id.to_string(),
            source: error,
        })
    }

    /// Drive several downloads at once; results are in completion order
    pub async fn download_many(
        &self,
        requests: Vec<DownloadRequest>,
    ) -> Vec<(String, Result<DownloadedArtifact>)> {
        stream::iter(requests)
            .map(|request| async move {
                let id = request.component_id.clone();
                (id, self.download(request).await)
            })
            .buffer_unordered(self.max_parallel)
            .collect()
            .await
    }

    async fn attempt(
        &self,
        url: &str,
        expected: Option<&str>,
        request: &DownloadRequest,
    ) -> std::result::Result<DownloadedArtifact, AttemptError> {
        let timeout = request.timeout.unwrap_or(self.timeout);
        let temp = tempfile::Builder::new()
            .prefix(".envsmith-")
            .suffix(".part")
            .tempfile_in(&self.scratch_dir)?;
        let (file, temp_path) = temp.into_parts();
        let mut file = tokio::fs::File::from_std(file);
        let mut hasher = StreamingHasher::new(request.source.checksum_algorithm);

        let streamed = tokio::select! {
            result = tokio::time::timeout(timeout, self.stream_to(url, &mut file, &mut hasher, request)) => {
                result.unwrap_or(Err(AttemptError::TimedOut(timeout)))
            }
            _ = request.cancel.cancelled() => Err(AttemptError::Cancelled),
        };
        let size = streamed?;
        drop(file);

        let digest = hasher.finalize_hex();
        if let Some(expected) = expected {
            if !digest.eq_ignore_ascii_case(expected) {
                return Err(AttemptError::Integrity {
                    expected: expected.to_ascii_lowercase(),
                    actual: digest,
                });
            }
        }

        let file_name = file_name_from_url(url, &request.component_id);
        let path = self
            .scratch_dir
            .join(format!("{}-{}", Uuid::new_v4().simple(), file_name));
        temp_path.persist(&path).map_err(|e| AttemptError::Io(e.error))?;

        Ok(DownloadedArtifact {
            component_id: request.component_id.clone(),
            path,
            file_name,
            url: url.to_string(),
            size,
            digest,
        })
    }

    async fn stream_to(
        &self,
        url: &str,
        file: &mut tokio::fs::File,
        hasher: &mut StreamingHasher,
        request: &DownloadRequest,
    ) -> std::result::Result<u64, AttemptError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| AttemptError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AttemptError::Http {
                status: status.as_u16(),
            });
        }

        let total = response.content_length();
        let mut stream = response.bytes_stream();
        let mut done = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk: bytes::Bytes = chunk.map_err(|e| AttemptError::Transport(e.to_string()))?;
            file.write_all(&chunk).await?;
            hasher.update(&chunk);
            done += chunk.len() as u64;
            report(
                request.progress.as_ref(),
                ProgressUpdate::bytes(&request.component_id, done, total),
            );
        }

        file.flush().await?;
        file.sync_all().await?;
        Ok(done)
    }
}

/// Last path segment of the URL, restricted to filesystem-safe characters
fn file_name_from_url(url: &str, component_id: &str) -> String {
    let segment = url::Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .filter(|s| !s.is_empty());

    match segment {
        Some(name) => name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                    c
                } else {
                    '_'
                }
            })
            .collect(),
        None => format!("{}.download", component_id),
    }
}
