//! # envsmith-engine
//!
//! Provisioning engine for envsmith:
//! - Dependency resolution with cycle detection and deterministic ordering
//! - Verified, retrying downloads with mirror fallback
//! - Transactional installs with journaled undo and rollback
//! - Concurrent multi-strategy detection
//! - Durable per-component status and a typed event channel

pub mod detection;
pub mod download;
pub mod env;
pub mod error;
pub mod events;
pub mod install;
pub mod ledger;
pub mod orchestrator;
pub mod platform;
pub mod resolver;
pub mod status;
pub mod verify;

pub use detection::{DetectionEngine, DetectionReport, DetectionResult, StrategyKind};
pub use download::{DownloadManager, DownloadRequest, DownloadedArtifact};
pub use env::EnvOverlay;
pub use error::{DownloadError, EngineError, Failure, InstallationError, Result, RollbackError};
pub use events::{EngineEvent, EventEnvelope, EventSink, ProgressCallback, ProgressStage, ProgressUpdate};
pub use install::{InstallOutcome, InstallRequest, InstallerConfig, TransactionalInstaller};
pub use ledger::{EventFilter, EventLedger};
pub use orchestrator::{InstallOptions, Orchestrator, ProvisionReport, ProvisionResult};
pub use resolver::{DependencyResolver, Resolution, ResolutionFailure};
pub use status::StatusStore;
