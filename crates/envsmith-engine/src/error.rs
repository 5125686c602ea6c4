//! Error taxonomy for the provisioning engine
//!
//! Every error can be flattened into a serializable [`Failure`] for event
//! consumers and the CLI.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type alias using the engine's error type
pub type Result<T> = std::result::Result<T, EngineError>;

/// Engine errors
#[derive(Error, Debug)]
pub enum EngineError {
    /// Invalid catalog entry or runtime configuration
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// A dependency cycle; `cycle` starts and ends with the same id
    #[error("Circular dependency detected: {}", cycle.join(" -> "))]
    CircularDependency { component: String, cycle: Vec<String> },

    #[error("Component '{component}' depends on unknown component '{missing}'")]
    MissingDependency { component: String, missing: String },

    #[error("Component '{component}' cannot proceed: dependency '{dependency}' is unavailable")]
    DependencyFailed {
        component: String,
        dependency: String,
    },

    #[error("Download failed for '{component}': {source}")]
    Download {
        component: String,
        #[source]
        source: DownloadError,
    },

    #[error("Installation of '{component}' failed: {source}")]
    Installation {
        component: String,
        #[source]
        source: InstallationError,
        /// Steps attempted, in order
        trail: Vec<String>,
        /// Undo actions that could not be completed
        rollback_errors: Vec<RollbackError>,
    },

    /// Rollback left the system partially modified
    #[error("Rollback of '{component}' incomplete: {} undo action(s) failed", errors.len())]
    Rollback {
        component: String,
        errors: Vec<RollbackError>,
    },

    #[error("Detection strategy '{strategy}' failed for '{component}': {message}")]
    Detection {
        component: String,
        strategy: String,
        message: String,
    },

    #[error("Operation on '{component}' was cancelled")]
    Cancelled {
        component: String,
        trail: Vec<String>,
    },

    #[error("A transaction is already in progress for '{component}'")]
    TransactionInProgress { component: String },

    #[error("Unknown component: {0}")]
    UnknownComponent(String),

    #[error("Status store error: {message}")]
    Status { message: String },

    #[error(transparent)]
    Core(#[from] envsmith_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Terminal download failures; each lists every URL attempted
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DownloadError {
    #[error("network failure fetching {}: {message}", urls.join(", "))]
    NetworkFailure { urls: Vec<String>, message: String },

    #[error("checksum mismatch (expected {expected}, got {actual}); tried {}", urls.join(", "))]
    IntegrityMismatch {
        urls: Vec<String>,
        expected: String,
        actual: String,
    },

    #[error("all sources failed ({}): {last_error}", urls.join(", "))]
    MirrorsExhausted {
        urls: Vec<String>,
        last_error: String,
    },
}

impl DownloadError {
    pub fn urls(&self) -> &[String] {
        match self {
            DownloadError::NetworkFailure { urls, .. }
            | DownloadError::IntegrityMismatch { urls, .. }
            | DownloadError::MirrorsExhausted { urls, .. } => urls,
        }
    }
}

/// Installation failures that trigger rollback
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InstallationError {
    #[error("step '{step}' failed: {message}")]
    StepFailed { step: String, message: String },

    #[error("verification failed: none of [{}] passed", checks.join(", "))]
    VerificationFailed { checks: Vec<String> },
}

/// An undo action that failed during rollback
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackError {
    pub action: String,
    pub message: String,
}

impl fmt::Display for RollbackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.action, self.message)
    }
}

impl EngineError {
    pub fn configuration(message: impl Into<String>) -> Self {
        EngineError::Configuration {
            message: message.into(),
        }
    }

    pub fn status(message: impl Into<String>) -> Self {
        EngineError::Status {
            message: message.into(),
        }
    }

    pub fn cancelled(component: impl Into<String>) -> Self {
        EngineError::Cancelled {
            component: component.into(),
            trail: Vec::new(),
        }
    }

    /// Stable snake_case identifier for the error kind
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Configuration { .. } => "configuration",
            EngineError::CircularDependency { .. } => "circular_dependency",
            EngineError::MissingDependency { .. } => "missing_dependency",
            EngineError::DependencyFailed { .. } => "dependency_failed",
            EngineError::Download { source, .. } => match source {
                DownloadError::NetworkFailure { .. } => "network_failure",
                DownloadError::IntegrityMismatch { .. } => "integrity_mismatch",
                DownloadError::MirrorsExhausted { .. } => "mirrors_exhausted",
            },
            EngineError::Installation { source, .. } => match source {
                InstallationError::StepFailed { .. } => "step_failed",
                InstallationError::VerificationFailed { .. } => "verification_failed",
            },
            EngineError::Rollback { .. } => "rollback",
            EngineError::Detection { .. } => "detection",
            EngineError::Cancelled { .. } => "cancelled",
            EngineError::TransactionInProgress { .. } => "transaction_in_progress",
            EngineError::UnknownComponent(_) => "unknown_component",
            EngineError::Status { .. } => "status",
            EngineError::Core(_) => "configuration",
            EngineError::Io(_) => "io",
        }
    }

    /// Component the error concerns, if any
    pub fn component(&self) -> Option<&str> {
        match self {
            EngineError::CircularDependency { component, .. }
            | EngineError::MissingDependency { component, .. }
            | EngineError::DependencyFailed { component, .. }
            | EngineError::Download { component, .. }
            | EngineError::Installation { component, .. }
            | EngineError::Rollback { component, .. }
            | EngineError::Detection { component, .. }
            | EngineError::Cancelled { component, .. }
            | EngineError::TransactionInProgress { component } => Some(component.as_str()),
            EngineError::UnknownComponent(id) => Some(id.as_str()),
            _ => None,
        }
    }

    /// Ordered list of steps attempted before the failure
    pub fn trail(&self) -> &[String] {
        match self {
            EngineError::Installation { trail, .. } | EngineError::Cancelled { trail, .. } => {
                trail.as_slice()
            }
            _ => &[],
        }
    }

    /// Suggested remedy, where one can be determined
    pub fn remedy(&self) -> Option<String> {
        match self {
            EngineError::CircularDependency { cycle, .. } => Some(format!(
                "Break the cycle by removing one of the dependencies in: {}",
                cycle.join(" -> ")
            )),
            EngineError::MissingDependency { missing, .. } => Some(format!(
                "Add '{}' to the catalog or remove it from the dependency list",
                missing
            )),
            EngineError::DependencyFailed { dependency, .. } => Some(format!(
                "Install '{}' first, then retry",
                dependency
            )),
            EngineError::Download { source, .. } => Some(match source {
                DownloadError::IntegrityMismatch { .. } => {
                    "Verify the catalog checksum matches the published artifact".to_string()
                }
                _ => "Check network connectivity or add a mirror for this component".to_string(),
            }),
            EngineError::Installation { source, .. } => match source {
                InstallationError::VerificationFailed { .. } => Some(
                    "The install ran but could not be confirmed; check the verify actions"
                        .to_string(),
                ),
                InstallationError::StepFailed { .. } => {
                    Some("Re-run with -vv to see the installer output".to_string())
                }
            },
            EngineError::Rollback { .. } => {
                Some("Some changes could not be undone; inspect the listed paths".to_string())
            }
            EngineError::TransactionInProgress { .. } => {
                Some("Wait for the running install to finish".to_string())
            }
            EngineError::UnknownComponent(_) => {
                Some("Run 'envsmith status' to list known components".to_string())
            }
            EngineError::Configuration { .. } | EngineError::Core(_) => {
                Some("Fix the catalog or ~/.envsmith/runtime.yaml and retry".to_string())
            }
            _ => None,
        }
    }

    /// Flatten into a serializable failure record
    pub fn to_failure(&self) -> Failure {
        let mut diagnostic_trail = self.trail().to_vec();
        if let EngineError::Installation {
            rollback_errors, ..
        } = self
        {
            diagnostic_trail.extend(rollback_errors.iter().map(|e| format!("rollback: {}", e)));
        }
        if let EngineError::Download { source, .. } = self {
            diagnostic_trail.extend(source.urls().iter().map(|u| format!("tried {}", u)));
        }

        Failure {
            kind: self.kind().to_string(),
            component_id: self.component().map(str::to_string),
            message: self.to_string(),
            remedy: self.remedy(),
            diagnostic_trail,
        }
    }
}

/// Serializable failure report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component_id: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remedy: Option<String>,
    #[serde(default)]
    pub diagnostic_trail: Vec<String>,
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<EngineError> for Failure {
    fn from(err: EngineError) -> Self {
        err.to_failure()
    }
}
