//! Persisted component status model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Last-known state of a component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentState {
    #[default]
    NotDetected,
    Detected,
    Installed,
    NeedsUpdate,
    Failed,
}

impl ComponentState {
    /// Whether dependents may proceed on top of this component
    pub fn satisfies_dependents(&self) -> bool {
        matches!(self, ComponentState::Detected | ComponentState::Installed)
    }
}

impl fmt::Display for ComponentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ComponentState::NotDetected => "not detected",
            ComponentState::Detected => "detected",
            ComponentState::Installed => "installed",
            ComponentState::NeedsUpdate => "needs update",
            ComponentState::Failed => "failed",
        };
        write!(f, "{}", label)
    }
}

/// Merged, persisted view of one component
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentStatus {
    pub component_id: String,
    pub state: ComponentState,
    #[serde(default)]
    pub confidence: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checked: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_installed: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl ComponentStatus {
    /// Fresh status for a component that has never been observed
    pub fn new(component_id: impl Into<String>) -> Self {
        Self {
            component_id: component_id.into(),
            state: ComponentState::NotDetected,
            confidence: 0.0,
            version: None,
            last_checked: None,
            last_installed: None,
            last_error: None,
        }
    }
}
