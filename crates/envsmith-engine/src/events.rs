//! Typed engine events and the per-session event channel
//!
//! Events travel over a bounded `mpsc` channel wrapped in an
//! [`EventEnvelope`]. Progress is best-effort: it is dropped when the
//! channel is full. Every other event is awaited and, when a ledger is
//! attached, appended to the JSONL history.

use crate::ledger::EventLedger;
use chrono::{DateTime, Utc};
use envsmith_core::types::ComponentState;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};

/// Phase of work a progress event refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStage {
    Resolving,
    Detecting,
    Downloading,
    Staging,
    Installing,
    Verifying,
    RollingBack,
    Uninstalling,
}

impl fmt::Display for ProgressStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ProgressStage::Resolving => "resolving",
            ProgressStage::Detecting => "detecting",
            ProgressStage::Downloading => "downloading",
            ProgressStage::Staging => "staging",
            ProgressStage::Installing => "installing",
            ProgressStage::Verifying => "verifying",
            ProgressStage::RollingBack => "rolling back",
            ProgressStage::Uninstalling => "uninstalling",
        };
        write!(f, "{}", label)
    }
}

/// Engine events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    StatusChanged {
        component_id: String,
        old_state: ComponentState,
        new_state: ComponentState,
    },

    Progress {
        component_id: String,
        stage: ProgressStage,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        percent: Option<u8>,
        message: String,
    },

    Failure {
        component_id: String,
        kind: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        remedy: Option<String>,
        #[serde(default)]
        diagnostic_trail: Vec<String>,
    },

    /// An artifact was fetched without a checksum to verify it against
    IntegrityWarning { component_id: String, url: String },
}

impl EngineEvent {
    pub fn component_id(&self) -> &str {
        match self {
            EngineEvent::StatusChanged { component_id, .. }
            | EngineEvent::Progress { component_id, .. }
            | EngineEvent::Failure { component_id, .. }
            | EngineEvent::IntegrityWarning { component_id, .. } => component_id,
        }
    }

    pub fn is_progress(&self) -> bool {
        matches!(self, EngineEvent::Progress { .. })
    }

    /// Event type name as serialized
    pub fn type_name(&self) -> &'static str {
        match self {
            EngineEvent::StatusChanged { .. } => "status_changed",
            EngineEvent::Progress { .. } => "progress",
            EngineEvent::Failure { .. } => "failure",
            EngineEvent::IntegrityWarning { .. } => "integrity_warning",
        }
    }

    pub fn failure(component_id: &str, failure: &crate::error::Failure) -> Self {
        EngineEvent::Failure {
            component_id: component_id.to_string(),
            kind: failure.kind.clone(),
            message: failure.message.clone(),
            remedy: failure.remedy.clone(),
            diagnostic_trail: failure.diagnostic_trail.clone(),
        }
    }
}

/// Event metadata envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique event ID (UUID v4)
    pub event_id: String,

    pub timestamp: DateTime<Utc>,

    /// Identifies the engine session that published the event
    pub session_id: String,

    pub event: EngineEvent,
}

impl EventEnvelope {
    pub fn new(session_id: impl Into<String>, event: EngineEvent) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            session_id: session_id.into(),
            event,
        }
    }
}

/// A progress update forwarded through every layer of an operation
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub component_id: String,
    pub stage: ProgressStage,
    pub percent: Option<u8>,
    pub message: String,
    pub bytes_done: Option<u64>,
    pub bytes_total: Option<u64>,
}

impl ProgressUpdate {
    pub fn stage(component_id: &str, stage: ProgressStage, message: impl Into<String>) -> Self {
        Self {
            component_id: component_id.to_string(),
            stage,
            percent: None,
            message: message.into(),
            bytes_done: None,
            bytes_total: None,
        }
    }

    /// Download progress; `percent` is derived when the total is known
    pub fn bytes(component_id: &str, done: u64, total: Option<u64>) -> Self {
        let percent = total
            .filter(|t| *t > 0)
            .map(|t| ((done.min(t) * 100) / t) as u8);
        Self {
            component_id: component_id.to_string(),
            stage: ProgressStage::Downloading,
            percent,
            message: match total {
                Some(t) => format!("{} / {} bytes", done, t),
                None => format!("{} bytes", done),
            },
            bytes_done: Some(done),
            bytes_total: total,
        }
    }

    pub fn with_percent(mut self, percent: u8) -> Self {
        self.percent = Some(percent.min(100));
        self
    }
}

/// Caller-supplied progress callback
pub type ProgressCallback = Arc<dyn Fn(&ProgressUpdate) + Send + Sync>;

/// Invoke an optional callback
pub fn report(progress: Option<&ProgressCallback>, update: ProgressUpdate) {
    if let Some(callback) = progress {
        callback(&update);
    }
}

/// Progress events a session dropped on a full channel
///
/// Shared by every clone of a sink. The total is logged once the last clone
/// goes away.
#[derive(Debug)]
struct DropCounter {
    session_id: Arc<str>,
    dropped: AtomicU64,
}

impl DropCounter {
    fn new(session_id: Arc<str>) -> Arc<Self> {
        Arc::new(Self {
            session_id,
            dropped: AtomicU64::new(0),
        })
    }
}

impl Drop for DropCounter {
    fn drop(&mut self) {
        let dropped = *self.dropped.get_mut();
        if dropped > 0 {
            tracing::debug!(
                session = %self.session_id,
                dropped,
                "event sink closed; progress events were dropped on a full channel"
            );
        }
    }
}

/// Sending half of a session's event channel
#[derive(Clone)]
pub struct EventSink {
    session_id: Arc<str>,
    sender: Option<mpsc::Sender<EventEnvelope>>,
    ledger: Option<Arc<EventLedger>>,
    drops: Arc<DropCounter>,
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink")
            .field("session_id", &self.session_id)
            .field("connected", &self.sender.is_some())
            .field("ledger", &self.ledger.is_some())
            .field("dropped_progress", &self.dropped_progress())
            .finish()
    }
}

impl EventSink {
    /// Create a bounded channel for a new session
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<EventEnvelope>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(Some(tx)), rx)
    }

    /// A sink with no receiver; events are only traced (and ledgered, if attached)
    pub fn disabled() -> Self {
        Self::new(None)
    }

    fn new(sender: Option<mpsc::Sender<EventEnvelope>>) -> Self {
        let session_id: Arc<str> = Arc::from(uuid::Uuid::new_v4().to_string());
        Self {
            drops: DropCounter::new(Arc::clone(&session_id)),
            session_id,
            sender,
            ledger: None,
        }
    }

    /// Append non-progress events to `ledger`
    pub fn with_ledger(mut self, ledger: Arc<EventLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Progress events this session has dropped so far
    pub fn dropped_progress(&self) -> u64 {
        self.drops.dropped.load(Ordering::Relaxed)
    }

    /// Publish an event
    ///
    /// Progress goes through `try_send`; anything else waits for channel
    /// capacity. A dropped receiver is not an error.
    pub async fn emit(&self, event: EngineEvent) {
        if event.is_progress() {
            self.progress_event(event);
            return;
        }

        let envelope = EventEnvelope::new(self.session_id.as_ref(), event);
        tracing::debug!(
            event = envelope.event.type_name(),
            component = envelope.event.component_id(),
            "engine event"
        );

        if let Some(ledger) = &self.ledger {
            let ledger = Arc::clone(ledger);
            let record = envelope.clone();
            match tokio::task::spawn_blocking(move || ledger.append(&record)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!("Failed to append event to ledger: {:#}", e),
                Err(e) => tracing::warn!("Ledger task failed: {}", e),
            }
        }

        if let Some(sender) = &self.sender {
            if sender.send(envelope).await.is_err() {
                tracing::trace!("event receiver dropped");
            }
        }
    }

    /// Publish progress without waiting; dropped when the channel is full
    pub fn progress(&self, update: &ProgressUpdate) {
        self.progress_event(EngineEvent::Progress {
            component_id: update.component_id.clone(),
            stage: update.stage,
            percent: update.percent,
            message: update.message.clone(),
        });
    }

    fn progress_event(&self, event: EngineEvent) {
        let Some(sender) = &self.sender else {
            return;
        };
        match sender.try_send(EventEnvelope::new(self.session_id.as_ref(), event)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.drops.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::trace!("progress event dropped (channel full)");
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    /// Progress callback that forwards into this sink and then to `inner`
    pub fn progress_callback(&self, inner: Option<ProgressCallback>) -> ProgressCallback {
        let sink = self.clone();
        Arc::new(move |update: &ProgressUpdate| {
            sink.progress(update);
            if let Some(callback) = &inner {
                callback(update);
            }
        })
    }
}
