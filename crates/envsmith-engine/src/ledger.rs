//! Append-only JSONL history of engine events

use crate::events::EventEnvelope;
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use fs4::fs_std::FileExt;
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// Default number of events shown by `envsmith log`
pub const DEFAULT_LOG_TAIL_LINES: usize = 25;

/// Compact every N appends
const AUTO_COMPACT_INTERVAL: usize = 500;

const AUTO_COMPACT_RETENTION_DAYS: i64 = 90;

/// Filter criteria for querying events from the ledger
#[derive(Debug, Default, Clone)]
pub struct EventFilter {
    pub component_id: Option<String>,
    /// Serialized type names, e.g. "failure" or "status_changed"
    pub event_types: Option<Vec<String>>,
    pub since: Option<DateTime<Utc>>,
    /// Keep only the most recent N matches
    pub limit: Option<usize>,
}

/// Summary statistics
#[derive(Debug, Default, Clone)]
pub struct LedgerStats {
    pub total_events: usize,
    pub file_size_bytes: u64,
    pub oldest_timestamp: Option<DateTime<Utc>>,
    pub newest_timestamp: Option<DateTime<Utc>>,
    pub event_type_counts: HashMap<String, usize>,
}

/// JSONL event ledger guarded by an exclusive file lock
#[derive(Debug)]
pub struct EventLedger {
    ledger_path: PathBuf,
}

impl EventLedger {
    pub fn new(ledger_path: impl Into<PathBuf>) -> Self {
        Self {
            ledger_path: ledger_path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.ledger_path
    }

    /// Append one event (file-locked, synced) and compact periodically
    pub fn append(&self, event: &EventEnvelope) -> Result<()> {
        if let Some(parent) = self.ledger_path.parent() {
            fs::create_dir_all(parent).context("Failed to create ledger directory")?;
        }

        {
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.ledger_path)
                .context("Failed to open ledger file")?;

            file.lock_exclusive()
                .context("Failed to acquire exclusive lock on ledger")?;

            let line = serde_json::to_string(event).context("Failed to serialize event")?;
            writeln!(file, "{}", line).context("Failed to write event to ledger")?;
            file.sync_all().context("Failed to sync ledger file")?;
        }

        self.maybe_auto_compact();
        Ok(())
    }

    fn maybe_auto_compact(&self) {
        let count = match self.count_events() {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!("Auto-compaction skipped: {:#}", e);
                return;
            }
        };

        if count > 0 && count % AUTO_COMPACT_INTERVAL == 0 {
            match self.compact(AUTO_COMPACT_RETENTION_DAYS) {
                Ok(removed) if removed > 0 => {
                    tracing::info!("Auto-compacted ledger: removed {} old events", removed)
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("Auto-compaction failed: {:#}", e),
            }
        }
    }

    fn count_events(&self) -> Result<usize> {
        if !self.ledger_path.exists() {
            return Ok(0);
        }
        let file = fs::File::open(&self.ledger_path).context("Failed to open ledger file")?;
        Ok(BufReader::new(file)
            .lines()
            .filter(|l| l.as_ref().map(|s| !s.trim().is_empty()).unwrap_or(false))
            .count())
    }

    /// Read every event in chronological order
    fn read_all(&self) -> Result<Vec<EventEnvelope>> {
        if !self.ledger_path.exists() {
            return Ok(Vec::new());
        }

        let file = fs::File::open(&self.ledger_path).context("Failed to open ledger file")?;
        let mut events = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.context("Failed to read line from ledger")?;
            if line.trim().is_empty() {
                continue;
            }
            let envelope: EventEnvelope =
                serde_json::from_str(&line).context("Failed to deserialize event from ledger")?;
            events.push(envelope);
        }
        Ok(events)
    }

    /// Events matching `filter`, oldest first
    pub fn query(&self, filter: &EventFilter) -> Result<Vec<EventEnvelope>> {
        let mut events: Vec<EventEnvelope> = self
            .read_all()?
            .into_iter()
            .filter(|e| {
                filter
                    .component_id
                    .as_deref()
                    .is_none_or(|id| e.event.component_id() == id)
            })
            .filter(|e| {
                filter
                    .event_types
                    .as_ref()
                    .is_none_or(|types| types.iter().any(|t| t == e.event.type_name()))
            })
            .filter(|e| filter.since.is_none_or(|since| e.timestamp >= since))
            .collect();

        if let Some(limit) = filter.limit {
            if events.len() > limit {
                events = events.split_off(events.len() - limit);
            }
        }
        Ok(events)
    }

    /// History for one component, most recent `limit` events
    pub fn history(&self, component_id: &str, limit: Option<usize>) -> Result<Vec<EventEnvelope>> {
        self.query(&EventFilter {
            component_id: Some(component_id.to_string()),
            limit,
            ..Default::default()
        })
    }

    /// Drop events older than the retention period
    ///
    /// The newest event for each component is always kept.
    pub fn compact(&self, retention_days: i64) -> Result<usize> {
        if !self.ledger_path.exists() {
            return Ok(0);
        }

        let cutoff = Utc::now() - Duration::days(retention_days);
        let events = self.read_all()?;

        let mut latest: HashMap<&str, &str> = HashMap::new();
        for event in &events {
            latest.insert(event.event.component_id(), event.event_id.as_str());
        }

        let temp_path = self.ledger_path.with_extension("jsonl.tmp");
        let mut temp_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&temp_path)
            .context("Failed to create temp ledger file")?;

        let mut removed = 0;
        for event in &events {
            let is_latest = latest.get(event.event.component_id()) == Some(&event.event_id.as_str());
            if event.timestamp >= cutoff || is_latest {
                let line = serde_json::to_string(event).context("Failed to serialize event")?;
                writeln!(temp_file, "{}", line).context("Failed to write to temp ledger")?;
            } else {
                removed += 1;
            }
        }

        temp_file.sync_all().context("Failed to sync temp ledger")?;
        drop(temp_file);

        fs::rename(&temp_path, &self.ledger_path)
            .context("Failed to replace ledger with compacted version")?;

        Ok(removed)
    }

    pub fn stats(&self) -> Result<LedgerStats> {
        if !self.ledger_path.exists() {
            return Ok(LedgerStats::default());
        }

        let events = self.read_all()?;
        let mut stats = LedgerStats {
            total_events: events.len(),
            file_size_bytes: fs::metadata(&self.ledger_path)
                .context("Failed to get ledger file metadata")?
                .len(),
            oldest_timestamp: events.iter().map(|e| e.timestamp).min(),
            newest_timestamp: events.iter().map(|e| e.timestamp).max(),
            ..Default::default()
        };
        for event in &events {
            *stats
                .event_type_counts
                .entry(event.event.type_name().to_string())
                .or_insert(0) += 1;
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EngineEvent;
    use envsmith_core::types::ComponentState;
    use tempfile::TempDir;

    fn status_event(id: &str, new_state: ComponentState) -> EventEnvelope {
        EventEnvelope::new(
            "session",
            EngineEvent::StatusChanged {
                component_id: id.to_string(),
                old_state: ComponentState::NotDetected,
                new_state,
            },
        )
    }

    #[test]
    fn test_append_and_history() {
        let temp = TempDir::new().unwrap();
        let ledger = EventLedger::new(temp.path().join("events.jsonl"));

        ledger.append(&status_event("git", ComponentState::Detected)).unwrap();
        ledger.append(&status_event("node", ComponentState::Installed)).unwrap();
        ledger.append(&status_event("git", ComponentState::Installed)).unwrap();

        let history = ledger.history("git", None).unwrap();
        assert_eq!(history.len(), 2);

        let latest = ledger.history("git", Some(1)).unwrap();
        assert!(matches!(
            latest[0].event,
            EngineEvent::StatusChanged {
                new_state: ComponentState::Installed,
                ..
            }
        ));
    }

    #[test]
    fn test_query_by_type() {
        let temp = TempDir::new().unwrap();
        let ledger = EventLedger::new(temp.path().join("events.jsonl"));

        ledger.append(&status_event("git", ComponentState::Detected)).unwrap();
        ledger
            .append(&EventEnvelope::new(
                "session",
                EngineEvent::IntegrityWarning {
                    component_id: "git".into(),
                    url: "https://example.com/git.tgz".into(),
                },
            ))
            .unwrap();

        let warnings = ledger
            .query(&EventFilter {
                event_types: Some(vec!["integrity_warning".into()]),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(warnings.len(), 1);

        let stats = ledger.stats().unwrap();
        assert_eq!(stats.total_events, 2);
        assert_eq!(stats.event_type_counts.get("status_changed"), Some(&1));
    }

    #[test]
    fn test_compact_keeps_latest_per_component() {
        let temp = TempDir::new().unwrap();
        let ledger = EventLedger::new(temp.path().join("events.jsonl"));

        let mut old = status_event("git", ComponentState::Detected);
        old.timestamp = Utc::now() - Duration::days(200);
        let mut old_latest = status_event("node", ComponentState::Installed);
        old_latest.timestamp = Utc::now() - Duration::days(150);

        ledger.append(&old).unwrap();
        ledger.append(&old_latest).unwrap();
        ledger.append(&status_event("git", ComponentState::Installed)).unwrap();

        let removed = ledger.compact(90).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(ledger.history("node", None).unwrap().len(), 1);
        assert_eq!(ledger.history("git", None).unwrap().len(), 1);
    }

    #[test]
    fn test_missing_ledger_is_empty() {
        let temp = TempDir::new().unwrap();
        let ledger = EventLedger::new(temp.path().join("absent.jsonl"));
        assert!(ledger.query(&EventFilter::default()).unwrap().is_empty());
        assert_eq!(ledger.compact(1).unwrap(), 0);
    }
}
