//! Time-bounded cache of detection reports

use super::DetectionReport;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub struct DetectionCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, (Instant, DetectionReport)>>,
}

impl DetectionCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// A fresh report; expired entries are evicted on lookup
    pub fn get(&self, component_id: &str) -> Option<DetectionReport> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get(component_id) {
            Some((stored, report)) if stored.elapsed() < self.ttl => Some(report.clone()),
            Some(_) => {
                entries.remove(component_id);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, report: DetectionReport) {
        if self.ttl.is_zero() {
            return;
        }
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(report.component_id.clone(), (Instant::now(), report));
    }

    pub fn invalidate(&self, component_id: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(component_id);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
