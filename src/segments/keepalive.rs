//! Detection keepalive
//!
//! Heavy scans run less often than the batch window, so a detection found in
//! one scan would vanish from intermediate batches and its threat would
//! expire early. Segments mark detections active after the expensive pass;
//! the keepalive re-emits lightweight copies on its own cadence until the
//! detection goes stale, keeping the threat's heartbeat alive without
//! repeating the heavy work.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::runtime::Runtime;
use crate::types::{Category, Status};

struct KeepaliveEntry {
    name: String,
    status: Status,
    details: String,
    last_seen: f64,
    last_emit: f64,
}

/// Tracks active detections for one segment and re-emits them periodically.
pub struct DetectionKeepalive {
    category: Category,
    keepalive_interval: f64,
    active_timeout: f64,
    entries: Mutex<HashMap<String, KeepaliveEntry>>,
}

impl DetectionKeepalive {
    pub fn new(category: Category, keepalive_interval: f64, active_timeout: f64) -> Self {
        let keepalive_interval = keepalive_interval.max(10.0);
        Self {
            category,
            keepalive_interval,
            active_timeout: active_timeout.max(keepalive_interval),
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, KeepaliveEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Declare a detection active, right after emitting the full signal.
    pub fn mark_active(&self, key: &str, name: &str, status: Status, details: &str, now: f64) {
        let mut entries = self.lock();
        match entries.get_mut(key) {
            Some(entry) => {
                entry.last_seen = now;
                entry.name = name.to_string();
                entry.status = status;
                entry.details = details.to_string();
            }
            None => {
                entries.insert(
                    key.to_string(),
                    KeepaliveEntry {
                        name: name.to_string(),
                        status,
                        details: details.to_string(),
                        last_seen: now,
                        last_emit: now,
                    },
                );
            }
        }
    }

    /// Drop a detection immediately (segment saw it disappear).
    pub fn mark_inactive(&self, key: &str) {
        self.lock().remove(key);
    }

    /// Re-emit keepalive signals for still-active detections and drop stale
    /// ones. Called from the segment's tick.
    pub fn emit_keepalives(&self, runtime: &Runtime, now: f64) {
        let due: Vec<(String, Status, String)> = {
            let mut entries = self.lock();
            entries.retain(|_, e| now - e.last_seen <= self.active_timeout);
            entries
                .values_mut()
                .filter(|e| now - e.last_emit >= self.keepalive_interval)
                .map(|e| {
                    e.last_emit = now;
                    (e.name.clone(), e.status, e.details.clone())
                })
                .collect()
        };

        for (name, status, details) in due {
            runtime.post_signal(self.category, name, status, details, None);
        }
    }

    pub fn active_count(&self) -> usize {
        self.lock().len()
    }
}
