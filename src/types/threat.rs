//! Aggregated threat model
//!
//! An [`ActiveThreat`] is the persistent view of one underlying threat across
//! every signal that mapped to the same threat id. The threat manager owns
//! the live map; the summary types here are the read-only snapshots handed to
//! the batcher and the dashboard.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::{Category, Status};

/// Persistent threat tracked across batches until its category heartbeat
/// timeout elapses without a refreshing signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveThreat {
    /// Canonical identifier derived from signal content (see `threat::identity`).
    pub threat_id: String,
    pub category: Category,
    pub name: String,
    pub status: Status,
    pub details: String,
    pub first_seen: f64,
    pub last_seen: f64,
    /// Total signals merged into this threat; always ≥ 1 and ≥ source count.
    pub detection_count: u64,
    /// Current point value; always equals `status.points()`.
    pub threat_score: u32,
    /// Ordered-unique `"{category}/{name}"` strings that fed this threat.
    pub detection_sources: Vec<String>,
    /// Number of distinct detection sources.
    pub confidence_score: u32,
}

impl ActiveThreat {
    /// Record a `"{category}/{name}"` source if not already tracked and keep
    /// the confidence count in sync.
    pub fn add_source(&mut self, category: Category, name: &str) {
        let source = format!("{}/{}", category, name);
        if !self.detection_sources.contains(&source) {
            self.detection_sources.push(source);
            self.confidence_score = self.detection_sources.len() as u32;
        }
    }
}

/// Per-threat detail row inside a [`ThreatSummary`] snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreatDetail {
    pub threat_id: String,
    pub name: String,
    pub category: Category,
    pub status: Status,
    pub score: f64,
    pub age_seconds: i64,
    pub confidence: u32,
    pub sources: Vec<String>,
    pub detections: u64,
}

/// Consistent read of the threat manager taken under its lock.
///
/// `threat_details` holds at most the top 10 threats by score; the counters
/// cover every threat in the (optionally window-restricted) view.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThreatSummary {
    /// Deduplicated bot probability, rounded to one decimal.
    pub bot_probability: f64,
    /// Same linear sum restricted to `vm`-category threats.
    pub vm_probability: f64,
    pub total_active_threats: usize,
    pub critical_threats: usize,
    pub alert_threats: usize,
    pub warn_threats: usize,
    pub category_breakdown: HashMap<String, usize>,
    pub threat_details: Vec<ThreatDetail>,
}

impl ThreatSummary {
    /// Look up the detail row for a threat id, if it made the top 10.
    pub fn detail(&self, threat_id: &str) -> Option<&ThreatDetail> {
        self.threat_details.iter().find(|d| d.threat_id == threat_id)
    }
}
