//! Unified batch report wire model
//!
//! The report batcher folds one window of detections plus a threat-manager
//! snapshot into a [`UnifiedBatchReport`]. The document travels embedded as a
//! JSON string in the `details` of a `system`/`Unified Scan Report` signal so
//! the wire keeps a uniform signal schema; forwarders parse it back out.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::{Category, Status, ThreatDetail};

/// Deduplicated detection row assembled by the batcher.
///
/// Signals inside one window that share (category, name, details, segment)
/// collapse into a single entry with an occurrence count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionEntry {
    pub name: String,
    pub segment: String,
    pub category: Category,
    pub status: Status,
    pub points: u32,
    pub first_detected: f64,
    pub details: String,
    pub occurrences: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threat_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threat_sources: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threat_confidence: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threat_score: Option<f64>,
}

/// Severity and score roll-up for one batch window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub critical: usize,
    pub alert: usize,
    pub warn: usize,
    pub info: usize,
    pub total_detections: usize,
    pub total_threats: usize,
    /// Deduplicated score - mirrors `bot_probability`.
    pub threat_score: f64,
    /// Pre-dedup sum of per-detection points (display only).
    pub raw_detection_score: u32,
}

/// Host block attached to every report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemBlock {
    pub cpu_percent: f64,
    pub mem_used_percent: f64,
    pub segments_running: usize,
    pub env: String,
    pub host: String,
}

impl Default for SystemBlock {
    fn default() -> Self {
        Self {
            cpu_percent: 0.0,
            mem_used_percent: 0.0,
            segments_running: 0,
            env: "PROD".to_string(),
            host: "unknown".to_string(),
        }
    }
}

/// `device` sub-object kept for dashboard compatibility.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceBlock {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
}

// ============================================================================
// Pipeline metadata (TESTING_JSON)
// ============================================================================

/// Human-readable description of the signal flow, for dashboard debugging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowMetadata {
    pub description: String,
    pub steps: Vec<String>,
}

/// Per-segment row inside the metadata block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentMetadata {
    pub name: String,
    pub category: Category,
    pub interval: f64,
    pub status: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimingMetadata {
    pub batch_interval: f64,
    pub sync_segments: bool,
    pub segment_intervals: HashMap<String, f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationMetadata {
    pub env: String,
    pub web_enabled: bool,
    pub testing_json: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemStateMetadata {
    pub segments_running: usize,
    pub batch_count: u64,
    pub cpu_percent: f64,
    pub mem_used_percent: f64,
    pub host: String,
}

/// Pipeline topology block attached to reports when `TESTING_JSON` is on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportMetadata {
    pub flow: FlowMetadata,
    pub segments: Vec<SegmentMetadata>,
    pub timing: TimingMetadata,
    pub configuration: ConfigurationMetadata,
    pub system_state: SystemStateMetadata,
}

// ============================================================================
// Unified batch report
// ============================================================================

/// One window's unified scan report.
///
/// Emitted every batch interval - also for empty windows, where it doubles
/// as the device heartbeat. `aggregated_threats` is the primary source of
/// truth for the dashboard; `detections` is the deduplicated display list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedBatchReport {
    /// Always `"unified"`.
    pub scan_type: String,
    /// Strictly monotonic per-process counter.
    pub batch_number: u64,
    /// Deduplicated score in `[0, 100]`, one decimal.
    pub bot_probability: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    pub device_id: String,
    pub device_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_ip: Option<String>,
    pub device: DeviceBlock,
    pub timestamp: f64,
    /// Stamped at send time; the dashboard uses it for online/offline state.
    pub batch_sent_at: f64,
    pub summary: ReportSummary,
    pub categories: HashMap<String, usize>,
    pub active_threats: usize,
    pub aggregated_threats: Vec<ThreatDetail>,
    pub detections: Vec<DetectionEntry>,
    pub vm_probability: f64,
    pub file_analysis_count: usize,
    pub system: SystemBlock,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ReportMetadata>,
}

impl UnifiedBatchReport {
    /// Signal name the report travels under.
    pub const SIGNAL_NAME: &'static str = "Unified Scan Report";

    /// Parse a report back out of a batch signal's `details` string.
    pub fn from_details(details: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(details)
    }
}
