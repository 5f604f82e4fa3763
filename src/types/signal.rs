//! Detection signal model
//!
//! A [`Signal`] is a single detection event emitted by a segment. Signals are
//! immutable once posted: the threat manager aggregates them into
//! [`ActiveThreat`](super::ActiveThreat)s and the report batcher folds them
//! into unified batch reports.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time as fractional seconds since the Unix epoch.
///
/// All signal and batch timestamps use this representation so the wire
/// format stays compatible with the dashboard.
pub fn now_ts() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

// ============================================================================
// Category
// ============================================================================

/// Closed set of detection categories.
///
/// Each segment emits into exactly one category; per-category heartbeat
/// timeouts in the threat manager are keyed on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Programs,
    Network,
    Behaviour,
    Auto,
    Vm,
    Screen,
    Security,
    System,
}

impl Category {
    /// All categories that detection segments emit into (excludes `system`,
    /// which is reserved for batch reports and scanner lifecycle signals).
    pub const DETECTION_CATEGORIES: [Category; 7] = [
        Category::Programs,
        Category::Network,
        Category::Behaviour,
        Category::Auto,
        Category::Vm,
        Category::Screen,
        Category::Security,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Programs => "programs",
            Category::Network => "network",
            Category::Behaviour => "behaviour",
            Category::Auto => "auto",
            Category::Vm => "vm",
            Category::Screen => "screen",
            Category::Security => "security",
            Category::System => "system",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Status
// ============================================================================

/// Signal severity, ordered `OK < INFO < WARN < ALERT < CRITICAL`.
///
/// The derived `Ord` follows variant order, so comparisons match the point
/// tiers used by the threat manager.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Ok,
    #[default]
    Info,
    Warn,
    Alert,
    Critical,
}

impl Status {
    /// Threat points contributed by a threat at this status.
    ///
    /// `OK` and `INFO` carry no points; threats are only created for
    /// point-bearing statuses.
    pub fn points(&self) -> u32 {
        match self {
            Status::Ok | Status::Info => 0,
            Status::Warn => 5,
            Status::Alert => 10,
            Status::Critical => 15,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::Info => "INFO",
            Status::Warn => "WARN",
            Status::Alert => "ALERT",
            Status::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Signal
// ============================================================================

/// A single detection event.
///
/// Identity fields (`device_id`, `device_name`, `device_ip`) are optional at
/// the emit site; `post_signal` fills them from the host before the signal
/// reaches the bus. A signal is never dropped solely because identity is
/// missing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    /// Seconds since the Unix epoch at creation time.
    pub timestamp: f64,
    pub category: Category,
    /// Free-form label describing the detection.
    pub name: String,
    pub status: Status,
    /// Opaque details; batch reports carry their JSON document here.
    pub details: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_ip: Option<String>,
    /// Name of the segment that created this signal, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segment_name: Option<String>,
}

impl Signal {
    /// Build a signal stamped with the current time and no identity.
    pub fn new(
        category: Category,
        name: impl Into<String>,
        status: Status,
        details: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: now_ts(),
            category,
            name: name.into(),
            status,
            details: details.into(),
            device_id: None,
            device_name: None,
            device_ip: None,
            segment_name: None,
        }
    }

    /// True for the periodic unified batch report signal.
    pub fn is_batch_report(&self) -> bool {
        self.category == Category::System && self.name.contains("Scan Report")
    }

    /// True for the nickname signal emitted by the screen segment when it
    /// reads the player name off the lobby window.
    pub fn is_player_name(&self) -> bool {
        self.category == Category::System && self.name == "Player Name Detected"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_ordering_matches_points() {
        assert!(Status::Ok < Status::Info);
        assert!(Status::Info < Status::Warn);
        assert!(Status::Warn < Status::Alert);
        assert!(Status::Alert < Status::Critical);

        assert_eq!(Status::Critical.points(), 15);
        assert_eq!(Status::Alert.points(), 10);
        assert_eq!(Status::Warn.points(), 5);
        assert_eq!(Status::Info.points(), 0);
        assert_eq!(Status::Ok.points(), 0);
    }

    #[test]
    fn test_status_wire_format_is_uppercase() {
        assert_eq!(serde_json::to_string(&Status::Critical).unwrap(), "\"CRITICAL\"");
        assert_eq!(
            serde_json::from_str::<Status>("\"WARN\"").unwrap(),
            Status::Warn
        );
    }

    #[test]
    fn test_category_wire_format_is_lowercase() {
        assert_eq!(serde_json::to_string(&Category::Behaviour).unwrap(), "\"behaviour\"");
        assert_eq!(
            serde_json::from_str::<Category>("\"vm\"").unwrap(),
            Category::Vm
        );
    }

    #[test]
    fn test_batch_report_detection() {
        let mut sig = Signal::new(Category::System, "Unified Scan Report", Status::Info, "{}");
        assert!(sig.is_batch_report());

        sig.category = Category::Programs;
        assert!(!sig.is_batch_report());

        let nick = Signal::new(Category::System, "Player Name Detected", Status::Info, "{}");
        assert!(nick.is_player_name());
        assert!(!nick.is_batch_report());
    }
}
