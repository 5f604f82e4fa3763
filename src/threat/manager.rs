//! Threat manager
//!
//! Owns the map of active threats. Each incoming signal is merged into the
//! threat sharing its derived id (escalating severity, accumulating sources)
//! or creates a new threat when it carries points. Threats expire when their
//! category heartbeat timeout elapses without a refreshing signal - binary
//! removal, no decay.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, info};

use super::identity::{derive_threat_id, is_false_positive, is_more_specific_name, threat_level};
use crate::types::{now_ts, ActiveThreat, Category, Signal, ThreatDetail, ThreatSummary};

/// Seconds between expiry sweeps.
const CLEANUP_PERIOD_SECS: f64 = 10.0;

/// Timeout applied to categories with no configured interval.
const DEFAULT_TIMEOUT_SECS: f64 = 60.0;

/// Rows kept in the summary's `threat_details`.
const SUMMARY_TOP_N: usize = 10;

// ============================================================================
// Category timeouts
// ============================================================================

/// Per-category heartbeat timeouts.
///
/// A threat is dropped once its category's segment has had three chances to
/// re-detect it and did not: `timeout = 3 × scan interval`, floored at one
/// interval.
#[derive(Debug, Clone)]
pub struct CategoryTimeouts {
    timeouts: HashMap<Category, f64>,
}

impl Default for CategoryTimeouts {
    fn default() -> Self {
        // Matches the default scan cadence: heavy segments every 120 s,
        // window-interval segments just above the 92 s batch window.
        Self {
            timeouts: HashMap::from([
                (Category::Programs, 360.0),
                (Category::Auto, 95.0),
                (Category::Network, 95.0),
                (Category::Behaviour, 95.0),
                (Category::Vm, 360.0),
                (Category::Screen, 95.0),
                (Category::System, 300.0),
            ]),
        }
    }
}

impl CategoryTimeouts {
    /// Build timeouts from configured scan intervals (seconds per category).
    /// Categories missing from the map keep their defaults.
    pub fn from_scan_intervals(intervals: &HashMap<Category, f64>) -> Self {
        let mut base = Self::default();
        for (category, interval) in intervals {
            base.timeouts
                .insert(*category, (interval.max(1.0) * 3.0).max(*interval));
        }
        base
    }

    pub fn for_category(&self, category: Category) -> f64 {
        self.timeouts
            .get(&category)
            .copied()
            .unwrap_or(DEFAULT_TIMEOUT_SECS)
    }

    #[cfg(test)]
    pub fn with_timeout(mut self, category: Category, secs: f64) -> Self {
        self.timeouts.insert(category, secs);
        self
    }
}

// ============================================================================
// Threat manager
// ============================================================================

/// Outcome of feeding one signal through the manager.
///
/// `suppress_emit` replaces the old exception-based UI dedup: the caller
/// skips emitting the signal when a strictly higher-severity active threat
/// already exists for the same threat id.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalDisposition {
    pub bot_probability: f64,
    pub suppress_emit: bool,
}

struct ManagerInner {
    active: HashMap<String, ActiveThreat>,
    last_cleanup: f64,
}

/// Single writer to the active-threat map; all state behind one mutex.
pub struct ThreatManager {
    inner: Mutex<ManagerInner>,
    timeouts: CategoryTimeouts,
}

impl Default for ThreatManager {
    fn default() -> Self {
        Self::new(CategoryTimeouts::default())
    }
}

impl ThreatManager {
    pub fn new(timeouts: CategoryTimeouts) -> Self {
        Self {
            inner: Mutex::new(ManagerInner {
                active: HashMap::new(),
                last_cleanup: 0.0,
            }),
            timeouts,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ManagerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Merge a signal into the active-threat map and return the updated
    /// probability plus the emit-suppression decision.
    pub fn process_signal(&self, signal: &Signal) -> SignalDisposition {
        let mut inner = self.lock();

        if is_false_positive(signal) {
            // Not tracked; still suppress when a stronger threat already
            // exists for the same id, so the UI keeps the worst signal.
            let suppress = Self::should_suppress(&inner, signal);
            return SignalDisposition {
                bot_probability: Self::probability(inner.active.values()),
                suppress_emit: suppress,
            };
        }

        let threat_id = derive_threat_id(signal);
        let now = signal.timestamp;
        let level = threat_level(signal);

        if let Some(threat) = inner.active.get_mut(&threat_id) {
            threat.last_seen = now;
            threat.detection_count += 1;
            threat.add_source(signal.category, &signal.name);

            // Escalate only - a lower-severity signal never downgrades.
            if level.points() > threat.status.points() {
                debug!(
                    threat_id = %threat_id,
                    from = %threat.status,
                    to = %level,
                    "Escalating threat severity"
                );
                threat.status = level;
                threat.threat_score = level.points();
            }
            if signal.details.len() > threat.details.len() {
                threat.details = signal.details.clone();
            }
            if is_more_specific_name(&signal.name, &threat.name) {
                threat.name = signal.name.clone();
            }
        } else if level.points() > 0 {
            inner.active.insert(
                threat_id.clone(),
                ActiveThreat {
                    threat_id: threat_id.clone(),
                    category: signal.category,
                    name: signal.name.clone(),
                    status: level,
                    details: signal.details.clone(),
                    first_seen: now,
                    last_seen: now,
                    detection_count: 1,
                    threat_score: level.points(),
                    detection_sources: vec![format!("{}/{}", signal.category, signal.name)],
                    confidence_score: 1,
                },
            );
        }

        // Periodic expiry sweep piggybacks on signal traffic; the pipeline
        // also runs a dedicated 10 s sweep for quiet periods.
        if now - inner.last_cleanup >= CLEANUP_PERIOD_SECS {
            inner.last_cleanup = now;
            Self::remove_expired(&mut inner, now, &self.timeouts);
        }

        let suppress = Self::should_suppress(&inner, signal);
        SignalDisposition {
            bot_probability: Self::probability(inner.active.values()),
            suppress_emit: suppress,
        }
    }

    fn should_suppress(inner: &ManagerInner, signal: &Signal) -> bool {
        let threat_id = derive_threat_id(signal);
        match inner.active.get(&threat_id) {
            Some(existing) => existing.status.points() > threat_level(signal).points(),
            None => false,
        }
    }

    /// Remove threats whose heartbeat timeout elapsed. Called by the
    /// pipeline's 10 s maintenance tick so expiry also happens while no
    /// signals arrive.
    pub fn sweep_expired(&self, now: f64) {
        let mut inner = self.lock();
        Self::remove_expired(&mut inner, now, &self.timeouts);
    }

    fn remove_expired(inner: &mut ManagerInner, now: f64, timeouts: &CategoryTimeouts) {
        let expired: Vec<String> = inner
            .active
            .values()
            .filter(|t| now - t.last_seen > timeouts.for_category(t.category))
            .map(|t| t.threat_id.clone())
            .collect();

        for threat_id in expired {
            if let Some(threat) = inner.active.remove(&threat_id) {
                info!(
                    threat_id = %threat_id,
                    name = %threat.name,
                    category = %threat.category,
                    idle_secs = (now - threat.last_seen) as i64,
                    "Removing expired threat"
                );
            }
        }
    }

    fn probability<'a>(threats: impl Iterator<Item = &'a ActiveThreat>) -> f64 {
        let total: u32 = threats.map(|t| t.threat_score).sum();
        f64::from(total).clamp(0.0, 100.0)
    }

    /// Current deduplicated bot probability in `[0, 100]`.
    pub fn bot_probability(&self) -> f64 {
        Self::probability(self.lock().active.values())
    }

    /// Snapshot of all active threats.
    pub fn active_threats(&self) -> Vec<ActiveThreat> {
        self.lock().active.values().cloned().collect()
    }

    /// Consistent summary for the batcher and dashboard.
    pub fn summary(&self, window_start: Option<f64>) -> ThreatSummary {
        self.summary_at(now_ts(), window_start)
    }

    /// Summary with an explicit "now", restricted to threats refreshed at or
    /// after `window_start` when given.
    pub fn summary_at(&self, now: f64, window_start: Option<f64>) -> ThreatSummary {
        let inner = self.lock();
        let threats: Vec<&ActiveThreat> = inner
            .active
            .values()
            .filter(|t| window_start.map_or(true, |ws| t.last_seen >= ws))
            .collect();

        let mut category_breakdown: HashMap<String, usize> = HashMap::new();
        for threat in &threats {
            *category_breakdown
                .entry(threat.category.as_str().to_string())
                .or_default() += 1;
        }

        let bot_probability = Self::probability(threats.iter().copied());
        let vm_probability = Self::probability(
            threats
                .iter()
                .copied()
                .filter(|t| t.category == Category::Vm),
        );

        let mut sorted: Vec<&ActiveThreat> = threats.clone();
        sorted.sort_by(|a, b| b.threat_score.cmp(&a.threat_score));

        let threat_details = sorted
            .iter()
            .take(SUMMARY_TOP_N)
            .map(|t| ThreatDetail {
                threat_id: t.threat_id.clone(),
                name: t.name.clone(),
                category: t.category,
                status: t.status,
                score: f64::from(t.threat_score),
                age_seconds: (now - t.last_seen) as i64,
                confidence: t.confidence_score,
                sources: t.detection_sources.clone(),
                detections: t.detection_count,
            })
            .collect();

        ThreatSummary {
            bot_probability: (bot_probability * 10.0).round() / 10.0,
            vm_probability: (vm_probability * 10.0).round() / 10.0,
            total_active_threats: threats.len(),
            critical_threats: threats.iter().filter(|t| t.status == crate::types::Status::Critical).count(),
            alert_threats: threats.iter().filter(|t| t.status == crate::types::Status::Alert).count(),
            warn_threats: threats.iter().filter(|t| t.status == crate::types::Status::Warn).count(),
            category_breakdown,
            threat_details,
        }
    }

    /// Drop all tracked threats.
    pub fn cleanup(&self) {
        let mut inner = self.lock();
        inner.active.clear();
        inner.last_cleanup = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Status;

    fn signal_at(
        ts: f64,
        category: Category,
        name: &str,
        status: Status,
        details: &str,
    ) -> Signal {
        let mut sig = Signal::new(category, name, status, details);
        sig.timestamp = ts;
        sig
    }

    #[test]
    fn test_single_warn_creates_threat_with_escalated_level() {
        let manager = ThreatManager::default();
        let sig = signal_at(100.0, Category::Auto, "Python", Status::Warn, "Python detected");

        let disposition = manager.process_signal(&sig);

        // WARN in auto maps to ALERT (10 points)
        assert_eq!(disposition.bot_probability, 10.0);
        assert!(!disposition.suppress_emit);

        let threats = manager.active_threats();
        assert_eq!(threats.len(), 1);
        let t = &threats[0];
        assert_eq!(t.threat_id, "python");
        assert_eq!(t.status, Status::Alert);
        assert_eq!(t.threat_score, t.status.points());
        assert!(t.first_seen <= t.last_seen);
        assert!(t.detection_count as usize >= t.detection_sources.len());
    }

    #[test]
    fn test_escalation_by_second_source() {
        let manager = ThreatManager::default();

        manager.process_signal(&signal_at(
            100.0,
            Category::Programs,
            "Suspicious Code: openholdem.exe",
            Status::Warn,
            "entropy hit",
        ));
        manager.process_signal(&signal_at(
            101.0,
            Category::Auto,
            "OpenHoldem",
            Status::Alert,
            "automation runtime present",
        ));

        let threats = manager.active_threats();
        assert_eq!(threats.len(), 1);
        let t = &threats[0];
        assert_eq!(t.threat_id, "openholdem");
        // ALERT + known bot token ⇒ CRITICAL
        assert_eq!(t.status, Status::Critical);
        assert_eq!(t.threat_score, 15);
        assert_eq!(t.confidence_score, 2);
        assert_eq!(t.detection_count, 2);
        assert_eq!(manager.bot_probability(), 15.0);
    }

    #[test]
    fn test_status_never_downgrades() {
        let manager = ThreatManager::default();

        manager.process_signal(&signal_at(
            100.0,
            Category::Network,
            "rdp.exe session",
            Status::Alert,
            "",
        ));
        manager.process_signal(&signal_at(
            101.0,
            Category::Network,
            "rdp.exe session",
            Status::Warn,
            "",
        ));

        let t = &manager.active_threats()[0];
        assert_eq!(t.status, Status::Alert);
        assert_eq!(t.threat_score, 10);
        assert_eq!(t.detection_count, 2);
    }

    #[test]
    fn test_info_signals_do_not_create_threats() {
        let manager = ThreatManager::default();
        let disposition = manager.process_signal(&signal_at(
            100.0,
            Category::Programs,
            "Other Poker Site: pokerstars",
            Status::Info,
            "",
        ));
        assert_eq!(disposition.bot_probability, 0.0);
        assert!(manager.active_threats().is_empty());
    }

    #[test]
    fn test_lower_severity_duplicate_is_suppressed() {
        let manager = ThreatManager::default();

        manager.process_signal(&signal_at(
            100.0,
            Category::Auto,
            "python.exe automation",
            Status::Alert,
            "",
        ));
        // ALERT threat exists; a WARN python signal outside auto maps to
        // ALERT too (name contains python) - equal points, not suppressed.
        let equal = manager.process_signal(&signal_at(
            101.0,
            Category::Programs,
            "python.exe spawned",
            Status::Warn,
            "",
        ));
        assert!(!equal.suppress_emit);

        // An INFO-mapped signal for the same threat id is suppressed.
        let lower = manager.process_signal(&signal_at(
            102.0,
            Category::Programs,
            "python.exe listed",
            Status::Info,
            "",
        ));
        assert!(lower.suppress_emit);
    }

    #[test]
    fn test_expiry_after_category_timeout() {
        let timeouts = CategoryTimeouts::default().with_timeout(Category::Auto, 95.0);
        let manager = ThreatManager::new(timeouts);

        manager.process_signal(&signal_at(0.0, Category::Auto, "Macro Replay", Status::Alert, ""));
        assert_eq!(manager.active_threats().len(), 1);

        // Just inside the timeout - still alive
        manager.sweep_expired(94.0);
        assert_eq!(manager.active_threats().len(), 1);

        // Past the timeout - removed, probability back to zero
        manager.sweep_expired(96.0);
        assert!(manager.active_threats().is_empty());
        assert_eq!(manager.bot_probability(), 0.0);
    }

    #[test]
    fn test_probability_clamped_to_100() {
        let manager = ThreatManager::default();
        for i in 0..10 {
            manager.process_signal(&signal_at(
                100.0 + f64::from(i),
                Category::Programs,
                &format!("tool{i}.exe malware", i = i),
                Status::Critical,
                "",
            ));
        }
        assert_eq!(manager.bot_probability(), 100.0);
    }

    #[test]
    fn test_summary_window_restriction_and_top_sorting() {
        let manager = ThreatManager::default();
        manager.process_signal(&signal_at(100.0, Category::Programs, "old.exe found", Status::Warn, ""));
        manager.process_signal(&signal_at(200.0, Category::Auto, "fresh.exe macro", Status::Alert, ""));

        let all = manager.summary_at(210.0, None);
        assert_eq!(all.total_active_threats, 2);
        // Sorted by score descending
        assert_eq!(all.threat_details[0].threat_id, "fresh");

        let windowed = manager.summary_at(210.0, Some(150.0));
        assert_eq!(windowed.total_active_threats, 1);
        assert_eq!(windowed.threat_details[0].threat_id, "fresh");
        assert_eq!(windowed.bot_probability, 10.0);
    }

    #[test]
    fn test_details_replaced_only_when_longer() {
        let manager = ThreatManager::default();
        manager.process_signal(&signal_at(
            100.0,
            Category::Programs,
            "bot.exe",
            Status::Warn,
            "a long and detailed description",
        ));
        manager.process_signal(&signal_at(
            101.0,
            Category::Programs,
            "bot.exe",
            Status::Warn,
            "short",
        ));
        assert_eq!(
            manager.active_threats()[0].details,
            "a long and detailed description"
        );
    }
}
