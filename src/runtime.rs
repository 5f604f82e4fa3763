//! Runtime wiring
//!
//! [`Runtime`] owns the process-lifetime pieces of the pipeline - the event
//! bus, the threat manager, and this workstation's identity - and provides
//! [`post_signal`](Runtime::post_signal), the single ingress point every
//! segment uses. Components receive the runtime by reference; a package-level
//! default instance exists only for the binary entry point.

use std::sync::atomic::AtomicU64;
use std::sync::{Arc, OnceLock};

use tracing::{debug, warn};

use crate::bus::{EventBus, DETECTION_EVENT};
use crate::host::DeviceIdentity;
use crate::threat::{CategoryTimeouts, SignalDisposition, ThreatManager};
use crate::types::{Category, Signal, Status};

pub struct Runtime {
    bus: EventBus,
    threats: ThreatManager,
    identity: DeviceIdentity,
    /// Batch numbering is per process, not per pipeline activation: the
    /// protected client opens and closes many times during one agent run,
    /// and the dashboard relies on the counter never restarting meanwhile.
    batch_counter: Arc<AtomicU64>,
}

impl Runtime {
    pub fn new(identity: DeviceIdentity, timeouts: CategoryTimeouts) -> Self {
        Self {
            bus: EventBus::new(),
            threats: ThreatManager::new(timeouts),
            identity,
            batch_counter: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn threats(&self) -> &ThreatManager {
        &self.threats
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Process-lifetime batch counter shared with every batcher instance.
    pub fn batch_counter(&self) -> &Arc<AtomicU64> {
        &self.batch_counter
    }

    /// Post a detection signal from a segment.
    ///
    /// Fills missing identity fields from the host, feeds the threat
    /// manager, and emits on the `detection` event - unless a strictly
    /// higher-severity active threat already exists for the same threat id,
    /// in which case the emit is suppressed so the UI keeps the worst signal.
    pub fn post_signal(
        &self,
        category: Category,
        name: impl Into<String>,
        status: Status,
        details: impl Into<String>,
        segment_name: Option<&str>,
    ) -> SignalDisposition {
        let mut signal = Signal::new(category, name, status, details);
        signal.device_id = Some(self.identity.device_id.clone());
        signal.device_name = Some(self.identity.device_name.clone());
        signal.device_ip = self.identity.device_ip.clone();
        signal.segment_name = segment_name.map(str::to_string);

        self.post(signal)
    }

    /// [`post_signal`](Self::post_signal) for an already-built signal.
    /// Missing identity fields are filled in; present ones are kept.
    pub fn post(&self, mut signal: Signal) -> SignalDisposition {
        if signal.device_id.is_none() {
            signal.device_id = Some(self.identity.device_id.clone());
            signal.device_name = Some(self.identity.device_name.clone());
        }
        if signal.device_ip.is_none() {
            signal.device_ip = self.identity.device_ip.clone();
        }

        debug!(
            category = %signal.category,
            name = %signal.name,
            status = %signal.status,
            "Signal posted"
        );

        let disposition = self.threats.process_signal(&signal);
        if disposition.suppress_emit {
            debug!(name = %signal.name, "Suppressing lower-severity duplicate");
            return disposition;
        }

        if let Err(e) = self.bus.emit(DETECTION_EVENT, signal) {
            warn!(error = %e, "Signal emit rejected");
        }
        disposition
    }
}

/// Process-default runtime for the binary entry point. Library code and
/// tests construct their own [`Runtime`] instead.
pub fn default_runtime() -> &'static Arc<Runtime> {
    static DEFAULT: OnceLock<Arc<Runtime>> = OnceLock::new();
    DEFAULT.get_or_init(|| {
        let host = crate::host::SystemHost::new();
        let identity = DeviceIdentity::from_host(&host);
        let timeouts =
            CategoryTimeouts::from_scan_intervals(&crate::config::get().scan_intervals());
        Arc::new(Runtime::new(identity, timeouts))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime() -> Runtime {
        Runtime::new(
            DeviceIdentity {
                device_id: "aabb".to_string(),
                device_name: "DESKTOP-AB".to_string(),
                device_ip: Some("10.0.0.2".to_string()),
            },
            CategoryTimeouts::default(),
        )
    }

    #[test]
    fn test_post_signal_fills_identity_and_emits() {
        let rt = runtime();
        let disposition = rt.post_signal(
            Category::Auto,
            "Python",
            Status::Warn,
            "Python detected",
            Some("AutomationDetector"),
        );
        assert!(!disposition.suppress_emit);

        let history = rt.bus().history(None, 10);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].device_id.as_deref(), Some("aabb"));
        assert_eq!(history[0].device_name.as_deref(), Some("DESKTOP-AB"));
        assert_eq!(history[0].segment_name.as_deref(), Some("AutomationDetector"));
    }

    #[test]
    fn test_suppressed_duplicate_not_emitted() {
        let rt = runtime();
        rt.post_signal(Category::Auto, "python.exe macro", Status::Alert, "", None);
        assert_eq!(rt.bus().history(None, 10).len(), 1);

        // INFO-mapped duplicate for the same threat id: tracked, not emitted
        let disposition =
            rt.post_signal(Category::Programs, "python.exe listed", Status::Info, "", None);
        assert!(disposition.suppress_emit);
        assert_eq!(rt.bus().history(None, 10).len(), 1);
    }

    #[test]
    fn test_disposition_carries_probability() {
        let rt = runtime();
        let d1 = rt.post_signal(Category::Programs, "weird.exe found", Status::Warn, "", None);
        assert_eq!(d1.bot_probability, 5.0);
        let d2 = rt.post_signal(Category::Network, "rdp.exe session", Status::Alert, "", None);
        assert_eq!(d2.bot_probability, 15.0);
    }
}
