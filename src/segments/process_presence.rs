//! Process-presence segment
//!
//! Scans the process table against the program registry from the config
//! bundle and reports every known bot, RTA tool, or automation runtime found
//! running. The heavy analysis segments build on the same pattern; this one
//! exercises the scheduler, keepalive, and ingress path end to end.

use std::sync::Arc;

use async_trait::async_trait;

use super::{DetectionKeepalive, Segment};
use crate::config::{ConfigBundle, ProgramEntry};
use crate::host::HostOs;
use crate::runtime::Runtime;
use crate::types::{now_ts, Category, Status};

pub struct ProcessPresenceSegment {
    host: Arc<dyn HostOs>,
    programs: Vec<ProgramEntry>,
    interval_secs: f64,
    keepalive: DetectionKeepalive,
}

impl ProcessPresenceSegment {
    pub fn new(
        host: Arc<dyn HostOs>,
        bundle: &ConfigBundle,
        interval_secs: f64,
        keepalive_interval_secs: f64,
    ) -> Self {
        let programs = bundle
            .programs_registry
            .as_ref()
            .map(|r| r.programs.clone())
            .unwrap_or_default();
        Self {
            host,
            programs,
            interval_secs,
            keepalive: DetectionKeepalive::new(
                Category::Programs,
                keepalive_interval_secs,
                interval_secs * 3.0,
            ),
        }
    }

    fn severity(entry: &ProgramEntry) -> Status {
        match entry.severity.to_uppercase().as_str() {
            "CRITICAL" => Status::Critical,
            "ALERT" => Status::Alert,
            "INFO" => Status::Info,
            _ => Status::Warn,
        }
    }

    fn category(entry: &ProgramEntry) -> Category {
        match entry.category.as_deref() {
            Some("auto") => Category::Auto,
            Some("network") => Category::Network,
            Some("screen") => Category::Screen,
            _ => Category::Programs,
        }
    }
}

#[async_trait]
impl Segment for ProcessPresenceSegment {
    fn name(&self) -> &str {
        "ProcessPresence"
    }

    fn category(&self) -> Category {
        Category::Programs
    }

    fn interval_secs(&self) -> f64 {
        self.interval_secs
    }

    async fn tick(&self, runtime: &Runtime) {
        let now = now_ts();
        let processes = self.host.processes();

        for entry in &self.programs {
            let hit = processes.iter().find(|p| {
                entry
                    .process_names
                    .iter()
                    .any(|wanted| p.name.eq_ignore_ascii_case(wanted))
            });

            match hit {
                Some(proc_) => {
                    let name = format!("Known Tool: {}", proc_.name);
                    let details = format!("proc={} | pid={}", entry.name, proc_.pid);
                    let status = Self::severity(entry);

                    runtime.post_signal(
                        Self::category(entry),
                        name.clone(),
                        status,
                        details.clone(),
                        Some(self.name()),
                    );
                    self.keepalive
                        .mark_active(&entry.name, &name, status, &details, now);
                }
                None => self.keepalive.mark_inactive(&entry.name),
            }
        }

        self.keepalive.emit_keepalives(runtime, now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{DeviceIdentity, MockHost, ProcessInfo};
    use crate::threat::CategoryTimeouts;

    fn runtime() -> Runtime {
        Runtime::new(
            DeviceIdentity {
                device_id: "id".to_string(),
                device_name: "name".to_string(),
                device_ip: None,
            },
            CategoryTimeouts::default(),
        )
    }

    fn bundle() -> ConfigBundle {
        serde_json::from_value(serde_json::json!({
            "programs_registry": {"programs": [
                {"name": "OpenHoldem", "process_names": ["openholdem.exe"], "severity": "ALERT"},
                {"name": "Python", "process_names": ["python.exe", "pythonw.exe"], "severity": "WARN", "category": "auto"}
            ]}
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_reports_known_tool_when_running() {
        let host = Arc::new(MockHost::named("X"));
        host.add_process(ProcessInfo {
            pid: 42,
            name: "openholdem.exe".to_string(),
            ..Default::default()
        });

        let segment = ProcessPresenceSegment::new(host, &bundle(), 92.0, 60.0);
        let rt = runtime();
        segment.tick(&rt).await;

        let history = rt.bus().history(None, 10);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].name, "Known Tool: openholdem.exe");
        assert_eq!(history[0].status, Status::Alert);
        assert_eq!(history[0].segment_name.as_deref(), Some("ProcessPresence"));

        // The threat manager groups it under the canonical id
        let threats = rt.threats().active_threats();
        assert_eq!(threats.len(), 1);
        assert_eq!(threats[0].threat_id, "openholdem");
        // ALERT + known bot token escalates to CRITICAL
        assert_eq!(threats[0].status, Status::Critical);
    }

    #[tokio::test]
    async fn test_quiet_when_nothing_matches() {
        let host = Arc::new(MockHost::named("X"));
        host.add_process(ProcessInfo {
            pid: 1,
            name: "explorer.exe".to_string(),
            ..Default::default()
        });

        let segment = ProcessPresenceSegment::new(host, &bundle(), 92.0, 60.0);
        let rt = runtime();
        segment.tick(&rt).await;

        assert!(rt.bus().history(None, 10).is_empty());
        assert!(rt.threats().active_threats().is_empty());
    }

    #[tokio::test]
    async fn test_disappeared_tool_clears_keepalive() {
        let host = Arc::new(MockHost::named("X"));
        host.add_process(ProcessInfo {
            pid: 9,
            name: "python.exe".to_string(),
            ..Default::default()
        });

        let segment = ProcessPresenceSegment::new(Arc::clone(&host) as Arc<dyn HostOs>, &bundle(), 92.0, 60.0);
        let rt = runtime();
        segment.tick(&rt).await;
        assert_eq!(segment.keepalive.active_count(), 1);

        host.clear_processes();
        segment.tick(&rt).await;
        assert_eq!(segment.keepalive.active_count(), 0);
    }
}
