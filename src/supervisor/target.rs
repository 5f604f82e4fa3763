//! Multi-factor protected-client detection
//!
//! Other poker clients ship executables with the same basename, and players
//! install the client in arbitrary locations, so no single indicator is
//! trustworthy. Each candidate process is scored across independent
//! indicators and classified by total confidence.

use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;

use crate::config::TargetProfile;
use crate::host::{HostOs, ProcessInfo, WindowInfo};

/// Path/cwd token that identifies the protected client's install.
const TARGET_TOKEN: &str = "coinpoker";

fn uuid_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}")
            .unwrap_or_else(|_| unreachable!())
    })
}

/// Indicator breakdown for one candidate process.
#[derive(Debug, Clone, Default)]
pub struct TargetIndicators {
    pub pid: u32,
    pub name_match: bool,
    pub path_token: bool,
    pub cwd_token: bool,
    pub parent_path_token: bool,
    pub cmdline_uuid: bool,
    pub window_class_match: bool,
    pub window_title_match: bool,
    pub child_processes_match: bool,
    /// Weighted sum in `[0, ~1.4]`; classification thresholds at 0.4/0.6.
    pub confidence: f64,
}

/// A process classified as the protected client.
#[derive(Debug, Clone)]
pub struct DetectedTarget {
    pub pid: u32,
    pub confidence: f64,
    pub indicators: TargetIndicators,
}

pub struct TargetDetector {
    profile: TargetProfile,
}

impl TargetDetector {
    pub fn new(profile: TargetProfile) -> Self {
        Self { profile }
    }

    pub fn profile(&self) -> &TargetProfile {
        &self.profile
    }

    /// Score one process against all indicators.
    pub fn analyze(
        &self,
        host: &dyn HostOs,
        proc_: &ProcessInfo,
        windows: &[WindowInfo],
    ) -> TargetIndicators {
        let mut ind = TargetIndicators {
            pid: proc_.pid,
            ..Default::default()
        };

        let exe_lower = proc_
            .exe_path
            .as_ref()
            .map(|p| p.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        if proc_.name == self.profile.process_name.to_lowercase() {
            ind.name_match = true;
            ind.confidence += 0.10;
        }

        if exe_lower.contains(TARGET_TOKEN) {
            ind.path_token = true;
            ind.confidence += 0.30;
        }

        if let Some(cwd) = &proc_.cwd {
            if cwd.to_string_lossy().to_lowercase().contains(TARGET_TOKEN) {
                ind.cwd_token = true;
                ind.confidence += 0.20;
            }
        }

        if let Some(parent_pid) = proc_.parent_pid {
            let parent_has_token = host
                .processes()
                .iter()
                .find(|p| p.pid == parent_pid)
                .and_then(|p| p.exe_path.as_ref())
                .map(|p| p.to_string_lossy().to_lowercase().contains(TARGET_TOKEN))
                .unwrap_or(false);
            if parent_has_token {
                ind.parent_path_token = true;
                ind.confidence += 0.15;
            }
        }

        let cmdline = proc_.cmdline.join(" ");
        if uuid_re().is_match(&cmdline) {
            ind.cmdline_uuid = true;
            ind.confidence += 0.15;
        }

        // Window checks only make sense once the basename matched.
        if ind.name_match {
            let expected_class = self.profile.window_class.to_lowercase();
            for window in windows.iter().filter(|w| w.pid == proc_.pid) {
                if window.class_name.to_lowercase().contains(&expected_class) {
                    if !ind.window_class_match {
                        ind.window_class_match = true;
                        ind.confidence += 0.20;
                    }
                    let title_lower = window.title.to_lowercase();
                    if !ind.window_title_match
                        && self
                            .profile
                            .title_patterns
                            .iter()
                            .any(|p| title_lower.contains(p))
                    {
                        ind.window_title_match = true;
                        ind.confidence += 0.10;
                    }
                }
            }
        }

        let expected_children: Vec<String> = self
            .profile
            .children_processes
            .iter()
            .map(|c| c.to_lowercase())
            .collect();
        let child_names: Vec<String> = host
            .children_of(proc_.pid)
            .into_iter()
            .map(|c| c.name)
            .collect();
        let matched_children = expected_children
            .iter()
            .filter(|c| child_names.contains(c))
            .count();
        if matched_children >= 2 {
            ind.child_processes_match = true;
            ind.confidence += 0.20;
        } else if matched_children == 1 {
            ind.confidence += 0.10;
        }

        ind
    }

    /// Classify: target when confidence ≥ 0.6, or the path token is present
    /// with confidence ≥ 0.4, or confidence ≥ 0.4 alone.
    pub fn verify(&self, indicators: &TargetIndicators) -> bool {
        let confidence = indicators.confidence;
        if confidence >= 0.6 || (indicators.path_token && confidence >= 0.4) {
            return true;
        }
        confidence >= 0.4
    }

    /// All protected-client processes currently running.
    pub fn detect_processes(&self, host: &dyn HostOs) -> Vec<DetectedTarget> {
        let expected_name = self.profile.process_name.to_lowercase();
        let windows = host.windows();

        host.processes()
            .iter()
            .filter(|p| p.name == expected_name)
            .filter_map(|p| {
                let indicators = self.analyze(host, p, &windows);
                if self.verify(&indicators) {
                    Some(DetectedTarget {
                        pid: p.pid,
                        confidence: indicators.confidence,
                        indicators,
                    })
                } else {
                    None
                }
            })
            .collect()
    }

    /// Locate the client's lobby window, if visible.
    pub fn find_lobby_window(&self, host: &dyn HostOs) -> Option<WindowInfo> {
        let expected_class = self.profile.window_class.to_lowercase();
        let expected_process = self.profile.process_name.to_lowercase();
        let processes = host.processes();

        host.windows().into_iter().find(|window| {
            if !window.visible {
                return false;
            }
            if !window.class_name.to_lowercase().contains(&expected_class) {
                return false;
            }
            let title = window.title.to_lowercase();
            if !title.contains("lobby") || !title.contains(TARGET_TOKEN) {
                return false;
            }
            processes.iter().any(|p| {
                p.pid == window.pid
                    && p.name == expected_process
                    && p.exe_path
                        .as_ref()
                        .map(|e| e.to_string_lossy().to_lowercase().contains(TARGET_TOKEN))
                        .unwrap_or(false)
            })
        })
    }

    /// Poll for the lobby window until it appears or the timeout elapses.
    pub async fn wait_for_lobby_window(
        &self,
        host: &dyn HostOs,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Option<WindowInfo> {
        let deadline = tokio::time::Instant::now() + timeout;
        let interval = poll_interval.max(Duration::from_millis(100));

        loop {
            if let Some(window) = self.find_lobby_window(host) {
                return Some(window);
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// All table windows of detected client processes (everything but the
    /// lobby), for the snapshot command.
    pub fn find_table_windows(&self, host: &dyn HostOs) -> Vec<WindowInfo> {
        let target_pids: Vec<u32> = self.detect_processes(host).iter().map(|t| t.pid).collect();
        let expected_class = self.profile.window_class.to_lowercase();

        host.windows()
            .into_iter()
            .filter(|w| {
                w.visible
                    && target_pids.contains(&w.pid)
                    && w.class_name.to_lowercase().contains(&expected_class)
                    && !w.title.to_lowercase().contains("lobby")
            })
            .collect()
    }
}
