//! Unified report batcher
//!
//! Collects every detection signal emitted during one batch window and folds
//! them - together with a windowed threat-manager snapshot - into a single
//! [`UnifiedBatchReport`]. One report is produced per elapsed interval,
//! including for empty windows (the report doubles as the device heartbeat).
//!
//! The batcher owns only its per-window buffer; the caller emits the
//! returned report signal on the event bus.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info};

use super::log::BatchLog;
use crate::config::{Environment, Settings};
use crate::host::{resolve_device_name, DeviceIdentity, NameSources};
use crate::threat::{derive_threat_id, threat_level, ThreatManager};
use crate::types::{
    Category, ConfigurationMetadata, DetectionEntry, DeviceBlock, FlowMetadata, ReportMetadata,
    ReportSummary, SegmentMetadata, Signal, Status, SystemBlock, SystemStateMetadata,
    TimingMetadata, UnifiedBatchReport,
};

/// Host snapshot supplied by the pipeline on every batch check.
#[derive(Debug, Clone, Default)]
pub struct SystemInfo {
    pub cpu_percent: f64,
    pub mem_used_percent: f64,
    pub segments_running: usize,
    pub env: String,
    pub host: String,
    pub device_ip: Option<String>,
}

/// Scheduler-provided segment state for the metadata block.
#[derive(Debug, Clone)]
pub struct SegmentInfo {
    pub name: String,
    pub category: Category,
    pub interval_secs: f64,
    pub running: bool,
}

struct BatcherInner {
    buffer: Vec<Signal>,
    last_batch: f64,
}

/// Window-based batch assembly. Single writer to its buffer.
pub struct ReportBatcher {
    batch_interval: f64,
    dev_mode: bool,
    testing_json: bool,
    sync_segments: bool,
    scan_intervals: HashMap<Category, f64>,
    identity: DeviceIdentity,
    log: Option<BatchLog>,
    /// Shared per-process counter (see [`Runtime::batch_counter`]); batch
    /// numbers keep climbing across pipeline restarts.
    ///
    /// [`Runtime::batch_counter`]: crate::runtime::Runtime::batch_counter
    batch_counter: Arc<AtomicU64>,
    inner: Mutex<BatcherInner>,
}

impl ReportBatcher {
    pub fn new(
        settings: &Settings,
        identity: DeviceIdentity,
        now: f64,
        batch_counter: Arc<AtomicU64>,
    ) -> Self {
        let log = if settings.log_batches {
            let dir = settings
                .batch_log_dir
                .clone()
                .unwrap_or_else(|| std::path::PathBuf::from("batch_logs"));
            info!(dir = %dir.display(), "Batch logging enabled");
            Some(BatchLog::new(&dir))
        } else {
            None
        };

        info!(
            interval_secs = settings.batch_interval_secs,
            "Unified batch system initialized"
        );

        Self {
            batch_interval: settings.batch_interval_secs,
            dev_mode: settings.env == Environment::Dev,
            testing_json: settings.testing_json,
            sync_segments: settings.sync_segments,
            scan_intervals: settings.scan_intervals(),
            identity,
            log,
            batch_counter,
            inner: Mutex::new(BatcherInner {
                buffer: Vec::new(),
                last_batch: now,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BatcherInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn batch_interval(&self) -> f64 {
        self.batch_interval
    }

    /// Batches emitted so far in this process.
    pub fn batch_count(&self) -> u64 {
        self.batch_counter.load(Ordering::SeqCst)
    }

    /// Buffer a signal for the current window.
    pub fn add_signal(&self, signal: Signal) {
        self.lock().buffer.push(signal);
    }

    /// Emit a report if the window elapsed. Returns the batch signal for the
    /// caller to put on the event bus.
    pub fn maybe_send(
        &self,
        now: f64,
        threats: &ThreatManager,
        system_info: &SystemInfo,
        segments_info: &[SegmentInfo],
    ) -> Option<Signal> {
        let (buffer, window_start, batch_number) = {
            let mut inner = self.lock();
            if now - inner.last_batch < self.batch_interval {
                return None;
            }
            let window_start = inner.last_batch;
            inner.last_batch = now;
            let batch_number = self.batch_counter.fetch_add(1, Ordering::SeqCst);
            (std::mem::take(&mut inner.buffer), window_start, batch_number)
        };

        if buffer.is_empty() {
            debug!("Sending empty unified batch (heartbeat)");
        } else {
            debug!(detections = buffer.len(), "Sending unified batch");
        }

        let report = self.build_report(
            now,
            window_start,
            batch_number,
            &buffer,
            threats,
            system_info,
            segments_info,
        );

        if let Some(log) = &self.log {
            log.write(&report);
        }

        let details = match serde_json::to_string(&report) {
            Ok(json) => json,
            Err(e) => {
                // Should not happen for a value type; drop this window
                // rather than emitting a malformed report.
                tracing::error!(error = %e, "Failed to serialize batch report");
                return None;
            }
        };

        let mut signal = Signal::new(
            Category::System,
            UnifiedBatchReport::SIGNAL_NAME,
            Status::Info,
            details,
        );
        signal.timestamp = now;
        signal.device_id = Some(report.device_id.clone());
        signal.device_name = Some(report.device_name.clone());
        signal.device_ip = report.device_ip.clone();

        info!(
            batch_number = report.batch_number,
            device_name = %report.device_name,
            detections = report.summary.total_detections,
            bot_probability = report.bot_probability,
            "Batch report created"
        );
        Some(signal)
    }

    #[allow(clippy::too_many_arguments)]
    fn build_report(
        &self,
        now: f64,
        window_start: f64,
        batch_number: u64,
        buffer: &[Signal],
        threats: &ThreatManager,
        system_info: &SystemInfo,
        segments_info: &[SegmentInfo],
    ) -> UnifiedBatchReport {
        let summary = threats.summary_at(now, Some(window_start));

        // Nickname rides in on a system signal; grab it before system
        // signals are filtered out of the detection walk.
        let nickname = buffer
            .iter()
            .filter(|s| s.is_player_name())
            .find_map(|s| extract_player_name(&s.details));

        // Deduplicate buffered detections for display.
        let mut detections_map: HashMap<(String, String, String, String), DetectionEntry> =
            HashMap::new();
        for sig in buffer {
            if sig.category == Category::System {
                continue;
            }
            let level = threat_level(sig);
            let points = level.points();
            if points == 0 {
                continue;
            }

            let segment = guess_segment_name(sig);
            let threat_id = derive_threat_id(sig);
            let key = (
                sig.category.as_str().to_string(),
                sig.name.clone(),
                sig.details.clone(),
                segment.clone(),
            );

            if let Some(existing) = detections_map.get_mut(&key) {
                existing.occurrences += 1;
                if sig.timestamp < existing.first_detected {
                    existing.first_detected = sig.timestamp;
                }
                continue;
            }

            let mut entry = DetectionEntry {
                name: sig.name.clone(),
                segment,
                category: sig.category,
                status: level,
                points,
                first_detected: sig.timestamp,
                details: sig.details.clone(),
                occurrences: 1,
                threat_id: Some(threat_id.clone()),
                threat_sources: None,
                threat_confidence: None,
                threat_score: None,
            };
            if let Some(detail) = summary.detail(&threat_id) {
                entry.threat_sources = Some(detail.sources.clone());
                entry.threat_confidence = Some(detail.confidence);
                entry.threat_score = Some(detail.score);
            }
            detections_map.insert(key, entry);
        }
        let mut detections: Vec<DetectionEntry> = detections_map.into_values().collect();
        detections.sort_by(|a, b| {
            a.first_detected
                .partial_cmp(&b.first_detected)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        // Severity/category counts over the deduplicated list.
        let mut counts = (0usize, 0usize, 0usize, 0usize); // critical, alert, warn, info
        let mut categories: HashMap<String, usize> = HashMap::new();
        for entry in &detections {
            match entry.status {
                Status::Critical => counts.0 += 1,
                Status::Alert => counts.1 += 1,
                Status::Warn => counts.2 += 1,
                _ => counts.3 += 1,
            }
            *categories
                .entry(entry.category.as_str().to_string())
                .or_default() += 1;
        }
        let raw_detection_score: u32 = detections.iter().map(|d| d.points).sum();
        let file_analysis_count = detections
            .iter()
            .filter(|d| {
                let name = d.name.to_lowercase();
                name.contains("hash") || name.contains("file")
            })
            .count();

        // ---- identity resolution ------------------------------------------
        let first = buffer.first();
        let mut device_id = first
            .and_then(|s| s.device_id.clone())
            .unwrap_or_else(|| self.identity.device_id.clone());
        let mut device_name = first
            .and_then(|s| s.device_name.clone())
            .unwrap_or_else(|| self.identity.device_name.clone());
        let device_ip = first
            .and_then(|s| s.device_ip.clone())
            .or_else(|| system_info.device_ip.clone())
            .or_else(|| self.identity.device_ip.clone())
            .or_else(|| Some("127.0.0.1".to_string()));

        if device_id.is_empty() {
            device_id = crate::host::identity::device_id_from_name(&device_name);
        }

        let host = if system_info.host.is_empty() {
            "unknown".to_string()
        } else {
            system_info.host.clone()
        };

        device_name = resolve_device_name(
            &device_id,
            &NameSources {
                batch_nickname: nickname.clone(),
                batch_device: None,
                batch_host: Some(host.clone()),
                batch_device_hostname: Some(host.clone()),
                batch_meta_hostname: None,
                signal_device_name: Some(device_name),
            },
        );

        if self.dev_mode {
            device_name = "Test".to_string();
        }

        let env = if system_info.env.is_empty() {
            "PROD".to_string()
        } else {
            system_info.env.clone()
        };
        let system = SystemBlock {
            cpu_percent: system_info.cpu_percent,
            mem_used_percent: system_info.mem_used_percent,
            segments_running: system_info.segments_running,
            env: env.clone(),
            host: host.clone(),
        };

        let metadata = if self.testing_json {
            Some(self.build_metadata(batch_number, segments_info, &system))
        } else {
            None
        };

        UnifiedBatchReport {
            scan_type: "unified".to_string(),
            batch_number,
            bot_probability: summary.bot_probability,
            nickname,
            device_id,
            device_name,
            device_ip: device_ip.clone(),
            device: DeviceBlock {
                hostname: Some(host),
                ip: device_ip,
            },
            timestamp: now,
            batch_sent_at: now,
            summary: ReportSummary {
                critical: counts.0,
                alert: counts.1,
                warn: counts.2,
                info: counts.3,
                total_detections: detections.len(),
                total_threats: summary.total_active_threats,
                threat_score: summary.bot_probability,
                raw_detection_score,
            },
            categories,
            active_threats: summary.total_active_threats,
            aggregated_threats: summary.threat_details.clone(),
            detections,
            vm_probability: summary.vm_probability,
            file_analysis_count,
            system,
            metadata,
        }
    }

    fn build_metadata(
        &self,
        batch_count: u64,
        segments_info: &[SegmentInfo],
        system: &SystemBlock,
    ) -> ReportMetadata {
        ReportMetadata {
            flow: FlowMetadata {
                description: "Signal flow through the bot detection system".to_string(),
                steps: vec![
                    "Segments detect threats and post signals".to_string(),
                    "Signals are emitted on the event bus".to_string(),
                    "Report batcher collects signals in memory".to_string(),
                    format!(
                        "Every {}s the batcher creates a unified batch report",
                        self.batch_interval
                    ),
                    "Forwarders ship the batch report to the dashboard".to_string(),
                ],
            },
            segments: segments_info
                .iter()
                .map(|s| SegmentMetadata {
                    name: s.name.clone(),
                    category: s.category,
                    interval: s.interval_secs,
                    status: if s.running { "running" } else { "stopped" }.to_string(),
                })
                .collect(),
            timing: TimingMetadata {
                batch_interval: self.batch_interval,
                sync_segments: self.sync_segments,
                segment_intervals: self
                    .scan_intervals
                    .iter()
                    .map(|(c, v)| (c.as_str().to_string(), *v))
                    .collect(),
            },
            configuration: ConfigurationMetadata {
                env: system.env.clone(),
                web_enabled: true,
                testing_json: self.testing_json,
            },
            system_state: SystemStateMetadata {
                segments_running: system.segments_running,
                batch_count,
                cpu_percent: system.cpu_percent,
                mem_used_percent: system.mem_used_percent,
                host: system.host.clone(),
            },
        }
    }

    /// Drop any buffered signals (shutdown path). The batch counter is
    /// process-lifetime and is not reset here.
    pub fn cleanup(&self) {
        self.lock().buffer.clear();
    }
}

/// Pull `player_name` out of a `Player Name Detected` details payload.
fn extract_player_name(details: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(details).ok()?;
    let name = value
        .get("player_name")
        .or_else(|| value.get("nickname"))?
        .as_str()?
        .trim()
        .to_string();
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

/// Segment attribution for a signal: explicit tag first, else guessed from
/// the signal's shape.
fn guess_segment_name(sig: &Signal) -> String {
    if let Some(name) = &sig.segment_name {
        return name.clone();
    }

    let name_lower = sig.name.to_lowercase();

    if name_lower.contains("python")
        || name_lower.contains("autohotkey")
        || name_lower.contains("macro")
    {
        return "AutomationDetector".to_string();
    }
    if name_lower.contains("rename")
        || name_lower.contains("protected site")
        || name_lower.contains("coinpoker")
    {
        return "ProcessScanner".to_string();
    }
    if name_lower.contains("overlay")
        || (name_lower.contains("window") && sig.category == Category::Screen)
    {
        return "ScreenDetector".to_string();
    }
    if name_lower.contains("gto") || name_lower.contains("rta site") || name_lower.contains("dns")
    {
        return "WebMonitor".to_string();
    }
    if name_lower.contains("telegram") || name_lower.contains("bot token") {
        return "TelegramDetector".to_string();
    }
    if name_lower.contains("connection")
        || name_lower.contains("rdp")
        || name_lower.contains("vnc")
    {
        return "TrafficMonitor".to_string();
    }
    if sig.category == Category::Behaviour
        || name_lower.contains("mouse")
        || name_lower.contains("keyboard")
    {
        return "BehaviourDetector".to_string();
    }
    if sig.category == Category::Vm || name_lower.contains("virtual") {
        return "VMDetector".to_string();
    }
    if name_lower.contains("hash")
        || name_lower.contains("virustotal")
        || name_lower.contains("sha256")
    {
        return "HashAndSignatureScanner".to_string();
    }
    if name_lower.contains("entropy")
        || name_lower.contains("packer")
        || name_lower.contains("path hint")
    {
        return "ContentAnalyzer".to_string();
    }
    if name_lower.contains("obfuscation") {
        return "ObfuscationDetector".to_string();
    }

    // Default: capitalized category
    let category = sig.category.as_str();
    let mut chars = category.chars();
    match chars.next() {
        Some(first) => format!("{}{}Detector", first.to_uppercase(), chars.as_str()),
        None => "UnknownDetector".to_string(),
    }
}
