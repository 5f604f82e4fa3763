//! Batch report regression tests
//!
//! Drives signals through the runtime and the report batcher together and
//! asserts on the emitted Unified Scan Report: windowing, dedup,
//! identity resolution, heartbeats, and wire round-trips.

use tableguard::batch::{ReportBatcher, SystemInfo};
use tableguard::config::Settings;
use tableguard::host::identity::device_id_from_name;
use tableguard::host::DeviceIdentity;
use tableguard::threat::CategoryTimeouts;
use tableguard::types::{Category, Signal, Status, UnifiedBatchReport};
use tableguard::Runtime;

fn runtime() -> Runtime {
    Runtime::new(
        DeviceIdentity {
            device_id: device_id_from_name("DESKTOP-AB"),
            device_name: "DESKTOP-AB".to_string(),
            device_ip: Some("192.168.1.4".to_string()),
        },
        CategoryTimeouts::default(),
    )
}

fn batcher(rt: &Runtime) -> ReportBatcher {
    ReportBatcher::new(
        &Settings {
            batch_interval_secs: 92.0,
            ..Default::default()
        },
        rt.identity().clone(),
        0.0,
        std::sync::Arc::clone(rt.batch_counter()),
    )
}

fn system_info() -> SystemInfo {
    SystemInfo {
        cpu_percent: 7.5,
        mem_used_percent: 41.0,
        segments_running: 2,
        env: "PROD".to_string(),
        host: "DESKTOP-AB".to_string(),
        device_ip: None,
    }
}

fn post_at(rt: &Runtime, batcher: &ReportBatcher, ts: f64, category: Category, name: &str, status: Status, details: &str) {
    let mut sig = Signal::new(category, name, status, details);
    sig.timestamp = ts;
    let disposition = rt.threats().process_signal(&sig);
    if !disposition.suppress_emit {
        batcher.add_signal(sig);
    }
}

fn send(rt: &Runtime, batcher: &ReportBatcher, now: f64) -> UnifiedBatchReport {
    let signal = batcher
        .maybe_send(now, rt.threats(), &system_info(), &[])
        .expect("batch window should have elapsed");
    UnifiedBatchReport::from_details(&signal.details).expect("batch details must parse")
}

#[test]
fn single_warn_batch_matches_threat_state() {
    let rt = runtime();
    let batcher = batcher(&rt);

    post_at(&rt, &batcher, 10.0, Category::Auto, "Python", Status::Warn, "Python detected");

    let report = send(&rt, &batcher, 100.0);
    assert_eq!(report.summary.total_threats, 1);
    assert_eq!(report.aggregated_threats[0].threat_id, "python");
    // WARN in auto is tracked at ALERT strength
    assert_eq!(report.summary.alert, 1);
    assert_eq!(report.bot_probability, 10.0);
    assert_eq!(report.summary.threat_score, report.bot_probability);
    assert_eq!(report.categories["auto"], 1);
}

#[test]
fn five_identical_signals_one_wire_entry() {
    let rt = runtime();
    let batcher = batcher(&rt);

    for i in 0..5 {
        post_at(
            &rt,
            &batcher,
            10.0 + f64::from(i),
            Category::Network,
            "Suspicious Connection: rdp.exe",
            Status::Alert,
            "remote desktop session",
        );
    }

    let report = send(&rt, &batcher, 100.0);
    assert_eq!(report.detections.len(), 1);
    assert_eq!(report.detections[0].occurrences, 5);
    // Score counts the threat once, not per occurrence
    assert_eq!(report.bot_probability, 10.0);
    assert_eq!(report.summary.raw_detection_score, 10);
}

#[test]
fn empty_window_still_heartbeats() {
    let rt = runtime();
    let batcher = batcher(&rt);

    let first = send(&rt, &batcher, 100.0);
    assert_eq!(first.batch_number, 0);
    assert_eq!(first.summary.total_detections, 0);
    assert_eq!(first.bot_probability, 0.0);
    assert!(first.batch_sent_at > 0.0);

    // Next window: another heartbeat, strictly increasing counter
    let second = send(&rt, &batcher, 200.0);
    assert_eq!(second.batch_number, 1);
}

#[test]
fn batch_numbers_survive_pipeline_restart() {
    // The client closing and reopening rebuilds the batcher; the runtime's
    // counter keeps the per-process sequence going.
    let rt = runtime();

    let first_activation = batcher(&rt);
    assert_eq!(send(&rt, &first_activation, 100.0).batch_number, 0);
    assert_eq!(send(&rt, &first_activation, 200.0).batch_number, 1);
    drop(first_activation);

    let second_activation = batcher(&rt);
    assert_eq!(send(&rt, &second_activation, 300.0).batch_number, 2);
}

#[test]
fn one_report_per_window() {
    let rt = runtime();
    let batcher = batcher(&rt);

    assert!(batcher
        .maybe_send(50.0, rt.threats(), &system_info(), &[])
        .is_none());
    assert!(batcher
        .maybe_send(92.0, rt.threats(), &system_info(), &[])
        .is_some());
    // Window just restarted - nothing until it elapses again
    assert!(batcher
        .maybe_send(120.0, rt.threats(), &system_info(), &[])
        .is_none());
    assert!(batcher
        .maybe_send(185.0, rt.threats(), &system_info(), &[])
        .is_some());
}

#[test]
fn device_name_resolves_from_host_when_degraded() {
    let device_id = device_id_from_name("DESKTOP-AB");
    let rt = Runtime::new(
        DeviceIdentity {
            device_id: device_id.clone(),
            // Degraded: name equals the raw device id
            device_name: device_id,
            device_ip: None,
        },
        CategoryTimeouts::default(),
    );
    let batcher = batcher(&rt);

    let report = send(&rt, &batcher, 100.0);
    assert_eq!(report.device_name, "DESKTOP-AB");
    assert_eq!(report.system.host, "DESKTOP-AB");
}

#[test]
fn window_restricts_aggregated_threats() {
    let rt = runtime();
    let batcher = batcher(&rt);

    // First window carries the detection
    post_at(&rt, &batcher, 10.0, Category::Programs, "warbot.exe found", Status::Alert, "");
    let first = send(&rt, &batcher, 100.0);
    assert_eq!(first.summary.total_threats, 1);

    // Second window saw no refresh: the threat is outside the window even
    // though it is still active in the manager
    let second = send(&rt, &batcher, 200.0);
    assert_eq!(second.summary.total_threats, 0);
    assert_eq!(second.bot_probability, 0.0);
    assert!(!rt.threats().active_threats().is_empty());
}

#[test]
fn report_round_trips_via_signal_details() {
    let rt = runtime();
    let batcher = batcher(&rt);
    post_at(&rt, &batcher, 10.0, Category::Vm, "Hypervisor Bit Set", Status::Warn, "cpuid leaf");

    let signal = batcher
        .maybe_send(100.0, rt.threats(), &system_info(), &[])
        .unwrap();
    assert!(signal.is_batch_report());

    let report = UnifiedBatchReport::from_details(&signal.details).unwrap();
    let re_encoded = serde_json::to_string(&report).unwrap();
    let re_parsed = UnifiedBatchReport::from_details(&re_encoded).unwrap();
    assert_eq!(report, re_parsed);
    // VM-category threat drives vm_probability
    assert_eq!(report.vm_probability, 10.0);
}
