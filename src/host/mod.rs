//! Host OS integration
//!
//! Everything the agent needs from the operating system - process
//! enumeration, window enumeration, cpu/memory load, elevation state - sits
//! behind the [`HostOs`] trait so the core stays testable with
//! [`MockHost`]. The production backend is [`SystemHost`].

pub mod identity;
pub mod netinfo;
#[cfg(windows)]
pub mod win32;

use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use sysinfo::{CpuExt, PidExt, ProcessExt, System, SystemExt};

pub use identity::{resolve_device_name, DeviceIdentity, NameSources};

/// Snapshot of one process.
#[derive(Debug, Clone, Default)]
pub struct ProcessInfo {
    pub pid: u32,
    /// Executable basename, lowercased.
    pub name: String,
    pub exe_path: Option<PathBuf>,
    pub cwd: Option<PathBuf>,
    pub parent_pid: Option<u32>,
    pub cmdline: Vec<String>,
}

/// Snapshot of one top-level window.
#[derive(Debug, Clone, Default)]
pub struct WindowInfo {
    pub handle: u64,
    pub pid: u32,
    pub class_name: String,
    pub title: String,
    pub visible: bool,
    /// (left, top, right, bottom)
    pub rect: (i32, i32, i32, i32),
}

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("process {0} not found")]
    NoSuchProcess(u32),
    #[error("screen capture unavailable: {0}")]
    CaptureUnavailable(String),
}

/// OS facade the core depends on.
pub trait HostOs: Send + Sync {
    /// Computer name as shown to the user (may contain spaces).
    fn computer_name(&self) -> String;

    /// All processes currently running.
    fn processes(&self) -> Vec<ProcessInfo>;

    /// Direct children of a process.
    fn children_of(&self, pid: u32) -> Vec<ProcessInfo> {
        self.processes()
            .into_iter()
            .filter(|p| p.parent_pid == Some(pid))
            .collect()
    }

    /// Ask a process to exit; `force` escalates to a hard kill.
    fn kill_process(&self, pid: u32, force: bool) -> Result<(), HostError>;

    /// Global CPU utilization percent.
    fn cpu_percent(&self) -> f64;

    /// Used physical memory percent.
    fn mem_used_percent(&self) -> f64;

    /// Whether the agent runs elevated (administrator).
    fn is_elevated(&self) -> bool;

    /// Local IP as seen on the default route.
    fn local_ip(&self) -> Option<String>;

    /// Whether this host has a window-enumeration backend at all. Callers
    /// skip window-dependent steps (lobby wait, snapshots) when false.
    fn supports_window_enumeration(&self) -> bool {
        false
    }

    /// Top-level windows. Platforms without a window backend return none;
    /// callers must tolerate an empty list.
    fn windows(&self) -> Vec<WindowInfo> {
        Vec::new()
    }

    /// PNG screenshot of a window.
    fn capture_window_png(&self, _handle: u64) -> Result<Vec<u8>, HostError> {
        Err(HostError::CaptureUnavailable(
            "no capture backend on this platform".to_string(),
        ))
    }
}

// ============================================================================
// Production backend
// ============================================================================

/// `sysinfo`-backed host facade.
pub struct SystemHost {
    system: Mutex<System>,
}

impl Default for SystemHost {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemHost {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new_all()),
        }
    }

    fn with_system<T>(&self, f: impl FnOnce(&mut System) -> T) -> T {
        let mut sys = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut sys)
    }
}

impl HostOs for SystemHost {
    fn computer_name(&self) -> String {
        // COMPUTERNAME preserves the user-facing spelling on Windows;
        // host_name covers everything else.
        if let Ok(name) = std::env::var("COMPUTERNAME") {
            if !name.is_empty() {
                return name;
            }
        }
        self.with_system(|sys| sys.host_name())
            .unwrap_or_else(|| "Unknown Device".to_string())
    }

    fn processes(&self) -> Vec<ProcessInfo> {
        self.with_system(|sys| {
            sys.refresh_processes();
            sys.processes()
                .iter()
                .map(|(pid, proc_)| ProcessInfo {
                    pid: pid.as_u32(),
                    name: proc_.name().to_lowercase(),
                    exe_path: Some(proc_.exe().to_path_buf()).filter(|p| !p.as_os_str().is_empty()),
                    cwd: Some(proc_.cwd().to_path_buf()).filter(|p| !p.as_os_str().is_empty()),
                    parent_pid: proc_.parent().map(|p| p.as_u32()),
                    cmdline: proc_.cmd().to_vec(),
                })
                .collect()
        })
    }

    fn kill_process(&self, pid: u32, force: bool) -> Result<(), HostError> {
        self.with_system(|sys| {
            sys.refresh_processes();
            let proc_ = sys
                .process(sysinfo::Pid::from_u32(pid))
                .ok_or(HostError::NoSuchProcess(pid))?;
            if force {
                proc_.kill();
            } else {
                // Graceful first; sysinfo falls back to SIGKILL semantics on
                // platforms without a soft terminate.
                if proc_.kill_with(sysinfo::Signal::Term).is_none() {
                    proc_.kill();
                }
            }
            Ok(())
        })
    }

    fn cpu_percent(&self) -> f64 {
        self.with_system(|sys| {
            sys.refresh_cpu();
            f64::from(sys.global_cpu_info().cpu_usage())
        })
    }

    fn mem_used_percent(&self) -> f64 {
        self.with_system(|sys| {
            sys.refresh_memory();
            let total = sys.total_memory();
            if total == 0 {
                return 0.0;
            }
            sys.used_memory() as f64 / total as f64 * 100.0
        })
    }

    fn is_elevated(&self) -> bool {
        // Deployment wrappers export the elevation state; fall back to a
        // root check on unix hosts.
        if let Ok(v) = std::env::var("TABLEGUARD_ELEVATED") {
            return v == "1";
        }
        #[cfg(unix)]
        {
            std::env::var("USER").map(|u| u == "root").unwrap_or(false)
        }
        #[cfg(not(unix))]
        {
            false
        }
    }

    fn local_ip(&self) -> Option<String> {
        // Route-discovery trick: connect a UDP socket outward and read the
        // chosen source address. No packet is sent.
        let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
        socket.connect("8.8.8.8:80").ok()?;
        Some(socket.local_addr().ok()?.ip().to_string())
    }

    // The window backend only exists on Windows; elsewhere the trait
    // defaults apply and callers skip window-dependent steps.

    #[cfg(windows)]
    fn supports_window_enumeration(&self) -> bool {
        true
    }

    #[cfg(windows)]
    fn windows(&self) -> Vec<WindowInfo> {
        win32::enumerate_windows()
    }

    #[cfg(windows)]
    fn capture_window_png(&self, handle: u64) -> Result<Vec<u8>, HostError> {
        win32::capture_window_png(handle)
    }
}

// ============================================================================
// Test double
// ============================================================================

/// In-memory host used by tests and the simulator harness.
#[derive(Default)]
pub struct MockHost {
    pub computer_name: String,
    pub processes: Mutex<Vec<ProcessInfo>>,
    pub windows: Mutex<Vec<WindowInfo>>,
    pub elevated: bool,
    pub local_ip: Option<String>,
    pub killed: Mutex<Vec<(u32, bool)>>,
}

impl MockHost {
    pub fn named(computer_name: &str) -> Self {
        Self {
            computer_name: computer_name.to_string(),
            ..Default::default()
        }
    }

    pub fn add_process(&self, info: ProcessInfo) {
        if let Ok(mut procs) = self.processes.lock() {
            procs.push(info);
        }
    }

    pub fn add_window(&self, info: WindowInfo) {
        if let Ok(mut windows) = self.windows.lock() {
            windows.push(info);
        }
    }

    pub fn clear_processes(&self) {
        if let Ok(mut procs) = self.processes.lock() {
            procs.clear();
        }
    }

    pub fn killed_pids(&self) -> Vec<(u32, bool)> {
        self.killed.lock().map(|k| k.clone()).unwrap_or_default()
    }
}

impl HostOs for MockHost {
    fn computer_name(&self) -> String {
        self.computer_name.clone()
    }

    fn processes(&self) -> Vec<ProcessInfo> {
        self.processes.lock().map(|p| p.clone()).unwrap_or_default()
    }

    fn kill_process(&self, pid: u32, force: bool) -> Result<(), HostError> {
        let exists = self.processes().iter().any(|p| p.pid == pid);
        if !exists {
            return Err(HostError::NoSuchProcess(pid));
        }
        if let Ok(mut killed) = self.killed.lock() {
            killed.push((pid, force));
        }
        if let Ok(mut procs) = self.processes.lock() {
            procs.retain(|p| p.pid != pid);
        }
        Ok(())
    }

    fn cpu_percent(&self) -> f64 {
        12.5
    }

    fn mem_used_percent(&self) -> f64 {
        40.0
    }

    fn is_elevated(&self) -> bool {
        self.elevated
    }

    fn local_ip(&self) -> Option<String> {
        self.local_ip.clone()
    }

    fn supports_window_enumeration(&self) -> bool {
        true
    }

    fn windows(&self) -> Vec<WindowInfo> {
        self.windows.lock().map(|w| w.clone()).unwrap_or_default()
    }

    fn capture_window_png(&self, handle: u64) -> Result<Vec<u8>, HostError> {
        let known = self.windows().iter().any(|w| w.handle == handle);
        if known {
            // Smallest valid PNG header + fake payload; enough for encode tests.
            Ok(vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0x00])
        } else {
            Err(HostError::CaptureUnavailable(format!(
                "window {handle} not found"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_children_lookup() {
        let host = MockHost::named("DESKTOP-AB");
        host.add_process(ProcessInfo {
            pid: 100,
            name: "game.exe".to_string(),
            ..Default::default()
        });
        host.add_process(ProcessInfo {
            pid: 101,
            name: "crashpad_handler.exe".to_string(),
            parent_pid: Some(100),
            ..Default::default()
        });
        host.add_process(ProcessInfo {
            pid: 102,
            name: "qtwebengineprocess.exe".to_string(),
            parent_pid: Some(100),
            ..Default::default()
        });

        let children = host.children_of(100);
        assert_eq!(children.len(), 2);
    }

    #[test]
    fn test_mock_kill_records_and_removes() {
        let host = MockHost::named("X");
        host.add_process(ProcessInfo {
            pid: 7,
            name: "game.exe".to_string(),
            ..Default::default()
        });

        host.kill_process(7, false).unwrap();
        assert_eq!(host.killed_pids(), vec![(7, false)]);
        assert!(host.processes().is_empty());
        assert!(host.kill_process(7, true).is_err());
    }
}
