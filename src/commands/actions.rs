//! Command execution
//!
//! Executes dashboard commands against the host. `kill_coinpoker` terminates
//! every identified protected-client process (graceful first, then force);
//! `take_snapshot` captures the client's table windows as base64 PNGs.
//! Commands flagged `requireAdmin` fail fast when the agent is not elevated.

use std::sync::Arc;

use base64::Engine;
use serde_json::{json, Value};
use tracing::{info, warn};

use super::{CommandResult, DeviceCommand};
use crate::host::HostOs;
use crate::supervisor::TargetDetector;

pub struct CommandExecutor {
    host: Arc<dyn HostOs>,
    detector: Arc<TargetDetector>,
}

impl CommandExecutor {
    pub fn new(host: Arc<dyn HostOs>, detector: Arc<TargetDetector>) -> Self {
        Self { host, detector }
    }

    /// Execute one command. Never panics or aborts the agent - every failure
    /// is folded into the result.
    pub async fn execute(&self, command: &DeviceCommand) -> CommandResult {
        if command.require_admin && !self.host.is_elevated() {
            return CommandResult {
                success: false,
                output: None,
                error: Some("Administrator privileges required".to_string()),
                admin_required: true,
            };
        }

        match command.command.to_lowercase().as_str() {
            "kill_coinpoker" => self.kill_protected_client(),
            "take_snapshot" => self.capture_tables_snapshot(),
            other => CommandResult::failure(format!("Unsupported command: {other}")),
        }
    }

    /// Terminate all identified protected-client processes.
    fn kill_protected_client(&self) -> CommandResult {
        let targets = self.detector.detect_processes(self.host.as_ref());
        if targets.is_empty() {
            return CommandResult {
                success: false,
                output: Some(json!({"message": "No CoinPoker processes found", "killed_pids": []})),
                error: Some("No CoinPoker processes found".to_string()),
                admin_required: false,
            };
        }

        let mut killed: Vec<u32> = Vec::new();
        for target in &targets {
            match self.host.kill_process(target.pid, false) {
                Ok(()) => {
                    killed.push(target.pid);
                    info!(pid = target.pid, "Terminated CoinPoker process");
                }
                Err(e) => {
                    // Graceful terminate failed - escalate to a hard kill
                    warn!(pid = target.pid, error = %e, "Terminate failed, force-killing");
                    if self.host.kill_process(target.pid, true).is_ok() {
                        killed.push(target.pid);
                    }
                }
            }
        }

        // Anything that survived the graceful pass gets force-killed
        for leftover in self.detector.detect_processes(self.host.as_ref()) {
            if self.host.kill_process(leftover.pid, true).is_ok() && !killed.contains(&leftover.pid)
            {
                killed.push(leftover.pid);
            }
        }

        if killed.is_empty() {
            return CommandResult::failure("No processes were killed");
        }
        CommandResult {
            success: true,
            output: Some(json!({
                "message": format!("Successfully killed {} CoinPoker process(es)", killed.len()),
                "killed_pids": killed,
            })),
            error: None,
            admin_required: false,
        }
    }

    /// Capture every table window as a base64 PNG.
    fn capture_tables_snapshot(&self) -> CommandResult {
        let tables = self.detector.find_table_windows(self.host.as_ref());
        let mut results = Vec::new();
        let mut captured = 0usize;

        for table in &tables {
            let mut entry = json!({
                "hwnd": table.handle,
                "pid": table.pid,
                "title": table.title,
                "rect": [table.rect.0, table.rect.1, table.rect.2, table.rect.3],
            });
            match self.host.capture_window_png(table.handle) {
                Ok(png) => {
                    entry["screenshot"] =
                        json!(base64::engine::general_purpose::STANDARD.encode(png));
                    entry["screenshot_format"] = json!("PNG");
                    captured += 1;
                }
                Err(e) => {
                    entry["error"] = json!(e.to_string());
                }
            }
            results.push(entry);
        }

        let success = captured > 0;
        CommandResult {
            success,
            output: Some(json!({
                "success": success,
                "tables": results,
                "count": captured,
                "error": if success { Value::Null } else { json!("No table screenshots captured") },
            })),
            error: if success {
                None
            } else {
                Some("No table screenshots captured".to_string())
            },
            admin_required: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TargetProfile;
    use crate::host::{MockHost, ProcessInfo, WindowInfo};
    use std::path::PathBuf;

    fn setup() -> (Arc<MockHost>, CommandExecutor) {
        let host = Arc::new(MockHost::named("X"));
        let executor = CommandExecutor::new(
            Arc::clone(&host) as Arc<dyn HostOs>,
            Arc::new(TargetDetector::new(TargetProfile::default())),
        );
        (host, executor)
    }

    fn client_process(pid: u32) -> ProcessInfo {
        ProcessInfo {
            pid,
            name: "game.exe".to_string(),
            exe_path: Some(PathBuf::from("C:\\CoinPoker\\game.exe")),
            cwd: Some(PathBuf::from("C:\\CoinPoker")),
            parent_pid: None,
            cmdline: vec!["game.exe".to_string()],
        }
    }

    fn command(name: &str, require_admin: bool) -> DeviceCommand {
        DeviceCommand {
            id: "cmd-1".to_string(),
            command: name.to_string(),
            require_admin,
            status: None,
            extra: serde_json::Map::new(),
        }
    }

    #[tokio::test]
    async fn test_admin_required_fails_fast() {
        let (_, executor) = setup();
        let result = executor.execute(&command("kill_coinpoker", true)).await;
        assert!(!result.success);
        assert!(result.admin_required);
    }

    #[tokio::test]
    async fn test_kill_terminates_identified_processes() {
        let (host, executor) = setup();
        host.add_process(client_process(100));

        let result = executor.execute(&command("kill_coinpoker", false)).await;
        assert!(result.success);
        let output = result.output.unwrap();
        assert_eq!(output["killed_pids"][0], 100);
        assert_eq!(host.killed_pids(), vec![(100, false)]);
    }

    #[tokio::test]
    async fn test_kill_with_nothing_running_reports_failure() {
        let (_, executor) = setup();
        let result = executor.execute(&command("kill_coinpoker", false)).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("No CoinPoker processes"));
    }

    #[tokio::test]
    async fn test_snapshot_encodes_tables() {
        let (host, executor) = setup();
        host.add_process(client_process(100));
        host.add_window(WindowInfo {
            handle: 5,
            pid: 100,
            class_name: "Qt673QWindowIcon".to_string(),
            title: "NL Hold'em 1/2".to_string(),
            visible: true,
            rect: (0, 0, 800, 600),
        });

        let result = executor.execute(&command("take_snapshot", false)).await;
        assert!(result.success);
        let output = result.output.unwrap();
        assert_eq!(output["count"], 1);
        assert!(output["tables"][0]["screenshot"].is_string());
        assert_eq!(output["tables"][0]["screenshot_format"], "PNG");
    }

    #[tokio::test]
    async fn test_unsupported_command() {
        let (_, executor) = setup();
        let result = executor.execute(&command("reboot", false)).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("Unsupported command"));
    }
}
