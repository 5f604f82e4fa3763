//! Remote command channel
//!
//! The dashboard queues commands addressed to this device (kill the
//! protected client, capture table snapshots); the agent polls for them,
//! executes, and reports a result. Two sources share the contract: HTTP
//! ([`http`]) and Redis ([`redis`]). Both respect a minimum poll interval
//! and the shared overload backoff.

pub mod actions;
pub mod http;
pub mod redis;

pub use actions::CommandExecutor;
pub use http::HttpCommandClient;
pub use self::redis::RedisCommandClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Minimum seconds between polls, shared by both sources.
pub const DEFAULT_POLL_INTERVAL_SECS: f64 = 2.0;

/// One queued command from the dashboard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceCommand {
    pub id: String,
    pub command: String,
    #[serde(default, rename = "requireAdmin")]
    pub require_admin: bool,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Execution outcome reported back to the dashboard.
#[derive(Debug, Clone, Default)]
pub struct CommandResult {
    pub success: bool,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub admin_required: bool,
}

impl CommandResult {
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// A place commands come from and results go back to.
#[async_trait]
pub trait CommandSource: Send + Sync {
    /// Poll for pending commands. Implementations enforce the poll interval
    /// and overload backoff internally; an empty list means "nothing to do".
    async fn fetch_commands(&self) -> Vec<DeviceCommand>;

    /// Report an execution result.
    async fn send_result(&self, command: &DeviceCommand, result: &CommandResult);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_parses_dashboard_shape() {
        let raw = serde_json::json!({
            "id": "cmd-1",
            "command": "kill_coinpoker",
            "requireAdmin": true,
            "issuedBy": "ops",
        });
        let cmd: DeviceCommand = serde_json::from_value(raw).unwrap();
        assert_eq!(cmd.id, "cmd-1");
        assert!(cmd.require_admin);
        assert_eq!(cmd.extra["issuedBy"], "ops");
    }

    #[test]
    fn test_require_admin_defaults_false() {
        let cmd: DeviceCommand =
            serde_json::from_value(serde_json::json!({"id": "c", "command": "take_snapshot"}))
                .unwrap();
        assert!(!cmd.require_admin);
        assert!(cmd.status.is_none());
    }
}
