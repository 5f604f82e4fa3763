//! HTTP command client
//!
//! Polls `GET /device-commands?deviceId&limit=5` with bearer auth and posts
//! results to `/device-commands/result`. Overloaded-dashboard responses
//! (503/429) apply the shared exponential backoff; fetches during backoff
//! return nothing and the next poll retries.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use super::{CommandResult, CommandSource, DeviceCommand, DEFAULT_POLL_INTERVAL_SECS};
use crate::backoff::Backoff;
use crate::config::Settings;
use crate::types::now_ts;

/// Commands fetched per poll.
const FETCH_LIMIT: usize = 5;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct CommandsEnvelope {
    ok: bool,
    #[serde(default)]
    data: Option<CommandsData>,
}

#[derive(Debug, Deserialize)]
struct CommandsData {
    #[serde(default)]
    commands: Vec<DeviceCommand>,
}

struct PollState {
    last_fetch: f64,
    backoff: Backoff,
}

pub struct HttpCommandClient {
    http: reqwest::Client,
    commands_url: String,
    results_url: String,
    token: Option<String>,
    device_id: String,
    poll_interval: f64,
    state: Mutex<PollState>,
}

impl HttpCommandClient {
    pub fn new(settings: &Settings, device_id: &str) -> Self {
        let api_base = settings.api_base();
        Self {
            http: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
            commands_url: format!("{api_base}/device-commands"),
            results_url: format!("{api_base}/device-commands/result"),
            token: settings.signal_token.clone(),
            device_id: device_id.to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL_SECS,
            state: Mutex::new(PollState {
                last_fetch: 0.0,
                backoff: Backoff::default(),
            }),
        }
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.state
            .lock()
            .map(|s| s.backoff.consecutive_errors())
            .unwrap_or(0)
    }
}

#[async_trait]
impl CommandSource for HttpCommandClient {
    async fn fetch_commands(&self) -> Vec<DeviceCommand> {
        let now = now_ts();
        {
            let mut state = match self.state.lock() {
                Ok(s) => s,
                Err(e) => e.into_inner(),
            };
            if state.backoff.is_active(now) || now - state.last_fetch < self.poll_interval {
                return Vec::new();
            }
            state.last_fetch = now;
        }

        let limit = FETCH_LIMIT.to_string();
        let mut request = self
            .http
            .get(&self.commands_url)
            .query(&[("deviceId", self.device_id.as_str()), ("limit", limit.as_str())])
            .header("Accept", "application/json");
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => {
                debug!(error = %e, "Command fetch failed");
                return Vec::new();
            }
        };

        let status = response.status();
        if status == reqwest::StatusCode::SERVICE_UNAVAILABLE
            || status == reqwest::StatusCode::TOO_MANY_REQUESTS
        {
            let mut state = match self.state.lock() {
                Ok(s) => s,
                Err(e) => e.into_inner(),
            };
            let wait = state.backoff.record_overload(now);
            warn!(
                status = status.as_u16(),
                wait_secs = wait as u64,
                attempt = state.backoff.consecutive_errors(),
                "Dashboard overloaded - command polling backing off"
            );
            return Vec::new();
        }
        if !status.is_success() {
            warn!(status = status.as_u16(), "Command fetch returned error status");
            return Vec::new();
        }

        let envelope: CommandsEnvelope = match response.json().await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "Command response invalid");
                return Vec::new();
            }
        };
        if !envelope.ok {
            return Vec::new();
        }

        {
            let mut state = match self.state.lock() {
                Ok(s) => s,
                Err(e) => e.into_inner(),
            };
            if state.backoff.consecutive_errors() > 0 {
                info!("Dashboard recovered - command polling resumed");
            }
            state.backoff.record_success();
        }

        envelope.data.map(|d| d.commands).unwrap_or_default()
    }

    async fn send_result(&self, command: &DeviceCommand, result: &CommandResult) {
        let payload = json!({
            "commandId": command.id,
            "deviceId": self.device_id,
            "command": command.command,
            "success": result.success,
            "output": result.output,
            "error": result.error,
            "adminRequired": result.admin_required,
            "requireAdmin": command.require_admin,
        });

        let mut request = self.http.post(&self.results_url).json(&payload);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        match request.send().await {
            Ok(response) if !response.status().is_success() => {
                warn!(
                    status = response.status().as_u16(),
                    command_id = %command.id,
                    "Result upload rejected"
                );
            }
            Ok(_) => debug!(command_id = %command.id, "Command result reported"),
            Err(e) => warn!(command_id = %command.id, error = %e, "Result upload failed"),
        }
    }
}
