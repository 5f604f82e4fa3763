//! Redis command client
//!
//! Used when the dashboard is hosted remotely and its HTTP API is not
//! reachable from the player's network: commands queue in Redis instead.
//! Polls the device's command ZSET for the oldest pending entries, marks
//! them processing, and writes results to a 1-hour-TTL result key.

use std::sync::Mutex;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde_json::json;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use super::{CommandResult, CommandSource, DeviceCommand, DEFAULT_POLL_INTERVAL_SECS};
use crate::backoff::Backoff;
use crate::forward::schema::keys;
use crate::types::now_ts;

/// Commands fetched per poll (oldest first).
const FETCH_LIMIT: isize = 5;

/// TTL on the processing marker written back to the command key.
const PROCESSING_TTL_SECS: u64 = 300;

/// TTL on result keys.
const RESULT_TTL_SECS: u64 = 3600;

struct PollState {
    last_fetch: f64,
    backoff: Backoff,
}

pub struct RedisCommandClient {
    conn: AsyncMutex<ConnectionManager>,
    device_id: String,
    poll_interval: f64,
    state: Mutex<PollState>,
}

impl RedisCommandClient {
    /// Connect to Redis; fails when the server is unreachable.
    pub async fn connect(redis_url: &str, device_id: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(redis_url)?;
        let mut conn = client.get_connection_manager().await?;
        redis::cmd("PING").query_async::<_, ()>(&mut conn).await?;
        info!(device_id, "Redis command client connected");

        Ok(Self {
            conn: AsyncMutex::new(conn),
            device_id: device_id.to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL_SECS,
            state: Mutex::new(PollState {
                last_fetch: 0.0,
                backoff: Backoff::default(),
            }),
        })
    }

    async fn fetch_inner(&self) -> Result<Vec<DeviceCommand>, redis::RedisError> {
        let mut conn = self.conn.lock().await;
        let queue_key = keys::command_queue(&self.device_id);

        let command_ids: Vec<String> = conn.zrange(&queue_key, 0, FETCH_LIMIT - 1).await?;
        if command_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut commands = Vec::new();
        for cmd_id in command_ids {
            let command_key = keys::command(&self.device_id, &cmd_id);
            let raw: Option<String> = conn.get(&command_key).await?;
            let Some(raw) = raw else {
                // Command body expired - drop the dangling queue entry
                conn.zrem::<_, _, ()>(&queue_key, &cmd_id).await?;
                continue;
            };

            match serde_json::from_str::<DeviceCommand>(&raw) {
                Ok(mut command) => {
                    if command.status.as_deref() != Some("pending") {
                        continue;
                    }
                    command.status = Some("processing".to_string());
                    let updated = serde_json::to_string(&command)
                        .unwrap_or_else(|_| raw.clone());
                    conn.set_ex::<_, _, ()>(&command_key, updated, PROCESSING_TTL_SECS)
                        .await?;
                    conn.zrem::<_, _, ()>(&queue_key, &cmd_id).await?;

                    debug!(command_id = %cmd_id, command = %command.command, "Fetched command");
                    commands.push(command);
                }
                Err(e) => {
                    warn!(command_id = %cmd_id, error = %e, "Invalid command JSON");
                    conn.zrem::<_, _, ()>(&queue_key, &cmd_id).await?;
                }
            }
        }
        Ok(commands)
    }
}

#[async_trait]
impl CommandSource for RedisCommandClient {
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

        match self.fetch_inner().await {
            Ok(commands) => {
                let mut state = match self.state.lock() {
                    Ok(s) => s,
                    Err(e) => e.into_inner(),
                };
                state.backoff.record_success();
                commands
            }
            Err(e) => {
                // Server-side pressure backs polling off like an HTTP 503;
                // plain connectivity errors just wait for the next poll.
                if e.is_connection_refusal() || e.is_timeout() {
                    debug!(error = %e, "Redis command fetch failed");
                } else {
                    let mut state = match self.state.lock() {
                        Ok(s) => s,
                        Err(e) => e.into_inner(),
                    };
                    let wait = state.backoff.record_overload(now);
                    warn!(error = %e, wait_secs = wait as u64, "Redis overloaded - backing off");
                }
                Vec::new()
            }
        }
    }

    async fn send_result(&self, command: &DeviceCommand, result: &CommandResult) {
        let payload = json!({
            "commandId": command.id,
            "success": result.success,
            "output": result.output,
            "error": result.error,
            "adminRequired": result.admin_required,
            "completedAt": (now_ts() * 1000.0) as i64,
        });

        let mut conn = self.conn.lock().await;
        let result_key = keys::command_result(&self.device_id, &command.id);
        if let Err(e) = conn
            .set_ex::<_, _, ()>(&result_key, payload.to_string(), RESULT_TTL_SECS)
            .await
        {
            warn!(command_id = %command.id, error = %e, "Failed to store command result");
            return;
        }
        // Result stored - the command entry is done
        let command_key = keys::command(&self.device_id, &command.id);
        if let Err(e) = conn.del::<_, ()>(&command_key).await {
            warn!(command_id = %command.id, error = %e, "Failed to delete command key");
        }
        debug!(command_id = %command.id, success = result.success, "Command result stored");
    }
}
