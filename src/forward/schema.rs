//! Shared Redis schema
//!
//! Key and channel templates for everything the agent writes to Redis. The
//! dashboard reads the same schema; always go through these helpers instead
//! of formatting keys inline so both sides stay bit-compatible.

use crate::types::Status;

/// Default record TTL: 7 days.
pub const DEFAULT_TTL_SECONDS: u64 = 604_800;

/// TTL from the environment (`REDIS_TTL_SECONDS`) or the default.
pub fn ttl_seconds_from_env() -> u64 {
    std::env::var("REDIS_TTL_SECONDS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_TTL_SECONDS)
}

/// Redis key templates. Stateless; exists so call sites read as
/// `keys::device_hash(id)` rather than ad-hoc `format!`s.
pub mod keys {
    use super::Status;

    pub fn device_hash(device_id: &str) -> String {
        format!("device:{device_id}")
    }

    pub fn device_categories(device_id: &str) -> String {
        format!("device:{device_id}:categories")
    }

    pub fn device_detections(device_id: &str, severity: Status) -> String {
        format!("device:{device_id}:detections:{severity}")
    }

    pub fn device_threat(device_id: &str) -> String {
        format!("device:{device_id}:threat")
    }

    pub fn batch_record(device_id: &str, timestamp: i64) -> String {
        format!("batch:{device_id}:{timestamp}")
    }

    pub fn batches_hourly(device_id: &str) -> String {
        format!("batches:{device_id}:hourly")
    }

    pub fn batches_daily(device_id: &str) -> String {
        format!("batches:{device_id}:daily")
    }

    /// `day` formatted `YYYY-MM-DD`.
    pub fn day_stats(device_id: &str, day: &str) -> String {
        format!("day:{device_id}:{day}")
    }

    /// `hour` formatted `YYYY-MM-DDTHH`.
    pub fn hour_stats(device_id: &str, hour: &str) -> String {
        format!("hour:{device_id}:{hour}")
    }

    pub fn session_record(device_id: &str, timestamp: i64) -> String {
        format!("session:{device_id}:{timestamp}")
    }

    pub fn session_index(device_id: &str) -> String {
        format!("sessions:{device_id}")
    }

    pub fn session_pattern(device_id: &str) -> String {
        format!("session:{device_id}:*")
    }

    pub fn device_index() -> String {
        "devices".to_string()
    }

    pub fn top_players() -> String {
        "top_players:bot_probability".to_string()
    }

    pub fn device_updates_channel(device_id: &str) -> String {
        format!("updates:{device_id}")
    }

    pub fn global_updates_channel() -> String {
        "updates:all".to_string()
    }

    // Command queue (dashboard → agent)

    pub fn command_queue(device_id: &str) -> String {
        format!("device:{device_id}:command_queue")
    }

    pub fn command(device_id: &str, command_id: &str) -> String {
        format!("device:{device_id}:commands:{command_id}")
    }

    pub fn command_result(device_id: &str, command_id: &str) -> String {
        format!("device:{device_id}:command_result:{command_id}")
    }
}
