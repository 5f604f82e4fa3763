//! Device identity resolution
//!
//! The dashboard keys everything on `device_id` (MD5 of the computer name)
//! and displays a resolved `device_name`. Name resolution follows a fixed
//! priority shared with the dashboard so both sides always pick the same
//! label, and it sanitizes values that merely look like device ids.

use serde::{Deserialize, Serialize};

use super::HostOs;

/// Resolution priority, highest first. Mirrors the dashboard's
/// `name_priority` so stored and displayed names stay identical.
const NAME_PRIORITY: [&str; 7] = [
    "batch.nickname",
    "batch.device",
    "batch.system.host",
    "batch.device.hostname",
    "batch.meta.hostname",
    "signal.device_name",
    "device_id",
];

/// Stable device id: MD5 of the computer name.
pub fn device_id_from_name(computer_name: &str) -> String {
    format!("{:x}", md5::compute(computer_name.as_bytes()))
}

/// Heuristic for values that are really device ids, not names: a 32+ char
/// hex string, or two 16+ char hex halves joined by an underscore.
pub fn looks_like_device_id(value: &str) -> bool {
    let stripped = value.trim();
    let is_hex = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_hexdigit());

    if stripped.len() >= 32 && is_hex(stripped) {
        return true;
    }
    if let Some((a, b)) = stripped.split_once('_') {
        if a.len() >= 16 && b.len() >= 16 && is_hex(a) && is_hex(b) {
            return true;
        }
    }
    false
}

fn sanitize(candidate: Option<&str>, device_id: &str) -> Option<String> {
    let trimmed = candidate?.trim();
    if trimmed.is_empty() || trimmed == device_id || looks_like_device_id(trimmed) {
        return None;
    }
    Some(trimmed.to_string())
}

/// Candidate names gathered from one batch, by origin.
#[derive(Debug, Clone, Default)]
pub struct NameSources {
    pub batch_nickname: Option<String>,
    pub batch_device: Option<String>,
    pub batch_host: Option<String>,
    pub batch_device_hostname: Option<String>,
    pub batch_meta_hostname: Option<String>,
    pub signal_device_name: Option<String>,
}

/// Resolve the display/stored device name by priority, falling back to the
/// device id itself when nothing survives sanitization.
pub fn resolve_device_name(device_id: &str, sources: &NameSources) -> String {
    for key in NAME_PRIORITY {
        let candidate = match key {
            "batch.nickname" => sources.batch_nickname.as_deref(),
            "batch.device" => sources.batch_device.as_deref(),
            "batch.system.host" => sources.batch_host.as_deref(),
            "batch.device.hostname" => sources.batch_device_hostname.as_deref(),
            "batch.meta.hostname" => sources.batch_meta_hostname.as_deref(),
            "signal.device_name" => sources.signal_device_name.as_deref(),
            _ => return device_id.to_string(),
        };
        if let Some(resolved) = sanitize(candidate, device_id) {
            return resolved;
        }
    }
    device_id.to_string()
}

/// This workstation's identity as stamped onto outgoing signals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub device_name: String,
    pub device_ip: Option<String>,
}

impl DeviceIdentity {
    pub fn from_host(host: &dyn HostOs) -> Self {
        let device_name = host.computer_name();
        Self {
            device_id: device_id_from_name(&device_name),
            device_name,
            device_ip: host.local_ip(),
        }
    }
}
