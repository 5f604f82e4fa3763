//! Local agent settings
//!
//! The settings file holds the workstation-local knobs (environment, sink
//! selection, batch cadence, scan intervals). Keys are uppercase and mirror
//! the environment variable names, so a value can come from either place:
//! environment variables always win over the file, the file wins over the
//! built-in defaults.
//!
//! Loading order:
//! 1. `TABLEGUARD_CONFIG` environment variable (path to TOML file)
//! 2. `tableguard.toml` in the current working directory
//! 3. Built-in defaults

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::Category;

/// Default unified batch window (seconds).
pub const DEFAULT_BATCH_INTERVAL_SECS: f64 = 92.0;

/// Settings file searched in the working directory.
pub const SETTINGS_FILE_NAME: &str = "tableguard.toml";

/// Deployment environment; DEV points the agent at the local dashboard and
/// replaces the reported device name with "Test".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Environment {
    Dev,
    #[default]
    Prod,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Dev => "DEV",
            Environment::Prod => "PROD",
        }
    }
}

/// Which sink consumes batch reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwarderMode {
    /// Prefer Redis when a URL is configured, fall back to web.
    #[default]
    Auto,
    Web,
    Redis,
}

/// Agent settings. Unknown keys in the file are tolerated for forward
/// compatibility.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    #[serde(rename = "ENV")]
    pub env: Environment,
    #[serde(rename = "FORWARDER_MODE")]
    pub forwarder_mode: ForwarderMode,
    #[serde(rename = "WEB")]
    pub web_enabled: bool,
    #[serde(rename = "WEB_URL_DEV")]
    pub web_url_dev: Option<String>,
    #[serde(rename = "WEB_URL_PROD")]
    pub web_url_prod: Option<String>,
    #[serde(rename = "WEB_FORWARDER_TIMEOUT")]
    pub web_forwarder_timeout_secs: f64,
    #[serde(rename = "SIGNAL_TOKEN")]
    pub signal_token: Option<String>,
    #[serde(rename = "REDIS_URL")]
    pub redis_url: Option<String>,
    #[serde(rename = "REDIS_TTL_SECONDS")]
    pub redis_ttl_seconds: Option<u64>,
    #[serde(rename = "BATCH_INTERVAL_HEAVY")]
    pub batch_interval_secs: f64,
    /// All segments tick together (no start staggering) for deterministic
    /// testing.
    #[serde(rename = "SYNC_SEGMENTS")]
    pub sync_segments: bool,
    /// Global multiplier for per-segment cooldowns and caches; 0 disables
    /// throttling entirely.
    #[serde(rename = "COOLDOWN_MULTIPLIER")]
    pub cooldown_multiplier: f64,
    /// Keep the config bundle in RAM only and fall back to the embedded
    /// bundle instead of disk files. `None` auto-detects: RAM-only when no
    /// settings file exists on disk.
    #[serde(rename = "RAM_CONFIG")]
    pub ram_config: Option<bool>,
    #[serde(rename = "NEW_BATCHES_LOG")]
    pub log_batches: bool,
    #[serde(rename = "BATCH_LOG_DIR")]
    pub batch_log_dir: Option<PathBuf>,
    /// Attach the pipeline-topology metadata block to batch reports.
    #[serde(rename = "TESTING_JSON")]
    pub testing_json: bool,

    // Per-category scan intervals (seconds); threat heartbeat timeouts are
    // derived as 3× these values.
    #[serde(rename = "PROGRAMS")]
    pub programs_interval_secs: Option<f64>,
    #[serde(rename = "AUTO")]
    pub auto_interval_secs: Option<f64>,
    #[serde(rename = "NETWORK")]
    pub network_interval_secs: Option<f64>,
    #[serde(rename = "BEHAVIOUR")]
    pub behaviour_interval_secs: Option<f64>,
    #[serde(rename = "VM")]
    pub vm_interval_secs: Option<f64>,
    #[serde(rename = "SCREEN")]
    pub screen_interval_secs: Option<f64>,
    #[serde(rename = "SYSTEM")]
    pub system_interval_secs: Option<f64>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            env: Environment::Prod,
            forwarder_mode: ForwarderMode::Auto,
            web_enabled: false,
            web_url_dev: None,
            web_url_prod: None,
            web_forwarder_timeout_secs: 10.0,
            signal_token: None,
            redis_url: None,
            redis_ttl_seconds: None,
            batch_interval_secs: DEFAULT_BATCH_INTERVAL_SECS,
            sync_segments: false,
            cooldown_multiplier: 1.0,
            ram_config: None,
            log_batches: false,
            batch_log_dir: None,
            testing_json: false,
            programs_interval_secs: None,
            auto_interval_secs: None,
            network_interval_secs: None,
            behaviour_interval_secs: None,
            vm_interval_secs: None,
            screen_interval_secs: None,
            system_interval_secs: None,
        }
    }
}

impl Settings {
    /// Load settings from the TOML file (if present), then apply environment
    /// variable overrides.
    pub fn load() -> Self {
        let path = std::env::var("TABLEGUARD_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(SETTINGS_FILE_NAME));
        let mut settings = Self::from_file(&path);
        if settings.ram_config.is_none() {
            // No explicit choice: RAM-only when there is no settings file to
            // anchor a cache directory next to.
            settings.ram_config = Some(!path.exists());
        }
        settings.apply_env_overrides();
        settings
    }

    fn from_file(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(raw) => match toml::from_str::<Settings>(&raw) {
                Ok(settings) => {
                    info!(path = %path.display(), "Loaded settings file");
                    settings
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Settings file invalid, using defaults");
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("ENV") {
            self.env = match v.to_uppercase().as_str() {
                "DEV" => Environment::Dev,
                _ => Environment::Prod,
            };
        }
        if let Ok(v) = std::env::var("FORWARDER_MODE") {
            self.forwarder_mode = match v.to_lowercase().as_str() {
                "web" => ForwarderMode::Web,
                "redis" => ForwarderMode::Redis,
                _ => ForwarderMode::Auto,
            };
        }
        if let Ok(v) = std::env::var("WEB") {
            self.web_enabled = truthy(&v);
        }
        if let Ok(v) = std::env::var("WEB_URL_DEV") {
            self.web_url_dev = Some(v);
        }
        if let Ok(v) = std::env::var("WEB_URL_PROD") {
            self.web_url_prod = Some(v);
        }
        if let Ok(v) = std::env::var("SIGNAL_TOKEN") {
            self.signal_token = Some(v);
        }
        if let Ok(v) = std::env::var("REDIS_URL") {
            self.redis_url = Some(v);
        }
        if let Ok(v) = std::env::var("REDIS_TTL_SECONDS") {
            if let Ok(ttl) = v.parse() {
                self.redis_ttl_seconds = Some(ttl);
            }
        }
        if let Ok(v) = std::env::var("BATCH_INTERVAL_HEAVY") {
            if let Ok(secs) = v.parse::<f64>() {
                if secs > 0.0 {
                    self.batch_interval_secs = secs;
                }
            }
        }
        if let Ok(v) = std::env::var("SYNC_SEGMENTS") {
            self.sync_segments = truthy(&v);
        }
        if let Ok(v) = std::env::var("COOLDOWN_MULTIPLIER") {
            if let Ok(m) = v.parse::<f64>() {
                self.cooldown_multiplier = m.max(0.0);
            }
        }
        if let Ok(v) = std::env::var("RAM_CONFIG") {
            self.ram_config = Some(truthy(&v));
        }
    }

    /// Dashboard signal endpoint for the active environment.
    pub fn web_url(&self) -> String {
        match (self.env, &self.web_url_dev, &self.web_url_prod) {
            (Environment::Dev, Some(dev), _) => dev.clone(),
            (Environment::Prod, _, Some(prod)) => prod.clone(),
            (_, dev, prod) => prod
                .clone()
                .or_else(|| dev.clone())
                .unwrap_or_else(|| "http://localhost:3001/api/signal".to_string()),
        }
    }

    /// Dashboard API base derived from the signal endpoint.
    pub fn api_base(&self) -> String {
        let url = self.web_url();
        if let Some(base) = url.strip_suffix("/api/signal") {
            return format!("{base}/api");
        }
        if url.ends_with("/api") {
            return url;
        }
        format!("{}/api", url.trim_end_matches('/'))
    }

    /// Whether the config bundle should stay RAM-only (no disk cache).
    pub fn ram_only(&self) -> bool {
        self.ram_config.unwrap_or(false)
    }

    /// Configured per-category scan intervals (only explicitly set ones).
    pub fn scan_intervals(&self) -> HashMap<Category, f64> {
        let pairs = [
            (Category::Programs, self.programs_interval_secs),
            (Category::Auto, self.auto_interval_secs),
            (Category::Network, self.network_interval_secs),
            (Category::Behaviour, self.behaviour_interval_secs),
            (Category::Vm, self.vm_interval_secs),
            (Category::Screen, self.screen_interval_secs),
            (Category::System, self.system_interval_secs),
        ];
        pairs
            .into_iter()
            .filter_map(|(c, v)| v.map(|secs| (c, secs)))
            .collect()
    }

    /// Scale a cooldown/cache duration by the global multiplier, with an
    /// optional floor for values that must not reach zero.
    pub fn apply_cooldown(&self, base_secs: f64, minimum: Option<f64>) -> f64 {
        let scaled = base_secs * self.cooldown_multiplier;
        if scaled <= 0.0 {
            return minimum.unwrap_or(0.0);
        }
        match minimum {
            Some(min) if scaled < min => min,
            _ => scaled,
        }
    }
}

fn truthy(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "y" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let s = Settings::default();
        assert_eq!(s.env, Environment::Prod);
        assert_eq!(s.forwarder_mode, ForwarderMode::Auto);
        assert_eq!(s.batch_interval_secs, DEFAULT_BATCH_INTERVAL_SECS);
        assert_eq!(s.cooldown_multiplier, 1.0);
        assert!(!s.sync_segments);
    }

    #[test]
    fn test_toml_keys_mirror_env_names() {
        let raw = r#"
            ENV = "DEV"
            FORWARDER_MODE = "redis"
            REDIS_URL = "redis://localhost:6379/0"
            BATCH_INTERVAL_HEAVY = 30.0
            SYNC_SEGMENTS = true
            AUTO = 31.0
        "#;
        let s: Settings = toml::from_str(raw).unwrap();
        assert_eq!(s.env, Environment::Dev);
        assert_eq!(s.forwarder_mode, ForwarderMode::Redis);
        assert_eq!(s.redis_url.as_deref(), Some("redis://localhost:6379/0"));
        assert_eq!(s.batch_interval_secs, 30.0);
        assert!(s.sync_segments);
        assert_eq!(s.auto_interval_secs, Some(31.0));
    }

    #[test]
    fn test_unknown_keys_tolerated() {
        let raw = r#"
            ENV = "PROD"
            FUTURE_FLAG = "whatever"
        "#;
        assert!(toml::from_str::<Settings>(raw).is_ok());
    }

    #[test]
    fn test_web_url_selection() {
        let mut s = Settings {
            web_url_dev: Some("http://localhost:3001/api/signal".to_string()),
            web_url_prod: Some("https://dash.example.com/api/signal".to_string()),
            ..Default::default()
        };
        assert_eq!(s.web_url(), "https://dash.example.com/api/signal");
        assert_eq!(s.api_base(), "https://dash.example.com/api");

        s.env = Environment::Dev;
        assert_eq!(s.web_url(), "http://localhost:3001/api/signal");

        let bare = Settings::default();
        assert_eq!(bare.web_url(), "http://localhost:3001/api/signal");
        assert_eq!(bare.api_base(), "http://localhost:3001/api");
    }

    #[test]
    fn test_apply_cooldown() {
        let mut s = Settings::default();
        assert_eq!(s.apply_cooldown(60.0, None), 60.0);

        s.cooldown_multiplier = 0.25;
        assert_eq!(s.apply_cooldown(60.0, None), 15.0);
        assert_eq!(s.apply_cooldown(60.0, Some(30.0)), 30.0);

        s.cooldown_multiplier = 0.0;
        assert_eq!(s.apply_cooldown(60.0, None), 0.0);
        assert_eq!(s.apply_cooldown(60.0, Some(5.0)), 5.0);
    }

    #[test]
    fn test_scan_intervals_only_configured() {
        let s = Settings {
            auto_interval_secs: Some(31.0),
            vm_interval_secs: Some(120.0),
            ..Default::default()
        };
        let map = s.scan_intervals();
        assert_eq!(map.len(), 2);
        assert_eq!(map[&Category::Auto], 31.0);
        assert_eq!(map[&Category::Vm], 120.0);
    }
}
