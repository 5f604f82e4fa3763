//! Dashboard-first config loader
//!
//! Fetch priority for the detection config bundle:
//!
//! 1. Dashboard HTTP endpoint (`GET /configs`) - authoritative; cached in
//!    RAM for 5 minutes and, outside RAM-only mode, sealed to disk.
//! 2. Encrypted disk cache (date-rotated key, checksum-validated).
//! 3. Embedded bundle compiled into the binary (RAM-only mode).
//! 4. Loose JSON files on disk (legacy).
//!
//! Consecutive 503/429 responses trigger exponential backoff during which
//! fetches return the current in-memory copy without hitting the server.

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::bundle::{BundleSource, ConfigBundle};
use super::cache::{bundle_checksum, ConfigCache};
use super::embedded::embedded_bundle;
use super::settings::Settings;
use crate::backoff::Backoff;
use crate::types::now_ts;

/// RAM copy validity window.
const RAM_CACHE_TTL_SECS: f64 = 300.0;

/// Config requests use a short timeout; the next poll retries.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Directory for the encrypted cache, relative to the working directory.
const CACHE_DIR_NAME: &str = "config_cache";

/// Directory searched for loose JSON config files (legacy layout).
const LOCAL_CONFIG_DIR: &str = "configs";

/// Wrapped dashboard API response: `{ok: true, data} | {ok: false, error}`.
#[derive(Debug, Deserialize)]
struct ApiEnvelope {
    ok: bool,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VersionData {
    checksum: String,
}

struct LoaderState {
    last_fetch: f64,
    loaded_once: bool,
    backoff: Backoff,
}

/// Loads and caches the detection config bundle.
pub struct ConfigLoader {
    http: reqwest::Client,
    api_base: String,
    cache: Option<ConfigCache>,
    ram_only: bool,
    current: ArcSwap<ConfigBundle>,
    state: Mutex<LoaderState>,
}

impl ConfigLoader {
    pub fn new(settings: &Settings) -> Self {
        let ram_only = settings.ram_only();
        let cache = if ram_only {
            None
        } else {
            Some(ConfigCache::new(&PathBuf::from(CACHE_DIR_NAME)))
        };

        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();

        info!(
            api_base = %settings.api_base(),
            ram_only,
            "Config loader initialized"
        );

        Self {
            http,
            api_base: settings.api_base(),
            cache,
            ram_only,
            current: ArcSwap::from_pointee(ConfigBundle::default()),
            state: Mutex::new(LoaderState {
                last_fetch: 0.0,
                loaded_once: false,
                backoff: Backoff::default(),
            }),
        }
    }

    /// Current bundle without fetching.
    pub fn current(&self) -> Arc<ConfigBundle> {
        self.current.load_full()
    }

    /// Seconds-since-epoch of the last successful dashboard fetch (or cache
    /// adoption). Unchanged by failed or backed-off attempts.
    pub fn last_fetch(&self) -> f64 {
        self.state
            .lock()
            .map(|s| s.last_fetch)
            .unwrap_or(0.0)
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.state
            .lock()
            .map(|s| s.backoff.consecutive_errors())
            .unwrap_or(0)
    }

    /// Fetch the bundle, honoring the RAM TTL unless `force`.
    pub async fn fetch(&self, force: bool) -> Arc<ConfigBundle> {
        self.fetch_at(now_ts(), force).await
    }

    /// [`fetch`](Self::fetch) with an explicit clock, for deterministic tests.
    pub async fn fetch_at(&self, now: f64, force: bool) -> Arc<ConfigBundle> {
        {
            let state = match self.state.lock() {
                Ok(s) => s,
                Err(e) => e.into_inner(),
            };
            let ram_valid = state.loaded_once && (now - state.last_fetch) < RAM_CACHE_TTL_SECS;
            if (!force && ram_valid) || (state.loaded_once && state.backoff.is_active(now)) {
                return self.current.load_full();
            }
        }

        if let Some(bundle) = self.fetch_from_dashboard(now).await {
            let bundle = bundle.with_source(BundleSource::Dashboard);
            if let Some(cache) = &self.cache {
                if let Err(e) = cache.store(&bundle) {
                    warn!(error = %e, "Failed to write config cache");
                }
            }
            self.adopt(bundle, now);
            return self.current.load_full();
        }

        // Dashboard unavailable - fall through the cache chain. The RAM copy
        // stays authoritative if we already hold one.
        {
            let state = match self.state.lock() {
                Ok(s) => s,
                Err(e) => e.into_inner(),
            };
            if state.loaded_once {
                return self.current.load_full();
            }
        }

        if let Some(cache) = &self.cache {
            match cache.load() {
                Ok(bundle) => {
                    info!("Using encrypted config cache");
                    self.adopt(bundle.with_source(BundleSource::Cache), now);
                    return self.current.load_full();
                }
                Err(e) => debug!(error = %e, "Config cache unavailable"),
            }
        }

        let fallback = if self.ram_only {
            embedded_bundle()
        } else {
            load_local_json_files(&PathBuf::from(LOCAL_CONFIG_DIR))
                .unwrap_or_else(embedded_bundle)
        };
        self.adopt(fallback, now);
        self.current.load_full()
    }

    fn adopt(&self, bundle: ConfigBundle, now: f64) {
        let domains = bundle.domain_count();
        let source = bundle.meta.source;
        self.current.store(Arc::new(bundle));

        let mut state = match self.state.lock() {
            Ok(s) => s,
            Err(e) => e.into_inner(),
        };
        state.last_fetch = now;
        state.loaded_once = true;
        debug!(?source, domains, "Adopted config bundle");
    }

    async fn fetch_from_dashboard(&self, now: f64) -> Option<ConfigBundle> {
        {
            let state = match self.state.lock() {
                Ok(s) => s,
                Err(e) => e.into_inner(),
            };
            if state.backoff.is_active(now) {
                return None;
            }
        }

        let url = format!("{}/configs", self.api_base);
        let response = match self.http.get(&url).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "Dashboard not reachable");
                return None;
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
                "Dashboard overloaded - backing off"
            );
            return None;
        }
        if !status.is_success() {
            warn!(status = status.as_u16(), "Dashboard returned error status");
            return None;
        }

        let envelope: ApiEnvelope = match response.json().await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "Dashboard response invalid");
                return None;
            }
        };
        if !envelope.ok {
            warn!(
                error = envelope.error.as_deref().unwrap_or("unknown"),
                "Dashboard API error"
            );
            return None;
        }
        let data = envelope.data?;
        let bundle: ConfigBundle = match serde_json::from_value(data) {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "Dashboard config bundle invalid");
                return None;
            }
        };

        {
            let mut state = match self.state.lock() {
                Ok(s) => s,
                Err(e) => e.into_inner(),
            };
            if state.backoff.consecutive_errors() > 0 {
                info!("Dashboard recovered - resetting backoff");
            }
            state.backoff.record_success();
        }

        info!(domains = bundle.domain_count(), "Fetched configs from dashboard");
        Some(bundle)
    }

    /// Compare the dashboard's bundle checksum against the local copy.
    pub async fn check_for_updates(&self) -> bool {
        let url = format!("{}/configs/version", self.api_base);
        let Ok(response) = self.http.get(&url).send().await else {
            return false;
        };
        if !response.status().is_success() {
            return false;
        }
        let Ok(envelope) = response.json::<ApiEnvelope>().await else {
            return false;
        };
        let Some(data) = envelope.data else {
            return false;
        };
        let Ok(version) = serde_json::from_value::<VersionData>(data) else {
            return false;
        };

        match serde_json::to_value(self.current().as_ref()) {
            Ok(local) => version.checksum != bundle_checksum(&local),
            Err(_) => true,
        }
    }

    /// Drop the RAM copy (shutdown path).
    pub fn cleanup(&self) {
        self.current.store(Arc::new(ConfigBundle::default()));
        let mut state = match self.state.lock() {
            Ok(s) => s,
            Err(e) => e.into_inner(),
        };
        state.last_fetch = 0.0;
        state.loaded_once = false;
    }
}

/// Legacy fallback: assemble a bundle from loose JSON files in `dir`.
fn load_local_json_files(dir: &std::path::Path) -> Option<ConfigBundle> {
    const DOMAIN_FILES: [(&str, &str); 8] = [
        ("programs_registry", "programs_registry.json"),
        ("programs_config", "programs_config.json"),
        ("network_config", "network_config.json"),
        ("screen_config", "screen_config.json"),
        ("behaviour_config", "behaviour_config.json"),
        ("vm_config", "vm_config.json"),
        ("obfuscation_config", "obfuscation_config.json"),
        ("shared_config", "shared_config.json"),
    ];

    if !dir.exists() {
        return None;
    }

    let mut root = serde_json::Map::new();
    for (domain, file) in DOMAIN_FILES {
        let path = dir.join(file);
        let Ok(raw) = std::fs::read_to_string(&path) else {
            continue;
        };
        match serde_json::from_str::<Value>(&raw) {
            Ok(value) => {
                root.insert(domain.to_string(), value);
            }
            Err(e) => warn!(path = %path.display(), error = %e, "Skipping invalid config file"),
        }
    }
    if root.is_empty() {
        return None;
    }

    info!(domains = root.len(), "Loaded local JSON config files");
    serde_json::from_value::<ConfigBundle>(Value::Object(root))
        .ok()
        .map(|b| b.with_source(BundleSource::LocalFiles))
}
