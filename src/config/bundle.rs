//! Typed view of the detection config bundle
//!
//! The dashboard serves one JSON bundle holding every detection config
//! domain. The sections the core consumes are typed here; everything else is
//! carried opaquely in `extra` so unknown domains survive a cache round trip
//! and stay available to segments that know their own schema.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::now_ts;

/// Where a bundle was obtained from, recorded in `_meta.source`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BundleSource {
    Dashboard,
    Cache,
    Embedded,
    LocalFiles,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BundleMeta {
    pub version: String,
    pub source: Option<BundleSource>,
    pub timestamp: f64,
}

impl Default for BundleMeta {
    fn default() -> Self {
        Self {
            version: "0.0.0".to_string(),
            source: None,
            timestamp: 0.0,
        }
    }
}

/// One program definition from the registry (master source for all known
/// bots, RTA tools, and automation runtimes).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgramEntry {
    pub name: String,
    /// Executable basenames this program runs under.
    pub process_names: Vec<String>,
    /// Signal severity to report when seen (`WARN`/`ALERT`/`CRITICAL`).
    pub severity: String,
    pub category: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl Default for ProgramEntry {
    fn default() -> Self {
        Self {
            name: String::new(),
            process_names: Vec::new(),
            severity: "WARN".to_string(),
            category: None,
            extra: serde_json::Map::new(),
        }
    }
}

/// `programs_registry` section - the master program list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgramsRegistry {
    pub programs: Vec<ProgramEntry>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Identification profile for the protected client, shared with the kill and
/// snapshot tooling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetProfile {
    pub process_name: String,
    pub window_class: String,
    pub children_processes: Vec<String>,
    pub title_patterns: Vec<String>,
}

impl Default for TargetProfile {
    fn default() -> Self {
        Self {
            process_name: "game.exe".to_string(),
            window_class: "Qt673QWindowIcon".to_string(),
            children_processes: vec![
                "crashpad_handler.exe".to_string(),
                "QtWebEngineProcess.exe".to_string(),
            ],
            title_patterns: vec![
                "coinpoker".to_string(),
                "lobby".to_string(),
                "nl ".to_string(),
                "hold'em".to_string(),
                "plo ".to_string(),
                "ante".to_string(),
            ],
        }
    }
}

/// `coinpoker_windows` section wrapper.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetClientConfig {
    pub common: TargetProfile,
}

/// The full configuration bundle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigBundle {
    #[serde(rename = "_meta")]
    pub meta: BundleMeta,
    pub programs_registry: Option<ProgramsRegistry>,
    pub coinpoker_windows: Option<TargetClientConfig>,
    /// Domains the core does not interpret (network_config, screen_config,
    /// behaviour_config, vm_config, obfuscation_config, shared_config, …).
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl ConfigBundle {
    /// Bundle tagged with a source and the current timestamp.
    pub fn with_source(mut self, source: BundleSource) -> Self {
        self.meta.source = Some(source);
        if self.meta.timestamp == 0.0 {
            self.meta.timestamp = now_ts();
        }
        self
    }

    /// Number of config domains carried (excluding `_meta`).
    pub fn domain_count(&self) -> usize {
        usize::from(self.programs_registry.is_some())
            + usize::from(self.coinpoker_windows.is_some())
            + self.extra.len()
    }

    /// Target-client identification profile, falling back to the built-in
    /// defaults when the bundle carries none.
    pub fn target_profile(&self) -> TargetProfile {
        self.coinpoker_windows
            .as_ref()
            .map(|c| c.common.clone())
            .unwrap_or_default()
    }

    /// Opaque access for segments that own their domain's schema.
    pub fn domain(&self, name: &str) -> Option<&Value> {
        self.extra.get(name)
    }
}
