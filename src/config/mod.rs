//! Configuration
//!
//! Two layers, mirroring how the agent is deployed:
//!
//! - **Settings** (`settings`): workstation-local knobs from
//!   `tableguard.toml` and environment variables - environment, sink
//!   selection, batch cadence, scan intervals.
//! - **Config bundle** (`bundle`, `loader`, `cache`, `embedded`): the
//!   detection configuration served by the dashboard, cached encrypted on
//!   disk with an embedded fallback baked into the binary.
//!
//! Call `config::init()` once at startup, then `config::get()` anywhere:
//!
//! ```ignore
//! // In main():
//! config::init(Settings::load());
//!
//! // Anywhere in the codebase:
//! let interval = config::get().batch_interval_secs;
//! ```

pub mod bundle;
pub mod cache;
pub mod embedded;
pub mod loader;
mod settings;

pub use bundle::{
    BundleMeta, BundleSource, ConfigBundle, ProgramEntry, ProgramsRegistry, TargetClientConfig,
    TargetProfile,
};
pub use cache::{bundle_checksum, CacheError, ConfigCache};
pub use embedded::embedded_bundle;
pub use loader::ConfigLoader;
pub use settings::{
    Environment, ForwarderMode, Settings, DEFAULT_BATCH_INTERVAL_SECS, SETTINGS_FILE_NAME,
};

use std::sync::OnceLock;

/// Global agent settings, initialized once at startup.
static SETTINGS: OnceLock<Settings> = OnceLock::new();

/// Initialize the global settings.
///
/// Must be called exactly once before any calls to `get()`; repeated calls
/// are ignored with a warning.
pub fn init(settings: Settings) {
    if SETTINGS.set(settings).is_err() {
        tracing::warn!("config::init() called more than once - ignoring");
    }
}

/// Get the global settings, or the built-in defaults when `init()` has not
/// run (library/test contexts construct their own `Settings` instead).
pub fn get() -> &'static Settings {
    SETTINGS.get_or_init(Settings::default)
}

/// Whether `init()` has been called.
pub fn is_initialized() -> bool {
    SETTINGS.get().is_some()
}
