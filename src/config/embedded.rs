//! Embedded fallback config bundle
//!
//! A minimal bundle compiled into the binary so the agent still identifies
//! the protected client and the well-known bot families when the dashboard,
//! the cache, and loose JSON files are all unavailable. Selected
//! automatically in RAM-only mode.

use tracing::warn;

use super::bundle::{BundleSource, ConfigBundle};

const EMBEDDED_BUNDLE_JSON: &str = include_str!("embedded_bundle.json");

/// Parse the compiled-in bundle.
///
/// The JSON is validated by tests; if it somehow fails to parse at runtime
/// the agent degrades to built-in struct defaults rather than aborting.
pub fn embedded_bundle() -> ConfigBundle {
    match serde_json::from_str::<ConfigBundle>(EMBEDDED_BUNDLE_JSON) {
        Ok(bundle) => bundle.with_source(BundleSource::Embedded),
        Err(e) => {
            warn!(error = %e, "Embedded config bundle invalid, using struct defaults");
            ConfigBundle::default().with_source(BundleSource::Embedded)
        }
    }
}
