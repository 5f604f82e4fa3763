//! Compile-time segment registry
//!
//! Segments are enumerated here instead of being discovered from the
//! filesystem - adding a detection module means adding a constructor to this
//! list. Per-category scan intervals come from the settings, defaulting to
//! the batch window so every segment contributes to every report.

use std::sync::Arc;

use super::{ProcessPresenceSegment, Segment};
use crate::config::{ConfigBundle, Settings};
use crate::host::HostOs;

/// Build all registered segments against the given host and config bundle.
pub fn registry(
    host: Arc<dyn HostOs>,
    bundle: &ConfigBundle,
    settings: &Settings,
) -> Vec<Arc<dyn Segment>> {
    let interval = |configured: Option<f64>| {
        configured
            .filter(|v| *v > 0.0)
            .unwrap_or(settings.batch_interval_secs)
    };

    // Keepalive cadence scales with the global cooldown multiplier
    let keepalive_interval = settings.apply_cooldown(60.0, Some(10.0));

    vec![Arc::new(ProcessPresenceSegment::new(
        host,
        bundle,
        interval(settings.programs_interval_secs),
        keepalive_interval,
    ))]
}
