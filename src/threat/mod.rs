//! Threat aggregation
//!
//! Deduplicates heterogeneous detection signals into persistent active
//! threats, escalates severity, and expires threats whose source stopped
//! producing. See [`identity`] for the id-derivation rules and [`manager`]
//! for the stateful aggregation.

pub mod identity;
mod manager;

pub use identity::{derive_threat_id, is_false_positive, is_more_specific_name, threat_level};
pub use manager::{CategoryTimeouts, SignalDisposition, ThreatManager};
