//! TableGuard: Endpoint Bot Detection
//!
//! Long-lived workstation agent that watches for the protected poker client
//! and, while it runs, aggregates OS-level evidence into structured
//! detections for a central dashboard.
//!
//! ## Architecture
//!
//! - **Segments**: detection modules emitting categorized signals
//! - **Threat Manager**: dedup + escalation into persistent active threats
//! - **Report Batcher**: one unified scan report per batch window
//! - **Forwarders**: HTTP and direct-Redis sinks for batch reports
//! - **Supervisor**: gates the pipeline on protected-client presence

pub mod backoff;
pub mod batch;
pub mod bus;
pub mod commands;
pub mod config;
pub mod forward;
pub mod host;
pub mod pipeline;
pub mod runtime;
pub mod segments;
pub mod storage;
pub mod supervisor;
pub mod threat;
pub mod types;

// Re-export the types nearly every consumer touches
pub use bus::{EventBus, DETECTION_EVENT};
pub use runtime::Runtime;
pub use threat::{SignalDisposition, ThreatManager};
pub use types::{ActiveThreat, Category, Signal, Status, UnifiedBatchReport};
