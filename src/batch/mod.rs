//! Report batching
//!
//! One unified scan report per batch window, assembled from the window's
//! buffered signals plus a threat-manager snapshot. See [`batcher`] for the
//! assembly rules and [`log`] for the optional on-disk batch log.

mod batcher;
mod log;

pub use batcher::{ReportBatcher, SegmentInfo, SystemInfo};
pub use log::BatchLog;
