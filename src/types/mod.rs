//! Shared value types for the detection pipeline.

mod report;
mod signal;
mod threat;

pub use report::{
    ConfigurationMetadata, DetectionEntry, DeviceBlock, FlowMetadata, ReportMetadata,
    ReportSummary, SegmentMetadata, SystemBlock, SystemStateMetadata, TimingMetadata,
    UnifiedBatchReport,
};
pub use signal::{now_ts, Category, Signal, Status};
pub use threat::{ActiveThreat, ThreatDetail, ThreatSummary};
