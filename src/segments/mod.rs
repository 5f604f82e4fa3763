//! Segment runtime
//!
//! A segment is a detection module that periodically emits signals of one
//! category. Segments are registered at compile time (see [`registry`]) and
//! run by the [`SegmentScheduler`], which staggers their start offsets across
//! the batch window so ticks never land on the CPU at once.
//!
//! Shutdown is two-phase: cancel every segment's task, run `cleanup`, then
//! join with a short timeout - an uncooperative segment is abandoned rather
//! than blocking process exit.

mod keepalive;
mod process_presence;
mod registry;

pub use keepalive::DetectionKeepalive;
pub use process_presence::ProcessPresenceSegment;
pub use registry::registry;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::batch::SegmentInfo;
use crate::runtime::Runtime;
use crate::types::Category;

/// Join timeout applied per segment task at shutdown.
const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_millis(500);

/// A detection module.
#[async_trait]
pub trait Segment: Send + Sync {
    fn name(&self) -> &str;

    fn category(&self) -> Category;

    /// Seconds between ticks.
    fn interval_secs(&self) -> f64;

    /// One scan pass. May block on OS calls; runs outside all pipeline locks.
    async fn tick(&self, runtime: &Runtime);

    /// Release resources at shutdown. Called after the stop flag is set.
    fn cleanup(&self) {}
}

struct RunningSegment {
    segment: Arc<dyn Segment>,
    running: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

/// Starts each segment in its own task and coordinates graceful stop.
pub struct SegmentScheduler {
    runtime: Arc<Runtime>,
    slots: Vec<RunningSegment>,
    cancel: CancellationToken,
}

impl SegmentScheduler {
    pub fn new(runtime: Arc<Runtime>, segments: Vec<Arc<dyn Segment>>) -> Self {
        let slots = segments
            .into_iter()
            .map(|segment| RunningSegment {
                segment,
                running: Arc::new(AtomicBool::new(false)),
                task: None,
            })
            .collect();
        Self {
            runtime,
            slots,
            cancel: CancellationToken::new(),
        }
    }

    pub fn segment_count(&self) -> usize {
        self.slots.len()
    }

    pub fn running_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.running.load(Ordering::SeqCst))
            .count()
    }

    /// Start all segments. Initial offsets are spread uniformly across the
    /// batch window (`offset_i = i × batch_interval / N`); `sync_segments`
    /// zeroes the offsets for deterministic testing.
    pub fn start(&mut self, batch_interval: f64, sync_segments: bool) {
        let count = self.slots.len();
        if count == 0 {
            return;
        }
        let stagger = if sync_segments || count <= 1 {
            0.0
        } else {
            batch_interval.max(0.0) / count as f64
        };

        for (idx, slot) in self.slots.iter_mut().enumerate() {
            let segment = Arc::clone(&slot.segment);
            let running = Arc::clone(&slot.running);
            let runtime = Arc::clone(&self.runtime);
            let cancel = self.cancel.clone();
            let offset = stagger * idx as f64;

            running.store(true, Ordering::SeqCst);
            debug!(
                segment = segment.name(),
                offset_secs = offset,
                interval_secs = segment.interval_secs(),
                "Starting segment"
            );

            slot.task = Some(tokio::spawn(async move {
                if offset > 0.0 {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            running.store(false, Ordering::SeqCst);
                            return;
                        }
                        _ = tokio::time::sleep(Duration::from_secs_f64(offset)) => {}
                    }
                }

                loop {
                    segment.tick(runtime.as_ref()).await;

                    let interval = segment.interval_secs().max(0.1);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs_f64(interval)) => {}
                    }
                }
                running.store(false, Ordering::SeqCst);
            }));
        }

        info!(count, stagger_secs = stagger, "Segments started");
    }

    /// Two-phase stop: cancel, cleanup, short join. Tasks that do not exit
    /// in time are abandoned (they hold no pipeline locks).
    pub async fn stop(&mut self) {
        if self.slots.is_empty() {
            return;
        }
        info!(count = self.slots.len(), "Stopping segments");
        self.cancel.cancel();

        for slot in &self.slots {
            slot.segment.cleanup();
        }

        let tasks: Vec<JoinHandle<()>> =
            self.slots.iter_mut().filter_map(|s| s.task.take()).collect();
        if tokio::time::timeout(SHUTDOWN_JOIN_TIMEOUT, futures::future::join_all(tasks))
            .await
            .is_err()
        {
            warn!("Some segment tasks did not stop in time - abandoning");
        }
        for slot in &self.slots {
            slot.running.store(false, Ordering::SeqCst);
        }
        info!("All segments stopped");
    }

    /// Segment state rows for batch-report metadata.
    pub fn segment_info(&self) -> Vec<SegmentInfo> {
        self.slots
            .iter()
            .map(|s| SegmentInfo {
                name: s.segment.name().to_string(),
                category: s.segment.category(),
                interval_secs: s.segment.interval_secs(),
                running: s.running.load(Ordering::SeqCst),
            })
            .collect()
    }
}
