//! Detection pipeline
//!
//! One [`Pipeline`] instance exists per activation of the protected client:
//! it wires segments, the batch-emission loop, the threat-expiry sweep, and
//! the configured forwarder onto the runtime, and tears all of it down when
//! the client closes.
//!
//! ```text
//! segments → post_signal → event bus → { threat manager, batcher }
//!                                          ↓ every batch interval
//!                            Unified Scan Report (system signal)
//!                                          ↓
//!                            { web forwarder | redis forwarder }
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::batch::{ReportBatcher, SystemInfo};
use crate::bus::DETECTION_EVENT;
use crate::config::{ConfigBundle, ForwarderMode, Settings};
use crate::forward::{RedisForwarder, WebForwarder};
use crate::host::{netinfo, HostOs};
use crate::runtime::Runtime;
use crate::segments::{registry, SegmentScheduler};
use crate::types::now_ts;

/// How often the batch loop checks whether a window elapsed.
const BATCH_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Threat-expiry sweep cadence.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(10);

pub struct Pipeline {
    runtime: Arc<Runtime>,
    batcher: Arc<ReportBatcher>,
    scheduler: SegmentScheduler,
    web_forwarder: Option<WebForwarder>,
    redis_forwarder: Option<RedisForwarder>,
    cancel: CancellationToken,
    batch_task: Option<JoinHandle<()>>,
    maintenance_task: Option<JoinHandle<()>>,
    ingest_active: Arc<std::sync::atomic::AtomicBool>,
    stopped: bool,
}

impl Pipeline {
    /// Build and start the full pipeline.
    pub async fn start(
        runtime: Arc<Runtime>,
        host: Arc<dyn HostOs>,
        settings: &Settings,
        bundle: &ConfigBundle,
    ) -> Result<Self> {
        let env = settings.env.as_str().to_string();
        info!(env = %env, host = %host.computer_name(), "Starting detection pipeline");

        // Public address is best-effort; local address is the fallback.
        let public_ip = netinfo::public_ip_info(Duration::from_secs(5)).await;
        info!("{}", netinfo::format_public_ip_log(&public_ip));
        let device_ip = public_ip.ip.or_else(|| host.local_ip());

        // Batch numbering continues across activations; the counter lives
        // on the runtime.
        let batcher = Arc::new(ReportBatcher::new(
            settings,
            runtime.identity().clone(),
            now_ts(),
            Arc::clone(runtime.batch_counter()),
        ));

        // Batcher listens for every non-system detection signal. Listeners
        // cannot be unsubscribed, so the gate keeps a stopped pipeline's
        // batcher from buffering across activations.
        let ingest_active = Arc::new(std::sync::atomic::AtomicBool::new(true));
        {
            let batcher = Arc::clone(&batcher);
            let ingest_active = Arc::clone(&ingest_active);
            runtime.bus().subscribe(DETECTION_EVENT, move |signal| {
                if ingest_active.load(std::sync::atomic::Ordering::SeqCst)
                    && signal.category != crate::types::Category::System
                {
                    batcher.add_signal(signal.clone());
                }
                Ok(())
            });
        }

        let (web_forwarder, redis_forwarder) =
            start_forwarders(&runtime, settings).await;

        // Segments
        let segments = registry(Arc::clone(&host), bundle, settings);
        let mut scheduler = SegmentScheduler::new(Arc::clone(&runtime), segments);
        scheduler.start(settings.batch_interval_secs, settings.sync_segments);

        let cancel = CancellationToken::new();

        // Batch-emission loop
        let batch_task = {
            let runtime = Arc::clone(&runtime);
            let host = Arc::clone(&host);
            let batcher = Arc::clone(&batcher);
            let cancel = cancel.clone();
            let env = env.clone();
            let segments_running = scheduler.segment_info();
            Some(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(BATCH_CHECK_INTERVAL);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {}
                    }

                    let system_info = SystemInfo {
                        cpu_percent: host.cpu_percent(),
                        mem_used_percent: host.mem_used_percent(),
                        segments_running: segments_running.len(),
                        env: env.clone(),
                        host: host.computer_name(),
                        device_ip: device_ip.clone(),
                    };

                    if let Some(batch_signal) = batcher.maybe_send(
                        now_ts(),
                        runtime.threats(),
                        &system_info,
                        &segments_running,
                    ) {
                        if let Err(e) = runtime.bus().emit(DETECTION_EVENT, batch_signal) {
                            warn!(error = %e, "Batch report emit rejected");
                        }
                    }
                }
            }))
        };

        // Threat-expiry sweep (keeps expiry working through quiet periods)
        let maintenance_task = {
            let runtime = Arc::clone(&runtime);
            let cancel = cancel.clone();
            Some(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {}
                    }
                    runtime.threats().sweep_expired(now_ts());
                }
            }))
        };

        info!(
            batch_interval_secs = settings.batch_interval_secs,
            "Pipeline ready - listening for detection signals"
        );

        Ok(Self {
            runtime,
            batcher,
            scheduler,
            web_forwarder,
            redis_forwarder,
            cancel,
            batch_task,
            maintenance_task,
            ingest_active,
            stopped: false,
        })
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    pub fn segments_running(&self) -> usize {
        self.scheduler.running_count()
    }

    /// Idempotent two-phase shutdown: stop producers first (segments), then
    /// the loops, then the sinks.
    pub async fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        info!("Shutting down pipeline");

        self.ingest_active
            .store(false, std::sync::atomic::Ordering::SeqCst);
        self.scheduler.stop().await;

        self.cancel.cancel();
        for task in [self.batch_task.take(), self.maintenance_task.take()]
            .into_iter()
            .flatten()
        {
            let _ = tokio::time::timeout(Duration::from_secs(2), task).await;
        }

        if let Some(mut web) = self.web_forwarder.take() {
            web.stop().await;
        }
        if let Some(mut redis) = self.redis_forwarder.take() {
            redis.stop().await;
        }

        // Loops are down; anything still buffered belongs to no window
        self.batcher.cleanup();

        info!("Pipeline shutdown complete");
    }
}

/// Select and start batch-report sinks per `FORWARDER_MODE`.
async fn start_forwarders(
    runtime: &Arc<Runtime>,
    settings: &Settings,
) -> (Option<WebForwarder>, Option<RedisForwarder>) {
    let try_redis = |settings: &Settings| settings.redis_url.clone();

    match settings.forwarder_mode {
        ForwarderMode::Web => (start_web(runtime, settings), None),
        ForwarderMode::Redis => match try_redis(settings) {
            Some(url) => match start_redis(runtime, settings, &url).await {
                Some(redis) => (None, Some(redis)),
                None => {
                    warn!("Redis mode requested but Redis forwarder could not start - falling back to web");
                    (start_web(runtime, settings), None)
                }
            },
            None => {
                warn!("Redis mode requested but REDIS_URL missing - falling back to web");
                (start_web(runtime, settings), None)
            }
        },
        ForwarderMode::Auto => match try_redis(settings) {
            Some(url) => match start_redis(runtime, settings, &url).await {
                Some(redis) => (None, Some(redis)),
                None => (start_web(runtime, settings), None),
            },
            None => (start_web(runtime, settings), None),
        },
    }
}

fn start_web(runtime: &Arc<Runtime>, settings: &Settings) -> Option<WebForwarder> {
    if !settings.web_enabled {
        info!("Web forwarder disabled (WEB not set) - batches stay local");
        return None;
    }
    let mut web = WebForwarder::new(settings, runtime.identity().clone());
    web.subscribe(runtime.bus());
    web.start();
    Some(web)
}

async fn start_redis(
    runtime: &Arc<Runtime>,
    settings: &Settings,
    url: &str,
) -> Option<RedisForwarder> {
    let ttl = settings
        .redis_ttl_seconds
        .unwrap_or_else(crate::forward::schema::ttl_seconds_from_env);
    let mut redis = RedisForwarder::new(url, ttl, runtime.identity().clone());
    match redis.start().await {
        Ok(()) => {
            redis.subscribe(runtime.bus());
            info!("Redis forwarder enabled (direct to Redis, bypasses HTTP API)");
            Some(redis)
        }
        Err(e) => {
            warn!(error = %e, "Redis forwarder could not start");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{DeviceIdentity, MockHost};
    use crate::threat::CategoryTimeouts;
    use crate::types::{Category, Status, UnifiedBatchReport};

    fn test_runtime() -> Arc<Runtime> {
        Arc::new(Runtime::new(
            DeviceIdentity {
                device_id: "id".to_string(),
                device_name: "DESKTOP-AB".to_string(),
                device_ip: Some("10.0.0.5".to_string()),
            },
            CategoryTimeouts::default(),
        ))
    }

    #[tokio::test]
    async fn test_pipeline_emits_batch_reports() {
        let runtime = test_runtime();
        let host = Arc::new(MockHost::named("DESKTOP-AB"));
        // Short window so the 5 s batch check fires a report quickly
        let settings = Settings {
            batch_interval_secs: 1.0,
            sync_segments: true,
            ..Default::default()
        };

        let mut pipeline = Pipeline::start(
            Arc::clone(&runtime),
            host,
            &settings,
            &ConfigBundle::default(),
        )
        .await
        .unwrap();

        runtime.post_signal(Category::Auto, "Python", Status::Warn, "Python detected", None);

        // One batch-check tick past the window
        tokio::time::sleep(Duration::from_secs(6)).await;
        pipeline.stop().await;

        let batches: Vec<_> = runtime
            .bus()
            .history(Some(Category::System), 100)
            .into_iter()
            .filter(|s| s.is_batch_report())
            .collect();
        assert!(!batches.is_empty());

        let report = UnifiedBatchReport::from_details(&batches[0].details).unwrap();
        assert_eq!(report.scan_type, "unified");
        // WARN in auto escalates to ALERT (10 points)
        assert_eq!(report.bot_probability, 10.0);
        assert_eq!(report.aggregated_threats[0].threat_id, "python");
    }

    #[tokio::test]
    async fn test_pipeline_stop_is_idempotent() {
        let runtime = test_runtime();
        let host = Arc::new(MockHost::named("DESKTOP-AB"));
        let settings = Settings {
            sync_segments: true,
            ..Default::default()
        };

        let mut pipeline =
            Pipeline::start(runtime, host, &settings, &ConfigBundle::default())
                .await
                .unwrap();
        pipeline.stop().await;
        pipeline.stop().await;
        assert_eq!(pipeline.segments_running(), 0);
    }
}
