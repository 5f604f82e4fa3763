//! Lifecycle supervisor
//!
//! Watches the host for the protected client and gates the detection
//! pipeline on its presence: the pipeline starts when the client is
//! identified (multi-factor, see [`target`]) and stops when it disappears.
//! Dashboard commands are polled and executed on every monitor iteration,
//! whether or not the client is running.

pub mod target;

pub use target::{DetectedTarget, TargetDetector, TargetIndicators};

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::commands::{CommandExecutor, CommandSource, HttpCommandClient, RedisCommandClient};
use crate::config::{ConfigLoader, ForwarderMode, Settings};
use crate::host::HostOs;
use crate::pipeline::Pipeline;
use crate::runtime::Runtime;
use crate::types::{now_ts, Category, Status};

/// Monitor cadence while waiting for or watching the client.
const CHECK_INTERVAL: Duration = Duration::from_secs(2);

/// How long to wait for the lobby window before starting anyway.
const LOBBY_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Grace period for the nickname extractor once the lobby is visible.
const NICKNAME_WARMUP: Duration = Duration::from_secs(5);

/// Minimum seconds between pipeline start attempts.
const START_DEBOUNCE_SECS: f64 = 1.0;

struct ScannerState {
    pipeline: Option<Pipeline>,
    last_start_attempt: f64,
    stopping: bool,
}

/// Supervises pipeline lifecycle against protected-client presence.
pub struct Scanner {
    runtime: Arc<Runtime>,
    host: Arc<dyn HostOs>,
    settings: Settings,
    loader: Arc<ConfigLoader>,
    detector: Arc<TargetDetector>,
    executor: CommandExecutor,
    commands: Option<Arc<dyn CommandSource>>,
    state: Mutex<ScannerState>,
}

impl Scanner {
    pub async fn new(
        runtime: Arc<Runtime>,
        host: Arc<dyn HostOs>,
        settings: Settings,
        loader: Arc<ConfigLoader>,
    ) -> Self {
        let bundle = loader.fetch(false).await;
        let detector = Arc::new(TargetDetector::new(bundle.target_profile()));
        let executor = CommandExecutor::new(Arc::clone(&host), Arc::clone(&detector));
        let commands = build_command_source(&settings, &runtime).await;

        Self {
            runtime,
            host,
            settings,
            loader,
            detector,
            executor,
            commands,
            state: Mutex::new(ScannerState {
                pipeline: None,
                last_start_attempt: 0.0,
                stopping: false,
            }),
        }
    }

    pub fn detector(&self) -> &Arc<TargetDetector> {
        &self.detector
    }

    /// Whether the pipeline is currently active.
    pub async fn is_active(&self) -> bool {
        self.state.lock().await.pipeline.is_some()
    }

    /// Main monitor loop. Runs until cancelled, then stops the pipeline.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        info!(
            process = %self.detector.profile().process_name,
            "Monitoring for protected client - scanner starts when it launches"
        );

        // Initial check immediately, no delay
        self.monitor_once().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(CHECK_INTERVAL) => {}
            }
            self.monitor_once().await;
        }

        info!("Shutdown requested");
        self.stop_pipeline().await;
        Ok(())
    }

    /// One monitor iteration: reconcile pipeline state with client
    /// presence, then drain pending dashboard commands.
    pub async fn monitor_once(&self) {
        let targets = self.detector.detect_processes(self.host.as_ref());
        let target_running = !targets.is_empty();
        let active = self.is_active().await;

        if target_running && !active {
            debug!(
                pids = ?targets.iter().map(|t| t.pid).collect::<Vec<_>>(),
                "Protected client detected"
            );
            self.start_pipeline().await;
        } else if !target_running && active {
            info!("Protected client closed - stopping scanner");
            self.stop_pipeline().await;
        }

        self.process_commands().await;
    }

    /// Start the pipeline (debounced, single-flight).
    async fn start_pipeline(&self) {
        let mut state = self.state.lock().await;
        if state.pipeline.is_some() || state.stopping {
            return;
        }
        let now = now_ts();
        if now - state.last_start_attempt < START_DEBOUNCE_SECS {
            return;
        }
        state.last_start_attempt = now;

        info!("Protected client detected - starting detection scanner");
        self.wait_for_lobby_and_warmup().await;

        let bundle = self.loader.fetch(false).await;
        match Pipeline::start(
            Arc::clone(&self.runtime),
            Arc::clone(&self.host),
            &self.settings,
            &bundle,
        )
        .await
        {
            Ok(pipeline) => {
                state.pipeline = Some(pipeline);
                drop(state);
                // Explicit start marker so the dashboard flips the device to
                // online immediately instead of waiting for the first batch.
                self.runtime.post_signal(
                    Category::System,
                    "Scanner Started",
                    Status::Info,
                    "CoinPoker detection scanner activated - device is now active",
                    None,
                );
            }
            Err(e) => {
                error!(error = %e, "Failed to start scanner");
            }
        }
    }

    /// Wait for the client's lobby window so the nickname extractor gets a
    /// stable target before segments start hammering the host.
    async fn wait_for_lobby_and_warmup(&self) {
        if !self.host.supports_window_enumeration() {
            return;
        }
        debug!(
            timeout_secs = LOBBY_WAIT_TIMEOUT.as_secs(),
            "Waiting for lobby window"
        );
        match self
            .detector
            .wait_for_lobby_window(
                self.host.as_ref(),
                LOBBY_WAIT_TIMEOUT,
                Duration::from_millis(500),
            )
            .await
        {
            Some(window) => {
                info!(title = %window.title, "Lobby detected - giving nickname detector time to run");
                tokio::time::sleep(NICKNAME_WARMUP).await;
            }
            None => {
                warn!("Lobby window not detected within timeout - continuing with fallback defaults");
            }
        }
    }

    /// Stop the pipeline, emitting the stop marker first so `last_seen`
    /// updates before the device goes quiet.
    async fn stop_pipeline(&self) {
        let mut state = self.state.lock().await;
        if state.stopping || state.pipeline.is_none() {
            return;
        }
        state.stopping = true;
        let mut pipeline = match state.pipeline.take() {
            Some(p) => p,
            None => {
                state.stopping = false;
                return;
            }
        };
        drop(state);

        self.runtime.post_signal(
            Category::System,
            "Scanner Stopping",
            Status::Info,
            "CoinPoker detection scanner shutting down - device activity ending",
            None,
        );
        // Let the forwarder writer loops pick the marker up
        tokio::time::sleep(Duration::from_millis(100)).await;

        pipeline.stop().await;

        let mut state = self.state.lock().await;
        state.stopping = false;
        info!("Scanner stopped. Waiting for protected client to restart");
    }

    /// Fetch and execute pending dashboard commands.
    async fn process_commands(&self) {
        let Some(source) = &self.commands else {
            return;
        };
        let commands = source.fetch_commands().await;
        for command in commands {
            info!(command_id = %command.id, command = %command.command, "Executing dashboard command");
            let result = self.executor.execute(&command).await;
            if !result.success {
                warn!(
                    command_id = %command.id,
                    error = result.error.as_deref().unwrap_or("unknown"),
                    "Command failed"
                );
            }
            source.send_result(&command, &result).await;
        }
    }
}

/// Pick the command channel matching the forwarder mode: Redis when the
/// agent talks to Redis anyway, HTTP otherwise.
async fn build_command_source(
    settings: &Settings,
    runtime: &Arc<Runtime>,
) -> Option<Arc<dyn CommandSource>> {
    let device_id = &runtime.identity().device_id;

    if settings.forwarder_mode == ForwarderMode::Redis {
        if let Some(url) = &settings.redis_url {
            match RedisCommandClient::connect(url, device_id).await {
                Ok(client) => return Some(Arc::new(client)),
                Err(e) => {
                    warn!(error = %e, "Redis command client unavailable - using HTTP");
                }
            }
        }
    }
    Some(Arc::new(HttpCommandClient::new(settings, device_id)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{DeviceIdentity, MockHost, ProcessInfo};
    use crate::threat::CategoryTimeouts;
    use std::path::PathBuf;

    fn test_runtime() -> Arc<Runtime> {
        Arc::new(Runtime::new(
            DeviceIdentity {
                device_id: "id".to_string(),
                device_name: "DESKTOP-AB".to_string(),
                device_ip: None,
            },
            CategoryTimeouts::default(),
        ))
    }

    fn client_process(pid: u32) -> ProcessInfo {
        ProcessInfo {
            pid,
            name: "game.exe".to_string(),
            exe_path: Some(PathBuf::from("C:\\CoinPoker\\game.exe")),
            cwd: Some(PathBuf::from("C:\\CoinPoker")),
            parent_pid: None,
            cmdline: vec!["game.exe".to_string()],
        }
    }

    async fn scanner_with_host(host: Arc<MockHost>) -> Scanner {
        let settings = Settings {
            sync_segments: true,
            ..Default::default()
        };
        let loader = Arc::new(ConfigLoader::new(&Settings {
            ram_config: Some(true),
            ..Default::default()
        }));
        Scanner::new(test_runtime(), host, settings, loader).await
    }

    #[tokio::test]
    async fn test_pipeline_follows_client_presence() {
        let host = Arc::new(MockHost::named("DESKTOP-AB"));
        // Lobby window present so the wait returns immediately
        host.add_window(crate::host::WindowInfo {
            handle: 1,
            pid: 100,
            class_name: "Qt673QWindowIcon".to_string(),
            title: "CoinPoker Lobby".to_string(),
            visible: true,
            rect: (0, 0, 1, 1),
        });
        let scanner = scanner_with_host(Arc::clone(&host)).await;
        assert!(!scanner.is_active().await);

        // Client appears → pipeline starts (after the 5 s nickname warmup)
        host.add_process(client_process(100));
        scanner.monitor_once().await;
        assert!(scanner.is_active().await);

        // A start marker was emitted
        let history = scanner.runtime.bus().history(None, 100);
        assert!(history.iter().any(|s| s.name == "Scanner Started"));

        // Client disappears → pipeline stops with a stop marker
        host.clear_processes();
        scanner.monitor_once().await;
        assert!(!scanner.is_active().await);
        let history = scanner.runtime.bus().history(None, 100);
        assert!(history.iter().any(|s| s.name == "Scanner Stopping"));
    }

    #[tokio::test]
    async fn test_start_debounce() {
        let host = Arc::new(MockHost::named("DESKTOP-AB"));
        host.add_window(crate::host::WindowInfo {
            handle: 1,
            pid: 100,
            class_name: "Qt673QWindowIcon".to_string(),
            title: "CoinPoker Lobby".to_string(),
            visible: true,
            rect: (0, 0, 1, 1),
        });
        let scanner = scanner_with_host(Arc::clone(&host)).await;

        host.add_process(client_process(100));
        scanner.monitor_once().await;
        assert!(scanner.is_active().await);

        // Simulate a crashed pipeline: force-clear and immediately retry -
        // the debounce suppresses the restart attempt.
        {
            let mut state = scanner.state.lock().await;
            if let Some(mut p) = state.pipeline.take() {
                p.stop().await;
            }
            state.last_start_attempt = now_ts();
        }
        scanner.start_pipeline().await;
        assert!(!scanner.is_active().await);
    }
}
