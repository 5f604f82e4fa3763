//! TableGuard - CoinPoker bot detection scanner
//!
//! Main entry point. Acquires the singleton lock, loads settings and the
//! detection config bundle, then hands control to the lifecycle supervisor:
//! the detection pipeline runs only while the protected client is running.
//!
//! # Usage
//!
//! ```bash
//! # Run with defaults (settings from tableguard.toml + environment)
//! cargo run --release
//!
//! # Force the Redis sink
//! FORWARDER_MODE=redis REDIS_URL=redis://localhost:6379 cargo run --release
//! ```
//!
//! # Environment Variables
//!
//! - `ENV`: `DEV` or `PROD` (default: PROD)
//! - `FORWARDER_MODE`: `auto`, `web`, or `redis`
//! - `REDIS_URL` / `REDIS_TTL_SECONDS`: direct Redis sink
//! - `SIGNAL_TOKEN`: dashboard bearer token
//! - `BATCH_INTERVAL_HEAVY`: batch window seconds (default: 92)
//! - `RUST_LOG`: logging level (default: info)

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use tableguard::config::{self, ConfigLoader, Settings};
use tableguard::host::{DeviceIdentity, HostOs, SystemHost};
use tableguard::runtime::Runtime;
use tableguard::storage::ScannerLock;
use tableguard::supervisor::Scanner;
use tableguard::threat::CategoryTimeouts;

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "tableguard")]
#[command(about = "TableGuard CoinPoker bot detection scanner")]
#[command(version)]
struct CliArgs {
    /// Directory for the singleton lock file (default: working directory)
    #[arg(long, default_value = ".")]
    lock_dir: String,

    /// Override the settings file path (same as TABLEGUARD_CONFIG)
    #[arg(long)]
    config: Option<String>,
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = CliArgs::parse();

    if let Some(path) = &args.config {
        std::env::set_var("TABLEGUARD_CONFIG", path);
    }

    let settings = Settings::load();
    config::init(settings.clone());

    let host: Arc<dyn HostOs> = Arc::new(SystemHost::new());

    // Singleton guard: a second instance must abort with a clear diagnostic.
    let _lock = ScannerLock::acquire(&args.lock_dir, host.as_ref())
        .context("Could not acquire scanner lock - is another instance running?")?;

    let identity = DeviceIdentity::from_host(host.as_ref());
    info!(
        device_id = %identity.device_id,
        device_name = %identity.device_name,
        elevated = host.is_elevated(),
        "TableGuard starting"
    );

    let runtime = Arc::new(Runtime::new(
        identity,
        CategoryTimeouts::from_scan_intervals(&settings.scan_intervals()),
    ));

    let loader = Arc::new(ConfigLoader::new(&settings));
    let bundle = loader.fetch(false).await;
    info!(domains = bundle.domain_count(), source = ?bundle.meta.source, "Config bundle loaded");

    let scanner = Scanner::new(
        Arc::clone(&runtime),
        Arc::clone(&host),
        settings,
        Arc::clone(&loader),
    )
    .await;

    // Graceful shutdown on SIGINT/SIGTERM: cancel the monitor loop, which
    // stops the pipeline before the process exits.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received");
                cancel.cancel();
            }
        });
    }
    #[cfg(unix)]
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut sigterm = match tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::terminate(),
            ) {
                Ok(s) => s,
                Err(_) => return,
            };
            sigterm.recv().await;
            info!("SIGTERM received");
            cancel.cancel();
        });
    }

    if let Err(e) = scanner.run(cancel).await {
        error!(error = %e, "Scanner exited with error");
        loader.cleanup();
        return Err(e);
    }

    loader.cleanup();
    runtime.bus().cleanup();
    info!("Scanner exited");
    Ok(())
}
