//! Web forwarder - ships batch reports to the dashboard HTTP API
//!
//! Subscribes to `detection` but keeps only unified batch reports. Buffered
//! reports (cap 200, drop-oldest) are flushed by a single writer loop every
//! second as one JSON signal array with bearer auth. Failures are logged
//! once per streak and the batch is dropped - the next window carries fresh
//! state, so there is no per-batch retry.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{EventBus, DETECTION_EVENT};
use crate::config::Settings;
use crate::host::DeviceIdentity;
use crate::types::Signal;

/// Outbound buffer cap; oldest dropped beyond this.
const BUFFER_CAP: usize = 200;

/// Writer loop cadence.
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Signal object as POSTed to `/signal`. Timestamps are whole seconds on
/// the wire.
#[derive(Debug, Serialize)]
struct WireSignal<'a> {
    timestamp: i64,
    category: &'a str,
    name: &'a str,
    status: &'a str,
    details: &'a str,
    device_id: &'a str,
    device_name: &'a str,
    device_ip: Option<&'a str>,
    segment_name: Option<&'a str>,
}

type SharedBuffer = Arc<Mutex<VecDeque<Signal>>>;

/// HTTP sink for batch reports.
pub struct WebForwarder {
    url: String,
    token: Option<String>,
    timeout: Duration,
    identity: DeviceIdentity,
    buffer: SharedBuffer,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl WebForwarder {
    pub fn new(settings: &Settings, identity: DeviceIdentity) -> Self {
        Self {
            url: settings.web_url(),
            token: settings.signal_token.clone(),
            timeout: Duration::from_secs_f64(settings.web_forwarder_timeout_secs.max(1.0)),
            identity,
            buffer: Arc::new(Mutex::new(VecDeque::new())),
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    /// Register the bus listener. Only batch reports enter the buffer; the
    /// listener copies under a local lock and never blocks on I/O.
    pub fn subscribe(&self, bus: &EventBus) {
        let buffer = Arc::clone(&self.buffer);
        bus.subscribe(DETECTION_EVENT, move |signal| {
            if !signal.is_batch_report() {
                return Ok(());
            }
            let mut buf = buffer.lock().unwrap_or_else(PoisonError::into_inner);
            buf.push_back(signal.clone());
            if buf.len() > BUFFER_CAP {
                buf.pop_front();
            }
            Ok(())
        });
    }

    /// Start the writer loop.
    pub fn start(&mut self) {
        if self.task.is_some() {
            return;
        }
        info!(url = %self.url, "Web forwarder enabled");

        let buffer = Arc::clone(&self.buffer);
        let cancel = self.cancel.clone();
        let url = self.url.clone();
        let token = self.token.clone();
        let identity = self.identity.clone();
        let timeout = self.timeout;

        self.task = Some(tokio::spawn(async move {
            let client = match reqwest::Client::builder().timeout(timeout).build() {
                Ok(c) => c,
                Err(e) => {
                    warn!(error = %e, "Web forwarder could not build HTTP client");
                    return;
                }
            };
            let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
            // Streak-based logging: one warning until the next success.
            let mut failure_logged = false;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let to_send: Vec<Signal> = {
                    let mut buf = buffer.lock().unwrap_or_else(PoisonError::into_inner);
                    if buf.is_empty() {
                        continue;
                    }
                    buf.drain(..).collect()
                };

                match post_signals(&client, &url, token.as_deref(), &identity, &to_send).await {
                    Ok(()) => {
                        if failure_logged {
                            info!("Dashboard reachable again");
                        }
                        failure_logged = false;
                        debug!(count = to_send.len(), "Forwarded batch reports");
                    }
                    Err(e) => {
                        if !failure_logged {
                            warn!(url = %url, error = %e, "Dashboard not reachable - dropping batch");
                            failure_logged = true;
                        }
                    }
                }
            }
        }));
    }

    /// Stop the writer loop and clear the buffer.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = tokio::time::timeout(Duration::from_secs(1), task).await;
        }
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn buffered(&self) -> usize {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

async fn post_signals(
    client: &reqwest::Client,
    url: &str,
    token: Option<&str>,
    identity: &DeviceIdentity,
    signals: &[Signal],
) -> anyhow::Result<()> {
    let payload: Vec<WireSignal<'_>> = signals
        .iter()
        .map(|sig| WireSignal {
            timestamp: sig.timestamp as i64,
            category: sig.category.as_str(),
            name: &sig.name,
            status: sig.status.as_str(),
            details: &sig.details,
            device_id: sig.device_id.as_deref().unwrap_or(&identity.device_id),
            device_name: sig.device_name.as_deref().unwrap_or(&identity.device_name),
            device_ip: sig.device_ip.as_deref(),
            segment_name: sig.segment_name.as_deref(),
        })
        .collect();

    let mut request = client.post(url).json(&payload);
    if let Some(token) = token {
        request = request.bearer_auth(token);
    }
    let response = request.send().await?;
    if !response.status().is_success() {
        anyhow::bail!("dashboard returned status {}", response.status());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Category, Status};

    fn identity() -> DeviceIdentity {
        DeviceIdentity {
            device_id: "id".to_string(),
            device_name: "name".to_string(),
            device_ip: None,
        }
    }

    fn batch_signal() -> Signal {
        Signal::new(Category::System, "Unified Scan Report", Status::Info, "{}")
    }

    #[test]
    fn test_only_batch_reports_buffered() {
        let forwarder = WebForwarder::new(&Settings::default(), identity());
        let bus = EventBus::new();
        forwarder.subscribe(&bus);

        bus.emit(DETECTION_EVENT, batch_signal()).unwrap();
        bus.emit(
            DETECTION_EVENT,
            Signal::new(Category::Auto, "Python", Status::Warn, ""),
        )
        .unwrap();
        bus.emit(
            DETECTION_EVENT,
            Signal::new(Category::System, "Scanner Started", Status::Info, ""),
        )
        .unwrap();

        assert_eq!(forwarder.buffered(), 1);
    }

    #[test]
    fn test_buffer_drops_oldest_at_cap() {
        let forwarder = WebForwarder::new(&Settings::default(), identity());
        let bus = EventBus::new();
        forwarder.subscribe(&bus);

        for _ in 0..(BUFFER_CAP + 10) {
            bus.emit(DETECTION_EVENT, batch_signal()).unwrap();
        }
        assert_eq!(forwarder.buffered(), BUFFER_CAP);
    }

    #[test]
    fn test_wire_signal_shape() {
        let mut sig = batch_signal();
        sig.timestamp = 1_700_000_000.9;
        sig.device_id = Some("dev".to_string());
        let ident = identity();

        let wire = WireSignal {
            timestamp: sig.timestamp as i64,
            category: sig.category.as_str(),
            name: &sig.name,
            status: sig.status.as_str(),
            details: &sig.details,
            device_id: sig.device_id.as_deref().unwrap_or(&ident.device_id),
            device_name: sig.device_name.as_deref().unwrap_or(&ident.device_name),
            device_ip: None,
            segment_name: None,
        };
        let json = serde_json::to_value(&wire).unwrap();
        assert_eq!(json["timestamp"], 1_700_000_000i64);
        assert_eq!(json["category"], "system");
        assert_eq!(json["status"], "INFO");
        assert_eq!(json["device_name"], "name");
    }
}
