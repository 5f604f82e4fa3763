//! Config loader backoff regression test
//!
//! Simulates a dashboard returning consecutive 503s and asserts the loader
//! backs off exponentially, serves the in-memory bundle during the backoff
//! window without touching the server, keeps the last-successful-fetch
//! timestamp unchanged, and resets the error streak on recovery.

use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tableguard::config::{BundleSource, ConfigLoader, Settings};

/// Minimal canned-response HTTP server: answers each connection with the
/// next scripted status, then keeps repeating the last one.
fn spawn_server(responses: Vec<u16>) -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind test server");
    let addr = listener.local_addr().expect("server addr");
    let hits = Arc::new(AtomicUsize::new(0));
    let hits_clone = Arc::clone(&hits);

    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { continue };
            let n = hits_clone.fetch_add(1, Ordering::SeqCst);
            let status = *responses.get(n).unwrap_or(responses.last().unwrap_or(&200));

            // Drain the request head
            let mut buf = [0u8; 4096];
            let _ = stream.read(&mut buf);

            let response = match status {
                200 => {
                    let body = r#"{"ok":true,"data":{"_meta":{"version":"9.9.9"},"programs_registry":{"programs":[]}}}"#;
                    format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    )
                }
                503 => "HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                    .to_string(),
                other => format!(
                    "HTTP/1.1 {other} Error\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                ),
            };
            let _ = stream.write_all(response.as_bytes());
        }
    });

    (format!("http://{addr}/api/signal"), hits)
}

fn loader_for(url: &str) -> ConfigLoader {
    ConfigLoader::new(&Settings {
        web_url_prod: Some(url.to_string()),
        // RAM-only: no disk cache interference between test runs
        ram_config: Some(true),
        ..Default::default()
    })
}

#[tokio::test]
async fn backoff_serves_memory_copy_and_resets_on_recovery() {
    let (url, hits) = spawn_server(vec![200, 503, 503, 503, 200]);
    let loader = loader_for(&url);

    // Initial successful fetch
    let bundle = loader.fetch_at(0.0, true).await;
    assert_eq!(bundle.meta.source, Some(BundleSource::Dashboard));
    assert_eq!(bundle.meta.version, "9.9.9");
    assert_eq!(loader.last_fetch(), 0.0);
    assert_eq!(loader.consecutive_errors(), 0);

    // 503 #1 → 30 s backoff; the prior in-memory copy is returned and the
    // last-successful-fetch timestamp does not move
    let during = loader.fetch_at(400.0, true).await;
    assert_eq!(during.meta.source, Some(BundleSource::Dashboard));
    assert_eq!(loader.last_fetch(), 0.0);
    assert_eq!(loader.consecutive_errors(), 1);

    // Backoff expired at 430 → 503 #2 → 60 s backoff
    loader.fetch_at(440.0, true).await;
    assert_eq!(loader.consecutive_errors(), 2);

    // Inside the backoff window: served from memory, server not contacted
    let served = hits.load(Ordering::SeqCst);
    let inside = loader.fetch_at(460.0, true).await;
    assert_eq!(inside.meta.version, "9.9.9");
    assert_eq!(hits.load(Ordering::SeqCst), served);
    assert_eq!(loader.last_fetch(), 0.0);

    // Backoff expired at 500 → 503 #3 → 120 s backoff
    loader.fetch_at(505.0, true).await;
    assert_eq!(loader.consecutive_errors(), 3);

    // Recovery: server healthy again, streak resets, fetch timestamp moves
    let recovered = loader.fetch_at(700.0, true).await;
    assert_eq!(recovered.meta.source, Some(BundleSource::Dashboard));
    assert_eq!(loader.consecutive_errors(), 0);
    assert_eq!(loader.last_fetch(), 700.0);

    // Exactly 5 requests reached the server: 200, 503 ×3, 200
    assert_eq!(hits.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn unreachable_dashboard_falls_back_to_embedded() {
    // Nothing listens on this port (bound then dropped)
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let loader = loader_for(&format!("http://127.0.0.1:{port}/api/signal"));

    let bundle = loader.fetch_at(0.0, true).await;
    assert_eq!(bundle.meta.source, Some(BundleSource::Embedded));
    // The embedded registry still identifies the well-known bot families
    assert!(bundle
        .programs_registry
        .as_ref()
        .is_some_and(|r| !r.programs.is_empty()));
}

#[tokio::test]
async fn ram_ttl_serves_memory_copy_between_polls() {
    let (url, hits) = spawn_server(vec![200]);
    let loader = loader_for(&url);

    loader.fetch_at(0.0, false).await;
    let after_first = hits.load(Ordering::SeqCst);

    // Within the 5-minute RAM TTL: no server contact
    loader.fetch_at(100.0, false).await;
    loader.fetch_at(250.0, false).await;
    assert_eq!(hits.load(Ordering::SeqCst), after_first);

    // Past the TTL: refreshed from the server
    loader.fetch_at(400.0, false).await;
    assert_eq!(hits.load(Ordering::SeqCst), after_first + 1);
}
