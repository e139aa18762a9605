//! Integration tests for the scan engine

use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use netsweep::config::FingerprintKind;
use netsweep::error::{SweepError, SweepResult};
use netsweep::ingest::ApiClient;
use netsweep::probe::{OpenEndpoint, ProbeBackend};
use netsweep::{fingerprint::NativeProber, SweepConfig, SweepEngine};
use tokio_test::assert_ok;

/// Listener that writes `payload` to every connection, holding each
/// connection open long enough for the probe to finish reading
async fn spawn_banner_listener(payload: &'static [u8]) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            if let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let _ = socket.write_all(payload).await;
                    tokio::time::sleep(Duration::from_secs(2)).await;
                });
            }
        }
    });
    port
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Minimal ingestion API stub: answers 200 to everything and captures
/// POST bodies.
async fn spawn_ingest_stub() -> (u16, Arc<Mutex<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let bodies: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let captured = bodies.clone();

    tokio::spawn(async move {
        loop {
            let (mut socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let captured = captured.clone();

            tokio::spawn(async move {
                let mut data = Vec::new();
                let mut chunk = [0u8; 1024];

                loop {
                    let n = match socket.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => n,
                    };
                    data.extend_from_slice(&chunk[..n]);

                    if let Some(pos) = find_subslice(&data, b"\r\n\r\n") {
                        let headers = String::from_utf8_lossy(&data[..pos]).to_string();
                        let content_length = headers
                            .lines()
                            .find_map(|line| {
                                line.to_ascii_lowercase()
                                    .strip_prefix("content-length:")
                                    .map(|v| v.trim().parse::<usize>().unwrap_or(0))
                            })
                            .unwrap_or(0);

                        let body_start = pos + 4;
                        while data.len() < body_start + content_length {
                            let n = match socket.read(&mut chunk).await {
                                Ok(0) | Err(_) => break,
                                Ok(n) => n,
                            };
                            data.extend_from_slice(&chunk[..n]);
                        }

                        if headers.starts_with("POST") {
                            let end = (body_start + content_length).min(data.len());
                            let body =
                                String::from_utf8_lossy(&data[body_start..end]).to_string();
                            captured.lock().unwrap().push(body);
                        }

                        let _ = socket
                            .write_all(
                                b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\n{}",
                            )
                            .await;
                        return;
                    }
                }
            });
        }
    });

    (port, bodies)
}

#[tokio::test]
async fn test_end_to_end_scan_submits_fingerprinted_result() {
    let ssh_port = spawn_banner_listener(b"SSH-2.0-OpenSSH_9.0\r\n").await;
    let (api_port, bodies) = spawn_ingest_stub().await;

    let config = SweepConfig::new(vec!["127.0.0.1".to_string()])
        .with_ports(vec![ssh_port])
        .with_fingerprinter(FingerprintKind::Native)
        .with_rate(10)
        .with_timeout_secs(1)
        .with_api_url(format!("http://127.0.0.1:{}", api_port));

    let engine = SweepEngine::from_config(config).unwrap();
    let summary = engine.run_scan().await.unwrap();

    assert_eq!(summary.ports_scanned, 1);
    assert_eq!(summary.endpoints_found, 1);
    assert_eq!(summary.submitted, 1);
    assert_eq!(summary.submit_failures, 0);

    let bodies = bodies.lock().unwrap();
    assert_eq!(bodies.len(), 1);

    let batch: serde_json::Value = serde_json::from_str(&bodies[0]).unwrap();
    assert_eq!(batch["scan_id"], summary.scan_id.to_string());
    assert_eq!(batch["hosts"][0]["ip_address"], "127.0.0.1");

    let port_entry = &batch["hosts"][0]["ports"][0];
    assert_eq!(port_entry["port_number"], ssh_port);
    assert_eq!(port_entry["protocol"], "tcp");
    assert_eq!(port_entry["state"], "open");
    assert_eq!(port_entry["service_name"], "ssh");
    assert!(port_entry["banner"]
        .as_str()
        .unwrap()
        .contains("SSH-2.0-OpenSSH_9.0"));

    // The run is over and the completion time is recorded
    let status = engine.status();
    assert!(!status.is_scanning);
    assert!(status.last_scan_time.is_some());
}

#[tokio::test]
async fn test_unsubmittable_results_are_dropped_not_fatal() {
    let ssh_port = spawn_banner_listener(b"SSH-2.0-OpenSSH_9.0\r\n").await;

    // Point the engine at a port nothing listens on
    let dead_api = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    };

    let config = SweepConfig::new(vec!["127.0.0.1".to_string()])
        .with_ports(vec![ssh_port])
        .with_fingerprinter(FingerprintKind::Native)
        .with_rate(10)
        .with_timeout_secs(1)
        .with_api_url(format!("http://127.0.0.1:{}", dead_api));

    let engine = SweepEngine::from_config(config).unwrap();
    let summary = engine.run_scan().await.unwrap();

    assert_eq!(summary.endpoints_found, 1);
    assert_eq!(summary.submitted, 0);
    assert_eq!(summary.submit_failures, 1);
}

/// Backend that takes long enough for a second trigger to race it
struct SlowBackend;

#[async_trait::async_trait]
impl ProbeBackend for SlowBackend {
    fn name(&self) -> &'static str {
        "slow"
    }

    async fn probe_port(
        &self,
        _cancel: &CancellationToken,
        _port: u16,
    ) -> SweepResult<Vec<OpenEndpoint>> {
        tokio::time::sleep(Duration::from_millis(500)).await;
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn test_second_scan_rejected_while_running() {
    let config = SweepConfig::new(vec!["127.0.0.1".to_string()]).with_ports(vec![1]);

    let engine = Arc::new(SweepEngine::new(
        config,
        Arc::new(SlowBackend),
        Arc::new(NativeProber::new(Duration::from_millis(100))),
        Arc::new(ApiClient::new("http://127.0.0.1:1")),
    ));

    let running = engine.clone();
    let first = tokio::spawn(async move { running.run_scan().await });

    // Let the first run claim the guard
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(engine.status().is_scanning);

    let second = engine.run_scan().await;
    assert!(matches!(second, Err(SweepError::ScanInProgress)));

    let first = first.await.unwrap().unwrap();
    assert_eq!(first.endpoints_found, 0);

    // Guard is idle again and a new run is accepted
    let status = engine.status();
    assert!(!status.is_scanning);
    assert!(status.last_scan_time.is_some());

    tokio_test::assert_ok!(engine.run_scan().await);
}

#[tokio::test]
async fn test_fingerprint_never_errors_on_unreachable_endpoint() {
    let prober = NativeProber::new(Duration::from_millis(200));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let ip: IpAddr = "127.0.0.1".parse().unwrap();
    let info = netsweep::fingerprint::FingerprintStrategy::fingerprint(&prober, ip, port).await;

    assert_eq!(info.service_name.as_deref(), Some("unknown"));
    assert!(info.service_version.is_none());
    assert!(info.banner.is_none());
    assert!(info.fingerprint_data.is_none());
}
