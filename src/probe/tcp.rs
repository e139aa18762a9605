//! In-process TCP connect probe backend

use async_trait::async_trait;
use futures::future::join_all;
use log::debug;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use super::{AdmissionGate, OpenEndpoint, ProbeBackend};
use crate::error::{SweepError, SweepResult};
use crate::utils::range::expand_all;

/// Probes ports by completing full TCP handshakes from this process.
///
/// The admission gate caps concurrent connection attempts at the
/// configured rate; a failed or timed-out attempt counts as closed
/// and is never retried.
pub struct TcpProbeBackend {
    targets: Arc<Vec<IpAddr>>,
    gate: Arc<AdmissionGate>,
    timeout: Duration,
}

impl TcpProbeBackend {
    /// Build the backend, expanding the configured ranges once.
    /// Unparsable ranges are skipped with a warning; no usable target
    /// at all is an error.
    pub fn new(networks: &[String], rate: u32, timeout: Duration) -> SweepResult<Self> {
        let rate = if rate == 0 { 100 } else { rate };
        let targets = expand_all(networks);

        if targets.is_empty() {
            return Err(SweepError::InvalidRange(
                "No valid addresses to scan in configured networks".to_string(),
            ));
        }

        Ok(Self {
            targets: Arc::new(targets),
            gate: Arc::new(AdmissionGate::new(rate as usize)),
            timeout,
        })
    }

    /// The expanded target list
    pub fn targets(&self) -> &[IpAddr] {
        &self.targets
    }

    /// The admission gate, exposed so tests can check the ceiling
    pub fn gate(&self) -> &AdmissionGate {
        &self.gate
    }
}

#[async_trait]
impl ProbeBackend for TcpProbeBackend {
    fn name(&self) -> &'static str {
        "tcp"
    }

    async fn probe_port(
        &self,
        cancel: &CancellationToken,
        port: u16,
    ) -> SweepResult<Vec<OpenEndpoint>> {
        let results = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();

        for &ip in self.targets.iter() {
            if cancel.is_cancelled() {
                debug!("Cancelled before dispatching {}:{}", ip, port);
                break;
            }

            let pass = self.gate.acquire().await;
            let results = results.clone();
            let connect_timeout = self.timeout;

            handles.push(tokio::spawn(async move {
                let _pass = pass;
                if let Ok(Ok(stream)) =
                    timeout(connect_timeout, TcpStream::connect((ip, port))).await
                {
                    drop(stream);
                    results.lock().await.push(OpenEndpoint::new(ip, port));
                }
            }));
        }

        join_all(handles).await;

        let hits = std::mem::take(&mut *results.lock().await);
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn spawn_listener() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    #[tokio::test]
    async fn test_finds_listening_port() {
        let (listener, port) = spawn_listener().await;
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let backend = TcpProbeBackend::new(
            &["127.0.0.1".to_string()],
            10,
            Duration::from_secs(1),
        )
        .unwrap();

        let cancel = CancellationToken::new();
        let hits = backend.probe_port(&cancel, port).await.unwrap();

        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].port, port);
        assert_eq!(hits[0].ip, "127.0.0.1".parse::<IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn test_closed_port_yields_nothing() {
        // Bind then drop so the port is known-closed
        let (listener, port) = spawn_listener().await;
        drop(listener);

        let backend = TcpProbeBackend::new(
            &["127.0.0.1".to_string()],
            10,
            Duration::from_millis(500),
        )
        .unwrap();

        let cancel = CancellationToken::new();
        let hits = backend.probe_port(&cancel, port).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_rate_ceiling_holds() {
        // 127.0.0.0/28 expands to 14 loopback targets
        let backend = TcpProbeBackend::new(
            &["127.0.0.0/28".to_string()],
            4,
            Duration::from_millis(200),
        )
        .unwrap();
        assert_eq!(backend.targets().len(), 14);

        let cancel = CancellationToken::new();
        let _ = backend.probe_port(&cancel, 1).await.unwrap();

        assert!(backend.gate().high_water() <= 4);
        assert_eq!(backend.gate().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_cancellation_stops_dispatch() {
        let backend = TcpProbeBackend::new(
            &["127.0.0.0/28".to_string()],
            2,
            Duration::from_millis(200),
        )
        .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();

        let hits = backend.probe_port(&cancel, 9).await.unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn test_no_valid_targets_is_error() {
        let result = TcpProbeBackend::new(
            &["garbage".to_string()],
            10,
            Duration::from_secs(1),
        );
        assert!(result.is_err());
    }
}
