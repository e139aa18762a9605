//! Scan orchestration
//!
//! [`SweepEngine`] drives one full scan run: it resolves the port set,
//! asks the probe backend about each port, streams every open endpoint
//! through the fingerprint strategy and on to the ingestion API, and
//! enforces the one-scan-at-a-time rule through [`ScanGuard`].

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{FingerprintKind, ProbeBackendKind, SweepConfig};
use crate::error::{SweepError, SweepResult};
use crate::fingerprint::{FingerprintStrategy, NativeProber, ZgrabStrategy};
use crate::ingest::{ApiClient, ScanResults};
use crate::probe::{OpenEndpoint, ProbeBackend, TcpProbeBackend, ZmapProbeBackend};
use crate::top_ports::{all_port_batches, common_ports};

/// zgrab2 gets a longer leash than a plain connect: it may speak
/// several protocol round-trips per endpoint.
const ZGRAB_TIMEOUT: Duration = Duration::from_secs(10);

/// Capacity of the endpoint queue between probing and submission
const SUBMIT_QUEUE_DEPTH: usize = 64;

#[derive(Default)]
struct GuardState {
    scanning: bool,
    last_scan_time: Option<DateTime<Utc>>,
}

/// Enforces "at most one scan at a time" and answers status queries.
/// The flag and the last-completion timestamp are the only process-wide
/// state that outlives a scan run.
#[derive(Default)]
pub struct ScanGuard {
    state: Mutex<GuardState>,
}

/// Snapshot of the guard state, the whole status surface external
/// trigger/status glue needs
#[derive(Debug, Clone, Serialize)]
pub struct ScanStatus {
    pub is_scanning: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_scan_time: Option<DateTime<Utc>>,
}

impl ScanGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the running slot. A scan already in progress is a
    /// rejection, not a queue.
    pub fn try_begin(&self) -> SweepResult<()> {
        let mut state = self.state.lock().expect("scan state lock poisoned");
        if state.scanning {
            return Err(SweepError::ScanInProgress);
        }
        state.scanning = true;
        Ok(())
    }

    /// Release the slot and stamp the completion time
    pub fn finish(&self) {
        let mut state = self.state.lock().expect("scan state lock poisoned");
        state.scanning = false;
        state.last_scan_time = Some(Utc::now());
    }

    pub fn status(&self) -> ScanStatus {
        let state = self.state.lock().expect("scan state lock poisoned");
        ScanStatus {
            is_scanning: state.scanning,
            last_scan_time: state.last_scan_time,
        }
    }
}

/// What one completed run did
#[derive(Debug, Clone, Serialize)]
pub struct ScanSummary {
    pub scan_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub duration_secs: u64,
    pub ports_scanned: usize,
    pub endpoints_found: u64,
    pub submitted: u64,
    pub submit_failures: u64,
}

/// The scan orchestrator. Backend and strategy are chosen once at
/// startup and injected; the scan path itself has no mode branching.
pub struct SweepEngine {
    config: SweepConfig,
    backend: Arc<dyn ProbeBackend>,
    strategy: Arc<dyn FingerprintStrategy>,
    ingest: Arc<ApiClient>,
    guard: Arc<ScanGuard>,
}

impl SweepEngine {
    pub fn new(
        config: SweepConfig,
        backend: Arc<dyn ProbeBackend>,
        strategy: Arc<dyn FingerprintStrategy>,
        ingest: Arc<ApiClient>,
    ) -> Self {
        Self {
            config,
            backend,
            strategy,
            ingest,
            guard: Arc::new(ScanGuard::new()),
        }
    }

    /// Wire up backend, strategy and API client from configuration
    pub fn from_config(config: SweepConfig) -> SweepResult<Self> {
        config.validate()?;

        let backend: Arc<dyn ProbeBackend> = match config.backend {
            ProbeBackendKind::Tcp => Arc::new(TcpProbeBackend::new(
                &config.networks,
                config.rate,
                config.timeout_duration(),
            )?),
            ProbeBackendKind::Zmap => Arc::new(ZmapProbeBackend::new(
                &config.networks,
                config.rate,
                config.interface.clone(),
            )),
        };

        let strategy: Arc<dyn FingerprintStrategy> = match config.fingerprinter {
            FingerprintKind::Native => Arc::new(NativeProber::new(config.timeout_duration())),
            FingerprintKind::Zgrab => Arc::new(ZgrabStrategy::new(ZGRAB_TIMEOUT)),
        };

        let ingest = Arc::new(ApiClient::new(config.api_url.clone()));

        Ok(Self::new(config, backend, strategy, ingest))
    }

    /// Current guard state, for status surfaces
    pub fn status(&self) -> ScanStatus {
        self.guard.status()
    }

    pub fn ingest(&self) -> &ApiClient {
        &self.ingest
    }

    /// Run one full scan. Returns `ScanInProgress` without doing
    /// anything if a run is already active.
    pub async fn run_scan(&self) -> SweepResult<ScanSummary> {
        self.guard.try_begin()?;
        let result = self.run_scan_inner().await;
        self.guard.finish();
        result
    }

    async fn run_scan_inner(&self) -> SweepResult<ScanSummary> {
        let scan_id = Uuid::new_v4();
        let started_at = Utc::now();
        let clock = Instant::now();

        info!(
            "Starting scan {} over {:?} using {} backend and {} fingerprinting",
            scan_id,
            self.config.networks,
            self.backend.name(),
            self.strategy.name()
        );

        // One generous deadline bounds the whole run; cancellation is
        // cooperative and observed at dispatch and batch boundaries.
        let cancel = CancellationToken::new();
        let watchdog = {
            let cancel = cancel.clone();
            let deadline = self.config.scan_deadline();
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                warn!("Scan deadline of {:?} reached, cancelling", deadline);
                cancel.cancel();
            })
        };

        // Endpoints flow through a bounded queue to a single consumer
        // that fingerprints and submits them one at a time, so each
        // result reaches the API as soon as it exists and is always
        // attributed to the right address.
        let (endpoint_tx, mut endpoint_rx) = mpsc::channel::<OpenEndpoint>(SUBMIT_QUEUE_DEPTH);
        let consumer = {
            let strategy = self.strategy.clone();
            let ingest = self.ingest.clone();
            tokio::spawn(async move {
                let mut found: u64 = 0;
                let mut submitted: u64 = 0;
                let mut failures: u64 = 0;

                while let Some(endpoint) = endpoint_rx.recv().await {
                    found += 1;
                    let service = strategy.fingerprint(endpoint.ip, endpoint.port).await;
                    let service_name = service.service_name.clone().unwrap_or_default();

                    let batch = ScanResults::single(scan_id, &endpoint, service);
                    match ingest.submit_results(&batch).await {
                        Ok(()) => {
                            submitted += 1;
                            info!(
                                "Submitted: {}:{} ({})",
                                endpoint.ip, endpoint.port, service_name
                            );
                        }
                        Err(e) => {
                            failures += 1;
                            warn!(
                                "Failed to submit results for {}:{}: {}",
                                endpoint.ip, endpoint.port, e
                            );
                        }
                    }
                }

                (found, submitted, failures)
            })
        };

        let batches = resolve_port_batches(&self.config);
        let mut ports_scanned = 0usize;

        'sweep: for batch in batches {
            if cancel.is_cancelled() {
                warn!("Scan cancelled before batch start");
                break;
            }

            if batch.len() > 1 {
                info!(
                    "Scanning ports {}-{} across {} networks...",
                    batch.first().copied().unwrap_or_default(),
                    batch.last().copied().unwrap_or_default(),
                    self.config.networks.len()
                );
            }

            for port in batch {
                if cancel.is_cancelled() {
                    break 'sweep;
                }

                debug!("Scanning port {}", port);
                match self.backend.probe_port(&cancel, port).await {
                    Ok(hits) => {
                        ports_scanned += 1;
                        if !hits.is_empty() {
                            info!("Port {}: found {} hosts", port, hits.len());
                        }
                        for hit in hits {
                            if endpoint_tx.send(hit).await.is_err() {
                                break 'sweep;
                            }
                        }
                    }
                    Err(e) => {
                        ports_scanned += 1;
                        warn!("Error scanning port {}: {}", port, e);
                    }
                }
            }
        }

        drop(endpoint_tx);
        let (found, submitted, failures) = consumer.await.unwrap_or((0, 0, 0));
        watchdog.abort();

        let summary = ScanSummary {
            scan_id,
            started_at,
            duration_secs: clock.elapsed().as_secs(),
            ports_scanned,
            endpoints_found: found,
            submitted,
            submit_failures: failures,
        };

        info!(
            "Scan {} completed: {} ports, {} endpoints, {} submitted, {} submit failures",
            scan_id, summary.ports_scanned, summary.endpoints_found, summary.submitted,
            summary.submit_failures
        );

        Ok(summary)
    }
}

/// Resolve the configured port specification into scan batches:
/// an explicit list, the built-in common list, or all 65535 ports
/// in fixed-size batches.
fn resolve_port_batches(config: &SweepConfig) -> Vec<Vec<u16>> {
    if config.scan_all_ports {
        all_port_batches()
    } else if config.ports.is_empty() {
        vec![common_ports()]
    } else {
        vec![config.ports.clone()]
    }
}
