//! Client for the result-ingestion API
//!
//! Results are handed over as soon as they exist; a refused batch is
//! logged and dropped, never retried, and the scan moves on.

use log::{info, warn};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::net::IpAddr;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{SweepError, SweepResult};
use crate::fingerprint::ServiceInfo;
use crate::probe::OpenEndpoint;

/// One port entry in a submitted batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResultPort {
    pub port_number: u16,
    pub protocol: String,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub banner: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint_data: Option<Map<String, Value>>,
}

/// One host entry in a submitted batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResultHost {
    pub ip_address: IpAddr,
    pub ports: Vec<ScanResultPort>,
}

/// A batch of results attributed to one scan run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResults {
    pub scan_id: Uuid,
    pub hosts: Vec<ScanResultHost>,
}

impl ScanResults {
    /// Single-endpoint batch, the shape the streaming path submits
    pub fn single(scan_id: Uuid, endpoint: &OpenEndpoint, service: ServiceInfo) -> Self {
        let port = ScanResultPort {
            port_number: endpoint.port,
            protocol: endpoint.protocol.to_string(),
            state: endpoint.state.to_string(),
            service_name: service.service_name,
            service_version: service.service_version,
            banner: service.banner,
            fingerprint_data: service.fingerprint_data,
        };

        Self {
            scan_id,
            hosts: vec![ScanResultHost {
                ip_address: endpoint.ip,
                ports: vec![port],
            }],
        }
    }
}

/// HTTP client for the ingestion collaborator
pub struct ApiClient {
    base_url: String,
    client: Client,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
        }
    }

    /// Submit one batch of results
    pub async fn submit_results(&self, results: &ScanResults) -> SweepResult<()> {
        let url = format!("{}/api/scan/results", self.base_url);
        let response = self.client.post(&url).json(results).send().await?;

        if !response.status().is_success() {
            return Err(SweepError::Probe(format!(
                "ingestion API returned status {}",
                response.status()
            )));
        }

        Ok(())
    }

    /// Check whether the ingestion API is up
    pub async fn health_check(&self) -> SweepResult<()> {
        let url = format!("{}/api/health", self.base_url);
        let response = self.client.get(&url).send().await?;

        if !response.status().is_success() {
            return Err(SweepError::Probe(format!(
                "ingestion API unhealthy: status {}",
                response.status()
            )));
        }

        Ok(())
    }

    /// Poll the health endpoint until it answers or the attempt budget
    /// runs out. Scanning proceeds either way; an unreachable API just
    /// means submissions will fail and be dropped.
    pub async fn wait_ready(&self, attempts: u32, delay: Duration) {
        for attempt in 1..=attempts {
            match self.health_check().await {
                Ok(()) => {
                    info!("Ingestion API is ready");
                    return;
                }
                Err(e) => {
                    if attempt == attempts {
                        warn!(
                            "Ingestion API not ready after {} attempts ({}); scanning anyway",
                            attempts, e
                        );
                        return;
                    }
                }
            }
            tokio::time::sleep(delay).await;
        }
    }
}
