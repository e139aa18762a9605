//! Port probing backends
//!
//! A [`ProbeBackend`] answers one question: which of the configured
//! targets accept connections on a given port. Two implementations
//! exist — an in-process TCP connector and a delegated zmap runner —
//! selected once at startup and injected into the scan engine.

pub mod tcp;
pub mod zmap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::error::SweepResult;

pub use tcp::TcpProbeBackend;
pub use zmap::ZmapProbeBackend;

/// Transport protocol of a probed endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
        }
    }
}

/// Observed state of a probed endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortState {
    Open,
}

impl std::fmt::Display for PortState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PortState::Open => write!(f, "open"),
        }
    }
}

/// A target/port pair confirmed reachable at the transport layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenEndpoint {
    pub ip: IpAddr,
    pub port: u16,
    pub protocol: Protocol,
    pub state: PortState,
}

impl OpenEndpoint {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self {
            ip,
            port,
            protocol: Protocol::Tcp,
            state: PortState::Open,
        }
    }
}

/// Pluggable port prober
#[async_trait]
pub trait ProbeBackend: Send + Sync {
    /// Backend name, for logs
    fn name(&self) -> &'static str;

    /// Probe one port across every configured target, returning the
    /// endpoints that accepted. Transient per-target failures mean
    /// "closed" and are not errors; an `Err` means the whole port
    /// could not be processed.
    async fn probe_port(
        &self,
        cancel: &CancellationToken,
        port: u16,
    ) -> SweepResult<Vec<OpenEndpoint>>;
}

/// Counting admission gate bounding concurrently in-flight probes.
///
/// Acquire before dialing, release (drop the pass) on completion,
/// success or not. The gate is the only backpressure in the probe
/// path: excess acquisitions wait, nothing is dropped. The in-flight
/// high-water mark is kept so tests can verify the ceiling holds.
pub struct AdmissionGate {
    permits: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
    high_water: Arc<AtomicUsize>,
}

/// An admission slot. Dropping it releases the slot.
pub struct GatePass {
    _permit: OwnedSemaphorePermit,
    in_flight: Arc<AtomicUsize>,
}

impl Drop for GatePass {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl AdmissionGate {
    /// Create a gate admitting at most `limit` concurrent holders
    pub fn new(limit: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(limit)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            high_water: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Wait for a slot
    pub async fn acquire(&self) -> GatePass {
        // The semaphore is never closed, so acquire cannot fail
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .expect("admission gate semaphore closed");

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.high_water.fetch_max(current, Ordering::SeqCst);

        GatePass {
            _permit: permit,
            in_flight: self.in_flight.clone(),
        }
    }

    /// Number of passes currently held
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Most passes ever held at once
    pub fn high_water(&self) -> usize {
        self.high_water.load(Ordering::SeqCst)
    }
}
