//! netsweep - scheduled network scan-and-fingerprint daemon
//!
//! Expands configured network ranges into targets, probes ports with a
//! pluggable backend (in-process TCP connect or delegated zmap),
//! fingerprints every open endpoint with a pluggable strategy
//! (in-process protocol probes or delegated zgrab2 with fallback), and
//! streams normalized results to an ingestion API.

pub mod config;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod ingest;
pub mod probe;
pub mod top_ports;
pub mod utils;

// Re-export commonly used types
pub use config::{FingerprintKind, ProbeBackendKind, SweepConfig};
pub use engine::{ScanGuard, ScanStatus, ScanSummary, SweepEngine};
pub use error::{SweepError, SweepResult};
pub use fingerprint::{FingerprintStrategy, ServiceInfo};
pub use probe::{OpenEndpoint, ProbeBackend};

pub type Result<T> = std::result::Result<T, SweepError>;
