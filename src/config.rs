//! Configuration module for the netsweep daemon

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Which probe backend performs the port sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeBackendKind {
    /// In-process TCP connect scanning
    Tcp,
    /// Delegate each (network, port) pair to a zmap process
    Zmap,
}

/// Which strategy turns an open endpoint into service metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FingerprintKind {
    /// In-process protocol probes
    Native,
    /// Delegate to zgrab2, falling back per-call to the native probes
    Zgrab,
}

/// Main configuration structure for the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    /// Network ranges to scan, in CIDR notation
    pub networks: Vec<String>,

    /// Explicit ports to scan; empty means the built-in common list
    pub ports: Vec<u16>,

    /// Scan every port 1-65535 instead of the configured list
    pub scan_all_ports: bool,

    /// Probe backend selection
    pub backend: ProbeBackendKind,

    /// Fingerprint strategy selection
    pub fingerprinter: FingerprintKind,

    /// For the tcp backend: max concurrent connection attempts.
    /// For the zmap backend: packets per second.
    pub rate: u32,

    /// Per-probe connect/read timeout in seconds
    pub timeout_secs: u64,

    /// Network interface hint passed to zmap
    pub interface: Option<String>,

    /// Base URL of the ingestion API
    pub api_url: String,

    /// Minutes between scheduled scans
    pub interval_minutes: u64,

    /// Upper bound on a whole scan run, in seconds
    pub scan_deadline_secs: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            networks: vec!["192.168.1.0/24".to_string()],
            ports: Vec::new(),
            scan_all_ports: false,
            backend: ProbeBackendKind::Tcp,
            fingerprinter: FingerprintKind::Zgrab,
            rate: 100,
            timeout_secs: 5,
            interface: None,
            api_url: "http://127.0.0.1:8000".to_string(),
            interval_minutes: 15,
            scan_deadline_secs: 2 * 60 * 60,
        }
    }
}

impl SweepConfig {
    /// Create a configuration for the given networks
    pub fn new(networks: Vec<String>) -> Self {
        Self {
            networks,
            ..Default::default()
        }
    }

    /// Set the ports to scan
    pub fn with_ports(mut self, ports: Vec<u16>) -> Self {
        self.ports = ports;
        self
    }

    /// Set the probe backend
    pub fn with_backend(mut self, backend: ProbeBackendKind) -> Self {
        self.backend = backend;
        self
    }

    /// Set the fingerprint strategy
    pub fn with_fingerprinter(mut self, fingerprinter: FingerprintKind) -> Self {
        self.fingerprinter = fingerprinter;
        self
    }

    /// Set the probe rate
    pub fn with_rate(mut self, rate: u32) -> Self {
        self.rate = rate;
        self
    }

    /// Set the per-probe timeout in seconds
    pub fn with_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    /// Set the ingestion API base URL
    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    /// Per-probe timeout as a Duration
    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Whole-run deadline as a Duration
    pub fn scan_deadline(&self) -> Duration {
        Duration::from_secs(self.scan_deadline_secs)
    }

    /// Load configuration from a TOML file
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> crate::SweepResult<Self> {
        let content = fs::read_to_string(&path).map_err(|e| {
            crate::SweepError::Config(format!(
                "Failed to read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;

        let config: SweepConfig = toml::from_str(&content)
            .map_err(|e| crate::SweepError::Config(format!("Failed to parse TOML: {}", e)))?;

        Ok(config)
    }

    /// Load configuration, trying `path` first, then `~/.netsweep.toml`,
    /// then the built-in defaults.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        if path.as_ref().exists() {
            match Self::from_toml_file(&path) {
                Ok(config) => return config,
                Err(e) => log::warn!("{}; falling back to defaults", e),
            }
        }

        let home_dir = dirs::home_dir().unwrap_or_else(|| std::path::PathBuf::from("."));
        let home_config = home_dir.join(".netsweep.toml");
        if home_config.exists() {
            if let Ok(config) = Self::from_toml_file(&home_config) {
                log::info!("Loaded config from {}", home_config.display());
                return config;
            }
        }

        log::warn!("No config file found, using default configuration");
        Self::default()
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        if let Ok(api_url) = std::env::var("API_URL") {
            if !api_url.is_empty() {
                self.api_url = api_url;
            }
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::SweepResult<()> {
        if self.networks.is_empty() {
            return Err(crate::SweepError::Config(
                "At least one network range is required".to_string(),
            ));
        }

        if self.rate == 0 {
            return Err(crate::SweepError::Config(
                "Rate must be greater than 0".to_string(),
            ));
        }

        if self.timeout_secs == 0 {
            return Err(crate::SweepError::Config(
                "Timeout must be greater than 0".to_string(),
            ));
        }

        if self.api_url.is_empty() {
            return Err(crate::SweepError::Config(
                "API URL cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        let config = SweepConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.backend, ProbeBackendKind::Tcp);
        assert_eq!(config.rate, 100);
    }

    #[test]
    fn test_builders() {
        let config = SweepConfig::new(vec!["10.0.0.0/24".to_string()])
            .with_backend(ProbeBackendKind::Zmap)
            .with_rate(10_000)
            .with_timeout_secs(3);

        assert_eq!(config.networks, vec!["10.0.0.0/24".to_string()]);
        assert_eq!(config.backend, ProbeBackendKind::Zmap);
        assert_eq!(config.rate, 10_000);
        assert_eq!(config.timeout_duration(), Duration::from_secs(3));
    }

    #[test]
    fn test_partial_toml() {
        let config: SweepConfig = toml::from_str(
            r#"
            networks = ["10.1.0.0/24", "10.2.0.0/24"]
            backend = "zmap"
            rate = 5000
            "#,
        )
        .unwrap();

        assert_eq!(config.networks.len(), 2);
        assert_eq!(config.backend, ProbeBackendKind::Zmap);
        assert_eq!(config.rate, 5000);
        // Everything else comes from defaults
        assert_eq!(config.timeout_secs, 5);
        assert_eq!(config.api_url, "http://127.0.0.1:8000");
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = SweepConfig::default();
        config.networks.clear();
        assert!(config.validate().is_err());

        let mut config = SweepConfig::default();
        config.rate = 0;
        assert!(config.validate().is_err());
    }
}
