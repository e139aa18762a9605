//! Error handling for the netsweep daemon
//!
//! One error type covers the whole scan path. Almost nothing here is
//! fatal: range errors skip the range, probe errors skip the unit,
//! fingerprint and submission errors are absorbed by their callers.

use thiserror::Error;

/// Main error type for scan operations
#[derive(Debug, Error)]
pub enum SweepError {
    #[error("Invalid network range: {0}")]
    InvalidRange(String),

    #[error("Probe error: {0}")]
    Probe(String),

    #[error("External tool error: {0}")]
    ExternalTool(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Scan already in progress")]
    ScanInProgress,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Operation timed out")]
    Timeout,
}

/// Result type alias for scan operations
pub type SweepResult<T> = Result<T, SweepError>;

impl From<std::net::AddrParseError> for SweepError {
    fn from(e: std::net::AddrParseError) -> Self {
        SweepError::InvalidRange(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for SweepError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        SweepError::Timeout
    }
}
