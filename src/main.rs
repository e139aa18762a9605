use anyhow::Context;
use clap::Parser;
use colored::*;
use log::{error, info};
use std::path::PathBuf;
use std::time::Duration;

use netsweep::{SweepConfig, SweepEngine, SweepError};

/// Scheduled network scan-and-fingerprint daemon
#[derive(Parser, Debug)]
#[command(name = "netsweep", version, about)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "/etc/netsweep/config.toml")]
    config: PathBuf,

    /// Network ranges to scan (overrides the config file; repeatable)
    #[arg(long = "network")]
    networks: Vec<String>,

    /// Comma-separated ports to scan (overrides the config file)
    #[arg(long)]
    ports: Option<String>,

    /// Scan all 65535 ports
    #[arg(long)]
    all_ports: bool,

    /// Probe backend: tcp or zmap
    #[arg(long)]
    backend: Option<String>,

    /// Fingerprint strategy: native or zgrab
    #[arg(long)]
    fingerprinter: Option<String>,

    /// Concurrency (tcp) or packets per second (zmap)
    #[arg(long)]
    rate: Option<u32>,

    /// Per-probe timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Network interface hint for zmap
    #[arg(long)]
    interface: Option<String>,

    /// Base URL of the ingestion API
    #[arg(long)]
    api_url: Option<String>,

    /// Minutes between scheduled scans
    #[arg(long)]
    interval: Option<u64>,

    /// Run a single scan and exit
    #[arg(long)]
    once: bool,

    /// Raise the open-file limit before scanning
    #[arg(long)]
    ulimit: Option<u64>,
}

// Ulimit adjustment for Unix systems
#[cfg(unix)]
fn adjust_ulimit_size(ulimit: Option<u64>) -> u64 {
    use rlimit::Resource;

    if let Some(limit) = ulimit {
        if Resource::NOFILE.set(limit, limit).is_ok() {
            info!("Raised open-file limit to {}", limit);
        } else {
            error!("Failed to set open-file limit to {}", limit);
        }
    }

    match Resource::NOFILE.get() {
        Ok((soft, _)) => soft,
        Err(_) => 65535,
    }
}

#[cfg(not(unix))]
fn adjust_ulimit_size(_ulimit: Option<u64>) -> u64 {
    65535
}

fn print_banner() {
    println!(
        "{} {}",
        "netsweep".bright_cyan().bold(),
        env!("CARGO_PKG_VERSION").bright_white()
    );
    println!("{}", "network scan-and-fingerprint daemon".dimmed());
    println!();
}

fn apply_cli_overrides(config: &mut SweepConfig, cli: &Cli) -> anyhow::Result<()> {
    if !cli.networks.is_empty() {
        config.networks = cli.networks.clone();
    }

    if let Some(ports) = &cli.ports {
        config.ports = ports
            .split(',')
            .map(|p| p.trim().parse::<u16>())
            .collect::<Result<Vec<_>, _>>()
            .context("Invalid port list")?;
    }

    if cli.all_ports {
        config.scan_all_ports = true;
    }

    if let Some(backend) = &cli.backend {
        config.backend = match backend.as_str() {
            "tcp" => netsweep::ProbeBackendKind::Tcp,
            "zmap" => netsweep::ProbeBackendKind::Zmap,
            other => anyhow::bail!("Unknown backend '{}' (expected tcp or zmap)", other),
        };
    }

    if let Some(fingerprinter) = &cli.fingerprinter {
        config.fingerprinter = match fingerprinter.as_str() {
            "native" => netsweep::FingerprintKind::Native,
            "zgrab" => netsweep::FingerprintKind::Zgrab,
            other => anyhow::bail!("Unknown fingerprinter '{}' (expected native or zgrab)", other),
        };
    }

    if let Some(rate) = cli.rate {
        config.rate = rate;
    }
    if let Some(timeout) = cli.timeout {
        config.timeout_secs = timeout;
    }
    if cli.interface.is_some() {
        config.interface = cli.interface.clone();
    }
    if let Some(api_url) = &cli.api_url {
        config.api_url = api_url.clone();
    }
    if let Some(interval) = cli.interval {
        config.interval_minutes = interval;
    }

    Ok(())
}

async fn run_once(engine: &SweepEngine) {
    match engine.run_scan().await {
        Ok(summary) => info!(
            "Scan {} finished in {}s ({} endpoints, {} submitted)",
            summary.scan_id, summary.duration_secs, summary.endpoints_found, summary.submitted
        ),
        Err(SweepError::ScanInProgress) => info!("Scan already in progress, skipping..."),
        Err(e) => error!("Scan failed: {}", e),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    print_banner();

    let cli = Cli::parse();

    let soft_limit = adjust_ulimit_size(cli.ulimit);
    info!("Open-file limit: {}", soft_limit);

    let mut config = SweepConfig::load_or_default(&cli.config);
    config.apply_env_overrides();
    apply_cli_overrides(&mut config, &cli)?;
    config.validate().context("Invalid configuration")?;

    info!("Configuration loaded:");
    info!("  Networks: {:?}", config.networks);
    info!("  Scan all ports: {}", config.scan_all_ports);
    if !config.scan_all_ports {
        if config.ports.is_empty() {
            info!("  Ports: built-in common list");
        } else {
            info!("  Ports: {:?}", config.ports);
        }
    }
    info!("  Backend: {:?}", config.backend);
    info!("  Fingerprinter: {:?}", config.fingerprinter);
    info!("  Rate: {}", config.rate);
    info!("  Timeout: {}s", config.timeout_secs);
    info!("  Interval: {}m", config.interval_minutes);
    info!("  API URL: {}", config.api_url);

    let interval_minutes = config.interval_minutes;
    let engine = SweepEngine::from_config(config).context("Failed to build scan engine")?;

    info!("Waiting for ingestion API to be ready...");
    engine.ingest().wait_ready(30, Duration::from_secs(2)).await;

    // Initial scan at startup, like every scheduled one after it
    run_once(&engine).await;

    if cli.once {
        return Ok(());
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(interval_minutes.max(1) * 60));
    ticker.tick().await; // the first tick fires immediately; the initial scan already ran
    info!("Scheduled scans every {} minutes", interval_minutes.max(1));

    loop {
        tokio::select! {
            _ = ticker.tick() => run_once(&engine).await,
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
        }
    }

    Ok(())
}
