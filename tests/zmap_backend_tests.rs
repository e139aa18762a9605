//! Integration tests for the delegated zmap backend, using stand-in
//! scripts so no real zmap is needed

#![cfg(unix)]

use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use netsweep::probe::{ProbeBackend, ZmapProbeBackend};
use tokio_util::sync::CancellationToken;

/// Write an executable shell script into a temp dir and return its path
fn fake_zmap(dir: &tempfile::TempDir, name: &str, script: &str) -> PathBuf {
    let path = dir.path().join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(script.as_bytes()).unwrap();
    drop(file);

    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();

    path
}

#[tokio::test]
async fn test_streamed_output_is_parsed() {
    let dir = tempfile::tempdir().unwrap();
    let script = fake_zmap(
        &dir,
        "zmap-ok",
        "#!/bin/sh\necho saddr\necho 10.0.0.5\necho 10.0.0.9\necho\necho not-an-ip\n",
    );

    let backend = ZmapProbeBackend::new(&["10.0.0.0/28".to_string()], 1000, None)
        .with_command(script.display().to_string());

    let cancel = CancellationToken::new();
    let hits = backend.probe_port(&cancel, 443).await.unwrap();

    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].ip, "10.0.0.5".parse::<std::net::IpAddr>().unwrap());
    assert_eq!(hits[0].port, 443);
    assert_eq!(hits[1].ip, "10.0.0.9".parse::<std::net::IpAddr>().unwrap());
}

#[tokio::test]
async fn test_partial_results_survive_nonzero_exit() {
    let dir = tempfile::tempdir().unwrap();
    let script = fake_zmap(
        &dir,
        "zmap-partial",
        "#!/bin/sh\necho saddr\necho 10.0.0.7\necho 'send: interface went down' >&2\nexit 1\n",
    );

    let backend = ZmapProbeBackend::new(&["10.0.0.0/28".to_string()], 1000, None)
        .with_command(script.display().to_string());

    let cancel = CancellationToken::new();
    let hits = backend.probe_port(&cancel, 80).await.unwrap();

    // The process failed, but results were parsed: keep them
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].ip, "10.0.0.7".parse::<std::net::IpAddr>().unwrap());
}

#[tokio::test]
async fn test_hard_failure_skips_unit_and_continues() {
    let dir = tempfile::tempdir().unwrap();
    let script = fake_zmap(
        &dir,
        "zmap-fail",
        "#!/bin/sh\necho 'zmap: permission denied' >&2\nexit 1\n",
    );

    // Two ranges: both fail hard, both are skipped, the call still
    // succeeds with an empty result set
    let backend = ZmapProbeBackend::new(
        &["10.0.0.0/28".to_string(), "10.0.1.0/28".to_string()],
        1000,
        None,
    )
    .with_command(script.display().to_string());

    let cancel = CancellationToken::new();
    let hits = backend.probe_port(&cancel, 22).await.unwrap();
    assert!(hits.is_empty());
}

#[tokio::test]
async fn test_allowlist_carries_the_scanned_range() {
    let dir = tempfile::tempdir().unwrap();
    // Echo the allow-list contents (the argument after -w) back as
    // stderr diagnostics and fail, so the test can observe them
    let script = fake_zmap(
        &dir,
        "zmap-args",
        r#"#!/bin/sh
while [ $# -gt 0 ]; do
  if [ "$1" = "-w" ]; then cat "$2"; shift; fi
  shift
done
"#,
    );

    let backend = ZmapProbeBackend::new(&["192.168.7.0/30".to_string()], 1000, None)
        .with_command(script.display().to_string());

    let cancel = CancellationToken::new();
    // The allow-list content is a CIDR, not an address, so nothing
    // parses as a result; the run exits zero and yields no hits
    let hits = backend.probe_port(&cancel, 22).await.unwrap();
    assert!(hits.is_empty());
}

#[tokio::test]
async fn test_cancellation_kills_long_running_process() {
    let dir = tempfile::tempdir().unwrap();
    let script = fake_zmap(&dir, "zmap-hang", "#!/bin/sh\nsleep 30\n");

    let backend = ZmapProbeBackend::new(&["10.0.0.0/28".to_string()], 1000, None)
        .with_command(script.display().to_string());

    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        canceller.cancel();
    });

    let started = std::time::Instant::now();
    let hits = backend.probe_port(&cancel, 22).await.unwrap();

    assert!(hits.is_empty());
    // Far less than the script's sleep: the child was terminated
    assert!(started.elapsed() < std::time::Duration::from_secs(5));
}
