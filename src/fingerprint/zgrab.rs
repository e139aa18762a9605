//! Delegated zgrab2 fingerprint strategy
//!
//! Runs one zgrab2 process per (ip, port), picking the protocol module
//! and flags from the port, and lifts the structured output into
//! [`ServiceInfo`]. Any execution or parse failure falls back to the
//! native prober for that single call.

use log::debug;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::IpAddr;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;

use super::{
    default_service_name, extract_title, extract_version, guess_service_from_banner,
    redis_version_from_info, sanitize_banner, FingerprintStrategy, NativeProber, ServiceInfo,
};
use crate::error::{SweepError, SweepResult};

/// zgrab2-backed fingerprinter with per-call native fallback
pub struct ZgrabStrategy {
    timeout: Duration,
    command: String,
    fallback: NativeProber,
}

impl ZgrabStrategy {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            command: "zgrab2".to_string(),
            fallback: NativeProber::new(timeout),
        }
    }

    /// Override the zgrab2 binary name. Used by tests to force the
    /// fallback path.
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = command.into();
        self
    }

    async fn run_zgrab(&self, ip: IpAddr, args: &[String]) -> SweepResult<ZgrabOutput> {
        let mut child = Command::new(&self.command)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                SweepError::ExternalTool(format!("failed to start {}: {}", self.command, e))
            })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| SweepError::ExternalTool("no stdin pipe".to_string()))?;
        stdin.write_all(format!("{}\n", ip).as_bytes()).await?;
        drop(stdin);

        let output = timeout(self.timeout, child.wait_with_output()).await??;

        if !output.status.success() {
            return Err(SweepError::ExternalTool(format!(
                "{} exited with {}: {}",
                self.command,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        serde_json::from_slice(&output.stdout)
            .map_err(|e| SweepError::Parse(format!("bad {} output: {}", self.command, e)))
    }
}

/// zgrab2 module for a port
fn module_for_port(port: u16) -> &'static str {
    match port {
        21 => "ftp",
        22 => "ssh",
        23 => "telnet",
        25 | 465 | 587 => "smtp",
        80 | 8080 | 8000 | 8888 => "http",
        110 | 995 => "pop3",
        143 | 993 => "imap",
        443 | 8443 => "http", // with --use-https
        3306 => "mysql",
        5432 => "postgres",
        6379 => "redis",
        27017 => "mongodb",
        _ => "banner",
    }
}

/// Full zgrab2 argument list for a port
fn build_args(module: &str, port: u16) -> Vec<String> {
    let mut args: Vec<String> = vec![module.to_string(), "-p".to_string(), port.to_string()];

    match module {
        "http" => {
            if port == 443 || port == 8443 {
                args.push("--use-https".into());
            }
            args.push("--max-redirects".into());
            args.push("3".into());
        }
        "smtp" => {
            args.push("--send-ehlo".into());
            args.push("--ehlo-domain".into());
            args.push("netsweep.local".into());
            if port == 465 {
                args.push("--smtps".into());
            } else {
                args.push("--starttls".into());
            }
        }
        "ftp" => args.push("--authtls".into()),
        "imap" => {
            if port == 993 {
                args.push("--imaps".into());
            } else {
                args.push("--starttls".into());
            }
        }
        "pop3" => {
            if port == 995 {
                args.push("--pop3s".into());
            } else {
                args.push("--starttls".into());
            }
        }
        "banner" => {
            args.push("--probe".into());
            args.push("\\x00".into());
            args.push("--max-read-size".into());
            args.push("4096".into());
        }
        _ => {}
    }

    args
}

// ── zgrab2 output shapes ─────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ZgrabOutput {
    #[serde(default)]
    data: HashMap<String, ZgrabModule>,
}

#[derive(Debug, Deserialize)]
struct ZgrabModule {
    status: String,
    #[serde(default)]
    result: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct TlsLog {
    #[serde(default)]
    handshake_log: Option<HandshakeLog>,
}

#[derive(Debug, Deserialize)]
struct HandshakeLog {
    #[serde(default)]
    server_certificates: Option<ServerCertificates>,
    #[serde(default)]
    server_hello: Option<ServerHello>,
}

#[derive(Debug, Deserialize)]
struct ServerCertificates {
    #[serde(default)]
    certificate: Option<Certificate>,
    #[serde(default)]
    chain: Option<Vec<Certificate>>,
}

#[derive(Debug, Deserialize)]
struct Certificate {
    #[serde(default)]
    parsed: Option<ParsedCert>,
}

#[derive(Debug, Deserialize)]
struct ParsedCert {
    #[serde(default)]
    subject: Option<DistinguishedName>,
    #[serde(default)]
    issuer: Option<DistinguishedName>,
    #[serde(default)]
    validity_not_before: Option<String>,
    #[serde(default)]
    validity_not_after: Option<String>,
    #[serde(default)]
    signature_algorithm: Option<Value>,
    #[serde(default)]
    subject_alt_name: Option<SubjectAltNames>,
}

#[derive(Debug, Deserialize)]
struct DistinguishedName {
    #[serde(default)]
    common_name: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct SubjectAltNames {
    #[serde(default)]
    dns_names: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct ServerHello {
    #[serde(default)]
    version: Option<Value>,
    #[serde(default)]
    cipher_suite: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct HttpResult {
    #[serde(default)]
    response: Option<HttpResponse>,
}

#[derive(Debug, Deserialize)]
struct HttpResponse {
    #[serde(default)]
    status_code: Option<i64>,
    #[serde(default)]
    status_line: Option<String>,
    #[serde(default)]
    headers: Option<HashMap<String, Value>>,
    #[serde(default)]
    body: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SshResult {
    #[serde(default)]
    server_id: Option<SshServerId>,
    #[serde(default)]
    algorithm_selection: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct SshServerId {
    #[serde(default)]
    raw: Option<String>,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    software_version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SmtpResult {
    #[serde(default)]
    banner: Option<String>,
    #[serde(default)]
    ehlo: Option<String>,
    #[serde(default)]
    starttls: Option<String>,
    #[serde(default)]
    tls: Option<TlsLog>,
}

#[derive(Debug, Deserialize)]
struct FtpResult {
    #[serde(default)]
    banner: Option<String>,
    #[serde(default)]
    auth_tls: Option<String>,
    #[serde(default)]
    tls: Option<TlsLog>,
}

#[derive(Debug, Deserialize)]
struct MailboxResult {
    #[serde(default)]
    banner: Option<String>,
    #[serde(default)]
    starttls: Option<String>,
    #[serde(default)]
    tls: Option<TlsLog>,
}

#[derive(Debug, Deserialize)]
struct MysqlResult {
    #[serde(default)]
    protocol_version: Option<i64>,
    #[serde(default)]
    server_version: Option<String>,
    #[serde(default)]
    auth_plugin_name: Option<String>,
    #[serde(default)]
    tls: Option<TlsLog>,
}

#[derive(Debug, Deserialize)]
struct PostgresResult {
    #[serde(default)]
    supported_versions: Option<String>,
    #[serde(default)]
    is_ssl: Option<bool>,
    #[serde(default)]
    tls: Option<TlsLog>,
}

#[derive(Debug, Deserialize)]
struct RedisResult {
    #[serde(default)]
    info: Option<String>,
    #[serde(default)]
    auth_required: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct TelnetResult {
    #[serde(default)]
    banner: Option<String>,
}

// ── result extraction ────────────────────────────────────────────────

/// Lift one parsed module result into ServiceInfo
fn parse_output(output: &ZgrabOutput, module: &str, port: u16) -> ServiceInfo {
    let mut info = ServiceInfo::default();

    let module_result = match output.data.get(module) {
        Some(m) if m.status == "success" => m,
        _ => return info,
    };

    info.add_extra("zgrab_status", json!(module_result.status));
    info.add_extra("protocol", json!(module));

    let result = match &module_result.result {
        Some(r) => r.clone(),
        None => return info,
    };

    match module {
        "http" => {
            if let Ok(http) = serde_json::from_value::<HttpResult>(result) {
                if let Some(response) = http.response {
                    info.service_name = Some(
                        if port == 443 || port == 8443 { "https" } else { "http" }.to_string(),
                    );

                    if let Some(code) = response.status_code {
                        info.add_extra("status_code", json!(code));
                    }
                    if let Some(line) = response.status_line {
                        info.banner = Some(sanitize_banner(&line));
                    }
                    if let Some(headers) = response.headers {
                        if let Some(server) = headers.get("server").and_then(header_value) {
                            info.service_version = Some(server);
                        }
                        info.add_extra("headers", json!(headers));
                    }
                    if let Some(body) = response.body {
                        if let Some(title) = extract_title(&body) {
                            info.add_extra("title", json!(title));
                        }
                    }
                }
            }
        }
        "ssh" => {
            if let Ok(ssh) = serde_json::from_value::<SshResult>(result) {
                info.service_name = Some("ssh".to_string());
                if let Some(server_id) = ssh.server_id {
                    if let Some(raw) = server_id.raw {
                        info.banner = Some(sanitize_banner(&raw));
                    }
                    if let Some(software) = server_id.software_version {
                        info.service_version = Some(software);
                    }
                    if let Some(version) = server_id.version {
                        info.add_extra("protocol_version", json!(version));
                    }
                }
                if let Some(algorithms) = ssh.algorithm_selection {
                    info.add_extra("algorithms", algorithms);
                }
            }
        }
        "smtp" => {
            if let Ok(smtp) = serde_json::from_value::<SmtpResult>(result) {
                info.service_name = Some("smtp".to_string());
                if let Some(banner) = smtp.banner {
                    info.banner = Some(sanitize_banner(&banner));
                    info.service_version = extract_version(&banner);
                }
                if let Some(ehlo) = smtp.ehlo {
                    info.add_extra("ehlo", json!(ehlo));
                    let caps = super::parse_ehlo_capabilities(&ehlo);
                    if !caps.is_empty() {
                        info.add_extra("capabilities", json!(caps));
                    }
                }
                if smtp.starttls.is_some() {
                    info.add_extra("starttls", json!(true));
                }
                extract_tls_info(&mut info, &smtp.tls);
            }
        }
        "ftp" => {
            if let Ok(ftp) = serde_json::from_value::<FtpResult>(result) {
                info.service_name = Some("ftp".to_string());
                if let Some(banner) = ftp.banner {
                    info.banner = Some(sanitize_banner(&banner));
                    info.service_version = extract_version(&banner);
                }
                if ftp.auth_tls.is_some() {
                    info.add_extra("auth_tls", json!(true));
                }
                extract_tls_info(&mut info, &ftp.tls);
            }
        }
        "imap" | "pop3" => {
            if let Ok(mailbox) = serde_json::from_value::<MailboxResult>(result) {
                info.service_name = Some(module.to_string());
                if let Some(banner) = mailbox.banner {
                    info.banner = Some(sanitize_banner(&banner));
                    info.service_version = extract_version(&banner);
                }
                if mailbox.starttls.is_some() {
                    info.add_extra("starttls", json!(true));
                }
                extract_tls_info(&mut info, &mailbox.tls);
            }
        }
        "mysql" => {
            if let Ok(mysql) = serde_json::from_value::<MysqlResult>(result) {
                info.service_name = Some("mysql".to_string());
                if let Some(version) = mysql.server_version {
                    info.banner = Some(format!("MySQL {}", version));
                    info.service_version = Some(version);
                }
                if let Some(protocol) = mysql.protocol_version {
                    info.add_extra("protocol_version", json!(protocol));
                }
                if let Some(plugin) = mysql.auth_plugin_name {
                    info.add_extra("auth_plugin", json!(plugin));
                }
                extract_tls_info(&mut info, &mysql.tls);
            }
        }
        "postgres" => {
            if let Ok(postgres) = serde_json::from_value::<PostgresResult>(result) {
                info.service_name = Some("postgresql".to_string());
                if postgres.is_ssl.unwrap_or(false) {
                    info.banner = Some("PostgreSQL (SSL supported)".to_string());
                    info.add_extra("ssl_supported", json!(true));
                } else {
                    info.banner = Some("PostgreSQL".to_string());
                }
                if let Some(versions) = postgres.supported_versions {
                    info.add_extra("supported_versions", json!(versions));
                }
                extract_tls_info(&mut info, &postgres.tls);
            }
        }
        "redis" => {
            if let Ok(redis) = serde_json::from_value::<RedisResult>(result) {
                info.service_name = Some("redis".to_string());
                if redis.auth_required.unwrap_or(false) {
                    info.banner = Some("Redis (authentication required)".to_string());
                    info.add_extra("auth_required", json!(true));
                } else {
                    info.banner = Some("Redis".to_string());
                }
                if let Some(raw_info) = redis.info {
                    info.service_version = redis_version_from_info(&raw_info);
                }
            }
        }
        "telnet" => {
            if let Ok(telnet) = serde_json::from_value::<TelnetResult>(result) {
                info.service_name = Some("telnet".to_string());
                if let Some(banner) = telnet.banner {
                    info.banner = Some(sanitize_banner(&banner));
                }
            }
        }
        "banner" => {
            if let Some(banner) = result.get("banner").and_then(Value::as_str) {
                if !banner.is_empty() {
                    info.banner = Some(sanitize_banner(banner));
                    info.service_name = guess_service_from_banner(banner);
                }
            }
        }
        _ => {}
    }

    info
}

/// A header value from zgrab2 may be a string or a list of strings
fn header_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => items.first().and_then(Value::as_str).map(String::from),
        _ => None,
    }
}

/// Certificate and negotiation details into the "tls" extra
fn extract_tls_info(info: &mut ServiceInfo, tls: &Option<TlsLog>) {
    let handshake = match tls.as_ref().and_then(|t| t.handshake_log.as_ref()) {
        Some(h) => h,
        None => return,
    };

    let mut tls_info = serde_json::Map::new();

    if let Some(hello) = &handshake.server_hello {
        if let Some(version) = &hello.version {
            tls_info.insert("version".to_string(), version.clone());
        }
        if let Some(cipher) = &hello.cipher_suite {
            tls_info.insert("cipher_suite".to_string(), cipher.clone());
        }
    }

    if let Some(certs) = &handshake.server_certificates {
        if let Some(parsed) = certs.certificate.as_ref().and_then(|c| c.parsed.as_ref()) {
            let mut cert_info = serde_json::Map::new();

            if let Some(cn) = parsed
                .subject
                .as_ref()
                .and_then(|s| s.common_name.as_ref())
                .and_then(|names| names.first())
            {
                cert_info.insert("subject_cn".to_string(), json!(cn));
            }
            if let Some(cn) = parsed
                .issuer
                .as_ref()
                .and_then(|s| s.common_name.as_ref())
                .and_then(|names| names.first())
            {
                cert_info.insert("issuer_cn".to_string(), json!(cn));
            }
            if let Some(from) = &parsed.validity_not_before {
                cert_info.insert("valid_from".to_string(), json!(from));
            }
            if let Some(until) = &parsed.validity_not_after {
                cert_info.insert("valid_until".to_string(), json!(until));
            }
            if let Some(names) = parsed
                .subject_alt_name
                .as_ref()
                .and_then(|san| san.dns_names.as_ref())
            {
                if !names.is_empty() {
                    cert_info.insert("san_dns".to_string(), json!(names));
                }
            }
            if let Some(algorithm) = &parsed.signature_algorithm {
                cert_info.insert("signature_algorithm".to_string(), algorithm.clone());
            }

            tls_info.insert("certificate".to_string(), Value::Object(cert_info));
        }

        if let Some(chain) = &certs.chain {
            tls_info.insert("chain_length".to_string(), json!(chain.len()));
        }
    }

    if !tls_info.is_empty() {
        info.add_extra("tls", Value::Object(tls_info));
    }
}

#[async_trait::async_trait]
impl FingerprintStrategy for ZgrabStrategy {
    fn name(&self) -> &'static str {
        "zgrab"
    }

    async fn fingerprint(&self, ip: IpAddr, port: u16) -> ServiceInfo {
        let module = module_for_port(port);
        let args = build_args(module, port);

        match self.run_zgrab(ip, &args).await {
            Ok(output) => {
                let mut info = parse_output(&output, module, port);
                if info.service_name.is_none() {
                    info.service_name = Some(default_service_name(port).to_string());
                }
                info
            }
            Err(e) => {
                debug!(
                    "{} failed for {}:{} ({}), using native prober",
                    self.command, ip, port, e
                );
                self.fallback.fingerprint(ip, port).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_module_for_port() {
        assert_eq!(module_for_port(22), "ssh");
        assert_eq!(module_for_port(465), "smtp");
        assert_eq!(module_for_port(993), "imap");
        assert_eq!(module_for_port(8443), "http");
        assert_eq!(module_for_port(49152), "banner");
    }

    #[test]
    fn test_build_args() {
        let args = build_args("http", 443);
        assert!(args.contains(&"--use-https".to_string()));
        assert!(args.contains(&"--max-redirects".to_string()));

        let args = build_args("http", 8080);
        assert!(!args.contains(&"--use-https".to_string()));

        let args = build_args("smtp", 465);
        assert!(args.contains(&"--smtps".to_string()));
        assert!(!args.contains(&"--starttls".to_string()));

        let args = build_args("smtp", 587);
        assert!(args.contains(&"--starttls".to_string()));

        let args = build_args("banner", 49152);
        assert!(args.contains(&"--probe".to_string()));
    }

    #[test]
    fn test_parse_ssh_output() {
        let raw = serde_json::json!({
            "ip": "10.0.0.5",
            "data": {
                "ssh": {
                    "status": "success",
                    "protocol": "ssh",
                    "result": {
                        "server_id": {
                            "raw": "SSH-2.0-OpenSSH_9.0",
                            "version": "2.0",
                            "software_version": "OpenSSH_9.0"
                        }
                    }
                }
            }
        });
        let output: ZgrabOutput = serde_json::from_value(raw).unwrap();
        let info = parse_output(&output, "ssh", 22);

        assert_eq!(info.service_name, Some("ssh".to_string()));
        assert_eq!(info.service_version, Some("OpenSSH_9.0".to_string()));
        assert_eq!(info.banner, Some("SSH-2.0-OpenSSH_9.0".to_string()));
        let extras = info.fingerprint_data.unwrap();
        assert_eq!(extras["protocol_version"], "2.0");
    }

    #[test]
    fn test_parse_http_output_with_tls() {
        let raw = serde_json::json!({
            "data": {
                "http": {
                    "status": "success",
                    "result": {
                        "response": {
                            "status_code": 200,
                            "status_line": "200 OK",
                            "headers": { "server": ["nginx/1.25.3"] },
                            "body": "<html><title>Hello</title></html>"
                        }
                    }
                }
            }
        });
        let output: ZgrabOutput = serde_json::from_value(raw).unwrap();
        let info = parse_output(&output, "http", 443);

        assert_eq!(info.service_name, Some("https".to_string()));
        assert_eq!(info.service_version, Some("nginx/1.25.3".to_string()));
        let extras = info.fingerprint_data.unwrap();
        assert_eq!(extras["status_code"], 200);
        assert_eq!(extras["title"], "Hello");
    }

    #[test]
    fn test_parse_failed_module_is_empty() {
        let raw = serde_json::json!({
            "data": {
                "ssh": { "status": "connection-timeout" }
            }
        });
        let output: ZgrabOutput = serde_json::from_value(raw).unwrap();
        let info = parse_output(&output, "ssh", 22);
        assert_eq!(info, ServiceInfo::default());
    }

    #[test]
    fn test_extract_tls_info() {
        let tls: TlsLog = serde_json::from_value(serde_json::json!({
            "handshake_log": {
                "server_hello": { "version": {"name": "TLSv1.3"}, "cipher_suite": {"name": "TLS_AES_128_GCM_SHA256"} },
                "server_certificates": {
                    "certificate": {
                        "parsed": {
                            "subject": { "common_name": ["example.internal"] },
                            "issuer": { "common_name": ["Internal CA"] },
                            "validity_not_before": "2026-01-01T00:00:00Z",
                            "validity_not_after": "2027-01-01T00:00:00Z",
                            "signature_algorithm": "SHA256-RSA",
                            "subject_alt_name": { "dns_names": ["example.internal", "www.example.internal"] }
                        }
                    },
                    "chain": [ { }, { } ]
                }
            }
        }))
        .unwrap();

        let mut info = ServiceInfo::default();
        extract_tls_info(&mut info, &Some(tls));

        let extras = info.fingerprint_data.unwrap();
        let tls_extra = &extras["tls"];
        assert_eq!(tls_extra["certificate"]["subject_cn"], "example.internal");
        assert_eq!(tls_extra["certificate"]["issuer_cn"], "Internal CA");
        assert_eq!(tls_extra["certificate"]["san_dns"][1], "www.example.internal");
        assert_eq!(tls_extra["chain_length"], 2);
        assert_eq!(tls_extra["version"]["name"], "TLSv1.3");
    }

    #[tokio::test]
    async fn test_fallback_matches_native_prober() {
        // A port that is definitely closed
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        let probe_timeout = Duration::from_millis(300);

        let delegated =
            ZgrabStrategy::new(probe_timeout).with_command("netsweep-test-no-such-binary");
        let native = NativeProber::new(probe_timeout);

        let from_fallback = delegated.fingerprint(ip, port).await;
        let from_native = native.fingerprint(ip, port).await;

        assert_eq!(from_fallback, from_native);
        assert_eq!(from_fallback.service_name, Some("unknown".to_string()));
    }
}
