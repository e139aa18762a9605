//! Service fingerprinting strategies
//!
//! A [`FingerprintStrategy`] turns one open endpoint into normalized
//! [`ServiceInfo`]. Fingerprinting is best-effort end to end: a dial
//! failure, a misbehaving service or a broken external tool never
//! produces an error, only an emptier result.

pub mod native;
pub mod zgrab;

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::net::IpAddr;

pub use native::NativeProber;
pub use zgrab::ZgrabStrategy;

/// Sanitized banners are capped at this many characters, plus the
/// truncation marker.
pub const MAX_BANNER_CHARS: usize = 512;

/// Normalized service metadata for one endpoint
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub banner: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint_data: Option<Map<String, Value>>,
}

impl ServiceInfo {
    /// Named service with nothing else known yet
    pub fn named(service: &str) -> Self {
        Self {
            service_name: Some(service.to_string()),
            ..Default::default()
        }
    }

    /// Insert one protocol-specific extra, creating the map on first use
    pub fn add_extra(&mut self, key: &str, value: Value) {
        self.fingerprint_data
            .get_or_insert_with(Map::new)
            .insert(key.to_string(), value);
    }
}

/// Pluggable fingerprinting logic
#[async_trait]
pub trait FingerprintStrategy: Send + Sync {
    /// Strategy name, for logs
    fn name(&self) -> &'static str;

    /// Identify the service behind `ip:port`. Never fails; collects
    /// whatever the endpoint gives up before any error.
    async fn fingerprint(&self, ip: IpAddr, port: u16) -> ServiceInfo;
}

/// Protocol probe selected for a port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProbeKind {
    Ftp,
    Ssh,
    Telnet,
    Smtp,
    Http { tls: bool },
    Pop3,
    Imap,
    Mysql,
    Postgres,
    Redis,
    Mongo,
    Banner,
}

lazy_static! {
    static ref PROBE_TABLE: HashMap<u16, ProbeKind> = {
        let mut table = HashMap::new();
        table.insert(21, ProbeKind::Ftp);
        table.insert(22, ProbeKind::Ssh);
        table.insert(23, ProbeKind::Telnet);
        for port in [25, 465, 587] {
            table.insert(port, ProbeKind::Smtp);
        }
        for port in [80, 8080, 8000, 8888] {
            table.insert(port, ProbeKind::Http { tls: false });
        }
        for port in [443, 8443] {
            table.insert(port, ProbeKind::Http { tls: true });
        }
        table.insert(110, ProbeKind::Pop3);
        table.insert(143, ProbeKind::Imap);
        table.insert(3306, ProbeKind::Mysql);
        table.insert(5432, ProbeKind::Postgres);
        table.insert(6379, ProbeKind::Redis);
        table.insert(27017, ProbeKind::Mongo);
        table
    };
}

/// Table-driven probe dispatch; unmapped ports get a generic banner grab
pub(crate) fn probe_for_port(port: u16) -> ProbeKind {
    PROBE_TABLE.get(&port).copied().unwrap_or(ProbeKind::Banner)
}

/// Fill in a missing service name: first from banner keywords, then
/// from the port default table, finally "unknown".
pub fn finalize(mut info: ServiceInfo, port: u16) -> ServiceInfo {
    if info.service_name.is_none() {
        if let Some(banner) = &info.banner {
            info.service_name = guess_service_from_banner(banner);
        }
    }

    if info.service_name.is_none() {
        info.service_name = Some(default_service_name(port).to_string());
    }

    info
}

/// Clean up raw banner text: trim, map line breaks and tabs to
/// spaces, drop everything non-printable, and hard-truncate.
/// Sanitizing already-sanitized text is a no-op.
pub fn sanitize_banner(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .filter_map(|c| match c {
            ' '..='~' => Some(c),
            '\n' | '\r' | '\t' => Some(' '),
            _ => None,
        })
        .collect();

    let mut out = cleaned.trim().to_string();
    if out.len() > MAX_BANNER_CHARS {
        out.truncate(MAX_BANNER_CHARS);
        out.push_str("...");
    }

    out
}

lazy_static! {
    static ref VERSION_PATTERNS: Vec<Regex> = vec![
        Regex::new(r"(\d+\.\d+(?:\.\d+)?(?:[.-]\w+)?)").unwrap(),
        Regex::new(r"v(\d+\.\d+(?:\.\d+)?)").unwrap(),
    ];
    static ref REDIS_VERSION: Regex = Regex::new(r"redis_version:(\S+)").unwrap();
}

/// Pull a version number out of banner text; first pattern match wins
pub fn extract_version(banner: &str) -> Option<String> {
    for pattern in VERSION_PATTERNS.iter() {
        if let Some(captures) = pattern.captures(banner) {
            if let Some(version) = captures.get(1) {
                return Some(version.as_str().to_string());
            }
        }
    }
    None
}

/// Software version from an SSH identification line like
/// `SSH-2.0-OpenSSH_9.0 Ubuntu-1`
pub fn ssh_software_version(banner: &str) -> Option<String> {
    if !banner.starts_with("SSH-") {
        return None;
    }
    let mut parts = banner.splitn(3, '-');
    parts.next()?;
    parts.next()?;
    let software = parts.next()?.trim();
    if software.is_empty() {
        None
    } else {
        Some(software.to_string())
    }
}

/// Guess the service from banner content, case-insensitively
pub fn guess_service_from_banner(banner: &str) -> Option<String> {
    let lower = banner.to_lowercase();

    let name = if lower.contains("ssh") {
        "ssh"
    } else if lower.contains("ftp") {
        "ftp"
    } else if lower.contains("smtp") || lower.contains("mail") {
        "smtp"
    } else if lower.contains("http") {
        "http"
    } else if lower.contains("mysql") {
        "mysql"
    } else if lower.contains("postgres") {
        "postgresql"
    } else if lower.contains("redis") {
        "redis"
    } else if lower.contains("mongo") {
        "mongodb"
    } else if lower.contains("imap") {
        "imap"
    } else if lower.contains("pop") {
        "pop3"
    } else if lower.contains("telnet") {
        "telnet"
    } else {
        return None;
    };

    Some(name.to_string())
}

/// Default service name for well-known ports
pub fn default_service_name(port: u16) -> &'static str {
    match port {
        21 => "ftp",
        22 => "ssh",
        23 => "telnet",
        25 => "smtp",
        53 => "dns",
        80 => "http",
        110 => "pop3",
        143 => "imap",
        443 => "https",
        445 => "smb",
        465 => "smtps",
        587 => "submission",
        993 => "imaps",
        995 => "pop3s",
        1433 => "mssql",
        1521 => "oracle",
        3306 => "mysql",
        3389 => "rdp",
        5432 => "postgresql",
        5900 => "vnc",
        6379 => "redis",
        8080 => "http-proxy",
        8443 => "https-alt",
        27017 => "mongodb",
        _ => "unknown",
    }
}

/// First `<title>` element of an HTML body, if any
pub fn extract_title(html: &str) -> Option<String> {
    let lower = html.to_lowercase();
    let start = lower.find("<title>")? + "<title>".len();
    let end = lower[start..].find("</title>")?;
    let title = html[start..start + end].trim();
    if title.is_empty() {
        None
    } else {
        Some(title.to_string())
    }
}

/// Capability keywords from a multi-line EHLO response
pub fn parse_ehlo_capabilities(ehlo: &str) -> Vec<String> {
    let mut caps = Vec::new();
    for line in ehlo.lines() {
        let line = line.trim();
        if line.len() > 4 {
            let bytes = line.as_bytes();
            if bytes[3] == b'-' || bytes[3] == b' ' {
                let cap = line[4..].trim();
                if !cap.is_empty() && !cap.to_lowercase().starts_with("250") {
                    caps.push(cap.to_string());
                }
            }
        }
    }
    caps
}

/// redis_version field from a Redis INFO response
pub fn redis_version_from_info(info: &str) -> Option<String> {
    REDIS_VERSION
        .captures(info)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}
