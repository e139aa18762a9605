//! In-process protocol probes
//!
//! Each probe opens its own short-lived connection with an absolute
//! deadline, speaks just enough of the protocol to identify it, and
//! gives back whatever it managed to collect before anything failed.

use lazy_static::lazy_static;
use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode};
use regex::Regex;
use serde_json::Value;
use std::net::IpAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::{
    extract_title, extract_version, finalize, probe_for_port, redis_version_from_info,
    sanitize_banner, ssh_software_version, FingerprintStrategy, ProbeKind, ServiceInfo,
};

lazy_static! {
    static ref SERVER_HEADER: Regex = Regex::new(r"(?i)Server:\s*([^\r\n]+)").unwrap();
    static ref STATUS_CODE: Regex = Regex::new(r"HTTP/[\d.]+\s+(\d+)").unwrap();
}

/// Native fingerprinter. Read-only configuration, no state shared
/// between calls.
#[derive(Debug, Clone)]
pub struct NativeProber {
    timeout: Duration,
    max_banner: usize,
}

impl Default for NativeProber {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            max_banner: 1024,
        }
    }
}

impl NativeProber {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Default::default()
        }
    }

    async fn connect(&self, ip: IpAddr, port: u16) -> Option<TcpStream> {
        match timeout(self.timeout, TcpStream::connect((ip, port))).await {
            Ok(Ok(stream)) => Some(stream),
            _ => None,
        }
    }

    /// Read whatever the peer sends first, up to the banner cap
    async fn read_some(&self, stream: &mut TcpStream) -> Option<String> {
        let mut buf = vec![0u8; self.max_banner];
        match timeout(self.timeout, stream.read(&mut buf)).await {
            Ok(Ok(n)) if n > 0 => Some(String::from_utf8_lossy(&buf[..n]).to_string()),
            _ => None,
        }
    }

    /// Read a single greeting line
    async fn read_line(&self, stream: TcpStream) -> Option<String> {
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        match timeout(self.timeout, reader.read_line(&mut line)).await {
            Ok(Ok(n)) if n > 0 => Some(line),
            _ => None,
        }
    }

    /// Passive single-line banner services: connect, read the greeting,
    /// optionally pull a version out of a 2xx-style banner.
    async fn probe_greeting(
        &self,
        service: &str,
        ip: IpAddr,
        port: u16,
        version_prefix: Option<&str>,
    ) -> ServiceInfo {
        let mut info = ServiceInfo::named(service);

        let stream = match self.connect(ip, port).await {
            Some(s) => s,
            None => return info,
        };

        if let Some(line) = self.read_line(stream).await {
            info.banner = Some(sanitize_banner(&line));
            if let Some(prefix) = version_prefix {
                if line.starts_with(prefix) {
                    info.service_version = extract_version(&line);
                }
            }
        }

        info
    }

    async fn probe_ssh(&self, ip: IpAddr, port: u16) -> ServiceInfo {
        let mut info = ServiceInfo::named("ssh");

        let stream = match self.connect(ip, port).await {
            Some(s) => s,
            None => return info,
        };

        if let Some(line) = self.read_line(stream).await {
            info.banner = Some(sanitize_banner(&line));
            info.service_version = ssh_software_version(line.trim());
        }

        info
    }

    async fn probe_telnet(&self, ip: IpAddr, port: u16) -> ServiceInfo {
        let mut info = ServiceInfo::named("telnet");

        if let Some(mut stream) = self.connect(ip, port).await {
            if let Some(data) = self.read_some(&mut stream).await {
                info.banner = Some(sanitize_banner(&data));
            }
        }

        info
    }

    async fn probe_http(&self, ip: IpAddr, port: u16) -> ServiceInfo {
        let mut info = ServiceInfo::named("http");

        let mut stream = match self.connect(ip, port).await {
            Some(s) => s,
            None => return info,
        };

        let request = http_get_request(ip);
        if timeout(self.timeout, stream.write_all(request.as_bytes()))
            .await
            .map(|r| r.is_err())
            .unwrap_or(true)
        {
            return info;
        }

        if let Some(response) = self.read_some(&mut stream).await {
            apply_http_response(&mut info, &response);
        }

        info
    }

    /// HTTPS: the same GET over a TLS session with verification off.
    /// The handshake and exchange run synchronously on the underlying
    /// socket with read/write deadlines applied.
    async fn probe_https(&self, ip: IpAddr, port: u16) -> ServiceInfo {
        use std::io::{Read, Write};

        let mut info = ServiceInfo::named("https");

        let stream = match self.connect(ip, port).await {
            Some(s) => s,
            None => return info,
        };

        let std_stream = match stream.into_std() {
            Ok(s) => s,
            Err(_) => return info,
        };
        if std_stream.set_nonblocking(false).is_err() {
            return info;
        }
        let _ = std_stream.set_read_timeout(Some(self.timeout));
        let _ = std_stream.set_write_timeout(Some(self.timeout));

        let mut builder = match SslConnector::builder(SslMethod::tls()) {
            Ok(b) => b,
            Err(_) => return info,
        };
        builder.set_verify(SslVerifyMode::NONE);
        let connector = builder.build();

        let mut tls_stream = match connector.connect(&ip.to_string(), std_stream) {
            Ok(s) => s,
            Err(_) => return info,
        };

        let request = http_get_request(ip);
        if tls_stream.write_all(request.as_bytes()).is_err() {
            return info;
        }

        let mut buf = vec![0u8; self.max_banner];
        match tls_stream.read(&mut buf) {
            Ok(n) if n > 0 => {
                let response = String::from_utf8_lossy(&buf[..n]).to_string();
                apply_http_response(&mut info, &response);
            }
            _ => {}
        }

        info
    }

    async fn probe_mysql(&self, ip: IpAddr, port: u16) -> ServiceInfo {
        let mut info = ServiceInfo::named("mysql");

        let mut stream = match self.connect(ip, port).await {
            Some(s) => s,
            None => return info,
        };

        let mut buf = vec![0u8; self.max_banner];
        let n = match timeout(self.timeout, stream.read(&mut buf)).await {
            Ok(Ok(n)) => n,
            _ => return info,
        };

        // 4-byte packet header, 1 protocol byte, then a NUL-terminated
        // server version string
        if n > 5 {
            let start = 5;
            let end = buf[start..n]
                .iter()
                .position(|&b| b == 0)
                .map(|p| start + p)
                .unwrap_or(n);
            if end > start {
                let version = String::from_utf8_lossy(&buf[start..end]).to_string();
                info.banner = Some(format!("MySQL {}", version));
                info.service_version = Some(version);
            }
        }

        info
    }

    async fn probe_postgres(&self, ip: IpAddr, port: u16) -> ServiceInfo {
        let mut info = ServiceInfo::named("postgresql");

        let mut stream = match self.connect(ip, port).await {
            Some(s) => s,
            None => return info,
        };

        // SSLRequest message: length 8 + magic 80877103
        let ssl_request = [0u8, 0, 0, 8, 4, 210, 22, 47];
        if timeout(self.timeout, stream.write_all(&ssl_request))
            .await
            .map(|r| r.is_err())
            .unwrap_or(true)
        {
            return info;
        }

        let mut buf = [0u8; 1];
        if let Ok(Ok(n)) = timeout(self.timeout, stream.read(&mut buf)).await {
            if n > 0 {
                match buf[0] {
                    b'N' => info.banner = Some("PostgreSQL (SSL not supported)".to_string()),
                    b'S' => info.banner = Some("PostgreSQL (SSL supported)".to_string()),
                    _ => {}
                }
            }
        }

        info
    }

    async fn probe_redis(&self, ip: IpAddr, port: u16) -> ServiceInfo {
        let mut info = ServiceInfo::named("redis");

        let mut stream = match self.connect(ip, port).await {
            Some(s) => s,
            None => return info,
        };

        if timeout(self.timeout, stream.write_all(b"*1\r\n$4\r\nPING\r\n"))
            .await
            .map(|r| r.is_err())
            .unwrap_or(true)
        {
            return info;
        }

        let response = match self.read_some(&mut stream).await {
            Some(r) => r,
            None => return info,
        };

        if response.contains("PONG") {
            info.banner = Some("Redis server".to_string());
        } else if response.contains("NOAUTH") {
            info.banner = Some("Redis server (authentication required)".to_string());
        }

        if timeout(self.timeout, stream.write_all(b"*1\r\n$4\r\nINFO\r\n"))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
        {
            if let Some(reply) = self.read_some(&mut stream).await {
                info.service_version = redis_version_from_info(&reply);
            }
        }

        info
    }

    async fn probe_mongo(&self, ip: IpAddr, port: u16) -> ServiceInfo {
        let mut info = ServiceInfo::named("mongodb");

        let mut stream = match self.connect(ip, port).await {
            Some(s) => s,
            None => return info,
        };

        // MongoDB sends nothing unsolicited; a short passive read only
        // catches proxies that do
        let mut buf = vec![0u8; self.max_banner];
        match timeout(Duration::from_millis(500), stream.read(&mut buf)).await {
            Ok(Ok(n)) if n > 0 => {
                info.banner = Some(sanitize_banner(&String::from_utf8_lossy(&buf[..n])));
            }
            _ => info.banner = Some("MongoDB".to_string()),
        }

        info
    }

    async fn probe_generic(&self, ip: IpAddr, port: u16) -> ServiceInfo {
        let mut info = ServiceInfo::default();

        if let Some(mut stream) = self.connect(ip, port).await {
            if let Some(data) = self.read_some(&mut stream).await {
                info.banner = Some(sanitize_banner(&data));
            }
        }

        info
    }
}

fn http_get_request(ip: IpAddr) -> String {
    format!(
        "GET / HTTP/1.1\r\nHost: {}\r\nUser-Agent: netsweep/{}\r\nConnection: close\r\n\r\n",
        ip,
        env!("CARGO_PKG_VERSION")
    )
}

fn apply_http_response(info: &mut ServiceInfo, response: &str) {
    info.banner = Some(sanitize_banner(response));

    if let Some(captures) = SERVER_HEADER.captures(response) {
        info.service_version = Some(captures[1].trim().to_string());
    }

    if let Some(captures) = STATUS_CODE.captures(response) {
        info.add_extra("status_code", Value::String(captures[1].to_string()));
    }

    if let Some(title) = extract_title(response) {
        info.add_extra("title", Value::String(title));
    }
}

#[async_trait::async_trait]
impl FingerprintStrategy for NativeProber {
    fn name(&self) -> &'static str {
        "native"
    }

    async fn fingerprint(&self, ip: IpAddr, port: u16) -> ServiceInfo {
        let info = match probe_for_port(port) {
            ProbeKind::Ftp => self.probe_greeting("ftp", ip, port, Some("220")).await,
            ProbeKind::Ssh => self.probe_ssh(ip, port).await,
            ProbeKind::Telnet => self.probe_telnet(ip, port).await,
            ProbeKind::Smtp => self.probe_greeting("smtp", ip, port, Some("220")).await,
            ProbeKind::Http { tls: false } => self.probe_http(ip, port).await,
            ProbeKind::Http { tls: true } => self.probe_https(ip, port).await,
            ProbeKind::Pop3 => self.probe_greeting("pop3", ip, port, None).await,
            ProbeKind::Imap => self.probe_greeting("imap", ip, port, None).await,
            ProbeKind::Mysql => self.probe_mysql(ip, port).await,
            ProbeKind::Postgres => self.probe_postgres(ip, port).await,
            ProbeKind::Redis => self.probe_redis(ip, port).await,
            ProbeKind::Mongo => self.probe_mongo(ip, port).await,
            ProbeKind::Banner => self.probe_generic(ip, port).await,
        };

        finalize(info, port)
    }
}
