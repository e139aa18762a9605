//! Built-in port lists and batching constants

/// Highest TCP port number
pub const MAX_PORT: u16 = 65535;

/// Ports per batch when sweeping the full range. Batching only bounds
/// memory and log volume; results are identical to a port-by-port sweep.
pub const ALL_PORTS_BATCH_SIZE: usize = 1000;

/// Commonly exposed service ports, scanned when no explicit list is
/// configured.
pub fn common_ports() -> Vec<u16> {
    vec![
        21,    // FTP
        22,    // SSH
        23,    // Telnet
        25,    // SMTP
        53,    // DNS
        80,    // HTTP
        110,   // POP3
        143,   // IMAP
        443,   // HTTPS
        445,   // SMB
        993,   // IMAPS
        995,   // POP3S
        1433,  // MSSQL
        1521,  // Oracle
        3306,  // MySQL
        3389,  // RDP
        5432,  // PostgreSQL
        5900,  // VNC
        6379,  // Redis
        8080,  // HTTP Alt
        8443,  // HTTPS Alt
        27017, // MongoDB
    ]
}

/// The full 1-65535 range split into fixed-size batches.
pub fn all_port_batches() -> Vec<Vec<u16>> {
    let all: Vec<u16> = (1..=MAX_PORT).collect();
    all.chunks(ALL_PORTS_BATCH_SIZE)
        .map(|chunk| chunk.to_vec())
        .collect()
}
