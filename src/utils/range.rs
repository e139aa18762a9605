//! Network range expansion
//!
//! Turns CIDR specifications into the concrete list of addresses a
//! scan will probe. Addresses are produced in numeric order over the
//! masked range; for ranges with more than two addresses the first and
//! last entry (network and broadcast by convention) are dropped.

use ipnetwork::IpNetwork;
use log::warn;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::error::{SweepError, SweepResult};

/// Expansion cap. Ranges larger than this are rejected rather than
/// exhausting memory with a single config line.
pub const MAX_RANGE_ADDRESSES: u64 = 65536;

/// Expand a single CIDR range into its usable addresses.
///
/// A bare address without a prefix parses as a host route and expands
/// to itself. Ranges of one or two addresses are returned whole.
pub fn expand_network(range: &str) -> SweepResult<Vec<IpAddr>> {
    let network: IpNetwork = range
        .trim()
        .parse()
        .map_err(|e| SweepError::InvalidRange(format!("{}: {}", range, e)))?;

    let mut addresses = match network {
        IpNetwork::V4(net) => {
            let host_bits = 32 - net.prefix();
            let count = 1u64 << host_bits;
            if count > MAX_RANGE_ADDRESSES {
                return Err(SweepError::InvalidRange(format!(
                    "{}: {} addresses exceeds the {} cap",
                    range, count, MAX_RANGE_ADDRESSES
                )));
            }

            let base = u32::from(net.network());
            (0..count as u32)
                .map(|i| IpAddr::V4(Ipv4Addr::from(base + i)))
                .collect::<Vec<_>>()
        }
        IpNetwork::V6(net) => {
            let host_bits = 128 - net.prefix();
            if host_bits > 16 {
                return Err(SweepError::InvalidRange(format!(
                    "{}: IPv6 prefixes shorter than /112 are not supported",
                    range
                )));
            }
            let count = 1u64 << host_bits;
            if count > MAX_RANGE_ADDRESSES {
                return Err(SweepError::InvalidRange(format!(
                    "{}: {} addresses exceeds the {} cap",
                    range, count, MAX_RANGE_ADDRESSES
                )));
            }

            let base = u128::from(net.network());
            (0..count as u128)
                .map(|i| IpAddr::V6(Ipv6Addr::from(base + i)))
                .collect::<Vec<_>>()
        }
    };

    // Drop network and broadcast addresses for real subnets
    if addresses.len() > 2 {
        addresses.remove(0);
        addresses.pop();
    }

    Ok(addresses)
}

/// Expand every configured range, skipping the ones that fail to
/// parse. One bad entry in a multi-range configuration must not stop
/// the others from being scanned.
pub fn expand_all(ranges: &[String]) -> Vec<IpAddr> {
    let mut targets = Vec::new();

    for range in ranges {
        match expand_network(range) {
            Ok(addresses) => targets.extend(addresses),
            Err(e) => warn!("Skipping range: {}", e),
        }
    }

    targets
}
