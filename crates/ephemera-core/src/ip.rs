//! Sequential IPv4 allocation inside a subnet.
//!
//! The allocator is not synchronized; its owner serializes access.

use std::net::Ipv4Addr;

use ephemera_common::error::{EphemeraError, Result};

/// Hands out consecutive addresses of an IPv4 subnet.
///
/// The first address returned is the one after the network address. The
/// caller is expected to discard it (gateway).
#[derive(Debug, Clone)]
pub struct IpAllocator {
    network: u32,
    mask: u32,
    last: u32,
    next: u32,
}

impl IpAllocator {
    /// Parses a CIDR block such as `10.0.0.0/24`.
    ///
    /// # Errors
    ///
    /// Returns `EphemeraError::Config` if the text is not an IPv4 CIDR.
    pub fn new(cidr: &str) -> Result<Self> {
        let invalid = |reason: &str| EphemeraError::Config {
            message: format!("invalid subnet {cidr}: {reason}"),
        };

        let (addr, prefix) = cidr.trim().split_once('/').ok_or_else(|| invalid("missing prefix"))?;
        let addr: Ipv4Addr = addr.parse().map_err(|_| invalid("bad address"))?;
        let prefix: u32 = prefix.parse().map_err(|_| invalid("bad prefix length"))?;
        if prefix > 32 {
            return Err(invalid("prefix length above 32"));
        }

        let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
        let network = u32::from(addr) & mask;
        let last = network | !mask;

        Ok(Self {
            network,
            mask,
            last,
            next: network.saturating_add(1),
        })
    }

    /// Returns the next free address, or `None` once the subnet is used up.
    ///
    /// The broadcast address is never returned. Exhaustion is permanent.
    pub fn next_ip(&mut self) -> Option<Ipv4Addr> {
        if self.next >= self.last || self.next & self.mask != self.network {
            return None;
        }
        let ip = Ipv4Addr::from(self.next);
        self.next = self.next.saturating_add(1);
        Some(ip)
    }

    /// Returns the subnet in CIDR notation.
    #[must_use]
    pub fn subnet(&self) -> String {
        format!("{}/{}", Ipv4Addr::from(self.network), self.mask.count_ones())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slash_30_yields_two_hosts_then_none() {
        let mut ips = IpAllocator::new("10.0.0.0/30").expect("parse");
        assert_eq!(ips.next_ip(), Some(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(ips.next_ip(), Some(Ipv4Addr::new(10, 0, 0, 2)));
        assert_eq!(ips.next_ip(), None);
        assert_eq!(ips.next_ip(), None);
    }

    #[test]
    fn host_bits_in_cidr_are_masked() {
        let mut ips = IpAllocator::new("172.18.3.77/16").expect("parse");
        assert_eq!(ips.subnet(), "172.18.0.0/16");
        assert_eq!(ips.next_ip(), Some(Ipv4Addr::new(172, 18, 0, 1)));
    }

    #[test]
    fn slash_32_has_no_hosts() {
        let mut ips = IpAllocator::new("192.168.1.1/32").expect("parse");
        assert_eq!(ips.next_ip(), None);
    }

    #[test]
    fn invalid_cidr_is_rejected() {
        assert!(IpAllocator::new("10.0.0.0").is_err());
        assert!(IpAllocator::new("10.0.0/24").is_err());
        assert!(IpAllocator::new("10.0.0.0/33").is_err());
    }
}
