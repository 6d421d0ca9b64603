//! Networking utilities for cluster provisioning.
//!
//! This library provides helpers for:
//! - Parsing and validating IPv4 CIDR ranges (service and pod networks)
//! - Enumerating host addresses inside a prefix
//! - Deriving the well-known addresses Kubernetes reserves in the service range

use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

use thiserror::Error;

/// Networking errors.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// Invalid IP address.
    #[error("invalid IP address: {0}")]
    InvalidAddress(String),

    /// Invalid CIDR prefix.
    #[error("invalid CIDR prefix: {0}")]
    InvalidPrefix(String),

    /// Requested host offset does not fit in the prefix.
    #[error("address pool exhausted: offset {offset} does not fit in {prefix}")]
    PoolExhausted { prefix: String, offset: u32 },
}

// ============================================================================
// IPv4 prefixes
// ============================================================================

/// IPv4 prefix (e.g. a service-cluster IP range).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Prefix {
    /// Network address of the prefix.
    pub address: Ipv4Addr,

    /// Prefix length (e.g., 16 for /16).
    pub prefix_len: u8,
}

impl Ipv4Prefix {
    /// Create a new prefix, masking host bits off the address.
    pub fn new(address: Ipv4Addr, prefix_len: u8) -> Result<Self, NetworkError> {
        if prefix_len > 32 {
            return Err(NetworkError::InvalidPrefix(format!(
                "prefix length {} exceeds 32",
                prefix_len
            )));
        }

        Ok(Self {
            address: mask_ipv4(address, prefix_len),
            prefix_len,
        })
    }

    /// Parse from CIDR notation (e.g., "10.43.0.0/16").
    pub fn from_cidr(s: &str) -> Result<Self, NetworkError> {
        let Some((addr_str, prefix_str)) = s.trim().split_once('/') else {
            return Err(NetworkError::InvalidPrefix(format!(
                "missing '/' in CIDR: {}",
                s
            )));
        };

        let address = Ipv4Addr::from_str(addr_str)
            .map_err(|_| NetworkError::InvalidAddress(addr_str.to_string()))?;

        let prefix_len = prefix_str
            .parse::<u8>()
            .map_err(|_| NetworkError::InvalidPrefix(prefix_str.to_string()))?;

        Self::new(address, prefix_len)
    }

    /// Check if an address is within this prefix.
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        mask_ipv4(addr, self.prefix_len) == self.address
    }

    /// Calculate the number of addresses in this prefix.
    pub fn size(&self) -> u64 {
        1u64 << (32 - u32::from(self.prefix_len))
    }

    /// The address `offset` positions after the network address.
    ///
    /// Offset 0 is the network address itself and is rejected, as is any
    /// offset that would land on or past the broadcast address.
    pub fn host(&self, offset: u32) -> Result<Ipv4Addr, NetworkError> {
        let size = self.size();
        if offset == 0 || u64::from(offset) + 1 >= size {
            return Err(NetworkError::PoolExhausted {
                prefix: self.to_string(),
                offset,
            });
        }

        let base = u32::from(self.address);
        Ok(Ipv4Addr::from(base + offset))
    }

    /// Check whether two prefixes share any address.
    pub fn overlaps(&self, other: &Ipv4Prefix) -> bool {
        let shorter = self.prefix_len.min(other.prefix_len);
        mask_ipv4(self.address, shorter) == mask_ipv4(other.address, shorter)
    }
}

impl std::fmt::Display for Ipv4Prefix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

impl FromStr for Ipv4Prefix {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_cidr(s)
    }
}

/// Mask an IPv4 address to a prefix length.
fn mask_ipv4(addr: Ipv4Addr, prefix_len: u8) -> Ipv4Addr {
    let bits = u32::from(addr);
    let mask = if prefix_len == 0 {
        0
    } else if prefix_len >= 32 {
        u32::MAX
    } else {
        u32::MAX << (32 - prefix_len)
    };
    Ipv4Addr::from(bits & mask)
}

// ============================================================================
// Kubernetes service network
// ============================================================================

/// Offset of the `kubernetes.default` service address in the service range.
pub const KUBERNETES_SERVICE_OFFSET: u32 = 1;

/// Offset of the cluster DNS service address in the service range.
pub const CLUSTER_DNS_OFFSET: u32 = 10;

/// Address the API server is reachable at through the `kubernetes` service.
pub fn kubernetes_service_ip(service_range: &Ipv4Prefix) -> Result<Ipv4Addr, NetworkError> {
    service_range.host(KUBERNETES_SERVICE_OFFSET)
}

/// Address kubelets hand to pods as their DNS resolver.
pub fn cluster_dns_ip(service_range: &Ipv4Prefix) -> Result<Ipv4Addr, NetworkError> {
    service_range.host(CLUSTER_DNS_OFFSET)
}

/// Parse a host address literal (IPv4 or IPv6).
pub fn parse_host_address(s: &str) -> Result<IpAddr, NetworkError> {
    IpAddr::from_str(s.trim()).map_err(|_| NetworkError::InvalidAddress(s.to_string()))
}
