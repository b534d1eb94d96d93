//! Host address representation

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Host part of a destination: an IP address or a domain name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    Ip(IpAddr),
    Domain(String),
}

impl Address {
    /// Create from a domain name
    pub fn domain(domain: impl Into<String>) -> Self {
        Address::Domain(domain.into())
    }

    /// Create from raw IP octets (4 or 16 bytes)
    pub fn from_ip_bytes(bytes: &[u8]) -> Option<Self> {
        match bytes.len() {
            4 => {
                let mut octets = [0u8; 4];
                octets.copy_from_slice(bytes);
                Some(Address::Ip(IpAddr::V4(Ipv4Addr::from(octets))))
            }
            16 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(bytes);
                Some(Address::Ip(IpAddr::V6(Ipv6Addr::from(octets))))
            }
            _ => None,
        }
    }

    /// Parse a host string; IP literals become `Address::Ip`.
    pub fn parse(host: &str) -> Self {
        match host.parse::<IpAddr>() {
            Ok(ip) => Address::Ip(ip),
            Err(_) => Address::Domain(host.to_string()),
        }
    }

    pub fn is_domain(&self) -> bool {
        matches!(self, Address::Domain(_))
    }

    pub fn as_ip(&self) -> Option<IpAddr> {
        match self {
            Address::Ip(ip) => Some(*ip),
            Address::Domain(_) => None,
        }
    }

    pub fn as_domain(&self) -> Option<&str> {
        match self {
            Address::Domain(domain) => Some(domain),
            Address::Ip(_) => None,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ip(IpAddr::V6(ip)) => write!(f, "[{}]", ip),
            Address::Ip(ip) => write!(f, "{}", ip),
            Address::Domain(domain) => write!(f, "{}", domain),
        }
    }
}

impl From<IpAddr> for Address {
    fn from(ip: IpAddr) -> Self {
        Address::Ip(ip)
    }
}

impl From<&str> for Address {
    fn from(host: &str) -> Self {
        Address::parse(host)
    }
}
