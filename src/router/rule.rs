//! Routing rules and their compiled matchers

use std::net::IpAddr;

use ipnet::IpNet;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::common::{Address, Destination, Network};
use crate::error::{Error, Result};

/// Routing rule as written in the configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Rule {
    /// "tcp", "udp" or "tcp,udp"
    pub network: Option<String>,
    /// Port pattern, e.g. "80", "80,443", "1000-2000"
    pub port: Option<String>,
    /// Domain patterns: plain substring, "domain:", "full:", "keyword:", "regexp:"
    pub domain: Vec<String>,
    /// Exact IPs or CIDRs
    pub ip: Vec<String>,
    /// Target outbound tag
    pub outbound_tag: String,
}

#[derive(Debug)]
enum DomainMatcher {
    /// Substring
    Plain(String),
    /// The domain itself or any subdomain
    Suffix(String),
    Full(String),
    Keyword(String),
    Regex(Regex),
}

impl DomainMatcher {
    fn compile(pattern: &str) -> Result<Self> {
        let matcher = if let Some(target) = pattern.strip_prefix("domain:") {
            DomainMatcher::Suffix(target.to_lowercase())
        } else if let Some(target) = pattern.strip_prefix("full:") {
            DomainMatcher::Full(target.to_lowercase())
        } else if let Some(keyword) = pattern.strip_prefix("keyword:") {
            DomainMatcher::Keyword(keyword.to_lowercase())
        } else if let Some(expr) = pattern.strip_prefix("regexp:") {
            let re = Regex::new(expr)
                .map_err(|e| Error::Config(format!("Invalid regexp '{}': {}", expr, e)))?;
            DomainMatcher::Regex(re)
        } else {
            DomainMatcher::Plain(pattern.to_lowercase())
        };
        Ok(matcher)
    }

    fn matches(&self, domain: &str) -> bool {
        match self {
            DomainMatcher::Plain(s) | DomainMatcher::Keyword(s) => domain.contains(s.as_str()),
            DomainMatcher::Suffix(s) => {
                domain == s
                    || (domain.len() > s.len()
                        && domain.ends_with(s.as_str())
                        && domain.as_bytes()[domain.len() - s.len() - 1] == b'.')
            }
            DomainMatcher::Full(s) => domain == s,
            DomainMatcher::Regex(re) => re.is_match(domain),
        }
    }
}

/// A rule with every pattern parsed up front.
#[derive(Debug)]
pub struct CompiledRule {
    networks: Vec<Network>,
    ports: Vec<(u16, u16)>,
    domains: Vec<DomainMatcher>,
    ips: Vec<IpNet>,
    outbound_tag: String,
}

impl Rule {
    pub fn compile(&self) -> Result<CompiledRule> {
        if self.outbound_tag.is_empty() {
            return Err(Error::Config("Rule without outbound_tag".into()));
        }
        Ok(CompiledRule {
            networks: match &self.network {
                Some(list) => parse_networks(list)?,
                None => Vec::new(),
            },
            ports: match &self.port {
                Some(pattern) => parse_ports(pattern)?,
                None => Vec::new(),
            },
            domains: self
                .domain
                .iter()
                .map(|p| DomainMatcher::compile(p))
                .collect::<Result<_>>()?,
            ips: self.ip.iter().map(|p| parse_ip(p)).collect::<Result<_>>()?,
            outbound_tag: self.outbound_tag.clone(),
        })
    }
}

impl CompiledRule {
    pub fn outbound_tag(&self) -> &str {
        &self.outbound_tag
    }

    /// All present constraints must hold.
    pub fn matches(&self, destination: &Destination) -> bool {
        if !self.networks.is_empty() && !self.networks.contains(&destination.network) {
            return false;
        }

        if !self.ports.is_empty()
            && !self
                .ports
                .iter()
                .any(|(from, to)| (*from..=*to).contains(&destination.port))
        {
            return false;
        }

        if self.domains.is_empty() && self.ips.is_empty() {
            return true;
        }

        match &destination.address {
            Address::Domain(domain) => {
                let domain = domain.to_lowercase();
                self.domains.iter().any(|m| m.matches(&domain))
            }
            Address::Ip(ip) => self.ips.iter().any(|net| net.contains(ip)),
        }
    }
}

fn parse_networks(list: &str) -> Result<Vec<Network>> {
    list.split(',')
        .map(|part| match part.trim().to_lowercase().as_str() {
            "tcp" => Ok(Network::Tcp),
            "udp" => Ok(Network::Udp),
            other => Err(Error::Config(format!("Unknown network '{}'", other))),
        })
        .collect()
}

fn parse_ports(pattern: &str) -> Result<Vec<(u16, u16)>> {
    let invalid = || Error::Config(format!("Invalid port pattern '{}'", pattern));
    pattern
        .split(',')
        .map(|part| {
            let part = part.trim();
            match part.split_once('-') {
                Some((from, to)) => {
                    let from = from.trim().parse::<u16>().map_err(|_| invalid())?;
                    let to = to.trim().parse::<u16>().map_err(|_| invalid())?;
                    if from > to {
                        return Err(invalid());
                    }
                    Ok((from, to))
                }
                None => {
                    let port = part.parse::<u16>().map_err(|_| invalid())?;
                    Ok((port, port))
                }
            }
        })
        .collect()
}

fn parse_ip(pattern: &str) -> Result<IpNet> {
    if pattern.contains('/') {
        pattern
            .parse::<IpNet>()
            .map_err(|e| Error::Config(format!("Invalid CIDR '{}': {}", pattern, e)))
    } else {
        let ip = pattern
            .parse::<IpAddr>()
            .map_err(|e| Error::Config(format!("Invalid IP '{}': {}", pattern, e)))?;
        let host_prefix = if ip.is_ipv4() { 32 } else { 128 };
        IpNet::new(ip, host_prefix).map_err(|e| Error::Config(format!("Invalid IP '{}': {}", pattern, e)))
    }
}
