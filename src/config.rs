//! Configuration module for raycore
//!
//! JSON configuration in the V2Ray style: one default outbound, optional
//! tagged detours picked by the router, any number of VMess inbounds, and
//! inbound detours that spread one VMess inbound over a port range.
//!
//! ```json
//! {
//!   "log": { "level": "info" },
//!   "inbounds": [{
//!     "tag": "vmess-in", "port": 10086, "protocol": "vmess",
//!     "settings": { "users": [{ "id": "...", "alter_ids": 4, "level": 1, "email": "a@b.c" }] }
//!   }],
//!   "inbound_detours": [{
//!     "tag": "dynamic", "port_range": "10087-10090", "protocol": "vmess",
//!     "settings": { "users": [...] }
//!   }],
//!   "outbound": { "protocol": "freedom" },
//!   "outbound_detours": [{ "tag": "block", "protocol": "blackhole" }],
//!   "routing": { "rules": [{ "domain": ["domain:ads.example"], "outbound_tag": "block" }] }
//! }
//! ```

use std::collections::HashSet;
use std::fmt;
use std::ops::RangeInclusive;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::buf::PoolSizes;
use crate::error::{Error, Result};
use crate::protocol::vmess::{User, UserLevel};
use crate::router::{Rule, RuleRouter};

/// Upper bound on `routing.cache_ttl_secs` (one week)
pub const MAX_CACHE_TTL_SECS: u64 = 7 * 24 * 3600;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log configuration
    #[serde(default)]
    pub log: LogConfig,

    /// Idle buffers kept per size class
    #[serde(default)]
    pub buffers: PoolSizes,

    /// Inbound configurations
    #[serde(default)]
    pub inbounds: Vec<InboundConfig>,

    /// Inbounds listening on every port of a range, usually the target of
    /// another inbound's `detour_to`
    #[serde(default)]
    pub inbound_detours: Vec<InboundDetourConfig>,

    /// Default outbound
    pub outbound: OutboundConfig,

    /// Tagged outbounds the router can pick instead of the default
    #[serde(default)]
    pub outbound_detours: Vec<OutboundConfig>,

    /// Routing rules; without them everything uses the default outbound
    #[serde(default)]
    pub routing: Option<RoutingConfig>,
}

impl Config {
    /// Load configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;
        Self::from_json(&content)
    }

    /// Parse configuration from JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Check everything that serde cannot: ports, tag references, rules and
    /// protocol settings.
    pub fn validate(&self) -> Result<()> {
        let mut inbound_tags = HashSet::new();
        for inbound in &self.inbounds {
            if inbound.port == 0 {
                return Err(Error::Config(format!("Inbound [{}] has port 0", inbound.tag)));
            }
            if !inbound_tags.insert(inbound.tag.as_str()) {
                return Err(Error::Config(format!("Duplicate inbound tag: {}", inbound.tag)));
            }
            if inbound.settings.users.is_empty() {
                return Err(Error::Config(format!("Inbound [{}] has no users", inbound.tag)));
            }
        }
        for detour in &self.inbound_detours {
            if detour.port_range.from == 0 {
                return Err(Error::Config(format!("Inbound [{}] has port 0", detour.tag)));
            }
            if !inbound_tags.insert(detour.tag.as_str()) {
                return Err(Error::Config(format!("Duplicate inbound tag: {}", detour.tag)));
            }
            if detour.settings.users.is_empty() {
                return Err(Error::Config(format!("Inbound [{}] has no users", detour.tag)));
            }
            if detour.settings.detour_to.is_some() {
                return Err(Error::Config(format!(
                    "Inbound detour [{}] cannot detour again",
                    detour.tag
                )));
            }
        }
        for inbound in &self.inbounds {
            if let Some(target) = &inbound.settings.detour_to {
                if target == &inbound.tag || !inbound_tags.contains(target.as_str()) {
                    return Err(Error::Config(format!(
                        "Inbound [{}] detours to unknown inbound: {}",
                        inbound.tag, target
                    )));
                }
            }
        }

        let mut outbound_tags = HashSet::new();
        for outbound in std::iter::once(&self.outbound).chain(&self.outbound_detours) {
            if !outbound_tags.insert(outbound.tag.as_str()) {
                return Err(Error::Config(format!("Duplicate outbound tag: {}", outbound.tag)));
            }
            outbound.kind()?;
        }

        if let Some(routing) = &self.routing {
            let router = RuleRouter::new(&routing.rules)?;
            if let Some(tag) = router.outbound_tags().find(|t| !outbound_tags.contains(*t)) {
                return Err(Error::Config(format!("Rule targets unknown outbound: {}", tag)));
            }
            if routing.cache_ttl_secs > MAX_CACHE_TTL_SECS {
                return Err(Error::Config(format!(
                    "cache_ttl_secs {} exceeds {}",
                    routing.cache_ttl_secs, MAX_CACHE_TTL_SECS
                )));
            }
        }
        Ok(())
    }

    /// A minimal server configuration with one fresh user
    pub fn example() -> Self {
        Config {
            log: LogConfig::default(),
            buffers: PoolSizes::default(),
            inbounds: vec![InboundConfig {
                tag: "vmess-in".to_string(),
                port: 10086,
                protocol: InboundProtocol::Vmess,
                settings: VmessInboundSettings {
                    users: vec![VmessUser {
                        id: Uuid::new_v4(),
                        alter_ids: 16,
                        level: UserLevel(1),
                        email: "user@example.com".to_string(),
                    }],
                    detour_to: None,
                },
            }],
            inbound_detours: Vec::new(),
            outbound: OutboundConfig {
                tag: default_outbound_tag(),
                protocol: OutboundProtocol::Freedom,
                settings: serde_json::Value::Null,
            },
            outbound_detours: Vec::new(),
            routing: None,
        }
    }
}

/// Log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Inbound configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundConfig {
    /// Unique tag for this inbound
    pub tag: String,
    /// Listen port, on all interfaces
    pub port: u16,
    /// Protocol type
    pub protocol: InboundProtocol,
    /// Protocol-specific settings
    pub settings: VmessInboundSettings,
}

/// Inbound protocol types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InboundProtocol {
    Vmess,
}

/// VMess inbound settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmessInboundSettings {
    /// Allowed users
    pub users: Vec<VmessUser>,
    /// Tag of another inbound that clients are switched to
    #[serde(default)]
    pub detour_to: Option<String>,
}

/// A VMess inbound on every port of `port_range`. Each port gets its own
/// handler; switch-account commands pick a listening one at random.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundDetourConfig {
    pub tag: String,
    /// A single port (`10087`) or an inclusive range (`"10087-10090"`)
    pub port_range: PortRange,
    pub protocol: InboundProtocol,
    /// Same as a plain inbound, without `detour_to`
    pub settings: VmessInboundSettings,
}

/// Inclusive port range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "PortRangeValue", into = "PortRangeValue")]
pub struct PortRange {
    pub from: u16,
    pub to: u16,
}

impl PortRange {
    pub fn ports(&self) -> RangeInclusive<u16> {
        self.from..=self.to
    }
}

impl FromStr for PortRange {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::Config(format!("Invalid port range '{}'", s));
        let (from, to) = match s.split_once('-') {
            Some((from, to)) => (from.trim(), to.trim()),
            None => (s.trim(), s.trim()),
        };
        let from = from.parse::<u16>().map_err(|_| invalid())?;
        let to = to.parse::<u16>().map_err(|_| invalid())?;
        if from > to {
            return Err(invalid());
        }
        Ok(PortRange { from, to })
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.from == self.to {
            write!(f, "{}", self.from)
        } else {
            write!(f, "{}-{}", self.from, self.to)
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum PortRangeValue {
    Single(u16),
    Text(String),
}

impl TryFrom<PortRangeValue> for PortRange {
    type Error = Error;

    fn try_from(value: PortRangeValue) -> Result<Self> {
        match value {
            PortRangeValue::Single(port) => Ok(PortRange { from: port, to: port }),
            PortRangeValue::Text(text) => text.parse(),
        }
    }
}

impl From<PortRange> for PortRangeValue {
    fn from(range: PortRange) -> Self {
        if range.from == range.to {
            PortRangeValue::Single(range.from)
        } else {
            PortRangeValue::Text(range.to_string())
        }
    }
}

/// VMess user configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmessUser {
    /// User UUID
    pub id: Uuid,
    /// Number of alter IDs derived from `id`
    #[serde(default)]
    pub alter_ids: u16,
    #[serde(default)]
    pub level: UserLevel,
    /// User email (for logging and detour lookup)
    #[serde(default)]
    pub email: String,
}

impl VmessUser {
    pub fn to_user(&self) -> User {
        User::new(self.id, self.alter_ids, self.level, self.email.clone())
    }
}

/// Outbound configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundConfig {
    /// Unique tag for this outbound
    #[serde(default = "default_outbound_tag")]
    pub tag: String,
    /// Protocol type
    pub protocol: OutboundProtocol,
    /// Protocol-specific settings, interpreted by [`OutboundConfig::kind`]
    #[serde(default)]
    pub settings: serde_json::Value,
}

fn default_outbound_tag() -> String {
    "default".to_string()
}

/// Outbound protocol types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboundProtocol {
    Freedom,
    Blackhole,
    Vmess,
}

/// An outbound with its settings parsed for its protocol
#[derive(Debug, Clone)]
pub enum OutboundKind {
    Freedom,
    Blackhole,
    Vmess(VmessOutboundSettings),
}

impl OutboundConfig {
    pub fn kind(&self) -> Result<OutboundKind> {
        match self.protocol {
            OutboundProtocol::Freedom => Ok(OutboundKind::Freedom),
            OutboundProtocol::Blackhole => Ok(OutboundKind::Blackhole),
            OutboundProtocol::Vmess => {
                let settings: VmessOutboundSettings = serde_json::from_value(self.settings.clone())
                    .map_err(|e| {
                        Error::Config(format!("Invalid vmess settings for [{}]: {}", self.tag, e))
                    })?;
                settings.validate(&self.tag)?;
                Ok(OutboundKind::Vmess(settings))
            }
        }
    }
}

/// VMess outbound settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmessOutboundSettings {
    pub servers: Vec<VmessServer>,
}

impl VmessOutboundSettings {
    fn validate(&self, tag: &str) -> Result<()> {
        if self.servers.is_empty() {
            return Err(Error::Config(format!("Outbound [{}] has no servers", tag)));
        }
        for server in &self.servers {
            if server.port == 0 || server.address.is_empty() {
                return Err(Error::Config(format!(
                    "Outbound [{}] has an invalid server: {}:{}",
                    tag, server.address, server.port
                )));
            }
            if server.users.is_empty() {
                return Err(Error::Config(format!(
                    "Outbound [{}] server {} has no users",
                    tag, server.address
                )));
            }
        }
        Ok(())
    }
}

/// A VMess server and the accounts to use with it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmessServer {
    /// IP literal or domain name
    pub address: String,
    pub port: u16,
    pub users: Vec<VmessUser>,
}

/// Routing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Ordered rules; the first match wins
    #[serde(default)]
    pub rules: Vec<Rule>,
    /// How long a routing decision is cached
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

fn default_cache_ttl_secs() -> u64 {
    3600
}
