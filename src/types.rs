use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    str::FromStr,
};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

// ─── Protocol ───────────────────────────────────────────────────────────────

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Relay,
}

impl Protocol {
    /// Protocols whose contact is this node's external IP plus a local port,
    /// and which therefore need a NAT port mapping when behind a router.
    pub fn advertises_external_ip(self) -> bool {
        match self {
            Protocol::Tcp | Protocol::Udp => true,
            Protocol::Relay => false,
        }
    }
}

pub const DEFAULT_PRIORITY: &[Protocol] = &[Protocol::Tcp, Protocol::Udp, Protocol::Relay];

// ─── HostAddr ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HostAddr {
    V4(Ipv4Addr),
    V6(Ipv6Addr),
    Domain(String),
}

#[derive(Debug, Error)]
pub enum HostAddrParseError {
    #[error("empty host")]
    EmptyHost,
}

impl FromStr for HostAddr {
    type Err = HostAddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.is_empty() {
            true => Err(HostAddrParseError::EmptyHost),
            false => {
                if let Ok(v4) = s.parse::<Ipv4Addr>() {
                    return Ok(HostAddr::V4(v4));
                }
                if let Ok(v6) = s.parse::<Ipv6Addr>() {
                    return Ok(HostAddr::V6(v6));
                }
                Ok(HostAddr::Domain(s.to_string()))
            }
        }
    }
}

impl fmt::Display for HostAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostAddr::V4(ip) => write!(f, "{ip}"),
            HostAddr::V6(ip) => write!(f, "{ip}"),
            HostAddr::Domain(d) => write!(f, "{d}"),
        }
    }
}

impl From<IpAddr> for HostAddr {
    fn from(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => HostAddr::V4(v4),
            IpAddr::V6(v6) => HostAddr::V6(v6),
        }
    }
}

// ─── ContactAddr ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContactAddr {
    pub host: HostAddr,
    pub port: u16,
}

#[derive(Debug, Error)]
pub enum ContactAddrParseError {
    #[error("missing port separator ':'")]
    MissingPort,
    #[error("empty host")]
    EmptyHost,
    #[error("invalid port: {0}")]
    InvalidPort(#[from] std::num::ParseIntError),
}

impl ContactAddr {
    pub fn new(host: impl Into<HostAddr>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match &self.host {
            HostAddr::V4(ip) => Some(SocketAddr::new(IpAddr::V4(*ip), self.port)),
            HostAddr::V6(ip) => Some(SocketAddr::new(IpAddr::V6(*ip), self.port)),
            HostAddr::Domain(_) => None,
        }
    }
}

impl FromStr for ContactAddr {
    type Err = ContactAddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port_str) = match s.strip_prefix('[') {
            Some(after_bracket) => after_bracket
                .split_once("]:")
                .ok_or(ContactAddrParseError::MissingPort)?,
            None => s
                .rsplit_once(':')
                .ok_or(ContactAddrParseError::MissingPort)?,
        };

        let port: u16 = port_str.parse()?;
        let host: HostAddr = host
            .parse()
            .map_err(|_| ContactAddrParseError::EmptyHost)?;

        Ok(Self { host, port })
    }
}

impl fmt::Display for ContactAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.host {
            HostAddr::V6(_) => write!(f, "[{}]:{}", self.host, self.port),
            HostAddr::V4(_) | HostAddr::Domain(_) => write!(f, "{}:{}", self.host, self.port),
        }
    }
}

impl From<SocketAddr> for ContactAddr {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl Serialize for ContactAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ContactAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ─── Contact ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Contact {
    pub protocol: Protocol,
    pub address: ContactAddr,
}

#[derive(Debug, Error)]
pub enum ContactParseError {
    #[error("missing scheme separator '://'")]
    MissingScheme,
    #[error("unknown protocol '{0}'")]
    UnknownProtocol(String),
    #[error("invalid address: {0}")]
    InvalidAddr(#[from] ContactAddrParseError),
}

impl Contact {
    pub fn new(protocol: Protocol, address: ContactAddr) -> Self {
        Self { protocol, address }
    }
}

impl FromStr for Contact {
    type Err = ContactParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = s
            .split_once("://")
            .ok_or(ContactParseError::MissingScheme)?;
        let protocol: Protocol = scheme
            .parse()
            .map_err(|_| ContactParseError::UnknownProtocol(scheme.to_string()))?;
        Ok(Self {
            protocol,
            address: rest.parse()?,
        })
    }
}

impl fmt::Display for Contact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.protocol, self.address)
    }
}
