//! CIDR networks.
//!
//! Used by the source-ip policy condition and the IP black/allow list.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Error parsing an [`IpNet`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NetParseError {
    /// The address part is not an IP address.
    #[error("invalid address in network '{0}'")]
    Address(String),
    /// The prefix length is not a number or too large for the family.
    #[error("invalid prefix length in network '{0}'")]
    Prefix(String),
}

/// An IPv4 or IPv6 network: an address and a prefix length.
///
/// The address is stored with host bits cleared. A bare address parses as a
/// host network (`/32` or `/128`). IPv4-mapped IPv6 addresses are treated as
/// their IPv4 form when testing containment.
///
/// ```
/// use meridian_core::IpNet;
///
/// let net: IpNet = "10.0.0.0/8".parse().unwrap();
/// assert!(net.contains("10.1.2.3".parse().unwrap()));
/// assert!(!net.contains("192.168.1.1".parse().unwrap()));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IpNet {
    addr: IpAddr,
    prefix: u8,
}

impl IpNet {
    /// Builds a network, clearing host bits.
    pub fn new(addr: IpAddr, prefix: u8) -> Result<Self, NetParseError> {
        let addr = unmap(addr);
        let max = max_prefix(addr);
        if prefix > max {
            return Err(NetParseError::Prefix(format!("{addr}/{prefix}")));
        }
        Ok(Self {
            addr: mask(addr, prefix),
            prefix,
        })
    }

    /// A single-host network.
    #[must_use]
    pub fn host(addr: IpAddr) -> Self {
        let addr = unmap(addr);
        Self {
            addr,
            prefix: max_prefix(addr),
        }
    }

    /// The network address.
    #[must_use]
    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    /// The prefix length.
    #[must_use]
    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// Returns `true` if `ip` lies inside the network.
    #[must_use]
    pub fn contains(&self, ip: IpAddr) -> bool {
        let ip = unmap(ip);
        match (self.addr, ip) {
            (IpAddr::V4(_), IpAddr::V4(_)) | (IpAddr::V6(_), IpAddr::V6(_)) => {
                mask(ip, self.prefix) == self.addr
            }
            _ => false,
        }
    }
}

fn unmap(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(addr, IpAddr::V4),
        IpAddr::V4(_) => addr,
    }
}

const fn max_prefix(addr: IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

fn mask(addr: IpAddr, prefix: u8) -> IpAddr {
    match addr {
        IpAddr::V4(v4) => {
            let bits = u32::from(v4);
            let mask = u32::MAX.checked_shl(32 - u32::from(prefix)).unwrap_or(0);
            IpAddr::V4(Ipv4Addr::from(bits & mask))
        }
        IpAddr::V6(v6) => {
            let bits = u128::from(v6);
            let mask = u128::MAX.checked_shl(128 - u32::from(prefix)).unwrap_or(0);
            IpAddr::V6(Ipv6Addr::from(bits & mask))
        }
    }
}

impl FromStr for IpNet {
    type Err = NetParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (s, None),
        };
        let addr: IpAddr = addr
            .parse()
            .map_err(|_| NetParseError::Address(s.to_string()))?;
        match prefix {
            None => Ok(Self::host(addr)),
            Some(prefix) => {
                let prefix: u8 = prefix
                    .parse()
                    .map_err(|_| NetParseError::Prefix(s.to_string()))?;
                // A mapped address keeps its IPv6 prefix length.
                let prefix = match (addr, unmap(addr)) {
                    (IpAddr::V6(_), IpAddr::V4(_)) if prefix >= 96 => prefix - 96,
                    _ => prefix,
                };
                Self::new(addr, prefix).map_err(|_| NetParseError::Prefix(s.to_string()))
            }
        }
    }
}

impl fmt::Display for IpNet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

impl Serialize for IpNet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for IpNet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
