use std::fmt;
use std::net;
use std::str::FromStr;

use serde::de::{self, Deserialize, Deserializer};
use serde::ser::{Serialize, Serializer};

/// Error returned when parsing addresses or CIDR blocks from their string
/// form.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AddrError {
    #[error("malformed IPv4 address: {0:?}")]
    MalformedAddress(String),

    #[error("malformed CIDR: {0:?}")]
    MalformedCidr(String),
}

/// An IPv4 address stored as a host-order u32. This keeps address arithmetic
/// (block stepping, masking, comparisons) cheap and branch-free.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Ipv4Addr(pub u32);

/// The zero address, used to detect unset `min`/`max` bounds in network
/// configurations.
pub const EMPTY_IPV4_ADDR: Ipv4Addr = Ipv4Addr(0);

impl Ipv4Addr {
    /// Returns the address incremented by `n`, saturating at the top of the
    /// address space.
    pub fn add(self, n: u32) -> Ipv4Addr {
        Ipv4Addr(self.0.saturating_add(n))
    }

    pub fn to_std(self) -> net::Ipv4Addr {
        net::Ipv4Addr::from(self.0)
    }

    pub fn from_std(ip: net::Ipv4Addr) -> Ipv4Addr {
        Ipv4Addr(u32::from(ip))
    }
}

impl fmt::Display for Ipv4Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.to_std().fmt(f)
    }
}

impl FromStr for Ipv4Addr {
    type Err = AddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ip: net::Ipv4Addr = s
            .parse()
            .map_err(|_| AddrError::MalformedAddress(s.to_string()))?;
        Ok(Ipv4Addr::from_std(ip))
    }
}

impl From<net::Ipv4Addr> for Ipv4Addr {
    fn from(ip: net::Ipv4Addr) -> Self {
        Ipv4Addr::from_std(ip)
    }
}

impl Serialize for Ipv4Addr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Ipv4Addr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// An IPv4 network in CIDR notation: a base address plus prefix length.
/// Serialized as the CIDR string in both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv4Net {
    pub ip: Ipv4Addr,
    pub size: u8,
}

impl Ipv4Net {
    pub fn new(ip: Ipv4Addr, size: u8) -> Ipv4Net {
        Ipv4Net { ip, size }
    }

    fn mask(&self) -> u32 {
        if self.size == 0 {
            0
        } else {
            u32::MAX << (32 - self.size)
        }
    }

    /// The number of addresses spanned by this prefix length.
    pub fn block_size(&self) -> u32 {
        1u32 << (32 - self.size)
    }

    /// The next adjacent network of the same size.
    pub fn next_network(&self) -> Ipv4Net {
        Ipv4Net {
            ip: self.ip.add(self.block_size()),
            size: self.size,
        }
    }

    /// The same network with the base address incremented by one. For an
    /// allocated block this is the gateway address of the block.
    pub fn next_addr(&self) -> Ipv4Net {
        Ipv4Net {
            ip: self.ip.add(1),
            size: self.size,
        }
    }

    /// Whether two networks overlap: both bases are masked to the shorter
    /// prefix and compared.
    pub fn overlap(&self, other: &Ipv4Net) -> bool {
        let mask = if self.size < other.size {
            self.mask()
        } else {
            other.mask()
        };
        (self.ip.0 & mask) == (other.ip.0 & mask)
    }
}

impl fmt::Display for Ipv4Net {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.ip, self.size)
    }
}

impl FromStr for Ipv4Net {
    type Err = AddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ip, size) = s
            .split_once('/')
            .ok_or_else(|| AddrError::MalformedCidr(s.to_string()))?;
        let ip: Ipv4Addr = ip
            .parse()
            .map_err(|_| AddrError::MalformedCidr(s.to_string()))?;
        let size: u8 = size
            .parse()
            .map_err(|_| AddrError::MalformedCidr(s.to_string()))?;
        if size > 32 {
            return Err(AddrError::MalformedCidr(s.to_string()));
        }
        Ok(Ipv4Net { ip, size })
    }
}

impl Serialize for Ipv4Net {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Ipv4Net {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}
