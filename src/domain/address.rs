//! Address ranges: CIDR blocks as closed integer intervals
//!
//! CIDR text is parsed once at the boundary (via `ipnet`). Everything after that
//! is integer comparison on `[start, end]`.

use std::cmp::Ordering;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::domain::error::{DomainError, DomainResult};

/// Address family of a range. Ranges of different families never compare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    V4,
    V6,
}

impl Family {
    /// Number of address bits.
    pub fn width(self) -> u8 {
        match self {
            Family::V4 => 32,
            Family::V6 => 128,
        }
    }
}

/// A network prefix (`address/len`) with its interval bounds precomputed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Cidr {
    net: IpNet,
    start: u128,
    end: u128,
}

impl Cidr {
    /// Build from an `IpNet`, rejecting host bits below the mask.
    pub fn from_ipnet(net: IpNet) -> DomainResult<Self> {
        if net.trunc() != net {
            return Err(DomainError::InvalidCidr {
                input: net.to_string(),
                reason: format!("host bits set, network is {}", net.trunc()),
            });
        }
        let (family, start) = match net.network() {
            IpAddr::V4(a) => (Family::V4, u128::from(u32::from(a))),
            IpAddr::V6(a) => (Family::V6, u128::from(a)),
        };
        let end = start | host_mask(family, net.prefix_len());
        Ok(Self { net, start, end })
    }

    /// Build from a network address and prefix length.
    pub fn new(addr: IpAddr, len: u8) -> DomainResult<Self> {
        let net = IpNet::new(addr, len).map_err(|e| DomainError::InvalidCidr {
            input: format!("{addr}/{len}"),
            reason: e.to_string(),
        })?;
        Self::from_ipnet(net)
    }

    pub fn family(&self) -> Family {
        match self.net {
            IpNet::V4(_) => Family::V4,
            IpNet::V6(_) => Family::V6,
        }
    }

    /// First address of the range as an integer.
    pub fn start(&self) -> u128 {
        self.start
    }

    /// Last address of the range as an integer (inclusive).
    pub fn end(&self) -> u128 {
        self.end
    }

    pub fn mask_len(&self) -> u8 {
        self.net.prefix_len()
    }

    pub fn network(&self) -> IpAddr {
        self.net.network()
    }

    pub fn as_ipnet(&self) -> IpNet {
        self.net
    }

    /// Number of addresses covered (saturates for `::/0`).
    pub fn size(&self) -> u128 {
        (self.end - self.start).saturating_add(1)
    }

    /// Is `other` fully inside `self` (equality counts)?
    pub fn contains(&self, other: &Cidr) -> bool {
        self.family() == other.family() && self.start <= other.start && other.end <= self.end
    }

    /// Do the two ranges share at least one address?
    pub fn overlaps(&self, other: &Cidr) -> bool {
        self.family() == other.family() && self.start <= other.end && other.start <= self.end
    }

    /// Overlap where neither range contains the other.
    pub fn partially_overlaps(&self, other: &Cidr) -> bool {
        self.overlaps(other) && !self.contains(other) && !other.contains(self)
    }
}

fn host_mask(family: Family, len: u8) -> u128 {
    let bits = u32::from(family.width().saturating_sub(len));
    match bits {
        0 => 0,
        128 => u128::MAX,
        b => (1u128 << b) - 1,
    }
}

/// Ascending by family, then network address, then mask length (supernets first).
impl Ord for Cidr {
    fn cmp(&self, other: &Self) -> Ordering {
        self.family()
            .cmp(&other.family())
            .then(self.start.cmp(&other.start))
            .then(self.mask_len().cmp(&other.mask_len()))
    }
}

impl PartialOrd for Cidr {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl FromStr for Cidr {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let net: IpNet = trimmed.parse().map_err(|e: ipnet::AddrParseError| {
            DomainError::InvalidCidr {
                input: trimmed.to_string(),
                reason: e.to_string(),
            }
        })?;
        Self::from_ipnet(net)
    }
}

impl TryFrom<String> for Cidr {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Cidr> for String {
    fn from(value: Cidr) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.net)
    }
}
