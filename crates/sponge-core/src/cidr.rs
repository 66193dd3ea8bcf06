//! IPv4 CIDR blocks and subnet allocation.
//!
//! Subnets are carved out of a parent block by aligned, largest-first
//! packing. Because every block is placed at a multiple of its own size and
//! sizes only shrink as allocation proceeds, the packing never leaves gaps:
//! a request set fits exactly when the sum of its sizes fits.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ValidationError, ValidationResult};

/// An IPv4 network in CIDR notation with no host bits set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ipv4Cidr {
    base: u32,
    prefix: u8,
}

/// `10.0.0.0/16`, the block used by scaffolded environments.
pub const DEFAULT_BLOCK: Ipv4Cidr = Ipv4Cidr {
    base: 0x0A00_0000,
    prefix: 16,
};

impl Ipv4Cidr {
    pub fn new(addr: Ipv4Addr, prefix: u8) -> ValidationResult<Self> {
        let base = u32::from(addr);
        if prefix > 32 {
            return Err(invalid(format!("{addr}/{prefix}"), "prefix length exceeds 32"));
        }
        if base & !mask(prefix) != 0 {
            return Err(invalid(
                format!("{addr}/{prefix}"),
                "host bits are set below the prefix",
            ));
        }
        Ok(Self { base, prefix })
    }

    pub fn addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.base)
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// Number of addresses in the block.
    pub fn size(&self) -> u64 {
        1u64 << (32 - u32::from(self.prefix))
    }

    fn first(&self) -> u64 {
        u64::from(self.base)
    }

    fn last(&self) -> u64 {
        self.first() + self.size() - 1
    }

    /// True if `other` lies entirely inside this block.
    pub fn contains(&self, other: &Ipv4Cidr) -> bool {
        other.prefix >= self.prefix && other.first() >= self.first() && other.last() <= self.last()
    }

    pub fn overlaps(&self, other: &Ipv4Cidr) -> bool {
        self.first() <= other.last() && other.first() <= self.last()
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr(), self.prefix)
    }
}

impl FromStr for Ipv4Cidr {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| invalid(s.to_string(), "missing '/<prefix>'"))?;
        let addr: Ipv4Addr = addr
            .parse()
            .map_err(|_| invalid(s.to_string(), "not an IPv4 address"))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| invalid(s.to_string(), "prefix is not a number"))?;
        Ipv4Cidr::new(addr, prefix)
    }
}

impl TryFrom<String> for Ipv4Cidr {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Ipv4Cidr> for String {
    fn from(cidr: Ipv4Cidr) -> Self {
        cidr.to_string()
    }
}

/// A request for one subnet of a given prefix length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubnetRequest<K> {
    pub key: K,
    pub prefix: u8,
}

/// Carve one subnet per request out of `block`.
///
/// Requests are placed largest first; ties keep the caller's order. The
/// result is returned in the caller's order.
pub fn allocate<K: Clone>(
    block: Ipv4Cidr,
    requests: &[SubnetRequest<K>],
) -> ValidationResult<Vec<(K, Ipv4Cidr)>> {
    for req in requests {
        if req.prefix < block.prefix || req.prefix > 32 {
            return Err(ValidationError::PrefixExceedsBlock {
                requested: req.prefix,
                parent: block.to_string(),
            });
        }
    }

    let required: u64 = requests
        .iter()
        .map(|r| 1u64 << (32 - u32::from(r.prefix)))
        .sum();
    if required > block.size() {
        return Err(ValidationError::AddressSpaceExhausted {
            block: block.to_string(),
            required,
            available: block.size(),
        });
    }

    let mut order: Vec<usize> = (0..requests.len()).collect();
    order.sort_by_key(|&i| requests[i].prefix);

    let mut placed: Vec<Option<Ipv4Cidr>> = vec![None; requests.len()];
    let mut cursor = block.first();
    for i in order {
        let size = 1u64 << (32 - u32::from(requests[i].prefix));
        let start = cursor.div_ceil(size) * size;
        if start + size - 1 > block.last() {
            return Err(ValidationError::AddressSpaceExhausted {
                block: block.to_string(),
                required,
                available: block.size(),
            });
        }
        placed[i] = Some(Ipv4Cidr {
            base: start as u32,
            prefix: requests[i].prefix,
        });
        cursor = start + size;
    }

    Ok(requests
        .iter()
        .zip(placed)
        .filter_map(|(req, cidr)| cidr.map(|c| (req.key.clone(), c)))
        .collect())
}

/// Check that every subnet lies inside `block` and no two overlap.
pub fn check_partition(block: &Ipv4Cidr, subnets: &[Ipv4Cidr]) -> ValidationResult<()> {
    for subnet in subnets {
        if !block.contains(subnet) {
            return Err(ValidationError::SubnetOutsideBlock {
                subnet: subnet.to_string(),
                block: block.to_string(),
            });
        }
    }
    for (i, a) in subnets.iter().enumerate() {
        for b in &subnets[i + 1..] {
            if a.overlaps(b) {
                return Err(ValidationError::OverlappingSubnets {
                    a: a.to_string(),
                    b: b.to_string(),
                });
            }
        }
    }
    Ok(())
}

fn mask(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix))
    }
}

fn invalid(value: String, reason: &str) -> ValidationError {
    ValidationError::InvalidCidr {
        value,
        reason: reason.to_string(),
    }
}
