// IPv4 address math and the naming contract for kernel objects.
//
// Everything here is deterministic and pure: given the same inputs the same
// addresses and names come out, which is what makes re-running a partially
// applied command converge instead of drift.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Result, VpcError};

/// Interface name given to the namespace half of a subnet veth pair.
pub const NS_INTERFACE: &str = "eth0";

/// An IPv4 network in CIDR notation. The base address must be aligned to the
/// prefix; `10.0.1.5/24` is rejected rather than silently masked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cidr {
    base: u32,
    prefix: u8,
}

impl Cidr {
    pub fn parse(s: &str) -> Result<Self> {
        let (ip_part, prefix_part) = s
            .split_once('/')
            .ok_or_else(|| VpcError::Validation(format!("invalid CIDR '{}': missing prefix", s)))?;
        let ip: Ipv4Addr = ip_part
            .parse()
            .map_err(|e| VpcError::Validation(format!("invalid CIDR '{}': {}", s, e)))?;
        let prefix: u8 = prefix_part
            .parse()
            .map_err(|_| VpcError::Validation(format!("invalid prefix length in '{}'", s)))?;
        if prefix > 32 {
            return Err(VpcError::Validation(format!(
                "invalid prefix length /{} in '{}'",
                prefix, s
            )));
        }
        let base = u32::from(ip);
        if base & prefix_mask(prefix) != base {
            return Err(VpcError::Validation(format!(
                "CIDR '{}' has host bits set; expected a network base address",
                s
            )));
        }
        Ok(Self { base, prefix })
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.base)
    }

    /// First usable host address (network base + 1). The gateway by contract.
    pub fn first_usable(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.base + 1)
    }

    /// Second usable host address (network base + 2). The endpoint by contract.
    pub fn second_usable(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.base + 2)
    }

    /// Number of usable host addresses. Callers that hand out gateway and
    /// endpoint addresses must check this is at least 2 (prefix <= 30).
    pub fn usable_hosts(&self) -> u64 {
        let total = 1u64 << (32 - self.prefix);
        total.saturating_sub(2)
    }

    pub fn contains_ip(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & prefix_mask(self.prefix) == self.base
    }

    /// True when `other` lies entirely within `self` (equality counts).
    pub fn contains(&self, other: &Cidr) -> bool {
        other.prefix >= self.prefix && (other.base & prefix_mask(self.prefix)) == self.base
    }

    pub fn overlaps(&self, other: &Cidr) -> bool {
        self.contains(other) || other.contains(self)
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network(), self.prefix)
    }
}

impl FromStr for Cidr {
    type Err = VpcError;

    fn from_str(s: &str) -> Result<Self> {
        Cidr::parse(s)
    }
}

impl Serialize for Cidr {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Cidr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Cidr::parse(&s).map_err(serde::de::Error::custom)
    }
}

fn prefix_mask(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        (!0u32) << (32 - prefix)
    }
}

/// VPC and subnet names become interface and namespace names, so the charset
/// is restricted up front: `[a-z0-9-]{1,30}`.
pub fn validate_name(kind: &str, name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 30 {
        return Err(VpcError::Validation(format!(
            "{} name '{}' must be 1-30 characters",
            kind, name
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(VpcError::Validation(format!(
            "{} name '{}' may only contain lowercase letters, digits and '-'",
            kind, name
        )));
    }
    Ok(())
}

// Naming scheme. Fixed: tooling and tests key off these exact shapes.

pub fn bridge_name(vpc: &str) -> String {
    format!("br-{}", vpc)
}

pub fn namespace_name(vpc: &str, subnet: &str) -> String {
    format!("ns-{}-{}", vpc, subnet)
}

pub fn veth_host_name(vpc: &str, subnet: &str) -> String {
    format!("veth-{}-{}-h", vpc, subnet)
}

pub fn veth_ns_name(vpc: &str, subnet: &str) -> String {
    format!("veth-{}-{}-n", vpc, subnet)
}

/// Order a VPC pair lexicographically. Peering objects are named and owned by
/// the ordered pair regardless of which side the operator named first.
pub fn canonical_pair<'a>(x: &'a str, y: &'a str) -> (&'a str, &'a str) {
    if x <= y {
        (x, y)
    } else {
        (y, x)
    }
}

/// Peering veth leg names; the `-a` leg belongs to the lexicographically
/// first VPC of the pair.
pub fn peering_veth_names(a: &str, b: &str) -> (String, String) {
    debug_assert!(a < b);
    (
        format!("veth-peer-{}-{}-a", a, b),
        format!("veth-peer-{}-{}-b", a, b),
    )
}

/// Allocate the lowest free /30 from the reserved peering range
/// `192.168.<k>.0/30`, scanning the blocks already recorded in the store.
pub fn peering_block(in_use: &[Cidr]) -> Result<Cidr> {
    for k in 0u32..=255 {
        let candidate = Cidr {
            base: u32::from(Ipv4Addr::new(192, 168, k as u8, 0)),
            prefix: 30,
        };
        if !in_use.iter().any(|c| c.overlaps(&candidate)) {
            return Ok(candidate);
        }
    }
    Err(VpcError::Validation(
        "peering address pool 192.168.0.0/30..192.168.255.0/30 exhausted".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_prints_cidr() {
        let c = Cidr::parse("10.0.0.0/16").unwrap();
        assert_eq!(c.to_string(), "10.0.0.0/16");
        assert_eq!(c.prefix(), 16);
        assert_eq!(c.network(), Ipv4Addr::new(10, 0, 0, 0));
    }

    #[test]
    fn rejects_host_bits_and_bad_prefixes() {
        assert!(Cidr::parse("10.0.1.5/24").is_err());
        assert!(Cidr::parse("10.0.0.0/33").is_err());
        assert!(Cidr::parse("10.0.0.0").is_err());
        assert!(Cidr::parse("banana/8").is_err());
    }

    #[test]
    fn usable_addresses_follow_the_contract() {
        let c = Cidr::parse("10.0.1.0/24").unwrap();
        assert_eq!(c.first_usable(), Ipv4Addr::new(10, 0, 1, 1));
        assert_eq!(c.second_usable(), Ipv4Addr::new(10, 0, 1, 2));
        assert_eq!(c.usable_hosts(), 254);

        let tiny = Cidr::parse("192.168.0.0/30").unwrap();
        assert_eq!(tiny.usable_hosts(), 2);
        assert_eq!(tiny.first_usable(), Ipv4Addr::new(192, 168, 0, 1));
        assert_eq!(tiny.second_usable(), Ipv4Addr::new(192, 168, 0, 2));
    }

    #[test]
    fn containment_and_overlap() {
        let vpc = Cidr::parse("10.0.0.0/16").unwrap();
        let a = Cidr::parse("10.0.1.0/24").unwrap();
        let b = Cidr::parse("10.0.2.0/24").unwrap();
        let other = Cidr::parse("10.1.0.0/16").unwrap();

        assert!(vpc.contains(&a));
        assert!(!vpc.contains(&other));
        assert!(!a.overlaps(&b));
        assert!(vpc.overlaps(&a));
        assert!(a.contains_ip(Ipv4Addr::new(10, 0, 1, 200)));
        assert!(!a.contains_ip(Ipv4Addr::new(10, 0, 2, 1)));
    }

    #[test]
    fn peering_blocks_take_lowest_free_slot() {
        let first = peering_block(&[]).unwrap();
        assert_eq!(first.to_string(), "192.168.0.0/30");

        let second = peering_block(&[first]).unwrap();
        assert_eq!(second.to_string(), "192.168.1.0/30");

        // A hole left by a deleted peering is reused before new space.
        let third = peering_block(&[second]).unwrap();
        assert_eq!(third.to_string(), "192.168.0.0/30");
    }

    #[test]
    fn naming_contract_is_stable() {
        assert_eq!(bridge_name("prod"), "br-prod");
        assert_eq!(namespace_name("prod", "web"), "ns-prod-web");
        assert_eq!(veth_host_name("prod", "web"), "veth-prod-web-h");
        assert_eq!(veth_ns_name("prod", "web"), "veth-prod-web-n");

        assert_eq!(canonical_pair("w", "v"), ("v", "w"));
        let (a_leg, b_leg) = peering_veth_names("v", "w");
        assert_eq!(a_leg, "veth-peer-v-w-a");
        assert_eq!(b_leg, "veth-peer-v-w-b");
    }

    #[test]
    fn name_charset_is_enforced() {
        assert!(validate_name("vpc", "prod-1").is_ok());
        assert!(validate_name("vpc", "").is_err());
        assert!(validate_name("vpc", "Prod").is_err());
        assert!(validate_name("vpc", "a_b").is_err());
        assert!(validate_name("vpc", &"x".repeat(31)).is_err());
    }
}
