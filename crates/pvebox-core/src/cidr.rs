use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A validated CIDR block, e.g. `192.168.7.0/24`.
///
/// Parsing is strict: host bits set below the prefix are rejected, the
/// same way the hypervisor rejects them at subnet creation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Cidr(String);

/// Address range covered by a CIDR, normalized to u128 so v4 and v6
/// share one overlap test. Ranges in different families never overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct IpRange {
    v6: bool,
    start: u128,
    end: u128,
}

impl Cidr {
    pub fn new(text: &str) -> Result<Self> {
        parse_range(text)?;
        Ok(Self(text.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn overlaps(&self, other: &Cidr) -> bool {
        // Both sides were validated at construction.
        let a = parse_range(&self.0).expect("validated cidr");
        let b = parse_range(&other.0).expect("validated cidr");
        a.v6 == b.v6 && a.start <= b.end && b.start <= a.end
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Cidr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Cidr::new(s)
    }
}

impl TryFrom<String> for Cidr {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Cidr::new(&value)
    }
}

impl From<Cidr> for String {
    fn from(value: Cidr) -> Self {
        value.0
    }
}

fn parse_range(text: &str) -> Result<IpRange> {
    let (addr_part, prefix_part) = text
        .split_once('/')
        .ok_or_else(|| Error::Configuration(format!("invalid CIDR (missing prefix): {text}")))?;
    let addr: IpAddr = addr_part
        .parse()
        .map_err(|_| Error::Configuration(format!("invalid CIDR address: {text}")))?;
    let prefix: u32 = prefix_part
        .parse()
        .map_err(|_| Error::Configuration(format!("invalid CIDR prefix: {text}")))?;

    let (bits, value, v6) = match addr {
        IpAddr::V4(v4) => (32u32, u32::from(v4) as u128, false),
        IpAddr::V6(v6) => (128u32, u128::from(v6), true),
    };
    if prefix > bits {
        return Err(Error::Configuration(format!(
            "CIDR prefix /{prefix} out of range for {text}"
        )));
    }
    let host_bits = bits - prefix;
    let mask: u128 = if host_bits >= 128 {
        0
    } else {
        !0u128 >> host_bits << host_bits
    };
    // Constrain the mask to the address family width.
    let family_mask: u128 = if bits == 128 { !0u128 } else { (1u128 << bits) - 1 };
    let mask = mask & family_mask;
    if value & !mask & family_mask != 0 {
        return Err(Error::Configuration(format!(
            "CIDR has host bits set: {text}"
        )));
    }
    Ok(IpRange {
        v6,
        start: value,
        end: value | (!mask & family_mask),
    })
}

/// All overlapping pairs between two CIDR lists, in input order.
pub fn find_overlaps(left: &[Cidr], right: &[Cidr]) -> Vec<(Cidr, Cidr)> {
    let mut overlaps = Vec::new();
    for a in left {
        for b in right {
            if a.overlaps(b) {
                overlaps.push((a.clone(), b.clone()));
            }
        }
    }
    overlaps
}

/// Overlapping pairs within a single list (excluding each entry against
/// itself, but including duplicate entries).
pub fn find_self_overlaps(list: &[Cidr]) -> Vec<(Cidr, Cidr)> {
    let mut overlaps = Vec::new();
    for (i, a) in list.iter().enumerate() {
        for (j, b) in list.iter().enumerate() {
            if i != j && a.overlaps(b) {
                overlaps.push((a.clone(), b.clone()));
            }
        }
    }
    overlaps
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cidr(s: &str) -> Cidr {
        Cidr::new(s).unwrap()
    }

    #[test]
    fn test_parse_valid() {
        assert!(Cidr::new("192.168.2.0/24").is_ok());
        assert!(Cidr::new("10.0.0.0/8").is_ok());
        assert!(Cidr::new("fd00::/64").is_ok());
        assert!(Cidr::new("0.0.0.0/0").is_ok());
    }

    #[test]
    fn test_parse_rejects_host_bits() {
        assert!(Cidr::new("192.168.2.1/24").is_err());
        assert!(Cidr::new("fd00::1/64").is_err());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Cidr::new("192.168.2.0").is_err());
        assert!(Cidr::new("192.168.2.0/33").is_err());
        assert!(Cidr::new("notacidr/24").is_err());
    }

    #[test]
    fn test_overlap_nested() {
        assert!(cidr("10.0.0.0/8").overlaps(&cidr("10.1.0.0/16")));
        assert!(cidr("10.1.0.0/16").overlaps(&cidr("10.0.0.0/8")));
    }

    #[test]
    fn test_overlap_disjoint() {
        assert!(!cidr("192.168.2.0/24").overlaps(&cidr("192.168.3.0/24")));
    }

    #[test]
    fn test_overlap_identical() {
        assert!(cidr("192.168.2.0/24").overlaps(&cidr("192.168.2.0/24")));
    }

    #[test]
    fn test_no_cross_family_overlap() {
        // ::/0 spans the whole v6 space but must not collide with v4.
        assert!(!cidr("::/0").overlaps(&cidr("10.0.0.0/8")));
    }

    #[test]
    fn test_find_overlaps_reports_all_pairs() {
        let existing = vec![cidr("192.168.2.0/24"), cidr("10.0.0.0/8")];
        let proposed = vec![cidr("10.5.0.0/16"), cidr("172.16.0.0/12")];
        let pairs = find_overlaps(&existing, &proposed);
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].0.as_str(), "10.0.0.0/8");
        assert_eq!(pairs[0].1.as_str(), "10.5.0.0/16");
    }

    #[test]
    fn test_find_self_overlaps() {
        let list = vec![
            cidr("192.168.2.0/24"),
            cidr("192.168.2.0/25"),
            cidr("192.168.4.0/24"),
        ];
        let pairs = find_self_overlaps(&list);
        // Both orderings of the one colliding pair.
        assert_eq!(pairs.len(), 2);
    }

    #[test]
    fn test_find_self_overlaps_clean() {
        let list = vec![cidr("192.168.2.0/24"), cidr("192.168.3.0/24")];
        assert!(find_self_overlaps(&list).is_empty());
    }

    #[test]
    fn test_serde_round_trip() {
        let c = cidr("192.168.9.0/24");
        let json = serde_json::to_string(&c).unwrap();
        assert_eq!(json, "\"192.168.9.0/24\"");
        let back: Cidr = serde_json::from_str(&json).unwrap();
        assert_eq!(back, c);
    }

    #[test]
    fn test_serde_rejects_invalid() {
        let result: std::result::Result<Cidr, _> = serde_json::from_str("\"192.168.9.1/24\"");
        assert!(result.is_err());
    }
}
