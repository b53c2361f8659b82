//! Hardware (link-layer) addresses.
//!
//! Accepts EUI-48, EUI-64 and 20-octet InfiniBand addresses written with
//! `:` or `-` separators, or in dotted `aabb.ccdd.eeff` form.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

const VALID_LENGTHS: [usize; 3] = [6, 8, 20];

/// A hardware address of 6, 8 or 20 octets.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct HwAddr(Vec<u8>);

impl HwAddr {
    pub fn new(bytes: Vec<u8>) -> Result<Self> {
        if !VALID_LENGTHS.contains(&bytes.len()) {
            return Err(Error::InvalidHwAddr(format!(
                "unsupported address length {}",
                bytes.len()
            )));
        }
        Ok(Self(bytes))
    }

    /// The all-zero EUI-48 address identifying the discovery system.
    pub fn null() -> Self {
        Self(vec![0; 6])
    }

    pub fn is_null(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Address with `-` separators, as used in grub's `grub.cfg-01-...` probing.
    pub fn to_dashed(&self) -> String {
        self.to_string().replace(':', "-")
    }

    fn parse_groups(s: &str, separator: char) -> Result<Vec<u8>> {
        s.split(separator)
            .map(|group| {
                if group.len() != 2 {
                    return Err(Error::InvalidHwAddr(s.to_string()));
                }
                u8::from_str_radix(group, 16).map_err(|_| Error::InvalidHwAddr(s.to_string()))
            })
            .collect()
    }

    fn parse_dotted(s: &str) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        for group in s.split('.') {
            if group.len() != 4 {
                return Err(Error::InvalidHwAddr(s.to_string()));
            }
            let word =
                u16::from_str_radix(group, 16).map_err(|_| Error::InvalidHwAddr(s.to_string()))?;
            bytes.extend_from_slice(&word.to_be_bytes());
        }
        Ok(bytes)
    }
}

/// Sort and deduplicate addresses into canonical order: longer formats
/// first, then by raw byte value descending. The first element is the
/// primary address of a system.
pub fn canonicalize(mut addrs: Vec<HwAddr>) -> Vec<HwAddr> {
    addrs.sort();
    addrs.dedup();
    addrs
}

impl Ord for HwAddr {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .0
            .len()
            .cmp(&self.0.len())
            .then_with(|| other.0.cmp(&self.0))
    }
}

impl PartialOrd for HwAddr {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl FromStr for HwAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let bytes = if s.contains(':') {
            Self::parse_groups(s, ':')?
        } else if s.contains('-') {
            Self::parse_groups(s, '-')?
        } else if s.contains('.') {
            Self::parse_dotted(s)?
        } else {
            return Err(Error::InvalidHwAddr(s.to_string()));
        };
        HwAddr::new(bytes).map_err(|_| Error::InvalidHwAddr(s.to_string()))
    }
}

impl fmt::Display for HwAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, b) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for HwAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HwAddr({})", self)
    }
}

impl Serialize for HwAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for HwAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
