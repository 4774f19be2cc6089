//! IP prefix type with longest-prefix-match helpers.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// Clears every bit of `address` past the first `len` bits.
///
/// `len` is clamped to the address width.
pub fn mask_address(address: IpAddr, len: u8) -> IpAddr {
    match address {
        IpAddr::V4(v4) => {
            let len = len.min(32);
            let bits = u32::from(v4);
            let masked = if len == 0 { 0 } else { bits & (u32::MAX << (32 - len)) };
            IpAddr::V4(Ipv4Addr::from(masked))
        }
        IpAddr::V6(v6) => {
            let len = len.min(128);
            let bits = u128::from(v6);
            let masked = if len == 0 { 0 } else { bits & (u128::MAX << (128 - len)) };
            IpAddr::V6(Ipv6Addr::from(masked))
        }
    }
}

fn max_len(address: &IpAddr) -> u8 {
    match address {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

/// An IP prefix in CIDR notation (e.g., 10.0.0.0/24 or 2001:db8::/32).
///
/// Host bits are always cleared on construction, so `10.1.2.3/24` and
/// `10.1.2.0/24` compare and hash equal. Route tables rely on this to do
/// longest-prefix match with plain hash lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IpPrefix {
    address: IpAddr,
    prefix_len: u8,
}

impl IpPrefix {
    /// Creates a new IP prefix, masking host bits.
    ///
    /// # Errors
    ///
    /// Returns an error if the prefix length is invalid for the address type
    /// (>32 for IPv4, >128 for IPv6).
    pub fn new(address: IpAddr, prefix_len: u8) -> Result<Self, ParseError> {
        let max = max_len(&address);
        if prefix_len > max {
            return Err(ParseError::InvalidIpPrefix(format!(
                "prefix length {} exceeds maximum {} for address type",
                prefix_len, max
            )));
        }

        Ok(IpPrefix {
            address: mask_address(address, prefix_len),
            prefix_len,
        })
    }

    /// Returns the host prefix (/32 or /128) for an address.
    pub fn host(address: IpAddr) -> Self {
        IpPrefix {
            address,
            prefix_len: max_len(&address),
        }
    }

    /// Returns the default prefix (0.0.0.0/0 or ::/0) of the address family.
    pub fn default_for(address: &IpAddr) -> Self {
        let unspecified = match address {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        IpPrefix {
            address: unspecified,
            prefix_len: 0,
        }
    }

    /// Returns the prefix of length `len` that covers `address`.
    ///
    /// Returns `None` when `len` is too long for the address family.
    pub fn covering(address: IpAddr, len: u8) -> Option<Self> {
        Self::new(address, len).ok()
    }

    /// Returns the network address of this prefix.
    pub const fn address(&self) -> &IpAddr {
        &self.address
    }

    /// Returns the prefix length in bits.
    pub const fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Returns the maximum prefix length of this prefix's address family.
    pub fn max_len(&self) -> u8 {
        max_len(&self.address)
    }

    /// Returns true if this is an IPv4 prefix.
    pub const fn is_ipv4(&self) -> bool {
        self.address.is_ipv4()
    }

    /// Returns true if this is the default route (0.0.0.0/0 or ::/0).
    pub fn is_default(&self) -> bool {
        self.prefix_len == 0
    }

    /// Returns true if `address` falls inside this prefix.
    ///
    /// Addresses of the other family are never contained.
    pub fn contains(&self, address: &IpAddr) -> bool {
        if address.is_ipv4() != self.address.is_ipv4() {
            return false;
        }
        mask_address(*address, self.prefix_len) == self.address
    }
}

impl fmt::Display for IpPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

impl FromStr for IpPrefix {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr_str, len_str) = s
            .rsplit_once('/')
            .ok_or_else(|| ParseError::InvalidIpPrefix(s.to_string()))?;

        let address: IpAddr = addr_str
            .parse()
            .map_err(|_| ParseError::InvalidIpAddress(addr_str.to_string()))?;
        let prefix_len: u8 = len_str
            .parse()
            .map_err(|_| ParseError::InvalidIpPrefix(s.to_string()))?;

        IpPrefix::new(address, prefix_len)
    }
}

impl TryFrom<String> for IpPrefix {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<IpPrefix> for String {
    fn from(prefix: IpPrefix) -> Self {
        prefix.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_prefix_parse() {
        let prefix: IpPrefix = "10.0.0.0/24".parse().unwrap();
        assert!(prefix.is_ipv4());
        assert_eq!(prefix.prefix_len(), 24);

        let v6_prefix: IpPrefix = "2001:db8::/32".parse().unwrap();
        assert!(!v6_prefix.is_ipv4());
        assert_eq!(v6_prefix.prefix_len(), 32);
    }

    #[test]
    fn test_host_bits_are_masked() {
        let a: IpPrefix = "10.1.2.3/24".parse().unwrap();
        let b: IpPrefix = "10.1.2.0/24".parse().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "10.1.2.0/24");
    }

    #[test]
    fn test_contains() {
        let prefix: IpPrefix = "100.1.0.0/16".parse().unwrap();
        assert!(prefix.contains(&"100.1.1.4".parse().unwrap()));
        assert!(!prefix.contains(&"100.2.1.4".parse().unwrap()));
        assert!(!prefix.contains(&"::1".parse().unwrap()));

        let default: IpPrefix = "0.0.0.0/0".parse().unwrap();
        assert!(default.is_default());
        assert!(default.contains(&"8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn test_covering_and_host() {
        let addr: IpAddr = "8.8.8.8".parse().unwrap();
        assert_eq!(IpPrefix::host(addr).prefix_len(), 32);
        assert_eq!(
            IpPrefix::covering(addr, 8).unwrap().to_string(),
            "8.0.0.0/8"
        );
        assert!(IpPrefix::covering(addr, 33).is_none());
        assert_eq!(IpPrefix::default_for(&addr).to_string(), "0.0.0.0/0");
    }

    #[test]
    fn test_invalid_prefix_length() {
        assert!("10.0.0.0/33".parse::<IpPrefix>().is_err());
        assert!("2001:db8::/129".parse::<IpPrefix>().is_err());
        assert!("10.0.0.0".parse::<IpPrefix>().is_err());
    }

    #[test]
    fn test_string_round_trip() {
        let prefix: IpPrefix = "192.168.0.0/16".parse().unwrap();
        assert_eq!(String::from(prefix), "192.168.0.0/16");
        assert_eq!(IpPrefix::try_from("192.168.7.7/16".to_string()).unwrap(), prefix);
    }
}
