//! Connection-time access control against an allow-list of addresses and CIDR ranges

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpMask {
    V4 { addr: Ipv4Addr, mask: u32 },
    V6 { addr: Ipv6Addr, mask: u128 },
}

impl IpMask {
    /// Parses `a.b.c.d`, `a.b.c.d/n` or their IPv6 equivalents.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        let (addr, prefix) = match value.rsplit_once('/') {
            Some((addr, prefix)) => (addr.trim(), Some(prefix.trim().parse::<u32>().ok()?)),
            None => (value, None),
        };

        match addr.parse::<IpAddr>().ok()? {
            IpAddr::V4(addr) => {
                let prefix = prefix.unwrap_or(32);
                if prefix > 32 {
                    return None;
                }
                Some(IpMask::V4 {
                    addr,
                    mask: u32::MAX.checked_shl(32 - prefix).unwrap_or(0),
                })
            }
            IpAddr::V6(addr) => {
                let prefix = prefix.unwrap_or(128);
                if prefix > 128 {
                    return None;
                }
                Some(IpMask::V6 {
                    addr,
                    mask: u128::MAX.checked_shl(128 - prefix).unwrap_or(0),
                })
            }
        }
    }

    pub fn matches(&self, remote: &IpAddr) -> bool {
        match self {
            IpMask::V4 { addr, mask } => {
                let remote = match remote {
                    IpAddr::V4(ip) => *ip,
                    IpAddr::V6(ip) => match ip.to_ipv4_mapped() {
                        Some(ip) => ip,
                        None => return false,
                    },
                };
                u32::from_be_bytes(remote.octets()) & mask
                    == u32::from_be_bytes(addr.octets()) & mask
            }
            IpMask::V6 { addr, mask } => {
                let remote = match remote {
                    IpAddr::V6(ip) => *ip,
                    IpAddr::V4(ip) => ip.to_ipv6_mapped(),
                };
                u128::from_be_bytes(remote.octets()) & mask
                    == u128::from_be_bytes(addr.octets()) & mask
            }
        }
    }
}

/// Ordered allow-list, immutable once loaded.
///
/// Entries that fail to parse are kept only as text: they never match, but
/// they still make the list non-empty.
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    entries: Vec<IpMask>,
    invalid: Vec<String>,
}

impl AllowList {
    /// Builds the list from a comma-separated setting such as
    /// `127.0.0.1,192.168.0.0/24`. Blank items are skipped.
    pub fn parse(value: &str) -> Self {
        let mut list = AllowList::default();
        for item in value.split(',').map(str::trim).filter(|item| !item.is_empty()) {
            match IpMask::parse(item) {
                Some(mask) => list.entries.push(mask),
                None => list.invalid.push(item.to_string()),
            }
        }
        list
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.invalid.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len() + self.invalid.len()
    }

    pub fn invalid_entries(&self) -> &[String] {
        &self.invalid
    }

    pub fn permits(&self, remote: &IpAddr) -> bool {
        self.is_empty() || self.entries.iter().any(|mask| mask.matches(remote))
    }
}

/// An empty list admits every peer.
pub fn permit(remote: &IpAddr, allow_list: &AllowList) -> bool {
    allow_list.permits(remote)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(value: &str) -> IpAddr {
        value.parse().unwrap()
    }

    #[test]
    fn test_ipmask() {
        for (mask, addr) in [
            ("10.0.0.0/8", "10.30.20.11"),
            ("10.0.0.0/8", "10.0.13.73"),
            ("192.168.1.1", "192.168.1.1"),
            ("192.168.0.0/24", "::ffff:192.168.0.42"),
            ("0.0.0.0/0", "203.0.113.9"),
            ("2001:db8::/32", "2001:db8:1::5"),
        ] {
            let mask = IpMask::parse(mask).unwrap();
            assert!(mask.matches(&ip(addr)), "{mask:?} should match {addr}");
        }

        for (mask, addr) in [
            ("10.0.0.0/8", "11.30.20.11"),
            ("192.168.1.1", "193.168.1.1"),
            ("192.168.0.0/24", "192.168.1.1"),
            ("2001:db8::/32", "2001:db9::1"),
        ] {
            let mask = IpMask::parse(mask).unwrap();
            assert!(!mask.matches(&ip(addr)), "{mask:?} should not match {addr}");
        }
    }

    #[test]
    fn test_ipmask_rejects_malformed() {
        for value in ["", "not-an-ip", "10.0.0.0/33", "10.0.0.0/x", "300.1.1.1", "::1/129"] {
            assert!(IpMask::parse(value).is_none(), "{value} should not parse");
        }
    }

    #[test]
    fn test_empty_list_allows_all() {
        let list = AllowList::parse("");
        assert!(list.is_empty());
        assert!(permit(&ip("10.0.0.5"), &list));
        assert!(permit(&ip("::1"), &list));

        let list = AllowList::parse(" , ,");
        assert!(list.is_empty());
    }

    #[test]
    fn test_literal_and_range_entries() {
        let list = AllowList::parse("127.0.0.1,192.168.0.0/24");
        assert_eq!(list.len(), 2);
        assert!(permit(&ip("127.0.0.1"), &list));
        assert!(permit(&ip("192.168.0.42"), &list));
        assert!(!permit(&ip("10.0.0.5"), &list));
        assert!(!permit(&ip("127.0.0.2"), &list));
    }

    #[test]
    fn test_malformed_entries_never_match() {
        let list = AllowList::parse("bogus, 10.0.0.0/99");
        assert!(!list.is_empty());
        assert_eq!(list.invalid_entries(), ["bogus", "10.0.0.0/99"]);
        assert!(!permit(&ip("10.0.0.1"), &list));

        let list = AllowList::parse("bogus,10.0.0.0/8");
        assert!(permit(&ip("10.0.0.1"), &list));
    }
}
