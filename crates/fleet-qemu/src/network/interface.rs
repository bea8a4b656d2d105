use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use ipnet::{Ipv4Net, Ipv6Net};

/// Lease index of the segment's bridge; machines get the rest.
pub const BRIDGE_INDEX: u8 = 1;
/// Highest lease index in a /24.
pub const MAX_INDEX: u8 = 254;

/// A locally administered MAC address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddr(pub [u8; 6]);

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

/// One (MAC, IPv4, IPv6) lease.
///
/// Everything is a function of the segment byte and the index:
///
/// | field | value                   |
/// |-------|-------------------------|
/// | MAC   | `02:00:00:00:{s}:{i}`   |
/// | IPv4  | `10.{s}.0.{i}/24`       |
/// | IPv6  | `fd00:0:0:{s}::{i}/64`  |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    pub segment: u8,
    pub index: u8,
    pub mac: MacAddr,
    pub ipv4: Ipv4Net,
    pub ipv6: Ipv6Net,
}

impl Interface {
    pub fn new(segment: u8, index: u8) -> Self {
        let ipv4 = Ipv4Addr::new(10, segment, 0, index);
        let ipv6 = Ipv6Addr::new(0xfd00, 0, 0, u16::from(segment), 0, 0, 0, u16::from(index));
        Self {
            segment,
            index,
            mac: MacAddr([0x02, 0, 0, 0, segment, index]),
            ipv4: Ipv4Net::new_assert(ipv4, 24),
            ipv6: Ipv6Net::new_assert(ipv6, 64),
        }
    }

    /// Name used for the lease in DNS.
    pub fn hostname(&self) -> String {
        format!("host-{}-{}", self.segment, self.index)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn layout() {
        let i = Interface::new(3, 17);
        assert_eq!(i.mac.to_string(), "02:00:00:00:03:11");
        assert_eq!(i.ipv4.to_string(), "10.3.0.17/24");
        assert_eq!(i.ipv6.to_string(), "fd00:0:0:3::11/64");
        assert_eq!(i.hostname(), "host-3-17");
    }

    #[test]
    fn generation_is_injective() {
        let mut macs = HashSet::new();
        let mut v4 = HashSet::new();
        let mut v6 = HashSet::new();
        for segment in 0..=4u8 {
            for index in BRIDGE_INDEX..=MAX_INDEX {
                let i = Interface::new(segment, index);
                assert!(macs.insert(i.mac), "duplicate MAC {}", i.mac);
                assert!(v4.insert(i.ipv4.addr()), "duplicate IPv4 {}", i.ipv4);
                assert!(v6.insert(i.ipv6.addr()), "duplicate IPv6 {}", i.ipv6);
            }
        }
    }

    #[test]
    fn mac_is_locally_administered_unicast() {
        let i = Interface::new(0, 2);
        assert_eq!(i.mac.0[0] & 0b11, 0b10);
    }
}
