use parking_lot::Mutex;

use super::interface::{BRIDGE_INDEX, Interface, MAX_INDEX};

/// One bridge inside the flight namespace and its pool of leases.
///
/// Segments carry no uplink of their own. A flight has a single veth pair
/// to the host, and its seed port listener, shared by every segment; each
/// bridge reaches it through the namespace's MASQUERADE rule.
#[derive(Debug)]
pub struct Segment {
    name: String,
    bridge: Interface,
    leases: Vec<Interface>,
    cursor: Mutex<usize>,
}

impl Segment {
    /// Segment `index` with up to `num_leases` machine leases.
    ///
    /// The pool is capped at what fits in the segment's /24.
    pub fn new(index: u8, num_leases: usize) -> Self {
        let leases = (BRIDGE_INDEX + 1..=MAX_INDEX)
            .take(num_leases)
            .map(|i| Interface::new(index, i))
            .collect();
        Self {
            name: format!("br{index}"),
            bridge: Interface::new(index, BRIDGE_INDEX),
            leases,
            cursor: Mutex::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Gateway, DHCP server and DNS server of the segment.
    pub fn bridge(&self) -> &Interface {
        &self.bridge
    }

    /// Every lease, handed out or not.
    pub fn leases(&self) -> &[Interface] {
        &self.leases
    }

    /// Hand out the next unused lease.
    pub(crate) fn next_interface(&self) -> Option<Interface> {
        let mut cursor = self.cursor.lock();
        let lease = self.leases.get(*cursor)?.clone();
        *cursor += 1;
        Some(lease)
    }
}

/// Take the next lease of the segment called `name`.
///
/// # Panics
///
/// If no segment has that name or its pool is exhausted. Both mean the
/// flight was sized wrong by its caller.
#[allow(clippy::panic)]
pub(crate) fn lease_from(segments: &[Segment], name: &str) -> Interface {
    let Some(segment) = segments.iter().find(|s| s.name() == name) else {
        panic!("unknown network segment {name:?}");
    };
    match segment.next_interface() {
        Some(interface) => interface,
        None => panic!("network segment {name:?} has no free leases"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leases_skip_bridge_and_are_handed_out_once() {
        let seg = Segment::new(0, 3);
        assert_eq!(seg.name(), "br0");
        assert_eq!(seg.bridge().ipv4.to_string(), "10.0.0.1/24");
        let got: Vec<_> = std::iter::from_fn(|| seg.next_interface())
            .map(|i| i.ipv4.addr().to_string())
            .collect();
        assert_eq!(got, ["10.0.0.2", "10.0.0.3", "10.0.0.4"]);
        assert!(seg.next_interface().is_none());
    }

    #[test]
    fn pool_is_capped_by_subnet() {
        let seg = Segment::new(1, 10_000);
        assert_eq!(seg.leases().len(), 253);
        assert_eq!(seg.leases().last().unwrap().ipv4.to_string(), "10.1.0.254/24");
    }

    #[test]
    fn lease_from_picks_segment_by_name() {
        let segments = [Segment::new(0, 2), Segment::new(1, 2)];
        assert_eq!(lease_from(&segments, "br1").ipv4.to_string(), "10.1.0.2/24");
        assert_eq!(lease_from(&segments, "br0").ipv4.to_string(), "10.0.0.2/24");
        assert_eq!(lease_from(&segments, "br1").ipv4.to_string(), "10.1.0.3/24");
    }

    #[test]
    #[should_panic(expected = "has no free leases")]
    fn lease_from_exhausted_pool_aborts() {
        let segments = [Segment::new(0, 1)];
        lease_from(&segments, "br0");
        lease_from(&segments, "br0");
    }

    #[test]
    #[should_panic(expected = "unknown network segment")]
    fn lease_from_unknown_segment_aborts() {
        let segments = [Segment::new(0, 1)];
        lease_from(&segments, "br7");
    }
}
