//! Sandbox-to-host link addressing.
//!
//! Each flight connects its namespace to the host through one veth pair with
//! a /31 point-to-point subnet carved out of `172.16.0.0/12`. The subnet is
//! derived from the port of an ephemeral TCP listener held for the flight's
//! lifetime: the kernel never hands the same port to two live listeners, so
//! concurrent flights on one host get distinct seeds.
//!
//! ```text
//!   seed (16 bit) ──<< 4──┐
//!                         ▼
//!   172.16.0.0  |  0000 ssss ssss ssss ssss 0000
//!                                             └─ low bit: 1 = inside, 0 = outside
//! ```

use std::net::{Ipv4Addr, TcpListener};

use fleet::FleetError;
use ipnet::Ipv4Net;
use tracing::debug;

use super::NetworkError;
use super::host::host_networks;

const VETH_BASE: Ipv4Addr = Ipv4Addr::new(172, 16, 0, 0);
const VETH_PREFIX_LEN: u8 = 31;
const MAX_SEED: u32 = 0xffff;

/// Ephemeral ports tried before giving up on finding a free subnet.
const MAX_SEED_ATTEMPTS: u32 = 32;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VethPairError {
    #[error("veth address {outside} collides with host network {network}")]
    AddressClash { outside: Ipv4Addr, network: Ipv4Net },

    #[error("invalid seed {0}: must be within 0-65535")]
    InvalidSeed(u32),
}

impl From<VethPairError> for FleetError {
    fn from(e: VethPairError) -> Self {
        match e {
            VethPairError::AddressClash { .. } => FleetError::AddressClash(e.to_string()),
            VethPairError::InvalidSeed(seed) => FleetError::InvalidSeed(seed),
        }
    }
}

/// Both ends of the sandbox uplink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VethPair {
    /// Namespace-side address, odd.
    pub inside: Ipv4Net,
    /// Host-side address, even; the namespace's default gateway.
    pub outside: Ipv4Net,
    pub inside_name: String,
    pub outside_name: String,
}

/// Derive the veth pair for `seed`, rejecting it if the host already routes
/// the outside address.
///
/// Pure: the same seed and host networks always give the same answer.
pub fn generate_veth_pair(
    seed: u32,
    host_networks: &[Ipv4Net],
) -> Result<VethPair, VethPairError> {
    if seed > MAX_SEED {
        return Err(VethPairError::InvalidSeed(seed));
    }

    let base = u32::from(VETH_BASE) | (seed << 4);
    let inside = Ipv4Addr::from(base | 1);
    let outside = Ipv4Addr::from(base & !1);

    if let Some(network) = host_networks.iter().find(|n| n.contains(&outside)) {
        return Err(VethPairError::AddressClash {
            outside,
            network: *network,
        });
    }

    Ok(VethPair {
        inside: Ipv4Net::new_assert(inside, VETH_PREFIX_LEN),
        outside: Ipv4Net::new_assert(outside, VETH_PREFIX_LEN),
        inside_name: veth_name(inside),
        outside_name: veth_name(outside),
    })
}

/// Interface name from the low 20 bits of an address, which is all the seed
/// can influence. Fits the kernel's 15-byte limit.
fn veth_name(addr: Ipv4Addr) -> String {
    format!("fl{:05x}", u32::from(addr) & 0xf_ffff)
}

/// Find a seed whose pair does not clash with the host.
///
/// Returns the pair and the listener backing its seed; the listener must be
/// held as long as the pair exists. Rejected listeners are kept open until
/// the search ends so the kernel cannot hand the same port back.
pub(crate) async fn allocate_veth_pair() -> Result<(VethPair, TcpListener), NetworkError> {
    let mut rejected = Vec::new();
    for _ in 0..MAX_SEED_ATTEMPTS {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        let seed = u32::from(listener.local_addr()?.port());
        let networks = host_networks().await?;
        match generate_veth_pair(seed, &networks) {
            Ok(pair) => {
                debug!(seed, inside = %pair.inside, outside = %pair.outside, "veth pair allocated");
                return Ok((pair, listener));
            }
            Err(e @ VethPairError::AddressClash { .. }) => {
                debug!(seed, error = %e, "seed rejected");
                rejected.push(listener);
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(NetworkError::SeedsExhausted(MAX_SEED_ATTEMPTS))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> Ipv4Net {
        s.parse().unwrap()
    }

    #[test]
    fn pair_differs_only_in_low_bit() {
        for seed in [0, 1, 2, 1234, 40000, 65535] {
            let pair = generate_veth_pair(seed, &[]).unwrap();
            let inside = u32::from(pair.inside.addr());
            let outside = u32::from(pair.outside.addr());
            assert_eq!(inside ^ outside, 1, "seed {seed}");
            assert_eq!(inside & 1, 1);
            assert_eq!(pair.inside.prefix_len(), 31);
            assert_eq!(pair.outside.prefix_len(), 31);
            assert!(net("172.16.0.0/12").contains(&pair.inside.addr()));
        }
    }

    #[test]
    fn known_seed_layout() {
        let pair = generate_veth_pair(0x1234, &[]).unwrap();
        assert_eq!(pair.inside, net("172.17.35.65/31"));
        assert_eq!(pair.outside, net("172.17.35.64/31"));
        assert_eq!(pair.inside_name, "fl12341");
        assert_eq!(pair.outside_name, "fl12340");
    }

    #[test]
    fn generation_is_deterministic() {
        let hosts = [net("10.0.0.0/8"), net("192.168.1.0/24")];
        assert_eq!(
            generate_veth_pair(4242, &hosts).unwrap(),
            generate_veth_pair(4242, &hosts).unwrap()
        );
    }

    #[test]
    fn distinct_seeds_give_distinct_pairs() {
        let a = generate_veth_pair(100, &[]).unwrap();
        let b = generate_veth_pair(101, &[]).unwrap();
        assert_ne!(a.inside, b.inside);
        assert_ne!(a.outside_name, b.outside_name);
    }

    #[test]
    fn clash_with_host_network_is_rejected() {
        let pair = generate_veth_pair(77, &[]).unwrap();
        let hosts = [net("192.168.0.0/16"), pair.outside.trunc()];
        assert_eq!(
            generate_veth_pair(77, &hosts),
            Err(VethPairError::AddressClash {
                outside: pair.outside.addr(),
                network: pair.outside.trunc(),
            })
        );
        // A broad route covering the whole block clashes for any seed.
        assert!(matches!(
            generate_veth_pair(9, &[net("172.16.0.0/12")]),
            Err(VethPairError::AddressClash { .. })
        ));
    }

    #[test]
    fn seed_out_of_range_is_rejected() {
        assert_eq!(
            generate_veth_pair(65536, &[]),
            Err(VethPairError::InvalidSeed(65536))
        );
        assert!(matches!(
            FleetError::from(VethPairError::InvalidSeed(70000)),
            FleetError::InvalidSeed(70000)
        ));
    }
}
