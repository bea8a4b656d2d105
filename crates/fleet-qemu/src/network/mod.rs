//! Virtual LAN inside a flight's namespace.
//!
//! ```text
//!   ┌──────────────── flight namespace ─────────────────┐
//!   │  tap-a ─┐                                          │
//!   │  tap-b ─┼─ br0 10.0.0.1/24 ── dnsmasq, services    │
//!   │  tap-c ─┘        │                                 │
//!   │              MASQUERADE                            │
//!   │                  │ fl12341  172.17.35.65/31        │
//!   └──────────────────┼─────────────────────────────────┘
//!                      │ fl12340  172.17.35.64/31
//!                  MASQUERADE (comment = namespace name)
//!                      ↓
//!               default host interface
//! ```

mod dnsmasq;
mod error;
mod host;
mod interface;
mod iptables;
mod segment;
mod veth;

use std::net::{IpAddr, TcpListener};
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use fleet::retry_conditional;
use tokio::process::Child;
use tracing::{info, warn};

pub use error::{NetworkError, Result};
pub use interface::{Interface, MacAddr};
pub use segment::Segment;
pub use veth::{VethPair, VethPairError, generate_veth_pair};

use crate::command::{CommandError, exec, exec_ignore_errors};
use crate::netns::NetNs;
use crate::process::{forward_output, terminate};

const TAP_ATTEMPTS: u32 = 5;
const TAP_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Bridged segments, their DHCP/DNS server and the NAT uplink to the host.
pub struct VirtualLan {
    ns: Arc<NetNs>,
    segments: Vec<Segment>,
    /// One uplink per flight, shared by every segment.
    uplink: VethPair,
    /// Holds the port the uplink addresses were derived from.
    _seed: TcpListener,
    dnsmasq: tokio::sync::Mutex<Option<Child>>,
}

impl VirtualLan {
    /// Build `num_segments` bridges in `ns`, connect `ns` to the host and
    /// start dnsmasq with its config under `work_dir`.
    pub async fn new(
        ns: Arc<NetNs>,
        num_segments: u8,
        leases_per_segment: usize,
        work_dir: &Path,
    ) -> Result<Self> {
        ns.exec("ip", &["link", "set", "lo", "up"]).await?;

        let segments: Vec<Segment> = (0..num_segments)
            .map(|i| Segment::new(i, leases_per_segment))
            .collect();
        for segment in &segments {
            create_bridge(&ns, segment).await?;
        }

        let (uplink, seed) = veth::allocate_veth_pair().await?;
        if let Err(e) = connect_uplink(&ns, &uplink).await {
            teardown_uplink(&ns, &uplink).await;
            return Err(e);
        }

        let dnsmasq = match start_dnsmasq(&ns, &segments, work_dir).await {
            Ok(child) => child,
            Err(e) => {
                teardown_uplink(&ns, &uplink).await;
                return Err(e);
            }
        };

        info!(
            ns = ns.name(),
            segments = segments.len(),
            uplink = %uplink.outside,
            "virtual LAN ready"
        );
        Ok(Self {
            ns,
            segments,
            uplink,
            _seed: seed,
            dnsmasq: tokio::sync::Mutex::new(Some(dnsmasq)),
        })
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn uplink(&self) -> &VethPair {
        &self.uplink
    }

    pub fn segment(&self, name: &str) -> Option<&Segment> {
        self.segments.iter().find(|s| s.name() == name)
    }

    /// Address of the first segment's bridge, where flight services listen.
    pub fn bridge_ip(&self) -> Option<IpAddr> {
        self.segments
            .first()
            .map(|s| IpAddr::V4(s.bridge().ipv4.addr()))
    }

    /// Take the next lease of `segment`.
    ///
    /// # Panics
    ///
    /// If the segment does not exist or has no lease left.
    pub fn get_interface(&self, segment: &str) -> Interface {
        segment::lease_from(&self.segments, segment)
    }

    /// Create tap device `name` enslaved to `segment`'s bridge.
    pub async fn add_tap(&self, segment: &str, name: &str) -> Result<()> {
        let ns = &self.ns;
        retry_conditional(
            TAP_ATTEMPTS,
            TAP_RETRY_DELAY,
            is_busy,
            move || async move {
                ns.exec("ip", &["tuntap", "add", "dev", name, "mode", "tap"])
                    .await?;
                ns.exec("ip", &["link", "set", name, "master", segment])
                    .await?;
                ns.exec("ip", &["link", "set", name, "up"]).await?;
                Ok::<_, CommandError>(())
            },
        )
        .await?;
        Ok(())
    }

    pub async fn remove_tap(&self, name: &str) {
        self.ns.exec_ignore_errors("ip", &["link", "del", name]).await;
    }

    /// Stop dnsmasq and remove the host side of the uplink.
    ///
    /// Bridges and taps vanish with the namespace itself.
    pub async fn destroy(&self) {
        if let Some(mut child) = self.dnsmasq.lock().await.take() {
            terminate(self.ns.name(), "dnsmasq", &mut child).await;
        }
        teardown_uplink(&self.ns, &self.uplink).await;
    }
}

fn is_busy(e: &CommandError) -> bool {
    e.detail.contains("Device or resource busy")
}

async fn create_bridge(ns: &NetNs, segment: &Segment) -> Result<()> {
    let name = segment.name();
    let v4 = segment.bridge().ipv4.to_string();
    let v6 = segment.bridge().ipv6.to_string();
    ns.exec("ip", &["link", "add", name, "type", "bridge"]).await?;
    ns.exec("ip", &["addr", "add", &v4, "dev", name]).await?;
    ns.exec("ip", &["-6", "addr", "add", &v6, "dev", name, "nodad"])
        .await?;
    ns.exec("ip", &["link", "set", name, "up"]).await?;
    Ok(())
}

/// Wire the veth pair and NAT on both sides.
async fn connect_uplink(ns: &NetNs, pair: &VethPair) -> Result<()> {
    let inside = pair.inside.to_string();
    let outside = pair.outside.to_string();
    let gateway = pair.outside.addr().to_string();
    let subnet = pair.outside.trunc().to_string();

    exec(
        "ip",
        &[
            "link",
            "add",
            &pair.outside_name,
            "type",
            "veth",
            "peer",
            "name",
            &pair.inside_name,
            "netns",
            ns.name(),
        ],
    )
    .await?;
    ns.exec("ip", &["addr", "add", &inside, "dev", &pair.inside_name])
        .await?;
    ns.exec("ip", &["link", "set", &pair.inside_name, "up"])
        .await?;
    exec("ip", &["addr", "add", &outside, "dev", &pair.outside_name]).await?;
    exec("ip", &["link", "set", &pair.outside_name, "up"]).await?;

    ns.exec("ip", &["route", "add", "default", "via", &gateway])
        .await?;
    ns.exec("sysctl", &["-w", "net.ipv4.ip_forward=1"]).await?;
    ns.exec(
        "iptables",
        &[
            "-t",
            "nat",
            "-A",
            "POSTROUTING",
            "-o",
            &pair.inside_name,
            "-j",
            "MASQUERADE",
        ],
    )
    .await?;

    // Host-level forwarding is global and left enabled on teardown.
    exec("sysctl", &["-w", "net.ipv4.ip_forward=1"]).await?;
    let default_iface = host::get_default_interface().await?;
    iptables::add_host_nat(ns.name(), &pair.outside_name, &subnet, &default_iface).await?;
    Ok(())
}

async fn teardown_uplink(ns: &NetNs, pair: &VethPair) {
    iptables::delete_rules_by_comment(ns.name()).await;
    exec_ignore_errors("ip", &["link", "del", &pair.outside_name]).await;
}

async fn start_dnsmasq(ns: &NetNs, segments: &[Segment], work_dir: &Path) -> Result<Child> {
    let resolv = tokio::fs::read_to_string("/etc/resolv.conf")
        .await
        .unwrap_or_else(|e| {
            warn!(error = %e, "failed to read resolv.conf, guests get no upstream DNS");
            String::new()
        });
    let config = dnsmasq::render_config(segments, &dnsmasq::upstream_servers(&resolv));
    let path = work_dir.join("dnsmasq.conf");
    tokio::fs::write(&path, config).await?;

    let mut child = ns
        .command("dnsmasq")
        .arg(format!("--conf-file={}", path.display()))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .spawn()?;
    forward_output(ns.name(), "dnsmasq", &mut child);
    Ok(child)
}
