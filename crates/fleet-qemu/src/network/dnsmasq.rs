//! DHCP, DNS and router advertisements for the flight's segments.

use std::fmt::Write as _;
use std::net::IpAddr;

use super::segment::Segment;

/// Render a dnsmasq configuration serving `segments`.
///
/// Every lease is registered statically, so a DHCP client always receives
/// exactly the address precomputed for its MAC. NTP is pointed at the bridge
/// itself (`0.0.0.0` and `[::]` mean "this server" to dnsmasq).
pub(crate) fn render_config(segments: &[Segment], upstream: &[IpAddr]) -> String {
    let mut out = String::from(
        "keep-in-foreground\n\
         leasefile-ro\n\
         log-facility=-\n\
         pid-file=\n\
         no-hosts\n\
         no-resolv\n\
         bind-dynamic\n\
         interface=lo\n\
         enable-ra\n\
         dhcp-authoritative\n\
         dhcp-option=option:ntp-server,0.0.0.0\n\
         dhcp-option=option6:ntp-server,[::]\n",
    );

    for server in upstream {
        let _ = writeln!(out, "server={server}");
    }

    for segment in segments {
        let bridge = segment.bridge();
        let _ = writeln!(out, "\ninterface={}", segment.name());
        let _ = writeln!(out, "domain={}.local", segment.name());
        let _ = writeln!(
            out,
            "dhcp-range={},static,{}",
            bridge.ipv4.network(),
            bridge.ipv4.netmask()
        );
        let _ = writeln!(
            out,
            "dhcp-range={},static,{}",
            bridge.ipv6.network(),
            bridge.ipv6.prefix_len()
        );
        for lease in segment.leases() {
            let _ = writeln!(
                out,
                "dhcp-host={},{},[{}],{}",
                lease.mac,
                lease.ipv4.addr(),
                lease.ipv6.addr(),
                lease.hostname()
            );
        }
    }
    out
}

/// Upstream resolvers for guests, taken from the host's resolv.conf.
///
/// Loopback resolvers (systemd-resolved and friends) are unreachable from
/// inside the namespace and are skipped.
pub(crate) fn upstream_servers(resolv_conf: &str) -> Vec<IpAddr> {
    resolv_conf
        .lines()
        .filter_map(|line| line.trim().strip_prefix("nameserver"))
        .filter_map(|rest| rest.trim().parse::<IpAddr>().ok())
        .filter(|ip| !ip.is_loopback())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_every_lease() {
        let segments = [Segment::new(0, 2)];
        let upstream = ["1.1.1.1".parse().unwrap()];
        let cfg = render_config(&segments, &upstream);

        assert!(cfg.starts_with("keep-in-foreground\n"));
        assert!(cfg.contains("server=1.1.1.1\n"));
        assert!(cfg.contains("interface=br0\n"));
        assert!(cfg.contains("dhcp-range=10.0.0.0,static,255.255.255.0\n"));
        assert!(cfg.contains("dhcp-range=fd00::,static,64\n"));
        assert!(cfg.contains("dhcp-host=02:00:00:00:00:02,10.0.0.2,[fd00::2],host-0-2\n"));
        assert!(cfg.contains("dhcp-host=02:00:00:00:00:03,10.0.0.3,[fd00::3],host-0-3\n"));
        assert_eq!(cfg.matches("dhcp-host=").count(), 2);
    }

    #[test]
    fn loopback_resolvers_are_skipped() {
        let resolv = "# generated\nnameserver 127.0.0.53\nnameserver 9.9.9.9\nsearch lan\nnameserver ::1\nnameserver 2001:4860:4860::8888\n";
        assert_eq!(
            upstream_servers(resolv),
            vec![
                "9.9.9.9".parse::<IpAddr>().unwrap(),
                "2001:4860:4860::8888".parse().unwrap()
            ]
        );
    }
}
