use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use serde::Deserialize;

use crate::command::exec;

use super::error::{NetworkError, Result};

#[derive(Debug, Deserialize)]
struct Link {
    #[serde(default)]
    addr_info: Vec<AddrInfo>,
}

#[derive(Debug, Deserialize)]
struct AddrInfo {
    family: String,
    local: String,
    prefixlen: u8,
}

/// Every IPv4 network assigned to an interface in the root namespace.
pub(crate) async fn host_networks() -> Result<Vec<Ipv4Net>> {
    let json = exec("ip", &["-j", "-4", "addr", "show"]).await?;
    parse_host_networks(&json)
}

fn parse_host_networks(json: &str) -> Result<Vec<Ipv4Net>> {
    let links: Vec<Link> =
        serde_json::from_str(json).map_err(|e| NetworkError::HostAddresses(e.to_string()))?;
    let mut networks = Vec::new();
    for info in links.iter().flat_map(|l| &l.addr_info) {
        if info.family != "inet" {
            continue;
        }
        let addr: Ipv4Addr = info
            .local
            .parse()
            .map_err(|e| NetworkError::HostAddresses(format!("{}: {e}", info.local)))?;
        let net = Ipv4Net::new(addr, info.prefixlen)
            .map_err(|e| NetworkError::HostAddresses(format!("{}: {e}", info.local)))?;
        networks.push(net.trunc());
    }
    Ok(networks)
}

/// The host interface carrying traffic toward the internet.
pub(crate) async fn get_default_interface() -> Result<String> {
    let result = exec("ip", &["route", "get", "8.8.8.8"]).await?;
    parse_route_device(&result).ok_or(NetworkError::NoDefaultInterface(result))
}

fn parse_route_device(route: &str) -> Option<String> {
    route
        .split_whitespace()
        .skip_while(|&w| w != "dev")
        .nth(1)
        .map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ip_json_output() {
        let json = r#"[
            {"ifindex":1,"ifname":"lo","addr_info":[{"family":"inet","local":"127.0.0.1","prefixlen":8}]},
            {"ifindex":2,"ifname":"eth0","addr_info":[
                {"family":"inet","local":"192.168.1.23","prefixlen":24},
                {"family":"inet6","local":"fe80::1","prefixlen":64}
            ]},
            {"ifindex":3,"ifname":"docker0"}
        ]"#;
        let nets = parse_host_networks(json).unwrap();
        assert_eq!(
            nets,
            vec![
                "127.0.0.0/8".parse::<Ipv4Net>().unwrap(),
                "192.168.1.0/24".parse().unwrap()
            ]
        );
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            parse_host_networks("not json"),
            Err(NetworkError::HostAddresses(_))
        ));
    }

    #[test]
    fn route_device() {
        let out = "8.8.8.8 via 192.168.1.1 dev wlp3s0 src 192.168.1.23 uid 0\n    cache";
        assert_eq!(parse_route_device(out).as_deref(), Some("wlp3s0"));
        assert_eq!(parse_route_device("unreachable"), None);
    }
}
