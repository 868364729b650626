//! Local interface address discovery

use std::net::{IpAddr, Ipv4Addr};

use tracing::{debug, warn};

use relaydrop_server::upnp::local_ipv4;

use crate::error::DiscoveryError;

/// Name prefixes of container, VM and VPN interfaces that peers cannot reach
const VIRTUAL_PREFIXES: &[&str] = &[
    "docker", "veth", "br-", "virbr", "vmnet", "vboxnet", "tun", "tap", "utun", "tailscale", "wg",
    "zt", "lo",
];

/// Name prefixes of wired and wireless adapters
const PHYSICAL_PREFIXES: &[&str] = &["eth", "en", "wlan", "wl", "wifi", "wi-fi", "ethernet"];

/// One enumerated interface address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceAddr {
    pub name: String,
    pub ip: IpAddr,
}

impl InterfaceAddr {
    pub fn new(name: impl Into<String>, ip: IpAddr) -> Self {
        Self {
            name: name.into(),
            ip,
        }
    }
}

pub fn is_virtual_interface(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    VIRTUAL_PREFIXES.iter().any(|p| name.starts_with(p))
}

pub fn is_physical_interface(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    PHYSICAL_PREFIXES.iter().any(|p| name.starts_with(p))
}

fn is_link_local(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_link_local(),
        IpAddr::V6(v6) => v6.is_unicast_link_local(),
    }
}

/// Order usable interface addresses for advertising to a peer
///
/// Virtual, loopback, unspecified and link-local addresses are dropped.
/// IPv4 addresses on physical adapters come first, then any other IPv4
/// address, then IPv6. Duplicates keep their first position.
pub fn select_local_addresses(interfaces: &[InterfaceAddr]) -> Vec<IpAddr> {
    let usable: Vec<&InterfaceAddr> = interfaces
        .iter()
        .filter(|i| !is_virtual_interface(&i.name))
        .filter(|i| !i.ip.is_loopback() && !i.ip.is_unspecified() && !is_link_local(&i.ip))
        .collect();

    let physical_v4 = usable
        .iter()
        .filter(|i| i.ip.is_ipv4() && is_physical_interface(&i.name));
    let other_v4 = usable
        .iter()
        .filter(|i| i.ip.is_ipv4() && !is_physical_interface(&i.name));
    let v6 = usable.iter().filter(|i| i.ip.is_ipv6());

    let mut selected = Vec::new();
    for iface in physical_v4.chain(other_v4).chain(v6) {
        if !selected.contains(&iface.ip) {
            selected.push(iface.ip);
        }
    }
    selected
}

/// Enumerate this host's reachable addresses
///
/// Falls back to the address the routing table would use for outbound
/// traffic when enumeration fails or yields nothing usable.
pub fn discover_local_addresses() -> Vec<IpAddr> {
    let interfaces = match get_if_addrs::get_if_addrs() {
        Ok(ifaces) => ifaces
            .into_iter()
            .map(|iface| {
                let ip = iface.ip();
                InterfaceAddr::new(iface.name, ip)
            })
            .collect(),
        Err(e) => {
            debug!(error = %e, "interface enumeration failed");
            Vec::new()
        }
    };

    let selected = select_local_addresses(&interfaces);
    if !selected.is_empty() {
        debug!(addresses = ?selected, "local addresses");
        return selected;
    }

    match routing_fallback() {
        Some(ip) => vec![IpAddr::V4(ip)],
        None => Vec::new(),
    }
}

fn routing_fallback() -> Option<Ipv4Addr> {
    match local_ipv4() {
        Ok(ip) => {
            debug!(%ip, "using routing table address");
            Some(ip)
        }
        Err(e) => {
            warn!("{}", DiscoveryError::DiscoveryUnavailable(e));
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iface(name: &str, ip: &str) -> InterfaceAddr {
        InterfaceAddr::new(name, ip.parse().unwrap())
    }

    fn ips(list: &[&str]) -> Vec<IpAddr> {
        list.iter().map(|s| s.parse().unwrap()).collect()
    }

    #[test]
    fn test_interface_name_patterns() {
        assert!(is_virtual_interface("docker0"));
        assert!(is_virtual_interface("veth12ab"));
        assert!(is_virtual_interface("br-5f2c"));
        assert!(is_virtual_interface("utun3"));
        assert!(is_virtual_interface("Tailscale"));
        assert!(is_virtual_interface("lo"));
        assert!(!is_virtual_interface("eth0"));

        assert!(is_physical_interface("eth0"));
        assert!(is_physical_interface("enp3s0"));
        assert!(is_physical_interface("wlan0"));
        assert!(is_physical_interface("Wi-Fi"));
        assert!(is_physical_interface("Ethernet 2"));
        assert!(!is_physical_interface("ppp0"));
    }

    #[test]
    fn test_physical_ipv4_first_then_other_then_ipv6() {
        let interfaces = [
            iface("ppp0", "100.64.1.5"),
            iface("wlan0", "2001:db8::5"),
            iface("docker0", "172.17.0.1"),
            iface("eth0", "192.168.1.20"),
            iface("lo", "127.0.0.1"),
        ];
        assert_eq!(
            select_local_addresses(&interfaces),
            ips(&["192.168.1.20", "100.64.1.5", "2001:db8::5"])
        );
    }

    #[test]
    fn test_link_local_and_loopback_excluded() {
        let interfaces = [
            iface("eth0", "169.254.10.1"),
            iface("eth0", "fe80::1"),
            iface("en0", "::1"),
            iface("en0", "10.0.0.7"),
        ];
        assert_eq!(select_local_addresses(&interfaces), ips(&["10.0.0.7"]));
    }

    #[test]
    fn test_duplicates_removed() {
        let interfaces = [iface("eth0", "10.0.0.7"), iface("en1", "10.0.0.7")];
        assert_eq!(select_local_addresses(&interfaces), ips(&["10.0.0.7"]));
    }

    #[test]
    fn test_only_virtual_yields_nothing() {
        let interfaces = [iface("docker0", "172.17.0.1"), iface("wg0", "10.8.0.2")];
        assert!(select_local_addresses(&interfaces).is_empty());
    }

    #[test]
    fn test_discovered_addresses_are_usable() {
        for ip in discover_local_addresses() {
            assert!(!ip.is_loopback());
            assert!(!ip.is_unspecified());
        }
    }
}
