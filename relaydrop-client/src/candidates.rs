//! Candidate address ordering

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

use ipnet::Ipv4Net;

/// Where a candidate address came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateSource {
    Local,
    StunPublic,
    UpnpMapped,
    /// Supplied explicitly by the user
    Forced,
    /// Guessed from the local /24
    LanScan,
}

/// Reachability class used for ordering
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AddressClass {
    Public,
    Private,
    Fallback,
}

/// An address worth trying, with an optional known port
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Candidate {
    pub address: IpAddr,
    /// When set, this port is tried before the shared port list
    pub port: Option<u16>,
    pub source: CandidateSource,
}

impl Candidate {
    pub fn new(address: IpAddr, port: Option<u16>, source: CandidateSource) -> Self {
        Self {
            address,
            port,
            source,
        }
    }

    pub fn class(&self) -> AddressClass {
        classify(self.address)
    }

    /// Private or fallback address, expected to answer quickly on a LAN
    pub fn is_lan(&self) -> bool {
        self.class() != AddressClass::Public
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.address, self.port) {
            (IpAddr::V6(ip), Some(port)) => write!(f, "[{ip}]:{port}"),
            (ip, Some(port)) => write!(f, "{ip}:{port}"),
            (ip, None) => write!(f, "{ip}"),
        }
    }
}

fn is_shared_v4(ip: Ipv4Addr) -> bool {
    // 100.64.0.0/10 carrier-grade NAT
    let [a, b, ..] = ip.octets();
    a == 100 && (b & 0xc0) == 64
}

/// Classify an address as public, private (RFC 1918, CGNAT, ULA) or fallback
pub fn classify(ip: IpAddr) -> AddressClass {
    match ip {
        IpAddr::V4(v4) => {
            if v4.is_loopback()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.is_multicast()
            {
                AddressClass::Fallback
            } else if v4.is_private() || is_shared_v4(v4) {
                AddressClass::Private
            } else {
                AddressClass::Public
            }
        }
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return classify(IpAddr::V4(mapped));
            }
            if v6.is_loopback()
                || v6.is_unspecified()
                || v6.is_unicast_link_local()
                || v6.is_multicast()
            {
                AddressClass::Fallback
            } else if v6.is_unique_local() {
                AddressClass::Private
            } else {
                AddressClass::Public
            }
        }
    }
}

/// Order candidates for racing
///
/// The known target (if any) goes first, then public addresses, then private
/// ones, then the remainder. Loopback is dropped unless `allow_loopback` is
/// set and unspecified addresses are always dropped. Order within a class is
/// preserved. Each address appears once, at its first position; if that entry
/// has no port it takes the port of a later duplicate.
pub fn prioritize(
    addrs: impl IntoIterator<Item = Candidate>,
    known_target: Option<Candidate>,
    allow_loopback: bool,
) -> Vec<Candidate> {
    let mut ranked: Vec<Candidate> = addrs
        .into_iter()
        .filter(|c| !c.address.is_unspecified())
        .filter(|c| allow_loopback || !c.address.is_loopback())
        .collect();
    // Stable, so discovery order survives inside each class
    ranked.sort_by_key(Candidate::class);

    let mut ordered: Vec<Candidate> = Vec::with_capacity(ranked.len() + 1);
    for candidate in known_target.into_iter().chain(ranked) {
        match ordered.iter_mut().find(|c| c.address == candidate.address) {
            Some(kept) => {
                kept.port = kept.port.or(candidate.port);
            }
            None => ordered.push(candidate),
        }
    }
    ordered
}

/// Neighbours of `local` on its /24, nearest host numbers first
///
/// Opt-in fallback for peers that could not share their address; `local`
/// itself is excluded.
pub fn nearby_lan_candidates(local: Ipv4Addr, port: Option<u16>, limit: usize) -> Vec<Candidate> {
    let Ok(net) = Ipv4Net::new(local, 24) else {
        return Vec::new();
    };
    let own = u32::from(local);
    let mut hosts: Vec<Ipv4Addr> = net.trunc().hosts().filter(|h| *h != local).collect();
    hosts.sort_by_key(|h| u32::from(*h).abs_diff(own));
    hosts
        .into_iter()
        .take(limit)
        .map(|h| Candidate::new(IpAddr::V4(h), port, CandidateSource::LanScan))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(ip: &str) -> Candidate {
        Candidate::new(ip.parse().unwrap(), None, CandidateSource::Local)
    }

    fn addresses(candidates: &[Candidate]) -> Vec<String> {
        candidates.iter().map(|c| c.address.to_string()).collect()
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify("8.8.8.8".parse().unwrap()), AddressClass::Public);
        assert_eq!(classify("10.1.2.3".parse().unwrap()), AddressClass::Private);
        assert_eq!(classify("172.20.0.1".parse().unwrap()), AddressClass::Private);
        assert_eq!(classify("192.168.0.9".parse().unwrap()), AddressClass::Private);
        assert_eq!(classify("100.100.1.1".parse().unwrap()), AddressClass::Private);
        assert_eq!(classify("100.128.1.1".parse().unwrap()), AddressClass::Public);
        assert_eq!(classify("169.254.3.4".parse().unwrap()), AddressClass::Fallback);
        assert_eq!(classify("127.0.0.1".parse().unwrap()), AddressClass::Fallback);
        assert_eq!(classify("fd00::1".parse().unwrap()), AddressClass::Private);
        assert_eq!(classify("fe80::1".parse().unwrap()), AddressClass::Fallback);
        assert_eq!(classify("2001:db8::1".parse().unwrap()), AddressClass::Public);
        assert_eq!(classify("::ffff:192.168.1.1".parse().unwrap()), AddressClass::Private);
    }

    #[test]
    fn test_public_then_private_then_remainder() {
        let ordered = prioritize(
            [
                local("169.254.1.1"),
                local("192.168.1.5"),
                local("203.0.113.9"),
                local("10.0.0.2"),
            ],
            None,
            false,
        );
        assert_eq!(
            addresses(&ordered),
            ["203.0.113.9", "192.168.1.5", "10.0.0.2", "169.254.1.1"]
        );
    }

    #[test]
    fn test_known_target_first_and_deduplicated() {
        let known = Candidate::new("10.0.0.2".parse().unwrap(), None, CandidateSource::Forced);
        let ordered = prioritize(
            [local("203.0.113.9"), local("10.0.0.2")],
            Some(known),
            false,
        );
        assert_eq!(addresses(&ordered), ["10.0.0.2", "203.0.113.9"]);
        assert_eq!(ordered[0].source, CandidateSource::Forced);
    }

    #[test]
    fn test_loopback_only_when_allowed() {
        let input = [local("127.0.0.1"), local("192.168.1.5"), local("0.0.0.0")];
        assert_eq!(addresses(&prioritize(input.clone(), None, false)), ["192.168.1.5"]);
        assert_eq!(
            addresses(&prioritize(input, None, true)),
            ["192.168.1.5", "127.0.0.1"]
        );
    }

    #[test]
    fn test_address_listed_once_across_ports() {
        let mapped =
            Candidate::new("203.0.113.9".parse().unwrap(), Some(7600), CandidateSource::UpnpMapped);
        let stun = Candidate::new("203.0.113.9".parse().unwrap(), None, CandidateSource::StunPublic);
        let other =
            Candidate::new("203.0.113.9".parse().unwrap(), Some(7700), CandidateSource::Forced);

        let ordered = prioritize([mapped, stun, other], None, false);
        assert_eq!(ordered.len(), 1);
        assert_eq!(ordered[0].source, CandidateSource::UpnpMapped);
        assert_eq!(ordered[0].port, Some(7600));
    }

    #[test]
    fn test_duplicate_fills_in_missing_port() {
        let known = Candidate::new("10.0.0.2".parse().unwrap(), None, CandidateSource::Forced);
        let mapped = Candidate::new("10.0.0.2".parse().unwrap(), Some(9000), CandidateSource::UpnpMapped);

        let ordered = prioritize([mapped], Some(known), false);
        assert_eq!(ordered.len(), 1);
        assert_eq!(ordered[0].source, CandidateSource::Forced);
        assert_eq!(ordered[0].port, Some(9000));
    }

    #[test]
    fn test_empty_input() {
        assert!(prioritize(Vec::new(), None, false).is_empty());
    }

    #[test]
    fn test_display() {
        assert_eq!(local("10.0.0.2").to_string(), "10.0.0.2");
        let v6 = Candidate::new("2001:db8::1".parse().unwrap(), Some(7600), CandidateSource::Local);
        assert_eq!(v6.to_string(), "[2001:db8::1]:7600");
    }

    #[test]
    fn test_nearby_lan_candidates() {
        let nearby = nearby_lan_candidates(Ipv4Addr::new(192, 168, 1, 20), Some(7600), 4);
        assert_eq!(
            addresses(&nearby),
            ["192.168.1.19", "192.168.1.21", "192.168.1.18", "192.168.1.22"]
        );
        assert!(nearby.iter().all(|c| c.source == CandidateSource::LanScan));
        assert!(nearby.iter().all(|c| c.port == Some(7600)));
    }

    #[test]
    fn test_nearby_lan_candidates_cover_subnet() {
        let all = nearby_lan_candidates(Ipv4Addr::new(10, 0, 0, 1), None, 1000);
        // 254 usable hosts minus ourselves
        assert_eq!(all.len(), 253);
        assert!(!all.iter().any(|c| c.address == IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))));
    }
}
