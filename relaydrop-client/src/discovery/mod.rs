//! Address discovery: local interfaces, STUN and gateway mapping
//!
//! All three sources run concurrently. Each one degrades to "nothing found"
//! on failure, so a report may be empty but discovery itself never fails.

mod gateway;
mod local;
mod stun;

use std::net::{IpAddr, SocketAddr};

pub use gateway::{
    GatewayConfig, MappingProtocol, MappingResult, negotiate_gateway_mapping,
    remove_gateway_mapping,
};
pub use local::{
    InterfaceAddr, discover_local_addresses, is_physical_interface, is_virtual_interface,
    select_local_addresses,
};
pub use stun::{StunConfig, StunError, binding_request, discover_public_address};

use crate::candidates::{Candidate, CandidateSource};

/// Which discovery sources to run
#[derive(Debug, Clone, Default)]
pub struct DiscoveryConfig {
    /// `None` disables STUN
    pub stun: Option<StunConfig>,
    /// `None` disables gateway mapping
    pub gateway: Option<GatewayConfig>,
}

/// Everything discovery learned about how this host can be reached
#[derive(Debug, Clone, Default)]
pub struct DiscoveryReport {
    pub local: Vec<IpAddr>,
    pub public: Option<SocketAddr>,
    pub gateway: Option<MappingResult>,
}

impl DiscoveryReport {
    /// Discovered addresses as unprioritized candidates
    ///
    /// STUN reports the address of a UDP flow, so only its IP is kept; the
    /// gateway mapping carries the port it actually forwards.
    pub fn candidates(&self) -> Vec<Candidate> {
        let mut out: Vec<Candidate> = self
            .local
            .iter()
            .map(|ip| Candidate::new(*ip, None, CandidateSource::Local))
            .collect();
        if let Some(public) = self.public {
            out.push(Candidate::new(public.ip(), None, CandidateSource::StunPublic));
        }
        if let Some(mapped) = self.gateway.as_ref().and_then(MappingResult::external_addr) {
            out.push(Candidate::new(
                mapped.ip(),
                Some(mapped.port()),
                CandidateSource::UpnpMapped,
            ));
        }
        out
    }
}

/// Run every enabled discovery source
///
/// `relay_port` is the local port a gateway mapping should forward; it is
/// mapped to the same external port.
pub async fn discover(config: &DiscoveryConfig, relay_port: u16) -> DiscoveryReport {
    let local = tokio::task::spawn_blocking(discover_local_addresses);

    let public = async {
        match &config.stun {
            Some(stun) => discover_public_address(stun).await,
            None => None,
        }
    };
    let gateway = async {
        match &config.gateway {
            Some(gateway) => Some(
                negotiate_gateway_mapping(relay_port, relay_port, MappingProtocol::Tcp, gateway)
                    .await,
            ),
            None => None,
        }
    };

    let (local, public, gateway) = tokio::join!(local, public, gateway);
    DiscoveryReport {
        local: local.unwrap_or_default(),
        public,
        gateway,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::time::Duration;

    #[test]
    fn test_report_candidates() {
        let report = DiscoveryReport {
            local: vec!["192.168.1.20".parse().unwrap()],
            public: Some("203.0.113.5:40000".parse().unwrap()),
            gateway: Some(MappingResult::Mapped {
                external_ip: "203.0.113.5".parse().unwrap(),
                external_port: 7600,
                internal: SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 20), 7600),
                lease: Duration::from_secs(3600),
            }),
        };

        let candidates = report.candidates();
        assert_eq!(candidates.len(), 3);
        assert_eq!(candidates[0].source, CandidateSource::Local);
        assert_eq!(candidates[1].port, None);
        assert_eq!(candidates[1].source, CandidateSource::StunPublic);
        assert_eq!(candidates[2].port, Some(7600));
        assert_eq!(candidates[2].source, CandidateSource::UpnpMapped);
    }

    #[test]
    fn test_unavailable_mapping_adds_no_candidate() {
        let report = DiscoveryReport {
            local: Vec::new(),
            public: None,
            gateway: Some(MappingResult::Unavailable {
                reason: "no gateway found".to_string(),
            }),
        };
        assert!(report.candidates().is_empty());
    }

    #[tokio::test]
    async fn test_discover_with_remote_sources_disabled() {
        let report = discover(&DiscoveryConfig::default(), 7600).await;
        assert!(report.public.is_none());
        assert!(report.gateway.is_none());
    }
}
