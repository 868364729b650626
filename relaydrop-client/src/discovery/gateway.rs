//! Gateway port mapping negotiation (UPnP/IGD)
//!
//! Used when the client hosts the embedded relay so that a receiver outside
//! the LAN can reach it. Every failure is reported as
//! [`MappingResult::Unavailable`]; the transfer continues without a mapping.

use std::net::{IpAddr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use igd_next::{PortMappingProtocol, SearchOptions};
use tokio::time::timeout;
use tracing::{info, warn};

use relaydrop_server::upnp::local_ipv4;

use crate::error::DiscoveryError;

const MAPPING_DESCRIPTION: &str = "RelayDrop transfer";

/// Gateway negotiation settings
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Upper bound for search, external IP lookup and mapping together
    pub timeout: Duration,
    /// Lease requested from the router
    pub lease: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            lease: Duration::from_secs(3600),
        }
    }
}

/// Transport protocol of a mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingProtocol {
    Tcp,
    Udp,
}

impl From<MappingProtocol> for PortMappingProtocol {
    fn from(protocol: MappingProtocol) -> Self {
        match protocol {
            MappingProtocol::Tcp => PortMappingProtocol::TCP,
            MappingProtocol::Udp => PortMappingProtocol::UDP,
        }
    }
}

/// Outcome of a mapping negotiation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MappingResult {
    Mapped {
        external_ip: IpAddr,
        external_port: u16,
        internal: SocketAddrV4,
        lease: Duration,
    },
    Unavailable {
        reason: String,
    },
}

impl MappingResult {
    /// Externally reachable address, if a mapping exists
    pub fn external_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Mapped {
                external_ip,
                external_port,
                ..
            } => Some(SocketAddr::new(*external_ip, *external_port)),
            Self::Unavailable { .. } => None,
        }
    }

    pub fn is_mapped(&self) -> bool {
        matches!(self, Self::Mapped { .. })
    }
}

/// Ask the gateway to forward `external_port` to `internal_port` on this host
pub async fn negotiate_gateway_mapping(
    internal_port: u16,
    external_port: u16,
    protocol: MappingProtocol,
    config: &GatewayConfig,
) -> MappingResult {
    let result = match timeout(
        config.timeout,
        negotiate(internal_port, external_port, protocol, config),
    )
    .await
    {
        Ok(Ok(mapped)) => mapped,
        Ok(Err(reason)) => MappingResult::Unavailable { reason },
        Err(_) => MappingResult::Unavailable {
            reason: format!("gateway did not respond within {:?}", config.timeout),
        },
    };

    match &result {
        MappingResult::Mapped {
            external_ip,
            external_port,
            internal,
            ..
        } => info!(external = %external_ip, port = external_port, %internal, "gateway mapping created"),
        MappingResult::Unavailable { reason } => {
            warn!("{}", DiscoveryError::DiscoveryUnavailable(reason.clone()))
        }
    }
    result
}

async fn negotiate(
    internal_port: u16,
    external_port: u16,
    protocol: MappingProtocol,
    config: &GatewayConfig,
) -> Result<MappingResult, String> {
    let local_ip = local_ipv4()?;
    let gateway = search_gateway(config.timeout).await?;
    let lease = config.lease;

    let external_ip = tokio::task::spawn_blocking({
        let gateway = gateway.clone();
        move || gateway.get_external_ip()
    })
    .await
    .map_err(|e| format!("external IP lookup task failed: {e}"))?
    .map_err(|e| format!("gateway did not report an external IP: {e}"))?;

    let internal = SocketAddrV4::new(local_ip, internal_port);
    let lease_secs = u32::try_from(lease.as_secs()).unwrap_or(u32::MAX);
    tokio::task::spawn_blocking(move || {
        gateway.add_port(
            protocol.into(),
            external_port,
            SocketAddr::V4(internal),
            lease_secs,
            MAPPING_DESCRIPTION,
        )
    })
    .await
    .map_err(|e| format!("port mapping task failed: {e}"))?
    .map_err(|e| format!("gateway refused the mapping: {e}"))?;

    Ok(MappingResult::Mapped {
        external_ip,
        external_port,
        internal,
        lease,
    })
}

/// Remove a mapping created by [`negotiate_gateway_mapping`]
///
/// # Errors
///
/// Returns a description of the failing step; the mapping expires with its
/// lease regardless.
pub async fn remove_gateway_mapping(
    external_port: u16,
    protocol: MappingProtocol,
    config: &GatewayConfig,
) -> Result<(), String> {
    let remove = async {
        let gateway = search_gateway(config.timeout).await?;
        tokio::task::spawn_blocking(move || gateway.remove_port(protocol.into(), external_port))
            .await
            .map_err(|e| format!("mapping removal task failed: {e}"))?
            .map_err(|e| format!("gateway refused removal: {e}"))
    };
    timeout(config.timeout, remove)
        .await
        .map_err(|_| format!("gateway did not respond within {:?}", config.timeout))?
}

async fn search_gateway(limit: Duration) -> Result<igd_next::Gateway, String> {
    tokio::task::spawn_blocking(move || {
        igd_next::search_gateway(SearchOptions {
            timeout: Some(limit),
            ..Default::default()
        })
    })
    .await
    .map_err(|e| format!("gateway search task failed: {e}"))?
    .map_err(|e| format!("no gateway found: {e}"))
}
