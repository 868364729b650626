//! UPnP/IGD port forwarding for the relay ports
//!
//! With `--upnp` the relay asks the local router to forward every listening
//! port to this host, renews the lease at half its duration, and removes the
//! mappings on a clean shutdown. Failures are never fatal: the relay keeps
//! running and the operator is told to forward ports manually.
//!
//! UPnP/IGD only maps IPv4. Binding to `0.0.0.0` or `::` works (the LAN
//! address is found with a routing lookup); a specific IPv6 bind address is
//! rejected.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use igd_next::{PortMappingProtocol, SearchOptions};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::constants::*;

/// Lease requested for each mapping, in seconds
const LEASE_DURATION: u32 = 3600;

/// Gateway search timeout (allows time for firewall approval dialogs)
const SEARCH_TIMEOUT: Duration = Duration::from_secs(15);

const PROTOCOL_DESCRIPTION: &str = "RelayDrop relay";

const UDP_BIND_ADDRESS: &str = "0.0.0.0:0";

/// Remote address for the routing table lookup (nothing is sent)
const ROUTING_TEST_ADDRESS: &str = "8.8.8.8:80";

/// Port mappings held on the router
pub struct UpnpGateway {
    gateway: RwLock<igd_next::Gateway>,
    ports: Vec<u16>,
    local_ip: Ipv4Addr,
}

async fn search_gateway() -> Result<igd_next::Gateway, String> {
    tokio::task::spawn_blocking(|| {
        igd_next::search_gateway(SearchOptions {
            timeout: Some(SEARCH_TIMEOUT),
            ..Default::default()
        })
    })
    .await
    .map_err(|e| format!("{ERR_UPNP_SEARCH_TASK_FAILED}{e}"))?
    .map_err(|e| format!("{ERR_UPNP_GATEWAY_NOT_FOUND}{e}"))
}

async fn add_port_mapping(
    gateway: &igd_next::Gateway,
    port: u16,
    local_ip: Ipv4Addr,
) -> Result<(), String> {
    let gateway = gateway.clone();
    let local = SocketAddr::V4(SocketAddrV4::new(local_ip, port));
    tokio::task::spawn_blocking(move || {
        gateway.add_port(
            PortMappingProtocol::TCP,
            port,
            local,
            LEASE_DURATION,
            PROTOCOL_DESCRIPTION,
        )
    })
    .await
    .map_err(|e| format!("{ERR_UPNP_PORT_FORWARD_TASK}{e}"))?
    .map_err(|e| format!("{ERR_UPNP_ADD_PORT_MAPPING}{e}"))
}

impl UpnpGateway {
    /// Discover the gateway and forward every port in `ports` to this host
    ///
    /// # Errors
    ///
    /// Returns a description of the failing step (no IPv4 route, no gateway,
    /// mapping refused).
    pub async fn setup(bind_addr: IpAddr, ports: &[u16]) -> Result<Self, String> {
        let local_ip = match bind_addr {
            IpAddr::V4(ipv4) if ipv4.is_unspecified() => local_ipv4()?,
            IpAddr::V4(ipv4) => ipv4,
            IpAddr::V6(ipv6) if ipv6.is_unspecified() => local_ipv4()?,
            IpAddr::V6(_) => return Err(ERR_IPV6_NOT_SUPPORTED.to_string()),
        };

        let gateway = search_gateway().await?;
        let external_ip = tokio::task::spawn_blocking({
            let gateway = gateway.clone();
            move || gateway.get_external_ip()
        })
        .await
        .map_err(|e| format!("{ERR_UPNP_GET_EXTERNAL_IP_TASK}{e}"))?
        .map_err(|e| format!("{ERR_UPNP_GET_EXTERNAL_IP}{e}"))?;

        for port in ports {
            add_port_mapping(&gateway, *port, local_ip).await?;
        }

        let port_list = ports
            .iter()
            .map(u16::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        info!("{MSG_UPNP_CONFIGURED}{external_ip} -> {local_ip} (ports {port_list})");

        Ok(Self {
            gateway: RwLock::new(gateway),
            ports: ports.to_vec(),
            local_ip,
        })
    }

    fn current_gateway(&self) -> igd_next::Gateway {
        self.gateway
            .read()
            .expect("UPnP gateway lock poisoned")
            .clone()
    }

    /// Remove all mappings; they expire with the lease if this fails
    ///
    /// # Errors
    ///
    /// Returns the first removal failure.
    pub async fn remove_port_mappings(&self) -> Result<(), String> {
        let gateway = self.current_gateway();
        for port in self.ports.iter().copied() {
            let gateway = gateway.clone();
            tokio::task::spawn_blocking(move || gateway.remove_port(PortMappingProtocol::TCP, port))
                .await
                .map_err(|e| format!("{ERR_UPNP_REMOVE_PORT_TASK}{e}"))?
                .map_err(|e| format!("{ERR_UPNP_REMOVE_PORT_MAPPING}{e}"))?;
        }
        Ok(())
    }

    /// Extend every mapping for another lease period
    ///
    /// # Errors
    ///
    /// Returns the first renewal failure.
    pub async fn renew_lease(&self) -> Result<(), String> {
        let gateway = self.current_gateway();
        for port in self.ports.iter().copied() {
            add_port_mapping(&gateway, port, self.local_ip)
                .await
                .map_err(|e| format!("{ERR_UPNP_RENEW_LEASE}{e}"))?;
        }
        Ok(())
    }

    /// Find the gateway again (after a router reboot) and re-add the mappings
    ///
    /// # Errors
    ///
    /// Returns an error if the gateway cannot be found or refuses a mapping.
    pub async fn rediscover_and_remap(&self) -> Result<(), String> {
        let gateway = search_gateway().await?;
        for port in self.ports.iter().copied() {
            add_port_mapping(&gateway, port, self.local_ip).await?;
        }
        *self.gateway.write().expect("UPnP gateway lock poisoned") = gateway;
        Ok(())
    }
}

/// LAN IPv4 address the OS would use to reach the internet
///
/// Found by "connecting" a UDP socket, which is a routing table lookup only.
///
/// # Errors
///
/// Returns an error if there is no non-loopback IPv4 route.
pub fn local_ipv4() -> Result<Ipv4Addr, String> {
    let socket =
        UdpSocket::bind(UDP_BIND_ADDRESS).map_err(|e| format!("{ERR_UPNP_CREATE_UDP_SOCKET}{e}"))?;
    socket
        .connect(ROUTING_TEST_ADDRESS)
        .map_err(|e| format!("{ERR_UPNP_DETERMINE_ROUTING}{e}"))?;

    match socket.local_addr() {
        Ok(SocketAddr::V4(addr)) if !addr.ip().is_loopback() => Ok(*addr.ip()),
        Ok(SocketAddr::V4(_)) => Err(ERR_UPNP_LOOPBACK_ONLY.to_string()),
        Ok(SocketAddr::V6(_)) => Err(ERR_UPNP_IPV6_EXPECTED_IPV4.to_string()),
        Err(e) => Err(format!("{ERR_UPNP_GET_LOCAL_ADDRESS}{e}")),
    }
}

/// Renew the mappings at half the lease duration until aborted
pub fn spawn_lease_renewal_task(gateway: Arc<UpnpGateway>) -> JoinHandle<()> {
    let renewal_interval = Duration::from_secs(u64::from(LEASE_DURATION / 2));

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(renewal_interval);
        interval.tick().await;

        loop {
            interval.tick().await;

            if let Err(e) = gateway.renew_lease().await {
                warn!("{WARN_UPNP_RENEW_FAILED}{e}");
                info!("{MSG_UPNP_REDISCOVERING}");
                match gateway.rediscover_and_remap().await {
                    Ok(()) => info!("{MSG_UPNP_REDISCOVERED}"),
                    Err(e) => {
                        warn!("{WARN_UPNP_REDISCOVER_FAILED}{e}");
                        warn!("{WARN_UPNP_PORT_EXPIRE}");
                    }
                }
            }
        }
    })
}
