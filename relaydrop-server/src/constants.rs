//! Log and status message strings
//!
//! Kept together so the wording of operator-facing output stays consistent.

pub const MSG_BANNER: &str = "RelayDrop relay v";
pub const MSG_LISTENING: &str = "Listening on ";
pub const MSG_SHUTDOWN: &str = "Shutting down relay";
pub const MSG_UPNP_CONFIGURED: &str = "UPnP port forwarding configured: ";
pub const MSG_UPNP_REDISCOVERING: &str = "Attempting to re-discover UPnP gateway";
pub const MSG_UPNP_REDISCOVERED: &str = "UPnP gateway re-discovered, port mappings restored";
pub const MSG_UPNP_REMOVED: &str = "UPnP port mappings removed";

pub const ERR_BIND: &str = "Failed to bind ";
pub const ERR_IPV6_NOT_SUPPORTED: &str =
    "UPnP requires an IPv4 bind address (or 0.0.0.0 / ::), got a specific IPv6 address";
pub const ERR_UPNP_SEARCH_TASK_FAILED: &str = "UPnP gateway search task failed: ";
pub const ERR_UPNP_GATEWAY_NOT_FOUND: &str = "UPnP gateway not found: ";
pub const ERR_UPNP_GET_EXTERNAL_IP_TASK: &str = "UPnP external IP task failed: ";
pub const ERR_UPNP_GET_EXTERNAL_IP: &str = "Failed to get external IP from gateway: ";
pub const ERR_UPNP_PORT_FORWARD_TASK: &str = "UPnP port forward task failed: ";
pub const ERR_UPNP_ADD_PORT_MAPPING: &str = "Failed to add UPnP port mapping: ";
pub const ERR_UPNP_REMOVE_PORT_TASK: &str = "UPnP port removal task failed: ";
pub const ERR_UPNP_REMOVE_PORT_MAPPING: &str = "Failed to remove UPnP port mapping: ";
pub const ERR_UPNP_RENEW_LEASE: &str = "Failed to renew UPnP lease: ";
pub const ERR_UPNP_CREATE_UDP_SOCKET: &str = "Failed to create UDP socket for routing lookup: ";
pub const ERR_UPNP_DETERMINE_ROUTING: &str = "Failed to determine local route: ";
pub const ERR_UPNP_LOOPBACK_ONLY: &str = "Only a loopback address is routable";
pub const ERR_UPNP_IPV6_EXPECTED_IPV4: &str = "Routing lookup returned IPv6, expected IPv4";
pub const ERR_UPNP_GET_LOCAL_ADDRESS: &str = "Failed to read local socket address: ";

pub const WARN_UPNP_SETUP_FAILED: &str = "UPnP setup failed: ";
pub const WARN_UPNP_MANUAL: &str = "Forward the relay port(s) manually if peers connect from outside the LAN";
pub const WARN_UPNP_RENEW_FAILED: &str = "UPnP lease renewal failed: ";
pub const WARN_UPNP_REDISCOVER_FAILED: &str = "UPnP re-discovery failed: ";
pub const WARN_UPNP_PORT_EXPIRE: &str = "Port mappings will expire when the current lease ends";
pub const WARN_UPNP_REMOVE_FAILED: &str = "Failed to remove UPnP port mappings: ";
