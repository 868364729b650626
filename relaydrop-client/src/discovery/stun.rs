//! Public address discovery via STUN Binding Requests (RFC 5389)

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use rand::seq::SliceRandom;
use thiserror::Error;
use tokio::net::{UdpSocket, lookup_host};
use tokio::time::{Instant, timeout, timeout_at};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DiscoveryError;

// =============================================================================
// Constants
// =============================================================================

const STUN_BINDING_REQUEST: u16 = 0x0001;
const STUN_BINDING_SUCCESS: u16 = 0x0101;
const STUN_MAGIC_COOKIE: u32 = 0x2112_A442;
const STUN_MAPPED_ADDRESS: u16 = 0x0001;
const STUN_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const STUN_HEADER_LEN: usize = 20;
const FAMILY_IPV4: u8 = 0x01;
const FAMILY_IPV6: u8 = 0x02;

/// Public STUN servers tried in random order
pub const DEFAULT_STUN_SERVERS: &[&str] = &[
    "stun.l.google.com:19302",
    "stun1.l.google.com:19302",
    "stun2.l.google.com:19302",
    "stun.cloudflare.com:3478",
    "stun.nextcloud.com:443",
];

/// Upper bound on the number of servers actually queried
pub const DEFAULT_MAX_ATTEMPTS: usize = 3;

/// Time allowed for one Binding Request round trip
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Time allowed for resolving a server name before it is skipped
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(500);

// =============================================================================
// Configuration
// =============================================================================

/// STUN discovery settings
#[derive(Debug, Clone)]
pub struct StunConfig {
    /// `host:port` entries
    pub servers: Vec<String>,
    pub max_attempts: usize,
    pub request_timeout: Duration,
    pub probe_timeout: Duration,
}

impl Default for StunConfig {
    fn default() -> Self {
        Self {
            servers: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Reasons a single Binding Request failed
#[derive(Debug, Error)]
pub enum StunError {
    #[error("response too short: {0} bytes")]
    TooShort(usize),

    #[error("unexpected message type {0:#06x}")]
    NotSuccess(u16),

    #[error("invalid magic cookie")]
    BadCookie,

    #[error("transaction id mismatch")]
    TransactionMismatch,

    #[error("no mapped address attribute")]
    NoMappedAddress,

    #[error("unsupported address family {0:#04x}")]
    UnsupportedFamily(u8),

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// =============================================================================
// Discovery
// =============================================================================

/// Learn this host's public address from the configured STUN servers
///
/// Servers are shuffled, names that do not resolve within the probe timeout
/// are skipped without counting as an attempt, and at most `max_attempts`
/// requests are sent. Returns `None` when every attempt fails.
pub async fn discover_public_address(config: &StunConfig) -> Option<SocketAddr> {
    let mut servers = config.servers.clone();
    servers.shuffle(&mut rand::rng());

    let mut attempts = 0;
    for server in &servers {
        if attempts >= config.max_attempts {
            break;
        }

        let Some(server_addr) = probe(server, config.probe_timeout).await else {
            continue;
        };
        attempts += 1;

        match binding_request(server_addr, config.request_timeout).await {
            Ok(mapped) => {
                info!(server = %server, public = %mapped, "STUN discovery succeeded");
                return Some(mapped);
            }
            Err(e) => debug!(server = %server, error = %e, "STUN request failed"),
        }
    }

    let reason = if attempts == 0 {
        "no STUN server reachable".to_string()
    } else {
        format!("{attempts} STUN attempts failed")
    };
    warn!("{}", DiscoveryError::DiscoveryUnavailable(reason));
    None
}

/// Resolve `server` under a short timeout
async fn probe(server: &str, limit: Duration) -> Option<SocketAddr> {
    match timeout(limit, lookup_host(server)).await {
        Ok(Ok(addrs)) => {
            let addrs: Vec<SocketAddr> = addrs.collect();
            addrs
                .iter()
                .find(|a| a.is_ipv4())
                .or_else(|| addrs.first())
                .copied()
        }
        Ok(Err(e)) => {
            debug!(server = %server, error = %e, "STUN server did not resolve");
            None
        }
        Err(_) => {
            debug!(server = %server, "STUN server resolution timed out");
            None
        }
    }
}

/// Send one Binding Request to `server` and parse the mapped address
///
/// Datagrams from other sources or with a foreign transaction id are ignored
/// until the timeout expires.
pub async fn binding_request(server: SocketAddr, limit: Duration) -> Result<SocketAddr, StunError> {
    let bind: SocketAddr = if server.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(bind).await?;

    let txid = new_transaction_id();
    socket.send_to(&encode_binding_request(&txid), server).await?;

    let deadline = Instant::now() + limit;
    let mut buf = [0u8; 1024];
    loop {
        let (n, from) = timeout_at(deadline, socket.recv_from(&mut buf))
            .await
            .map_err(|_| StunError::Timeout(limit))??;
        if from != server {
            continue;
        }
        match parse_binding_response(&buf[..n], &txid) {
            Err(StunError::TransactionMismatch) => continue,
            result => return result,
        }
    }
}

fn new_transaction_id() -> [u8; 12] {
    let mut txid = [0u8; 12];
    txid.copy_from_slice(&Uuid::new_v4().as_bytes()[..12]);
    txid
}

/// Build a 20-byte Binding Request with no attributes
pub fn encode_binding_request(txid: &[u8; 12]) -> [u8; STUN_HEADER_LEN] {
    let mut req = [0u8; STUN_HEADER_LEN];
    req[0..2].copy_from_slice(&STUN_BINDING_REQUEST.to_be_bytes());
    req[2..4].copy_from_slice(&0u16.to_be_bytes());
    req[4..8].copy_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());
    req[8..20].copy_from_slice(txid);
    req
}

/// Extract the mapped address from a Binding Success response
///
/// XOR-MAPPED-ADDRESS wins over MAPPED-ADDRESS when both are present.
pub fn parse_binding_response(msg: &[u8], txid: &[u8; 12]) -> Result<SocketAddr, StunError> {
    if msg.len() < STUN_HEADER_LEN {
        return Err(StunError::TooShort(msg.len()));
    }
    let kind = u16::from_be_bytes([msg[0], msg[1]]);
    if kind != STUN_BINDING_SUCCESS {
        return Err(StunError::NotSuccess(kind));
    }
    if u32::from_be_bytes([msg[4], msg[5], msg[6], msg[7]]) != STUN_MAGIC_COOKIE {
        return Err(StunError::BadCookie);
    }
    if msg[8..20] != txid[..] {
        return Err(StunError::TransactionMismatch);
    }

    let declared = u16::from_be_bytes([msg[2], msg[3]]) as usize;
    let limit = (STUN_HEADER_LEN + declared).min(msg.len());
    let mut offset = STUN_HEADER_LEN;
    let mut mapped = None;
    let mut unsupported = None;

    while offset + 4 <= limit {
        let attr_type = u16::from_be_bytes([msg[offset], msg[offset + 1]]);
        let attr_len = u16::from_be_bytes([msg[offset + 2], msg[offset + 3]]) as usize;
        offset += 4;
        if offset + attr_len > limit {
            break;
        }
        let value = &msg[offset..offset + attr_len];
        match attr_type {
            STUN_XOR_MAPPED_ADDRESS => match parse_address(value, txid, true) {
                Ok(addr) => return Ok(addr),
                Err(e) => unsupported = Some(e),
            },
            STUN_MAPPED_ADDRESS if mapped.is_none() => match parse_address(value, txid, false) {
                Ok(addr) => mapped = Some(addr),
                Err(e) => unsupported = Some(e),
            },
            _ => {}
        }
        // Attributes are padded to 4-byte boundaries
        offset += attr_len.next_multiple_of(4);
    }

    match (mapped, unsupported) {
        (Some(addr), _) => Ok(addr),
        (None, Some(e)) => Err(e),
        (None, None) => Err(StunError::NoMappedAddress),
    }
}

fn parse_address(value: &[u8], txid: &[u8; 12], xor: bool) -> Result<SocketAddr, StunError> {
    if value.len() < 8 {
        return Err(StunError::TooShort(value.len()));
    }
    let cookie = STUN_MAGIC_COOKIE.to_be_bytes();
    let mut port = u16::from_be_bytes([value[2], value[3]]);
    if xor {
        port ^= (STUN_MAGIC_COOKIE >> 16) as u16;
    }

    let ip = match value[1] {
        FAMILY_IPV4 => {
            let mut octets = [value[4], value[5], value[6], value[7]];
            if xor {
                for (octet, mask) in octets.iter_mut().zip(cookie) {
                    *octet ^= mask;
                }
            }
            IpAddr::from(octets)
        }
        FAMILY_IPV6 => {
            if value.len() < 20 {
                return Err(StunError::TooShort(value.len()));
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&value[4..20]);
            if xor {
                let mask = cookie.iter().chain(txid.iter());
                for (octet, mask) in octets.iter_mut().zip(mask) {
                    *octet ^= mask;
                }
            }
            IpAddr::from(octets)
        }
        family => return Err(StunError::UnsupportedFamily(family)),
    };
    Ok(SocketAddr::new(ip, port))
}
