//! Client tuning

use std::time::Duration;

use relaydrop_common::DEFAULT_RELAY_PORT;
use relaydrop_common::chunk::DEFAULT_CHUNK_SIZE;

use crate::discovery::{DiscoveryConfig, GatewayConfig, StunConfig};
use crate::racer::RaceConfig;

/// Wait for the relay to answer `register`
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Wait for the other side to show up (a person has to start the receiver)
pub const DEFAULT_PEER_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Longest silence tolerated between chunks
pub const DEFAULT_CHUNK_TIMEOUT: Duration = Duration::from_secs(60);

/// Neighbours tried by `--scan-lan` per local address
pub const DEFAULT_LAN_SCAN_LIMIT: usize = 64;

/// Suffix of a download still being written
pub const PART_SUFFIX: &str = ".part";

/// Settings shared by the send and receive drivers
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub race: RaceConfig,
    pub discovery: DiscoveryConfig,
    /// Ports tried for candidates that carry none
    pub ports: Vec<u16>,
    pub chunk_size: usize,
    pub reply_timeout: Duration,
    pub peer_timeout: Duration,
    pub chunk_timeout: Duration,
    /// Loopback candidates are only raced when set
    pub allow_loopback: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            race: RaceConfig::default(),
            discovery: DiscoveryConfig {
                stun: Some(StunConfig::default()),
                gateway: Some(GatewayConfig::default()),
            },
            ports: vec![DEFAULT_RELAY_PORT],
            chunk_size: DEFAULT_CHUNK_SIZE,
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            peer_timeout: DEFAULT_PEER_TIMEOUT,
            chunk_timeout: DEFAULT_CHUNK_TIMEOUT,
            allow_loopback: false,
        }
    }
}
