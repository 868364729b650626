//! Relay runtime configuration

use std::time::Duration;

use relaydrop_common::chunk::{MAX_CHUNK_SIZE, max_frame_len};
use relaydrop_common::{DEFAULT_IDLE_TIMEOUT, DEFAULT_SWEEP_INTERVAL};

use crate::args::Args;

/// Time a client has to send `register` after the upgrade
pub const DEFAULT_REGISTER_TIMEOUT: Duration = Duration::from_secs(30);

/// Frames queued per connection before senders wait
pub const DEFAULT_OUTBOUND_QUEUE_DEPTH: usize = 32;

/// Idle time before TCP keepalive probes start
pub const TCP_KEEPALIVE_TIME: Duration = Duration::from_secs(60);

/// Settings shared by every connection task
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
    pub register_timeout: Duration,
    pub outbound_queue_depth: usize,
    /// Largest WebSocket message accepted (a full chunk frame)
    pub max_message_size: usize,
    /// 0 = unlimited
    pub max_connections_per_ip: usize,
    /// 0 = unlimited
    pub max_connections: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            register_timeout: DEFAULT_REGISTER_TIMEOUT,
            outbound_queue_depth: DEFAULT_OUTBOUND_QUEUE_DEPTH,
            max_message_size: max_frame_len(MAX_CHUNK_SIZE),
            max_connections_per_ip: 0,
            max_connections: 0,
        }
    }
}

impl From<&Args> for RelayConfig {
    fn from(args: &Args) -> Self {
        Self {
            idle_timeout: Duration::from_secs(args.idle_timeout_secs),
            sweep_interval: Duration::from_secs(args.sweep_interval_secs.max(1)),
            max_connections_per_ip: args.max_connections_per_ip,
            max_connections: args.max_connections,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_defaults_fit_largest_chunk() {
        let config = RelayConfig::default();
        assert!(config.max_message_size > MAX_CHUNK_SIZE);
        assert_eq!(config.idle_timeout, Duration::from_secs(1800));
        assert_eq!(config.register_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_from_args() {
        let args = Args::parse_from([
            "relaydropd",
            "--idle-timeout-secs",
            "120",
            "--sweep-interval-secs",
            "0",
            "--max-connections-per-ip",
            "4",
        ]);
        let config = RelayConfig::from(&args);
        assert_eq!(config.idle_timeout, Duration::from_secs(120));
        assert_eq!(config.sweep_interval, Duration::from_secs(1));
        assert_eq!(config.max_connections_per_ip, 4);
        assert_eq!(config.max_connections, 0);
    }
}
