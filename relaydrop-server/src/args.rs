//! Command-line argument parsing

use std::net::IpAddr;

use clap::Parser;
use relaydrop_common::DEFAULT_RELAY_PORT;

/// RelayDrop relay server
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// IP address to bind to (IPv4 or IPv6)
    #[arg(short, long, default_value = "0.0.0.0")]
    pub bind: IpAddr,

    /// Port to listen on
    #[arg(short, long, default_value_t = DEFAULT_RELAY_PORT)]
    pub port: u16,

    /// Additional ports to listen on (repeatable)
    #[arg(long = "extra-port", value_name = "PORT")]
    pub extra_ports: Vec<u16>,

    /// Evict sessions with no activity for this many seconds
    #[arg(long, default_value_t = 1800)]
    pub idle_timeout_secs: u64,

    /// Seconds between idle-session sweeps
    #[arg(long, default_value_t = 60)]
    pub sweep_interval_secs: u64,

    /// Maximum concurrent connections per IP address (0 = unlimited)
    #[arg(long, default_value_t = 0)]
    pub max_connections_per_ip: usize,

    /// Maximum concurrent connections in total (0 = unlimited)
    #[arg(long, default_value_t = 0)]
    pub max_connections: usize,

    /// Enable debug logging (session and connection lifecycle)
    #[arg(long, default_value = "false")]
    pub debug: bool,

    /// Enable UPnP port forwarding (automatic NAT traversal)
    #[arg(long, default_value = "false")]
    pub upnp: bool,
}

impl Args {
    /// Every port to listen on, primary first, without duplicates
    pub fn ports(&self) -> Vec<u16> {
        let mut ports = vec![self.port];
        for port in &self.extra_ports {
            if !ports.contains(port) {
                ports.push(*port);
            }
        }
        ports
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::parse_from(["relaydropd"]);
        assert_eq!(args.port, DEFAULT_RELAY_PORT);
        assert_eq!(args.bind.to_string(), "0.0.0.0");
        assert!(!args.upnp);
        assert_eq!(args.ports(), vec![DEFAULT_RELAY_PORT]);
    }

    #[test]
    fn test_extra_ports_deduplicated() {
        let args = Args::parse_from([
            "relaydropd",
            "--port",
            "7600",
            "--extra-port",
            "443",
            "--extra-port",
            "7600",
            "--extra-port",
            "8080",
        ]);
        assert_eq!(args.ports(), vec![7600, 443, 8080]);
    }
}
