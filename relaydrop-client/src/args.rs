//! Command-line argument parsing

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand};
use relaydrop_common::DEFAULT_RELAY_PORT;
use relaydrop_common::chunk::{DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE};

use crate::candidates::{Candidate, CandidateSource};
use crate::config::ClientConfig;
use crate::discovery::DiscoveryConfig;
use crate::racer::RaceStrategy;

/// RelayDrop: send a file to another machine with a six-digit code
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Enable debug logging (discovery, racing and protocol traffic)
    #[arg(long, global = true, default_value = "false")]
    pub debug: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Send a file, hosting a relay unless --relay is given
    Send(SendArgs),
    /// Receive a file by its transfer code
    Receive(ReceiveArgs),
    /// Show the addresses this machine can be reached on
    Discover(DiscoverArgs),
}

#[derive(ClapArgs, Debug)]
pub struct SendArgs {
    /// File to send
    pub file: PathBuf,

    /// Transfer code to use instead of a random one
    #[arg(long)]
    pub code: Option<String>,

    /// Use an existing relay instead of hosting one (IP or IP:PORT, repeatable)
    #[arg(long = "relay", value_name = "ADDR", value_parser = parse_addr)]
    pub relays: Vec<PeerAddr>,

    /// Relay port (hosted relay, or default for --relay addresses)
    #[arg(short, long, default_value_t = DEFAULT_RELAY_PORT)]
    pub port: u16,

    /// Do not ask the gateway for a port mapping
    #[arg(long, default_value = "false")]
    pub no_upnp: bool,

    /// Do not look up the public address over STUN
    #[arg(long, default_value = "false")]
    pub no_stun: bool,

    /// Bytes per chunk
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE, value_parser = parse_chunk_size)]
    pub chunk_size: usize,
}

#[derive(ClapArgs, Debug)]
pub struct ReceiveArgs {
    /// Transfer code shown by the sender
    pub code: String,

    /// Relay addresses printed by the sender (IP or IP:PORT, repeatable)
    #[arg(long = "peer", value_name = "ADDR", value_parser = parse_addr)]
    pub peers: Vec<PeerAddr>,

    /// Address known to work, tried before everything else
    #[arg(long, value_name = "ADDR", value_parser = parse_addr)]
    pub known: Option<PeerAddr>,

    /// Port tried for addresses given without one
    #[arg(short, long, default_value_t = DEFAULT_RELAY_PORT)]
    pub port: u16,

    /// Directory the file is saved into
    #[arg(short, long, default_value = ".")]
    pub out: PathBuf,

    /// How candidate addresses are raced
    #[arg(long, value_enum, default_value = "lan-first")]
    pub strategy: RaceStrategy,

    /// Also try neighbours on the local /24 (slow, last resort)
    #[arg(long, default_value = "false")]
    pub scan_lan: bool,

    /// Allow loopback addresses (same-machine testing)
    #[arg(long, default_value = "false")]
    pub allow_loopback: bool,
}

#[derive(ClapArgs, Debug)]
pub struct DiscoverArgs {
    /// Port to request a gateway mapping for
    #[arg(short, long, default_value_t = DEFAULT_RELAY_PORT)]
    pub port: u16,

    /// Skip the gateway mapping
    #[arg(long, default_value = "false")]
    pub no_upnp: bool,

    /// Skip the STUN lookup
    #[arg(long, default_value = "false")]
    pub no_stun: bool,
}

/// An address given on the command line, port optional
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerAddr {
    pub ip: IpAddr,
    pub port: Option<u16>,
}

impl PeerAddr {
    pub fn candidate(self, source: CandidateSource) -> Candidate {
        Candidate::new(self.ip, self.port, source)
    }
}

/// Accepts `IP`, `IP:PORT` and `[IPv6]:PORT`
pub fn parse_addr(s: &str) -> Result<PeerAddr, String> {
    if let Ok(addr) = s.parse::<SocketAddr>() {
        return Ok(PeerAddr {
            ip: addr.ip(),
            port: Some(addr.port()),
        });
    }
    let bare = s.trim_start_matches('[').trim_end_matches(']');
    bare.parse::<IpAddr>()
        .map(|ip| PeerAddr { ip, port: None })
        .map_err(|_| format!("expected IP or IP:PORT, got '{s}'"))
}

fn parse_chunk_size(s: &str) -> Result<usize, String> {
    let size: usize = s.parse().map_err(|_| format!("not a number: '{s}'"))?;
    if size == 0 || size > MAX_CHUNK_SIZE {
        return Err(format!("chunk size must be between 1 and {MAX_CHUNK_SIZE}"));
    }
    Ok(size)
}

fn discovery_config(no_stun: bool, no_upnp: bool) -> DiscoveryConfig {
    let defaults = ClientConfig::default().discovery;
    DiscoveryConfig {
        stun: if no_stun { None } else { defaults.stun },
        gateway: if no_upnp { None } else { defaults.gateway },
    }
}

impl SendArgs {
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            discovery: discovery_config(self.no_stun, self.no_upnp),
            ports: vec![self.port],
            chunk_size: self.chunk_size,
            // The hosted relay is reached over loopback
            allow_loopback: self.relays.is_empty(),
            ..ClientConfig::default()
        }
    }
}

impl ReceiveArgs {
    pub fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig {
            discovery: DiscoveryConfig::default(),
            ports: vec![self.port],
            allow_loopback: self.allow_loopback,
            ..ClientConfig::default()
        };
        config.race.strategy = self.strategy;
        config
    }
}

impl DiscoverArgs {
    pub fn discovery_config(&self) -> DiscoveryConfig {
        discovery_config(self.no_stun, self.no_upnp)
    }
}
