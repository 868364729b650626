//! RelayDrop command-line client

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use clap::Parser;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use relaydrop_client::args::{Args, Command, DiscoverArgs, ReceiveArgs, SendArgs};
use relaydrop_client::constants::*;
use relaydrop_client::discovery::{MappingProtocol, MappingResult, discover, remove_gateway_mapping};
use relaydrop_client::engine::ProgressCallback;
use relaydrop_client::{
    CancelFlag, Candidate, CandidateSource, DiscoveryReport, OutcomeStatus, ReceiveRequest,
    ReceiveTable, SendRequest, SessionHooks, TransferOutcome, TransferProgress,
    nearby_lan_candidates, prioritize, receive_file, send_file,
};
use relaydrop_common::DEFAULT_RELAY_PORT;
use relaydrop_common::validators::{generate_transfer_code, validate_transfer_code};
use relaydrop_server::{ConnectionTracker, RelayConfig, SessionRegistry, serve, spawn_sweeper};

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.debug);

    match args.command {
        Command::Send(send) => run_send(send).await,
        Command::Receive(receive) => run_receive(receive).await,
        Command::Discover(discover) => run_discover(discover).await,
    }
}

/// Log to stderr; `RUST_LOG` overrides the level chosen by `--debug`
fn init_logging(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

// =============================================================================
// send
// =============================================================================

/// Relay hosted inside the sending process
struct HostedRelay {
    server: JoinHandle<()>,
    sweeper: JoinHandle<()>,
}

impl HostedRelay {
    async fn start(port: u16) -> std::io::Result<Self> {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        let listener = TcpListener::bind(addr).await?;
        let config = Arc::new(RelayConfig::default());
        let registry = SessionRegistry::new(config.idle_timeout);
        let tracker = Arc::new(ConnectionTracker::new(
            config.max_connections_per_ip,
            config.max_connections,
        ));
        let sweeper = spawn_sweeper(registry.clone(), config.sweep_interval);
        let server = tokio::spawn(serve(listener, registry, config, tracker));
        Ok(Self { server, sweeper })
    }

    fn stop(self) {
        self.server.abort();
        self.sweeper.abort();
    }
}

async fn run_send(args: SendArgs) -> ExitCode {
    println!("{}{}", MSG_BANNER, env!("CARGO_PKG_VERSION"));

    let code = args.code.clone().unwrap_or_else(generate_transfer_code);
    if let Err(e) = validate_transfer_code(&code) {
        eprintln!("{}{:?}", ERR_TRANSFER, e);
        return ExitCode::FAILURE;
    }
    let config = args.client_config();

    let mut hosted = None;
    let mut mapping = None;
    let candidates = if args.relays.is_empty() {
        match HostedRelay::start(args.port).await {
            Ok(relay) => hosted = Some(relay),
            Err(e) => {
                eprintln!("{}port {}: {}", ERR_BIND, args.port, e);
                return ExitCode::FAILURE;
            }
        }
        println!("{}{}", MSG_HOSTING_RELAY, args.port);

        let report = discover(&config.discovery, args.port).await;
        mapping = report.gateway.clone().filter(MappingResult::is_mapped);
        print_receiver_hint(&code, &hint_candidates(&report), args.port);

        vec![Candidate::new(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            Some(args.port),
            CandidateSource::Forced,
        )]
    } else {
        let relays: Vec<Candidate> = args
            .relays
            .iter()
            .map(|r| r.candidate(CandidateSource::Forced))
            .collect();
        print_receiver_hint(&code, &relays, args.port);
        prioritize(relays, None, config.allow_loopback)
    };
    println!("{}", MSG_WAITING_FOR_RECEIVER);

    let hooks = cli_hooks();
    let request = SendRequest {
        code,
        path: args.file.clone(),
        candidates,
    };
    let outcome = send_file(&request, &config, &hooks).await;
    print_outcome(&outcome, MSG_SENT);

    if let (Some(MappingResult::Mapped { external_port, .. }), Some(gateway)) =
        (&mapping, &config.discovery.gateway)
    {
        if let Err(e) = remove_gateway_mapping(*external_port, MappingProtocol::Tcp, gateway).await {
            warn!("{WARN_MAPPING_REMOVE_FAILED}{e}");
        }
    }
    if let Some(relay) = hosted {
        relay.stop();
    }
    exit_code(&outcome)
}

/// Addresses worth handing to the receiver, most reachable first
fn hint_candidates(report: &DiscoveryReport) -> Vec<Candidate> {
    prioritize(report.candidates(), None, false)
}

fn print_receiver_hint(code: &str, candidates: &[Candidate], default_port: u16) {
    println!("{}{}", MSG_TRANSFER_CODE, code);
    println!("{}", MSG_RECEIVER_HINT);
    let mut command = format!("  relaydrop receive {code}");
    for candidate in candidates {
        command.push_str(&format!(" --peer {}", hint_addr(candidate)));
    }
    let needs_port = candidates.iter().any(|c| c.port.is_none());
    if needs_port && default_port != DEFAULT_RELAY_PORT {
        command.push_str(&format!(" --port {default_port}"));
    }
    println!("{command}");
}

fn hint_addr(candidate: &Candidate) -> String {
    match (candidate.address, candidate.port) {
        (IpAddr::V6(ip), Some(port)) => format!("[{ip}]:{port}"),
        _ => candidate.to_string(),
    }
}

// =============================================================================
// receive
// =============================================================================

async fn run_receive(args: ReceiveArgs) -> ExitCode {
    println!("{}{}", MSG_BANNER, env!("CARGO_PKG_VERSION"));

    let config = args.client_config();
    let mut addrs: Vec<Candidate> = args
        .peers
        .iter()
        .map(|p| p.candidate(CandidateSource::Forced))
        .collect();
    if args.scan_lan {
        let local = tokio::task::spawn_blocking(relaydrop_client::discovery::discover_local_addresses)
            .await
            .unwrap_or_default();
        for ip in local {
            if let IpAddr::V4(v4) = ip {
                addrs.extend(nearby_lan_candidates(
                    v4,
                    None,
                    relaydrop_client::config::DEFAULT_LAN_SCAN_LIMIT,
                ));
            }
        }
    }
    let known = args.known.map(|k| k.candidate(CandidateSource::Forced));
    let candidates = prioritize(addrs, known, config.allow_loopback);
    if candidates.is_empty() {
        eprintln!("{}", ERR_NO_CANDIDATES);
        return ExitCode::FAILURE;
    }
    info!(count = candidates.len(), "racing relay candidates");

    let hooks = cli_hooks();
    let request = ReceiveRequest {
        code: args.code.clone(),
        candidates,
        out_dir: args.out.clone(),
    };
    let table = ReceiveTable::new();
    let outcome = receive_file(&request, &config, &hooks, &table).await;
    print_outcome(&outcome, MSG_RECEIVED);
    exit_code(&outcome)
}

// =============================================================================
// discover
// =============================================================================

async fn run_discover(args: DiscoverArgs) -> ExitCode {
    let config = args.discovery_config();
    let report = discover(&config, args.port).await;

    println!("{}", MSG_DISCOVER_LOCAL);
    if report.local.is_empty() {
        println!("  {}", MSG_NONE);
    }
    for ip in &report.local {
        println!("  {ip}");
    }

    let public = match (&config.stun, report.public) {
        (None, _) => MSG_DISABLED.to_string(),
        (Some(_), Some(addr)) => addr.to_string(),
        (Some(_), None) => MSG_NONE.to_string(),
    };
    println!("{}{}", MSG_DISCOVER_PUBLIC, public);

    let gateway = match &report.gateway {
        None => MSG_DISABLED.to_string(),
        Some(MappingResult::Mapped {
            external_ip,
            external_port,
            internal,
            lease,
        }) => format!("{external_ip}:{external_port} -> {internal} (lease {}s)", lease.as_secs()),
        Some(MappingResult::Unavailable { reason }) => format!("{MSG_NONE} ({reason})"),
    };
    println!("{}{}", MSG_DISCOVER_GATEWAY, gateway);

    // A mapping made only to report it should not linger on the router
    if let (Some(MappingResult::Mapped { external_port, .. }), Some(gateway)) =
        (&report.gateway, &config.gateway)
    {
        if let Err(e) = remove_gateway_mapping(*external_port, MappingProtocol::Tcp, gateway).await {
            warn!("{WARN_MAPPING_REMOVE_FAILED}{e}");
        }
    }
    ExitCode::SUCCESS
}

// =============================================================================
// Shared
// =============================================================================

/// Hooks with a Ctrl+C cancel and a percentage printout on stderr
fn cli_hooks() -> SessionHooks {
    let cancel = CancelFlag::new();
    spawn_ctrl_c(cancel.clone());

    let last_percent = Arc::new(AtomicU64::new(u64::MAX));
    let on_progress: ProgressCallback = Arc::new(move |p: &TransferProgress| {
        let percent = (p.progress * 100.0).floor() as u64;
        if last_percent.swap(percent, Ordering::Relaxed) != percent {
            eprint!("\r{}{:>3}%", MSG_PROGRESS, percent);
            if percent >= 100 {
                eprintln!();
            }
        }
    });

    SessionHooks {
        cancel,
        on_progress: Some(on_progress),
        ..SessionHooks::default()
    }
}

fn spawn_ctrl_c(cancel: CancelFlag) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                eprintln!("\n{}", MSG_CANCELLING);
                cancel.cancel();
            }
            Err(e) => error!(error = %e, "failed to listen for Ctrl+C"),
        }
    });
}

fn print_outcome(outcome: &TransferOutcome, verb: &str) {
    match outcome.status {
        OutcomeStatus::Completed => {
            println!(
                "{}{} ({} bytes)",
                verb,
                outcome.file_name.as_deref().unwrap_or("file"),
                outcome.size
            );
            if let Some(checksum) = &outcome.checksum {
                println!("{}{}", MSG_CHECKSUM, checksum);
            }
            if let Some(peer) = &outcome.peer_address {
                println!("{}{}", MSG_PEER, peer);
            }
        }
        OutcomeStatus::Cancelled => eprintln!("{}", ERR_TRANSFER_CANCELLED),
        OutcomeStatus::Failed => eprintln!(
            "{}{}",
            ERR_TRANSFER,
            outcome.error.as_deref().unwrap_or("unknown error")
        ),
    }
}

fn exit_code(outcome: &TransferOutcome) -> ExitCode {
    if outcome.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
