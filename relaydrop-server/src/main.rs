//! RelayDrop relay server

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use relaydrop_server::args::Args;
use relaydrop_server::constants::*;
use relaydrop_server::upnp::{UpnpGateway, spawn_lease_renewal_task};
use relaydrop_server::{ConnectionTracker, RelayConfig, SessionRegistry, serve, spawn_sweeper};

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.debug);

    println!("{}{}", MSG_BANNER, env!("CARGO_PKG_VERSION"));

    let config = Arc::new(RelayConfig::from(&args));
    let registry = SessionRegistry::new(config.idle_timeout);
    let tracker = Arc::new(ConnectionTracker::new(
        config.max_connections_per_ip,
        config.max_connections,
    ));

    let ports = args.ports();
    let mut listeners = Vec::with_capacity(ports.len());
    for port in &ports {
        let addr = SocketAddr::new(args.bind, *port);
        match TcpListener::bind(addr).await {
            Ok(listener) => {
                println!("{}{}", MSG_LISTENING, addr);
                listeners.push(listener);
            }
            Err(e) => {
                eprintln!("{}{}: {}", ERR_BIND, addr, e);
                std::process::exit(1);
            }
        }
    }

    let sweeper = spawn_sweeper(registry.clone(), config.sweep_interval);
    let servers: Vec<_> = listeners
        .into_iter()
        .map(|listener| {
            tokio::spawn(serve(
                listener,
                registry.clone(),
                config.clone(),
                tracker.clone(),
            ))
        })
        .collect();

    let upnp = if args.upnp {
        setup_upnp(&args, &ports).await
    } else {
        None
    };

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
    }
    println!("\n{}", MSG_SHUTDOWN);

    for server in servers {
        server.abort();
    }
    sweeper.abort();

    if let Some((gateway, renewal)) = upnp {
        renewal.abort();
        match gateway.remove_port_mappings().await {
            Ok(()) => info!("{MSG_UPNP_REMOVED}"),
            Err(e) => warn!("{WARN_UPNP_REMOVE_FAILED}{e}"),
        }
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

async fn setup_upnp(
    args: &Args,
    ports: &[u16],
) -> Option<(Arc<UpnpGateway>, tokio::task::JoinHandle<()>)> {
    match UpnpGateway::setup(args.bind, ports).await {
        Ok(gateway) => {
            let gateway = Arc::new(gateway);
            let renewal = spawn_lease_renewal_task(gateway.clone());
            Some((gateway, renewal))
        }
        Err(e) => {
            warn!("{WARN_UPNP_SETUP_FAILED}{e}");
            warn!("{WARN_UPNP_MANUAL}");
            None
        }
    }
}
