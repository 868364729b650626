//! Listener accept loop

use std::io;
use std::sync::Arc;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::config::{RelayConfig, TCP_KEEPALIVE_TIME};
use crate::connection::{ConnectionParams, handle_connection};
use crate::connection_tracker::ConnectionTracker;
use crate::registry::SessionRegistry;

/// Enable keepalive so half-dead peers are noticed during long transfers
fn configure_socket(socket: &TcpStream) -> io::Result<()> {
    socket.set_nodelay(true)?;
    let keepalive = TcpKeepalive::new().with_time(TCP_KEEPALIVE_TIME);
    SockRef::from(socket).set_tcp_keepalive(&keepalive)
}

/// Accept relay clients on `listener` until the task is dropped
///
/// Each connection runs in its own task holding a slot from `tracker`;
/// connections over the limit are closed immediately.
pub async fn serve(
    listener: TcpListener,
    registry: SessionRegistry,
    config: Arc<RelayConfig>,
    tracker: Arc<ConnectionTracker>,
) {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "relay listener started");
    }

    loop {
        let (socket, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };

        let Some(guard) = tracker.try_acquire(peer_addr.ip()) else {
            warn!(peer = %peer_addr, "connection limit reached, dropping");
            continue;
        };

        if let Err(e) = configure_socket(&socket) {
            debug!(peer = %peer_addr, error = %e, "could not configure socket");
        }

        let params = ConnectionParams {
            peer_addr,
            registry: registry.clone(),
            config: config.clone(),
        };
        tokio::spawn(async move {
            let _guard = guard;
            if let Err(e) = handle_connection(socket, params).await {
                debug!(peer = %peer_addr, error = %e, "connection ended with error");
            }
        });
    }
}
