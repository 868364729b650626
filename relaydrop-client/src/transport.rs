//! WebSocket connections to a relay

use std::net::SocketAddr;

use tokio::net::TcpStream;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;

use relaydrop_common::RELAY_PATH;
use relaydrop_common::chunk::{MAX_CHUNK_SIZE, max_frame_len};
use relaydrop_common::protocol::{QUERY_ROLE, QUERY_TRANSFER_CODE, Role};

use crate::racer::{DialError, Dialer};

/// An open relay connection
pub type RelayStream = WebSocketStream<TcpStream>;

/// Upgrade URL for `code`/`role` on the relay at `target`
pub fn relay_url(target: SocketAddr, code: &str, role: Role) -> String {
    format!("ws://{target}{RELAY_PATH}?{QUERY_TRANSFER_CODE}={code}&{QUERY_ROLE}={role}")
}

/// Limits matching the relay's, so a full-size chunk frame is accepted
pub fn websocket_config() -> WebSocketConfig {
    let max = max_frame_len(MAX_CHUNK_SIZE);
    WebSocketConfig::default()
        .max_message_size(Some(max))
        .max_frame_size(Some(max))
}

/// Dials a relay and completes the WebSocket handshake for one code/role
///
/// The handshake carries the code and role in the query string, but nothing
/// is registered: only the race winner sends `register`.
#[derive(Debug, Clone)]
pub struct WsDialer {
    code: String,
    role: Role,
}

impl WsDialer {
    pub fn new(code: impl Into<String>, role: Role) -> Self {
        Self {
            code: code.into(),
            role,
        }
    }
}

#[async_trait::async_trait]
impl Dialer for WsDialer {
    type Connection = RelayStream;

    async fn dial(&self, target: SocketAddr) -> Result<RelayStream, DialError> {
        let socket = TcpStream::connect(target).await?;
        socket.set_nodelay(true)?;
        let (stream, _response) = tokio_tungstenite::client_async_with_config(
            relay_url(target, &self.code, self.role),
            socket,
            Some(websocket_config()),
        )
        .await?;
        Ok(stream)
    }
}
