//! Relay connection handling
//!
//! One task per client socket. The WebSocket upgrade request carries the
//! transfer code and role in its query string; the first control message must
//! be a matching `register`. After that the task feeds the registry: control
//! messages are validated and forwarded, binary frames go to
//! [`SessionRegistry::relay_chunk`].
//!
//! Writes go through a separate writer task that drains the connection's
//! [`TransportOutbox`]. The read loop never writes to the socket directly, so
//! frames queued by the registry and replies from this task share one ordered
//! queue.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, StreamExt};
use relaydrop_common::RELAY_PATH;
use relaydrop_common::protocol::{ControlMessage, QUERY_ROLE, QUERY_TRANSFER_CODE, Role};
use relaydrop_common::validators::{validate_file_name, validate_transfer_code};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{StatusCode, Uri};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{Bytes, Error as WsError, Message};
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::error::{ProtocolError, RegistryError};
use crate::registry::{PeerInfo, SessionRegistry, TransportHandle, TransportOutbox};

/// How long queued frames may take to flush once the read side is done
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Parameters for handling a connection
pub struct ConnectionParams {
    pub peer_addr: SocketAddr,
    pub registry: SessionRegistry,
    pub config: Arc<RelayConfig>,
}

/// Transfer code and role taken from the upgrade request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeQuery {
    pub transfer_code: String,
    pub role: Role,
}

/// Parse `/transfer?transferCode=NNNNNN&role=sender|receiver`
///
/// # Errors
///
/// Returns a short reason suitable for an HTTP 400 body.
pub fn parse_upgrade_uri(uri: &Uri) -> Result<UpgradeQuery, String> {
    if uri.path() != RELAY_PATH {
        return Err(format!("unknown path {}", uri.path()));
    }

    let mut transfer_code = None;
    let mut role = None;
    for pair in uri.query().unwrap_or_default().split('&') {
        match pair.split_once('=') {
            Some((QUERY_TRANSFER_CODE, value)) => transfer_code = Some(value),
            Some((QUERY_ROLE, value)) => role = Some(value),
            _ => {}
        }
    }

    let transfer_code = transfer_code.ok_or_else(|| format!("missing {QUERY_TRANSFER_CODE}"))?;
    validate_transfer_code(transfer_code)
        .map_err(|e| format!("invalid {QUERY_TRANSFER_CODE}: {e:?}"))?;
    let role = role
        .ok_or_else(|| format!("missing {QUERY_ROLE}"))?
        .parse::<Role>()?;

    Ok(UpgradeQuery {
        transfer_code: transfer_code.to_string(),
        role,
    })
}

fn bad_request(reason: String) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason));
    *response.status_mut() = StatusCode::BAD_REQUEST;
    response
}

/// What the read loop does after handling a frame
#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

/// Per-connection state
struct ConnectionState {
    query: UpgradeQuery,
    registered: bool,
    handle: Arc<TransportHandle>,
    registry: SessionRegistry,
}

impl ConnectionState {
    fn code(&self) -> &str {
        &self.query.transfer_code
    }

    async fn reply(&self, message: &ControlMessage) {
        if let Err(e) = self.handle.send_control(message).await {
            debug!(code = %self.code(), error = %e, "reply dropped");
        }
    }

    async fn reply_error(&self, message: String) {
        debug!(code = %self.code(), peer = %self.handle.peer_addr(), error = %message, "rejecting client request");
        self.reply(&ControlMessage::error(Some(self.code()), message))
            .await;
    }

    async fn handle_text(&mut self, text: &str) -> Flow {
        let message = match ControlMessage::from_json(text) {
            Ok(message) => message,
            Err(e) => {
                self.reply_error(ProtocolError::MalformedMessage(e.to_string()).wire_message())
                    .await;
                return Flow::Continue;
            }
        };

        match message {
            ControlMessage::Register {
                transfer_code,
                role,
                file_name,
                file_size,
                device_id,
                username,
                session_id,
                ..
            } => {
                let info = PeerInfo {
                    device_id,
                    username,
                    session_id,
                };
                match self
                    .register(&transfer_code, role, info, file_name, file_size)
                    .await
                {
                    Ok(()) => Flow::Continue,
                    Err(message) => {
                        self.reply_error(message).await;
                        Flow::Close
                    }
                }
            }
            ControlMessage::Ready { .. } if self.is(Role::Receiver) => {
                let result = match self.registry.begin_transfer(self.code()) {
                    Ok(()) => {
                        self.registry
                            .relay_control(self.code(), self.handle.id(), &message)
                            .await
                    }
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    self.reply_error(e.wire_message()).await;
                }
                Flow::Continue
            }
            ControlMessage::Progress { .. } | ControlMessage::FinalChunk { .. }
                if self.is(Role::Sender) =>
            {
                if let Err(e) = self
                    .registry
                    .relay_control(self.code(), self.handle.id(), &message)
                    .await
                {
                    self.reply_error(e.wire_message()).await;
                }
                Flow::Continue
            }
            ControlMessage::Cancel { .. } if self.registered => {
                info!(code = %self.code(), role = %self.query.role, "cancel requested by client");
                match self
                    .registry
                    .cancel_from(self.code(), self.handle.id())
                    .await
                {
                    Ok(()) => Flow::Close,
                    Err(e) => {
                        self.reply_error(e.wire_message()).await;
                        Flow::Continue
                    }
                }
            }
            other => {
                self.reply_error(ProtocolError::UnexpectedMessage(other.kind()).wire_message())
                    .await;
                Flow::Continue
            }
        }
    }

    fn is(&self, role: Role) -> bool {
        self.registered && self.query.role == role
    }

    /// Register with the registry, acknowledge, then attach this transport
    ///
    /// Returns the wire message to send back on failure.
    async fn register(
        &mut self,
        transfer_code: &str,
        role: Role,
        info: PeerInfo,
        file_name: Option<String>,
        file_size: Option<u64>,
    ) -> Result<(), String> {
        if self.registered {
            return Err(ProtocolError::AlreadyRegistered.wire_message());
        }
        if transfer_code != self.code() || role != self.query.role {
            return Err(ProtocolError::RegistrationMismatch.wire_message());
        }

        let registered = match role {
            Role::Sender => {
                if let Some(name) = &file_name {
                    validate_file_name(name)
                        .map_err(|e| ProtocolError::InvalidFileName(e).wire_message())?;
                }
                let size = file_size.ok_or_else(|| ProtocolError::MissingFileSize.wire_message())?;
                self.registry
                    .register_sender(transfer_code, info, file_name, size)
            }
            Role::Receiver => self.registry.register_receiver(transfer_code, info),
        };
        registered.map_err(|e| e.wire_message())?;

        self.registered = true;
        self.reply(&ControlMessage::connected(transfer_code, role))
            .await;
        self.registry
            .attach(transfer_code, role, self.handle.clone())
            .await
            .map_err(|e| e.wire_message())
    }

    async fn handle_binary(&mut self, data: Bytes) -> Flow {
        if !self.is(Role::Sender) {
            self.reply_error(ProtocolError::UnexpectedMessage("binary chunk").wire_message())
                .await;
            return Flow::Continue;
        }

        match self
            .registry
            .relay_chunk(self.code(), self.handle.id(), data)
            .await
        {
            Ok(_) => Flow::Continue,
            Err(e @ RegistryError::MalformedChunk(_)) => {
                self.reply_error(e.wire_message()).await;
                Flow::Continue
            }
            Err(e) => {
                warn!(code = %self.code(), error = %e, "relay failed");
                Flow::Close
            }
        }
    }
}

/// Drain the outbox into the socket until closed
///
/// On close, frames already queued are flushed before the close frame, within
/// `WRITER_DRAIN_TIMEOUT`. A write still pending when the close arrives is
/// abandoned, so a peer that stopped reading cannot pin the task.
async fn write_loop<S>(mut sink: S, mut outbox: TransportOutbox)
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    loop {
        tokio::select! {
            biased;
            _ = &mut outbox.close => break,
            message = outbox.messages.recv() => match message {
                Some(message) => tokio::select! {
                    biased;
                    _ = &mut outbox.close => {
                        debug!("transport closed during a stalled write");
                        return;
                    }
                    sent = sink.send(message) => if let Err(e) = sent {
                        debug!(error = %e, "socket write failed");
                        return;
                    },
                },
                None => {
                    let _ = sink.close().await;
                    return;
                }
            },
        }
    }

    let flush = async {
        while let Ok(message) = outbox.messages.try_recv() {
            if sink.send(message).await.is_err() {
                return;
            }
        }
        let _ = sink.send(Message::Close(None)).await;
        let _ = sink.close().await;
    };
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, flush).await.is_err() {
        debug!("peer stopped reading, queued frames dropped on close");
    }
}

/// Handle one relay client from the raw socket
///
/// # Errors
///
/// Returns an error if the WebSocket upgrade fails or is rejected.
pub async fn handle_connection<S>(socket: S, params: ConnectionParams) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let ConnectionParams {
        peer_addr,
        registry,
        config,
    } = params;

    let mut query = None;
    let callback = |request: &Request, response: Response| match parse_upgrade_uri(request.uri()) {
        Ok(parsed) => {
            query = Some(parsed);
            Ok(response)
        }
        Err(reason) => Err(bad_request(reason)),
    };
    let ws_config = WebSocketConfig::default()
        .max_message_size(Some(config.max_message_size))
        .max_frame_size(Some(config.max_message_size));

    let ws_stream =
        tokio_tungstenite::accept_hdr_async_with_config(socket, callback, Some(ws_config))
            .await
            .map_err(|e| io::Error::other(format!("WebSocket handshake failed: {e}")))?;
    let query = query.ok_or_else(|| io::Error::other("upgrade request was not inspected"))?;

    debug!(peer = %peer_addr, code = %query.transfer_code, role = %query.role, "client connected");

    let (sink, mut stream) = ws_stream.split();
    let (handle, outbox) = TransportHandle::new(peer_addr, config.outbound_queue_depth);
    let handle = Arc::new(handle);
    let mut writer = tokio::spawn(write_loop(sink, outbox));
    let mut writer_done = false;

    let mut state = ConnectionState {
        query,
        registered: false,
        handle: handle.clone(),
        registry: registry.clone(),
    };

    let register_deadline = tokio::time::sleep(config.register_timeout);
    tokio::pin!(register_deadline);

    loop {
        tokio::select! {
            frame = stream.next() => {
                let flow = match frame {
                    Some(Ok(Message::Text(text))) => state.handle_text(text.as_str()).await,
                    Some(Ok(Message::Binary(data))) => state.handle_binary(data).await,
                    Some(Ok(Message::Close(_))) | None => Flow::Close,
                    Some(Ok(_)) => Flow::Continue,
                    Some(Err(e)) => {
                        debug!(peer = %peer_addr, error = %e, "read failed");
                        Flow::Close
                    }
                };
                if flow == Flow::Close {
                    break;
                }
            }
            _ = &mut register_deadline, if !state.registered => {
                let timeout = ProtocolError::RegisterTimeout(config.register_timeout.as_secs());
                state.reply_error(timeout.wire_message()).await;
                break;
            }
            _ = &mut writer, if !writer_done => {
                // Registry closed the transport or the socket died
                writer_done = true;
                break;
            }
        }
    }

    if state.registered {
        registry.detach(state.code(), handle.id()).await;
    }
    handle.close();
    if !writer_done {
        let _ = tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await;
    }

    debug!(peer = %peer_addr, code = %state.code(), "client disconnected");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    fn uri(text: &str) -> Uri {
        text.parse().unwrap()
    }

    #[test]
    fn test_parse_upgrade_uri() {
        let parsed = parse_upgrade_uri(&uri("/transfer?transferCode=482193&role=sender")).unwrap();
        assert_eq!(parsed.transfer_code, "482193");
        assert_eq!(parsed.role, Role::Sender);

        let parsed =
            parse_upgrade_uri(&uri("/transfer?role=receiver&transferCode=000001&x=1")).unwrap();
        assert_eq!(parsed.role, Role::Receiver);
    }

    #[test]
    fn test_parse_upgrade_uri_rejects_bad_requests() {
        assert!(parse_upgrade_uri(&uri("/other?transferCode=482193&role=sender")).is_err());
        assert!(parse_upgrade_uri(&uri("/transfer?role=sender")).is_err());
        assert!(parse_upgrade_uri(&uri("/transfer?transferCode=48219&role=sender")).is_err());
        assert!(parse_upgrade_uri(&uri("/transfer?transferCode=abcdef&role=sender")).is_err());
        assert!(parse_upgrade_uri(&uri("/transfer?transferCode=482193&role=relay")).is_err());
        assert!(parse_upgrade_uri(&uri("/transfer")).is_err());
    }

    /// Sink that records what the writer task sends
    #[derive(Default)]
    struct MockSink {
        sent: VecDeque<Message>,
        closed: bool,
    }

    impl Sink<Message> for MockSink {
        type Error = WsError;

        fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), WsError>> {
            Poll::Ready(Ok(()))
        }

        fn start_send(mut self: Pin<&mut Self>, item: Message) -> Result<(), WsError> {
            self.sent.push_back(item);
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), WsError>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), WsError>> {
            self.closed = true;
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_writer_flushes_queue_before_close_frame() {
        let (handle, outbox) = TransportHandle::new("192.0.2.1:1".parse().unwrap(), 8);
        handle
            .send(Message::Binary(Bytes::from_static(b"one")))
            .await
            .unwrap();
        handle
            .send_control(&ControlMessage::complete("123456", true, None))
            .await
            .unwrap();
        handle.close();

        let mut sink = MockSink::default();
        write_loop(&mut sink, outbox).await;

        assert_eq!(sink.sent.len(), 3);
        assert!(matches!(sink.sent[0], Message::Binary(_)));
        assert!(matches!(sink.sent[1], Message::Text(_)));
        assert!(matches!(sink.sent[2], Message::Close(None)));
        assert!(sink.closed);
    }

    /// Sink for a peer that stopped reading: never ready for another frame
    struct StalledSink;

    impl Sink<Message> for StalledSink {
        type Error = WsError;

        fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), WsError>> {
            Poll::Pending
        }

        fn start_send(self: Pin<&mut Self>, _item: Message) -> Result<(), WsError> {
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), WsError>> {
            Poll::Pending
        }

        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), WsError>> {
            Poll::Pending
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_writer_exits_on_close_when_peer_stalls() {
        let (handle, outbox) = TransportHandle::new("192.0.2.1:1".parse().unwrap(), 8);
        handle
            .send(Message::Binary(Bytes::from_static(b"stuck")))
            .await
            .unwrap();
        let writer = tokio::spawn(write_loop(StalledSink, outbox));
        tokio::task::yield_now().await;

        handle
            .send(Message::Binary(Bytes::from_static(b"queued")))
            .await
            .unwrap();
        handle.close();
        tokio::time::timeout(Duration::from_secs(1), writer)
            .await
            .expect("writer stayed blocked after close")
            .unwrap();
    }

    #[tokio::test]
    async fn test_writer_stops_when_handle_dropped() {
        let (handle, outbox) = TransportHandle::new("192.0.2.1:1".parse().unwrap(), 8);
        drop(handle);
        let mut sink = MockSink::default();
        write_loop(&mut sink, outbox).await;
        assert!(sink.closed);
    }
}
