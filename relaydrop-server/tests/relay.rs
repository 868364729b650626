//! Integration tests for the relay over real WebSocket connections
//!
//! Each test starts a relay on an ephemeral loopback port and drives it with
//! plain tokio-tungstenite clients.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use relaydrop_common::chunk::{
    DEFAULT_CHUNK_SIZE, Reassembled, Reassembler, SENTINEL, chunk_count, encode_frame,
};
use relaydrop_common::protocol::{ControlMessage, Role};
use relaydrop_server::{ConnectionTracker, RelayConfig, SessionRegistry, SessionStatus, serve};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const STEP_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Helpers
// ============================================================================

async fn start_relay() -> (SocketAddr, SessionRegistry) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let config = Arc::new(RelayConfig::default());
    let registry = SessionRegistry::new(config.idle_timeout);
    let tracker = Arc::new(ConnectionTracker::new(0, 0));
    tokio::spawn(serve(listener, registry.clone(), config, tracker));
    (addr, registry)
}

fn url(addr: SocketAddr, code: &str, role: Role) -> String {
    format!("ws://{addr}/transfer?transferCode={code}&role={role}")
}

async fn connect(addr: SocketAddr, code: &str, role: Role) -> Client {
    let (ws, _) = tokio_tungstenite::connect_async(url(addr, code, role))
        .await
        .unwrap();
    ws
}

async fn send_control(ws: &mut Client, message: ControlMessage) {
    ws.send(Message::Text(message.to_json().unwrap().into()))
        .await
        .unwrap();
}

/// Next text or binary frame, `None` once the relay closes the connection
async fn next_frame(ws: &mut Client) -> Option<Message> {
    loop {
        let frame = tokio::time::timeout(STEP_TIMEOUT, ws.next())
            .await
            .expect("relay did not answer in time");
        match frame {
            Some(Ok(Message::Text(text))) => return Some(Message::Text(text)),
            Some(Ok(Message::Binary(data))) => return Some(Message::Binary(data)),
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return None,
            Some(Ok(_)) => continue,
        }
    }
}

async fn next_control(ws: &mut Client) -> ControlMessage {
    match next_frame(ws).await {
        Some(Message::Text(text)) => ControlMessage::from_json(&text).unwrap(),
        other => panic!("expected a control message, got {other:?}"),
    }
}

async fn register_sender(ws: &mut Client, code: &str, size: u64) {
    let register = ControlMessage::register_sender(code, Some("photo.jpg".into()), size);
    send_control(ws, register).await;
    assert_eq!(next_control(ws).await.kind(), "connected");
}

/// Sender and receiver registered and paired
async fn paired(addr: SocketAddr, code: &str, size: u64) -> (Client, Client) {
    let mut sender = connect(addr, code, Role::Sender).await;
    register_sender(&mut sender, code, size).await;

    let mut receiver = connect(addr, code, Role::Receiver).await;
    send_control(&mut receiver, ControlMessage::register(code, Role::Receiver)).await;
    assert_eq!(next_control(&mut receiver).await.kind(), "connected");

    match next_control(&mut receiver).await {
        ControlMessage::PeerConnected {
            peer_address,
            file_name,
            file_size,
            ..
        } => {
            assert!(peer_address.unwrap().starts_with("127.0.0.1:"));
            assert_eq!(file_name.as_deref(), Some("photo.jpg"));
            assert_eq!(file_size, Some(size));
        }
        other => panic!("expected peerConnected, got {other:?}"),
    }
    assert_eq!(next_control(&mut sender).await.kind(), "peerConnected");
    (sender, receiver)
}

// ============================================================================
// Transfers
// ============================================================================

#[tokio::test]
async fn test_full_transfer_through_relay() {
    let code = "482193";
    let size = 2_500_000usize;
    let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
    let total = chunk_count(size as u64, DEFAULT_CHUNK_SIZE).unwrap();
    assert_eq!(total, 3);

    let (addr, registry) = start_relay().await;
    let (mut sender, mut receiver) = paired(addr, code, size as u64).await;

    send_control(&mut receiver, ControlMessage::ready(code)).await;
    assert_eq!(next_control(&mut sender).await.kind(), "ready");
    assert_eq!(registry.status(code), Some(SessionStatus::Transferring));

    let mut sent = 0u64;
    for (index, chunk) in data.chunks(DEFAULT_CHUNK_SIZE).enumerate() {
        let index = index as u32;
        if index + 1 == total {
            send_control(&mut sender, ControlMessage::final_chunk(code, total)).await;
        }
        let frame = encode_frame(index, total, chunk).unwrap();
        sender.send(Message::Binary(frame.into())).await.unwrap();
        sent += chunk.len() as u64;
        let progress = sent as f64 / size as f64;
        send_control(
            &mut sender,
            ControlMessage::progress(code, progress, sent, size as u64),
        )
        .await;
    }

    let mut reassembler = Reassembler::with_expected_size(size as u64);
    let mut frames = Vec::new();
    let mut last_progress = 0.0;
    let mut received = None;
    let mut completed = false;
    while let Some(frame) = next_frame(&mut receiver).await {
        match frame {
            Message::Binary(bytes) => {
                frames.push(bytes.clone());
                if let Reassembled::Complete(file) = reassembler.push(&bytes).unwrap() {
                    received = Some(file);
                }
            }
            Message::Text(text) => match ControlMessage::from_json(&text).unwrap() {
                ControlMessage::Progress { progress, .. } => {
                    assert!(progress >= last_progress);
                    last_progress = progress;
                }
                ControlMessage::FinalChunk { total_chunks, .. } => {
                    reassembler.announce_final(total_chunks)
                }
                ControlMessage::Complete { success, .. } => {
                    assert!(success);
                    completed = true;
                }
                other => panic!("unexpected {other:?}"),
            },
            _ => unreachable!(),
        }
    }

    assert!(completed);
    assert_eq!(frames.len(), 3);
    assert!(frames[2].ends_with(SENTINEL));
    assert!(!frames[0].ends_with(SENTINEL));
    assert_eq!(received.unwrap(), data);
    assert_eq!(registry.status(code), Some(SessionStatus::Completed));

    // Sender is told the outcome too
    let mut sender_done = false;
    while let Some(frame) = next_frame(&mut sender).await {
        if let Message::Text(text) = frame
            && let ControlMessage::Complete { success, .. } = ControlMessage::from_json(&text).unwrap()
        {
            assert!(success);
            sender_done = true;
        }
    }
    assert!(sender_done);
}

#[tokio::test]
async fn test_empty_file_is_one_final_frame() {
    let code = "100200";
    let (addr, _registry) = start_relay().await;
    let (mut sender, mut receiver) = paired(addr, code, 0).await;
    send_control(&mut receiver, ControlMessage::ready(code)).await;
    assert_eq!(next_control(&mut sender).await.kind(), "ready");

    send_control(&mut sender, ControlMessage::final_chunk(code, 1)).await;
    let frame = encode_frame(0, 1, &[]).unwrap();
    sender.send(Message::Binary(frame.into())).await.unwrap();

    assert_eq!(next_control(&mut receiver).await.kind(), "finalChunk");
    match next_frame(&mut receiver).await {
        Some(Message::Binary(bytes)) => {
            let mut reassembler = Reassembler::with_expected_size(0);
            assert_eq!(
                reassembler.push(&bytes).unwrap(),
                Reassembled::Complete(Vec::new())
            );
        }
        other => panic!("expected a chunk, got {other:?}"),
    }
    assert!(matches!(
        next_control(&mut receiver).await,
        ControlMessage::Complete { success: true, .. }
    ));
}

// ============================================================================
// Rejections
// ============================================================================

#[tokio::test]
async fn test_receiver_with_unknown_code_rejected() {
    let (addr, registry) = start_relay().await;
    let mut receiver = connect(addr, "000000", Role::Receiver).await;
    send_control(
        &mut receiver,
        ControlMessage::register("000000", Role::Receiver),
    )
    .await;

    match next_control(&mut receiver).await {
        ControlMessage::Error { error_message, .. } => {
            assert!(error_message.starts_with("InvalidCode"));
        }
        other => panic!("expected error, got {other:?}"),
    }
    assert!(next_frame(&mut receiver).await.is_none());
    assert!(!registry.contains("000000"));
}

#[tokio::test]
async fn test_bad_upgrade_query_rejected() {
    let (addr, _registry) = start_relay().await;
    let result = tokio_tungstenite::connect_async(format!(
        "ws://{addr}/transfer?transferCode=12ab56&role=sender"
    ))
    .await;
    match result {
        Err(WsError::Http(response)) => assert_eq!(response.status(), 400),
        other => panic!("expected HTTP 400, got {:?}", other.map(|(_, r)| r.status())),
    }
}

#[tokio::test]
async fn test_second_sender_rejected() {
    let (addr, _registry) = start_relay().await;
    let mut first = connect(addr, "303030", Role::Sender).await;
    register_sender(&mut first, "303030", 10).await;

    let mut second = connect(addr, "303030", Role::Sender).await;
    let mut register = ControlMessage::register("303030", Role::Sender);
    if let ControlMessage::Register { file_size, .. } = &mut register {
        *file_size = Some(10);
    }
    send_control(&mut second, register).await;
    match next_control(&mut second).await {
        ControlMessage::Error { error_message, .. } => {
            assert!(error_message.starts_with("CodeAlreadyInUse"));
        }
        other => panic!("expected error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_register_must_match_query() {
    let (addr, _registry) = start_relay().await;
    let mut ws = connect(addr, "404040", Role::Sender).await;
    send_control(&mut ws, ControlMessage::register("404041", Role::Sender)).await;
    match next_control(&mut ws).await {
        ControlMessage::Error { error_message, .. } => {
            assert!(error_message.starts_with("RegistrationMismatch"));
        }
        other => panic!("expected error, got {other:?}"),
    }
}

// ============================================================================
// Cancel and disconnect
// ============================================================================

#[tokio::test]
async fn test_receiver_cancel_reaches_both_sides() {
    let code = "515151";
    let (addr, registry) = start_relay().await;
    let (mut sender, mut receiver) = paired(addr, code, 3 * 1024).await;
    send_control(&mut receiver, ControlMessage::ready(code)).await;
    assert_eq!(next_control(&mut sender).await.kind(), "ready");

    let frame = encode_frame(0, 3, &[7u8; 1024]).unwrap();
    sender.send(Message::Binary(frame.into())).await.unwrap();
    assert!(matches!(
        next_frame(&mut receiver).await,
        Some(Message::Binary(_))
    ));

    send_control(&mut receiver, ControlMessage::cancel(code)).await;
    assert_eq!(next_control(&mut sender).await.kind(), "cancel");
    assert!(next_frame(&mut sender).await.is_none());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(registry.status(code), Some(SessionStatus::Cancelled));
    assert!(!registry.contains(code));
}

#[tokio::test]
async fn test_sender_disconnect_fails_transfer() {
    let code = "626262";
    let (addr, registry) = start_relay().await;
    let (sender, mut receiver) = paired(addr, code, 10).await;
    drop(sender);

    match next_control(&mut receiver).await {
        ControlMessage::Complete {
            success,
            error_message,
            ..
        } => {
            assert!(!success);
            assert!(error_message.unwrap().contains("closed unexpectedly"));
        }
        other => panic!("expected complete, got {other:?}"),
    }
    assert_eq!(registry.status(code), Some(SessionStatus::Failed));
}
