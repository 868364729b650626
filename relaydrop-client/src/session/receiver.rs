//! Receiving side of a transfer

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::{Stream, StreamExt};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};

use relaydrop_common::chunk::Reassembled;
use relaydrop_common::hash::sha256_hex;
use relaydrop_common::protocol::{ControlMessage, Role};
use relaydrop_common::validators::{validate_file_name, validate_transfer_code};

use super::{Incoming, Progress, RelayReader, SessionHooks, conclude, control, notify_cancel};
use crate::candidates::Candidate;
use crate::config::{ClientConfig, PART_SUFFIX};
use crate::engine::{ChunkSink, ReceiveTable, TransferProgress, WsChunkSink};
use crate::error::TransferError;
use crate::outcome::TransferOutcome;
use crate::racer::race;
use crate::transport::WsDialer;

/// Which code to fetch, from where, into which directory
#[derive(Debug, Clone)]
pub struct ReceiveRequest {
    pub code: String,
    /// Prioritized relay addresses
    pub candidates: Vec<Candidate>,
    pub out_dir: PathBuf,
}

/// Name used when the sender did not announce one
fn fallback_file_name(code: &str) -> String {
    format!("relaydrop-{code}.bin")
}

/// Receive one file through the first relay candidate that answers
///
/// The file is written as `<name>.part` and renamed once complete; an
/// existing file is never overwritten. Always returns an outcome.
pub async fn receive_file(
    request: &ReceiveRequest,
    config: &ClientConfig,
    hooks: &SessionHooks,
    table: &ReceiveTable,
) -> TransferOutcome {
    let mut progress = Progress::default();
    let result = run(request, config, hooks, table, &mut progress).await;
    table.discard(&request.code);
    conclude(&request.code, progress, result, hooks)
}

async fn run(
    request: &ReceiveRequest,
    config: &ClientConfig,
    hooks: &SessionHooks,
    table: &ReceiveTable,
    progress: &mut Progress,
) -> Result<(), TransferError> {
    let code = request.code.as_str();
    validate_transfer_code(code)?;

    let dialer = Arc::new(WsDialer::new(code, Role::Receiver));
    let winner = race(&request.candidates, &config.ports, &config.race, dialer).await?;
    info!(code = %code, relay = %winner.attempt.target, "connected to relay");

    let (sink, stream) = winner.connection.split();
    let mut sink = WsChunkSink::new(sink);
    let mut reader = RelayReader::new(stream);

    let result = receive(
        code,
        &request.out_dir,
        config,
        hooks,
        table,
        &mut sink,
        &mut reader,
        progress,
    )
    .await;
    notify_cancel(code, &result, &hooks.cancel, &mut sink).await;
    result
}

#[allow(clippy::too_many_arguments)]
async fn receive<K, S>(
    code: &str,
    out_dir: &Path,
    config: &ClientConfig,
    hooks: &SessionHooks,
    table: &ReceiveTable,
    sink: &mut K,
    reader: &mut RelayReader<S>,
    progress: &mut Progress,
) -> Result<(), TransferError>
where
    K: ChunkSink,
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    sink.send_control(&ControlMessage::register(code, Role::Receiver))
        .await?;

    match reader
        .expect(&hooks.cancel, config.reply_timeout, "connected")
        .await?
    {
        ControlMessage::Connected { .. } => {}
        other => return Err(TransferError::UnexpectedMessage(other.kind())),
    }

    let (file_name, file_size) = match reader
        .expect(&hooks.cancel, config.peer_timeout, "peerConnected")
        .await?
    {
        ControlMessage::PeerConnected {
            peer_address,
            file_name,
            file_size,
            ..
        } => {
            info!(code = %code, peer = peer_address.as_deref().unwrap_or("-"), "sender connected");
            progress.peer_address = peer_address;
            (file_name.unwrap_or_else(|| fallback_file_name(code)), file_size)
        }
        other => return Err(TransferError::UnexpectedMessage(other.kind())),
    };
    validate_file_name(&file_name)?;
    progress.file_name = Some(file_name.clone());
    progress.size = file_size.unwrap_or(0);

    let target = out_dir.join(&file_name);
    if tokio::fs::try_exists(&target).await? {
        return Err(TransferError::OutputExists(target.display().to_string()));
    }

    table.begin(code, file_size);
    sink.send_control(&ControlMessage::ready(code)).await?;

    let data = collect_chunks(code, file_size, config, hooks, table, reader).await?;
    progress.size = data.len() as u64;
    progress.checksum = Some(sha256_hex(&data));

    let plain = hooks.transform.reverse(data)?;
    write_output(&target, &plain).await?;
    info!(code = %code, path = %target.display(), bytes = plain.len(), "file saved");
    Ok(())
}

/// Feed relay frames to the reassembler until the stream and the relay's
/// `complete` have both arrived
async fn collect_chunks<S>(
    code: &str,
    expected_size: Option<u64>,
    config: &ClientConfig,
    hooks: &SessionHooks,
    table: &ReceiveTable,
    reader: &mut RelayReader<S>,
) -> Result<Vec<u8>, TransferError>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let mut data: Option<Vec<u8>> = None;

    loop {
        let incoming = tokio::select! {
            _ = hooks.cancel.cancelled() => return Err(TransferError::Cancelled),
            incoming = timeout(config.chunk_timeout, reader.next()) => {
                incoming.map_err(|_| TransferError::Timeout("chunk"))?
            }
        };

        match incoming {
            Ok(Incoming::Chunk(frame)) => match table.push(code, &frame)? {
                Reassembled::Pending {
                    bytes_received,
                    progress,
                    ..
                } => report(hooks, code, progress, bytes_received, expected_size.unwrap_or(0)),
                Reassembled::Complete(bytes) => {
                    let total = bytes.len() as u64;
                    report(hooks, code, 1.0, total, total);
                    data = Some(bytes);
                }
            },
            // The relay closes right after `complete`; a finished stream is enough
            Ok(Incoming::Closed) if data.is_some() => break,
            other => match control(other)? {
                ControlMessage::FinalChunk { total_chunks, .. } => {
                    table.announce_final(code, total_chunks);
                }
                ControlMessage::Complete { success: true, .. } => {
                    if data.is_some() {
                        break;
                    }
                    return Err(TransferError::Failed(
                        "relay reported completion before the final chunk".to_string(),
                    ));
                }
                ControlMessage::Progress { .. } => {}
                message => return Err(TransferError::UnexpectedMessage(message.kind())),
            },
        }
    }

    data.ok_or(TransferError::TransportClosedUnexpectedly)
}

fn report(hooks: &SessionHooks, code: &str, progress: f64, bytes: u64, total: u64) {
    debug!(code = %code, progress, bytes, "chunk received");
    if let Some(callback) = &hooks.on_progress {
        callback(&TransferProgress {
            transfer_code: code.to_string(),
            progress,
            bytes_transferred: bytes,
            total_bytes: total,
        });
    }
}

/// Write via a `.part` file, then move into place without overwriting
async fn write_output(target: &Path, data: &[u8]) -> Result<(), TransferError> {
    let mut part = target.as_os_str().to_owned();
    part.push(PART_SUFFIX);
    let part = PathBuf::from(part);

    if let Err(e) = tokio::fs::write(&part, data).await {
        let _ = tokio::fs::remove_file(&part).await;
        return Err(e.into());
    }
    if tokio::fs::try_exists(target).await? {
        warn!(path = %target.display(), "output appeared during transfer, keeping partial file");
        return Err(TransferError::OutputExists(target.display().to_string()));
    }
    tokio::fs::rename(&part, target).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_file_name_is_valid() {
        let name = fallback_file_name("123456");
        assert_eq!(name, "relaydrop-123456.bin");
        assert!(validate_file_name(&name).is_ok());
    }

    #[tokio::test]
    async fn test_write_output_renames_part_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("notes.txt");

        write_output(&target, b"hello").await.unwrap();

        assert_eq!(tokio::fs::read(&target).await.unwrap(), b"hello");
        assert!(!dir.path().join("notes.txt.part").exists());
    }

    #[tokio::test]
    async fn test_write_output_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("notes.txt");
        tokio::fs::write(&target, b"original").await.unwrap();

        let result = write_output(&target, b"replacement").await;

        assert!(matches!(result, Err(TransferError::OutputExists(_))));
        assert_eq!(tokio::fs::read(&target).await.unwrap(), b"original");
    }
}
