//! Sending side of a transfer

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::{Stream, StreamExt};
use tokio::io::AsyncRead;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info};

use relaydrop_common::protocol::{ControlMessage, Role};
use relaydrop_common::validators::{FileNameError, validate_file_name, validate_transfer_code};

use super::{Incoming, Progress, RelayReader, SessionHooks, conclude, control, notify_cancel};
use crate::candidates::Candidate;
use crate::config::ClientConfig;
use crate::engine::{ChunkEngine, ChunkSink, SendReport, WsChunkSink};
use crate::error::TransferError;
use crate::outcome::TransferOutcome;
use crate::racer::race;
use crate::transform::ByteTransform;
use crate::transport::WsDialer;

/// What to send and where the relay might be
#[derive(Debug, Clone)]
pub struct SendRequest {
    pub code: String,
    pub path: PathBuf,
    /// Prioritized relay addresses
    pub candidates: Vec<Candidate>,
}

/// How the chunk stream ended
enum StreamEnd {
    Sent(Result<SendReport, TransferError>),
    /// The relay spoke (or hung up) before the stream finished
    Interrupted(Result<Incoming, TransferError>),
}

/// Send one file through the first relay candidate that answers
///
/// With an identity transform the file is streamed from disk one chunk at a
/// time, so memory use is bounded by the chunk size. Any other transform
/// needs the whole file, and its output, in memory.
///
/// Always returns an outcome; failures are described in it rather than
/// returned as errors.
pub async fn send_file(
    request: &SendRequest,
    config: &ClientConfig,
    hooks: &SessionHooks,
) -> TransferOutcome {
    let mut progress = Progress::default();
    let result = run(request, config, hooks, &mut progress).await;
    conclude(&request.code, progress, result, hooks)
}

async fn run(
    request: &SendRequest,
    config: &ClientConfig,
    hooks: &SessionHooks,
    progress: &mut Progress,
) -> Result<(), TransferError> {
    let code = request.code.as_str();
    validate_transfer_code(code)?;

    let file_name = request
        .path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or(TransferError::InvalidFileName(FileNameError::Empty))?
        .to_string();
    validate_file_name(&file_name)?;
    progress.file_name = Some(file_name.clone());

    let (mut source, size) = open_source(&request.path, hooks.transform.as_ref()).await?;
    progress.size = size;

    let dialer = Arc::new(WsDialer::new(code, Role::Sender));
    let winner = race(&request.candidates, &config.ports, &config.race, dialer).await?;
    info!(code = %code, relay = %winner.attempt.target, "connected to relay");

    let (sink, stream) = winner.connection.split();
    let mut sink = WsChunkSink::new(sink);
    let mut reader = RelayReader::new(stream);

    let result = handshake_and_stream(
        code,
        &file_name,
        &mut source,
        size,
        config,
        hooks,
        &mut sink,
        &mut reader,
        progress,
    )
    .await;
    notify_cancel(code, &result, &hooks.cancel, &mut sink).await;
    result
}

type Source = Box<dyn AsyncRead + Unpin + Send>;

/// Bytes to send and their length
///
/// Reads the file whole only when the transform has to see all of it.
async fn open_source(path: &Path, transform: &dyn ByteTransform) -> Result<(Source, u64), TransferError> {
    if transform.is_identity() {
        let file = tokio::fs::File::open(path).await?;
        let size = file.metadata().await?.len();
        debug!(path = %path.display(), size, "streaming file from disk");
        let source: Source = Box::new(file);
        return Ok((source, size));
    }
    let data = transform.forward(tokio::fs::read(path).await?)?;
    let size = data.len() as u64;
    let source: Source = Box::new(Cursor::new(data));
    Ok((source, size))
}

#[allow(clippy::too_many_arguments)]
async fn handshake_and_stream<K, S, R>(
    code: &str,
    file_name: &str,
    source: &mut R,
    size: u64,
    config: &ClientConfig,
    hooks: &SessionHooks,
    sink: &mut K,
    reader: &mut RelayReader<S>,
    progress: &mut Progress,
) -> Result<(), TransferError>
where
    K: ChunkSink,
    S: Stream<Item = Result<Message, WsError>> + Unpin,
    R: AsyncRead + Unpin + Send,
{
    sink.send_control(&ControlMessage::register_sender(
        code,
        Some(file_name.to_string()),
        size,
    ))
    .await?;

    match reader
        .expect(&hooks.cancel, config.reply_timeout, "connected")
        .await?
    {
        ControlMessage::Connected { .. } => {}
        other => return Err(TransferError::UnexpectedMessage(other.kind())),
    }
    info!(code = %code, "registered, waiting for the receiver");

    match reader
        .expect(&hooks.cancel, config.peer_timeout, "peerConnected")
        .await?
    {
        ControlMessage::PeerConnected { peer_address, .. } => {
            info!(code = %code, peer = peer_address.as_deref().unwrap_or("-"), "receiver connected");
            progress.peer_address = peer_address;
        }
        other => return Err(TransferError::UnexpectedMessage(other.kind())),
    }

    match reader
        .expect(&hooks.cancel, config.peer_timeout, "ready")
        .await?
    {
        ControlMessage::Ready { .. } => {}
        other => return Err(TransferError::UnexpectedMessage(other.kind())),
    }

    let engine = ChunkEngine::new(config.chunk_size, hooks.cancel.clone());
    // The relay may confirm before the final send future is polled again
    let mut confirmed = false;
    let end = {
        let send = engine.send(
            code,
            source,
            size,
            sink,
            hooks.on_progress.as_ref(),
            None,
        );
        tokio::pin!(send);
        loop {
            tokio::select! {
                biased;
                result = &mut send => break StreamEnd::Sent(result),
                _ = hooks.cancel.cancelled() => break StreamEnd::Sent(Err(TransferError::Cancelled)),
                incoming = reader.next(), if !confirmed => match incoming {
                    Ok(Incoming::Control(ControlMessage::Progress { .. })) => continue,
                    Ok(Incoming::Control(ControlMessage::Complete { success: true, .. })) => {
                        confirmed = true;
                    }
                    other => break StreamEnd::Interrupted(other),
                },
            }
        }
    };

    match end {
        StreamEnd::Sent(Ok(report)) => {
            progress.checksum = Some(report.checksum);
        }
        StreamEnd::Sent(Err(e)) => return Err(e),
        StreamEnd::Interrupted(incoming) => {
            // Anything else the relay says mid-stream is a protocol violation
            let message = control(incoming)?;
            return Err(TransferError::UnexpectedMessage(message.kind()));
        }
    }
    if confirmed {
        return Ok(());
    }

    match reader
        .expect(&hooks.cancel, config.reply_timeout, "complete")
        .await?
    {
        ControlMessage::Complete { success: true, .. } => {
            debug!(code = %code, "relay confirmed completion");
            Ok(())
        }
        other => Err(TransferError::UnexpectedMessage(other.kind())),
    }
}
