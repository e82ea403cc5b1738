//! TCP server for gamepad devices: accept loop, handshake and relay loop.
//!
//! Frames are newline-delimited JSON read through a [`LinesCodec`] with a
//! bounded line length.  A session moves through
//! `Connected → Authenticating → Registered → Closed`:
//!
//! 1. A gamepad id is generated and the write half is registered.
//! 2. Lines are read (each bounded by the handshake timeout) until a valid
//!    `gpHandshakeReq` admits the device or the handshake fails.
//! 3. The relay loop runs alongside the ping loop without a read deadline.
//! 4. On EOF or a read error the ping loop is cancelled, the device is
//!    unregistered and the socket is shut down.

use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use futures_util::StreamExt;
use regap_core::{decode, encode_line, CodecError, Message};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::application::{HandshakeError, HandshakeStep, MessageWriter, TcpManager, WriteError};
use crate::infrastructure::ping::run_ping_loop;

/// Longest accepted line, newline excluded.
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

type Lines = FramedRead<OwnedReadHalf, LinesCodec>;

/// Timeouts applied to each gamepad session.
#[derive(Debug, Clone, Copy)]
pub struct TcpSessionTimings {
    pub ping_interval: Duration,
    pub handshake_timeout: Duration,
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Runs the gamepad accept loop on `listener` until `running` is cleared.
///
/// # Errors
///
/// Returns an error only if the listener's local address cannot be read.
pub async fn run_tcp_server(
    listener: TcpListener,
    manager: Arc<TcpManager>,
    timings: TcpSessionTimings,
    running: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let local = listener
        .local_addr()
        .context("failed to read gamepad listener address")?;
    info!(addr = %local, "gamepad TCP server listening");

    loop {
        if !running.load(Ordering::Relaxed) {
            info!("shutdown flag set; stopping gamepad accept loop");
            break;
        }

        match timeout(Duration::from_millis(200), listener.accept()).await {
            Ok(Ok((stream, peer_addr))) => {
                debug!(peer = %peer_addr, "new gamepad connection");
                let manager = Arc::clone(&manager);
                tokio::spawn(async move {
                    handle_gamepad_session(stream, peer_addr, manager, timings).await;
                });
            }
            Ok(Err(e)) => error!("gamepad accept error: {e}"),
            Err(_) => {}
        }
    }

    Ok(())
}

// ── Write half ────────────────────────────────────────────────────────────────

struct TcpWriter {
    half: Mutex<OwnedWriteHalf>,
}

impl TcpWriter {
    fn new(half: OwnedWriteHalf) -> Self {
        Self {
            half: Mutex::new(half),
        }
    }

    async fn shutdown(&self) {
        let mut half = self.half.lock().await;
        if let Err(e) = half.shutdown().await {
            debug!("shutting down gamepad socket failed: {e}");
        }
    }
}

#[async_trait]
impl MessageWriter for TcpWriter {
    async fn write_message(&self, msg: &Message) -> Result<(), WriteError> {
        let line = encode_line(msg)?;
        let mut half = self.half.lock().await;
        half.write_all(&line)
            .await
            .map_err(|e| WriteError::Transport(e.to_string()))
    }
}

// ── Per-session handler ───────────────────────────────────────────────────────

async fn handle_gamepad_session(
    stream: TcpStream,
    peer_addr: SocketAddr,
    manager: Arc<TcpManager>,
    timings: TcpSessionTimings,
) {
    match run_session(stream, peer_addr, manager, timings).await {
        Ok(()) => info!(peer = %peer_addr, "gamepad session closed"),
        Err(e) => warn!(peer = %peer_addr, "gamepad session closed with error: {e:#}"),
    }
}

async fn run_session(
    stream: TcpStream,
    peer_addr: SocketAddr,
    manager: Arc<TcpManager>,
    timings: TcpSessionTimings,
) -> anyhow::Result<()> {
    let (read_half, write_half) = stream.into_split();
    let mut lines = FramedRead::new(
        read_half,
        LinesCodec::new_with_max_length(MAX_LINE_LENGTH),
    );
    let writer = Arc::new(TcpWriter::new(write_half));
    let gamepad_id = manager.register_connection(writer.clone());

    if let Err(e) =
        await_handshake(&manager, &gamepad_id, &mut lines, timings.handshake_timeout).await
    {
        manager.unregister_connection(&gamepad_id).await;
        writer.shutdown().await;
        return Err(e).with_context(|| format!("gamepad {peer_addr} handshake failed"));
    }

    let cancel = CancellationToken::new();
    let ping_task = tokio::spawn(run_ping_loop(
        writer.clone(),
        timings.ping_interval,
        cancel.clone(),
        gamepad_id.clone(),
    ));

    let result = relay_loop(&manager, &gamepad_id, &mut lines).await;

    cancel.cancel();
    if let Err(e) = ping_task.await {
        debug!(gamepad_id = %gamepad_id, "ping task ended abnormally: {e}");
    }
    manager.unregister_connection(&gamepad_id).await;
    writer.shutdown().await;

    result
}

/// Reads lines until the device is admitted, each read bounded by `limit`.
async fn await_handshake(
    manager: &TcpManager,
    gamepad_id: &str,
    lines: &mut Lines,
    limit: Duration,
) -> Result<(), HandshakeError> {
    loop {
        let line = match timeout(limit, lines.next()).await {
            Err(_) => return Err(HandshakeError::Timeout),
            Ok(None) => return Err(HandshakeError::Closed),
            Ok(Some(Err(LinesCodecError::MaxLineLengthExceeded))) => {
                warn!(gamepad_id, "dropping over-long line during handshake");
                continue;
            }
            Ok(Some(Err(LinesCodecError::Io(e)))) => {
                return Err(HandshakeError::Read(e.to_string()))
            }
            Ok(Some(Ok(line))) => line,
        };

        let msg = match decode(&line) {
            Ok(msg) => msg,
            Err(CodecError::Empty) => continue,
            Err(e) => {
                warn!(gamepad_id, "dropping malformed line during handshake: {e}");
                continue;
            }
        };
        if manager.handshake(gamepad_id, msg).await? == HandshakeStep::Accepted {
            return Ok(());
        }
    }
}

/// Reads lines from an admitted device until EOF or a read error.
async fn relay_loop(manager: &TcpManager, gamepad_id: &str, lines: &mut Lines) -> anyhow::Result<()> {
    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(line) => line,
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                warn!(gamepad_id, "dropping over-long line");
                continue;
            }
            Err(LinesCodecError::Io(e)) => {
                debug!(gamepad_id, "gamepad read failed: {e}");
                break;
            }
        };

        let msg = match decode(&line) {
            Ok(msg) => msg,
            Err(CodecError::Empty) => continue,
            Err(e) => {
                warn!(gamepad_id, "dropping malformed line: {e}");
                continue;
            }
        };
        debug!(gamepad_id, msg_type = %msg.msg_type, "gamepad frame");
        manager.handle_message(gamepad_id, msg).await?;
    }
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
