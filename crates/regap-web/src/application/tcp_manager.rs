//! TCP-side connection manager and gamepad handshake.
//!
//! Every gamepad device holds one TCP connection carrying newline-delimited
//! JSON.  A gamepad id is generated the moment the connection is accepted,
//! so an early disconnect can always be unregistered.  The device is then
//! admitted by [`TcpManager::handshake`]:
//!
//! ```text
//!  device                                   server
//!  {"MsgType":"gpHandshakeReq",
//!   "GamepadHandshakeRequest":{"Name":..,"Digest":hex(sha256(secret))}}  ──▶
//!                      ◀── {"MsgType":"gpHandshakeRes","GamepadHandshakeResponse":{"GamepadId":..}}
//! ```
//!
//! After the handshake the relay loop hands each frame to
//! [`TcpManager::handle_message`], and messages from controllers reach the
//! device through [`TcpManager::on_from_ws`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use regap_core::protocol::messages::{GamepadHandshakeResponse, GamepadUnregister};
use regap_core::{ClientType, ClientsStore, Message, MsgType, RelationIds};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::application::forwarder::{ForwardError, ForwardHandler, Forwarder};
use crate::application::writer::{MessageWriter, SessionError, WriteError};

/// Why a device was not admitted.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// No line arrived within the handshake timeout.
    #[error("handshake timed out")]
    Timeout,

    /// The device closed the connection before completing the handshake.
    #[error("connection closed during handshake")]
    Closed,

    /// Reading from the socket failed.
    #[error("read failed during handshake: {0}")]
    Read(String),

    /// `gpHandshakeReq` carried no payload or an empty digest.
    #[error("no gamepad handshake request parameter")]
    MissingDigest,

    /// The digest does not match the shared secret.
    #[error("digest mismatch")]
    DigestMismatch,

    /// Replying to the device failed.
    #[error("can not write gpHandshakeRes message: {0}")]
    Write(#[from] WriteError),
}

/// Result of feeding one frame to [`TcpManager::handshake`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStep {
    /// The frame was not a handshake request; keep reading.
    Skipped,
    /// The device is admitted and registered.
    Accepted,
}

/// Returns the lowercase hex SHA-256 digest devices must present.
pub fn handshake_digest(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

/// Connection table and protocol logic for gamepad devices.
pub struct TcpManager {
    clients: Mutex<HashMap<String, Arc<dyn MessageWriter>>>,
    store: Arc<ClientsStore>,
    forwarder: Arc<Forwarder>,
    digest: String,
}

impl TcpManager {
    pub fn new(store: Arc<ClientsStore>, forwarder: Arc<Forwarder>, secret: &str) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            store,
            forwarder,
            digest: handshake_digest(secret),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<dyn MessageWriter>>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn writer_of(&self, gamepad_id: &str) -> Option<Arc<dyn MessageWriter>> {
        self.lock().get(gamepad_id).map(Arc::clone)
    }

    // ── Connection lifecycle ──────────────────────────────────────────────────

    /// Adds a freshly accepted connection and returns its gamepad id.
    pub fn register_connection(&self, writer: Arc<dyn MessageWriter>) -> String {
        let gamepad_id = Uuid::new_v4().to_string();
        self.lock().insert(gamepad_id.clone(), writer);
        debug!(
            gamepad_id = %gamepad_id,
            connections = self.connection_count(),
            "gamepad connection accepted"
        );
        gamepad_id
    }

    /// Removes a connection and, if the device had completed its handshake,
    /// drops it from the registry and tells the WebSocket half.  The
    /// notification is best effort.
    pub async fn unregister_connection(&self, gamepad_id: &str) {
        if self.lock().remove(gamepad_id).is_none() {
            return;
        }
        if !self.store.delete(ClientType::Gamepad, gamepad_id) {
            debug!(gamepad_id, "gamepad closed before completing handshake");
            return;
        }
        info!(gamepad_id, connections = self.connection_count(), "gamepad disconnected");

        let notice = Message {
            gamepad_unregister: Some(GamepadUnregister {
                gamepad_id: gamepad_id.to_string(),
            }),
            ..Message::new(MsgType::GpUnregister)
        };
        if self.forwarder.to_ws(notice).await.is_none() {
            debug!(gamepad_id, "gpUnregister not forwarded");
        }
    }

    pub fn connection_count(&self) -> usize {
        self.lock().len()
    }

    // ── Handshake ─────────────────────────────────────────────────────────────

    /// Feeds one frame received before the device is admitted.
    ///
    /// Frames other than `gpHandshakeReq` are skipped.  A handshake request
    /// with a wrong or missing digest is answered with `gpHandshakeRes{Error}`
    /// and fails; a valid one is answered with the gamepad id and registers
    /// the device name (or the id, when the name is empty).
    ///
    /// # Errors
    ///
    /// [`HandshakeError::MissingDigest`], [`HandshakeError::DigestMismatch`],
    /// or [`HandshakeError::Write`] if the reply cannot be written.
    pub async fn handshake(
        &self,
        gamepad_id: &str,
        msg: Message,
    ) -> Result<HandshakeStep, HandshakeError> {
        if msg.msg_type != MsgType::GpHandshakeReq {
            debug!(gamepad_id, msg_type = %msg.msg_type, "skipping frame before handshake");
            return Ok(HandshakeStep::Skipped);
        }
        let writer = self
            .writer_of(gamepad_id)
            .ok_or(HandshakeError::Closed)?;

        let req = msg.gamepad_handshake_request.unwrap_or_default();
        let verdict = if req.digest.is_empty() {
            Err(HandshakeError::MissingDigest)
        } else if req.digest != self.digest {
            Err(HandshakeError::DigestMismatch)
        } else {
            Ok(())
        };
        if let Err(e) = verdict {
            warn!(gamepad_id, error = %e, "gamepad handshake rejected");
            writer
                .write_message(&Message::with_error(MsgType::GpHandshakeRes, e.to_string()))
                .await?;
            return Err(e);
        }

        let res = Message {
            gamepad_handshake_response: Some(GamepadHandshakeResponse {
                gamepad_id: gamepad_id.to_string(),
            }),
            ..Message::new(MsgType::GpHandshakeRes)
        };
        writer.write_message(&res).await?;

        let name = if req.name.is_empty() {
            gamepad_id
        } else {
            req.name.as_str()
        };
        self.store.add(ClientType::Gamepad, gamepad_id, name);
        info!(gamepad_id, name, "gamepad registered");
        Ok(HandshakeStep::Accepted)
    }

    // ── Device → server ───────────────────────────────────────────────────────

    /// Processes one frame from an admitted device.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] when the device is unknown or a reply to it
    /// cannot be written; the caller should close the connection.
    pub async fn handle_message(&self, gamepad_id: &str, msg: Message) -> Result<(), SessionError> {
        let writer = self
            .writer_of(gamepad_id)
            .ok_or_else(|| SessionError::UnknownClient(gamepad_id.to_string()))?;

        match msg.msg_type.clone() {
            MsgType::Ping => {
                debug!(gamepad_id, "received ping");
                Ok(())
            }
            MsgType::GpConnectRes => {
                let ids = msg.gamepad_connect_response.as_ref().map(|r| r.relation_ids());
                if let Err(reason) = check_own_ids(gamepad_id, ids, "no gamepad connect response parameter") {
                    warn!(gamepad_id, reason, "rejecting gpConnectRes");
                    let reply = Message::with_error(MsgType::GpConnectSrvErr, reason);
                    return writer.write_message(&reply).await.map_err(|source| {
                        SessionError::Write {
                            msg_type: MsgType::GpConnectSrvErr,
                            source,
                        }
                    });
                }
                let owned_id = gamepad_id.to_string();
                self.forwarder
                    .to_ws_with_error(msg, move |e| async move {
                        warn!(gamepad_id = %owned_id, error = %e, "gpConnectRes delivery failed");
                        let reply = Message::with_error(MsgType::GpConnectSrvErr, e.to_string());
                        if let Err(e) = writer.write_message(&reply).await {
                            debug!(gamepad_id = %owned_id, error = %e, "can not write gpConnectSrvErr message");
                        }
                    })
                    .await;
                Ok(())
            }
            MsgType::GpVibration => {
                let ids = msg.gamepad_vibration.as_ref().map(|v| v.relation_ids());
                if let Err(reason) = check_own_ids(gamepad_id, ids, "no gamepad vibration parameter") {
                    debug!(gamepad_id, reason, "dropping gpVibration");
                    return Ok(());
                }
                // Fire-and-forget: the receipt is dropped.
                let _ = self.forwarder.to_ws(msg).await;
                Ok(())
            }
            other => {
                warn!(gamepad_id, msg_type = %other, "unsupported message");
                Ok(())
            }
        }
    }

    // ── Browser → device ──────────────────────────────────────────────────────

    /// Writes a message from a controller to the gamepad it names.
    ///
    /// # Errors
    ///
    /// [`ForwardError::UnknownDestination`] when no device holds that id,
    /// [`ForwardError::WriteFailed`] when the write fails.
    pub async fn on_from_ws(&self, msg: Message) -> Result<(), ForwardError> {
        let gamepad_id = match msg.msg_type {
            MsgType::GpConnectReq => msg
                .gamepad_connect_request
                .as_ref()
                .map(|r| r.gamepad_id.clone()),
            MsgType::GpState => msg.gamepad_state.as_ref().map(|s| s.gamepad_id.clone()),
            ref other => return Err(ForwardError::Unsupported(other.clone())),
        }
        .ok_or_else(|| ForwardError::MissingPayload(msg.msg_type.clone()))?;

        let writer = self
            .writer_of(&gamepad_id)
            .ok_or_else(|| ForwardError::UnknownDestination(format!("gamepad id {gamepad_id}")))?;
        writer
            .write_message(&msg)
            .await
            .map_err(|_| ForwardError::WriteFailed(msg.msg_type.clone()))
    }
}

/// Checks that a device frame carries all three ids and names the device itself.
fn check_own_ids(
    gamepad_id: &str,
    ids: Option<RelationIds>,
    missing: &'static str,
) -> Result<(), &'static str> {
    let ids = ids.filter(RelationIds::is_complete).ok_or(missing)?;
    if ids.gamepad_id != gamepad_id {
        return Err("gamepad id mismatch");
    }
    Ok(())
}

#[async_trait]
impl ForwardHandler for TcpManager {
    async fn handle(&self, msg: Message) -> Result<(), ForwardError> {
        self.on_from_ws(msg).await
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
