//! WebSocket-side connection manager and relation state machine.
//!
//! Owns every deliverer and controller connection together with its
//! [`Relation`].  Browser frames arrive through [`WsManager::handle_message`];
//! frames from gamepad devices arrive through the forwarder's from-TCP lane
//! and are routed by [`WsManager::on_from_tcp`].
//!
//! # Signaling flow
//!
//! ```text
//!  deliverer                     server                       controller
//!  sigOfferSdpReq ──────▶ propose(d) ─────────────────────▶ sigOfferSdpReq
//!  sigOfferSdpRes ◀────── commit(d) + propose_and_commit(c) ◀ sigOfferSdpRes
//!  sigAnswerSdpReq ◀───── both committed? ───────────────── sigAnswerSdpReq
//!  sigAnswerSdpRes ─────▶ both committed? ────────────────▶ sigAnswerSdpRes
//! ```
//!
//! After the offer leg both connections hold the same committed triple and
//! the controller may send `gpConnectReq`/`gpState` toward the gamepad.
//!
//! # Gamepad departure
//!
//! When a device that completed its handshake disconnects, the TCP half sends
//! `gpUnregister` over the forwarder.  The gamepad leaves the registry and the
//! frame is relayed unchanged to every browser whose relation names that
//! gamepad, so browsers see it on the wire:
//!
//! ```text
//! {"MsgType":"gpUnregister","GamepadUnregister":{"GamepadId":"<gamepad id>"}}
//! ```
//!
//! Relations are left as they are; the browsers decide whether to tear down.
//!
//! # Locking
//!
//! The connection table lock is held only for lookups and relation changes.
//! Writers are cloned out of the table and written to after the lock is
//! released, so the table lock is never held across a socket write.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use regap_core::protocol::messages::{LookupResponse, RegisterResponse};
use regap_core::{ClientType, ClientsStore, Message, MsgType, Relation, RelationIds};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::application::forwarder::{ForwardError, ForwardHandler, Forwarder};
use crate::application::writer::{MessageWriter, SessionError};

struct WsClient {
    client_type: ClientType,
    writer: Arc<dyn MessageWriter>,
    relation: Relation,
}

/// The connection a message came from.
struct Sender<'a> {
    id: &'a str,
    client_type: ClientType,
    writer: Arc<dyn MessageWriter>,
}

/// Connection table and protocol logic for deliverers and controllers.
pub struct WsManager {
    clients: Mutex<HashMap<String, WsClient>>,
    store: Arc<ClientsStore>,
    forwarder: Arc<Forwarder>,
}

impl WsManager {
    pub fn new(store: Arc<ClientsStore>, forwarder: Arc<Forwarder>) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            store,
            forwarder,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, WsClient>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Connection lifecycle ──────────────────────────────────────────────────

    /// Adds a freshly upgraded connection and returns its client id.
    ///
    /// The role is fixed for the connection's lifetime.
    pub fn register_connection(
        &self,
        client_type: ClientType,
        writer: Arc<dyn MessageWriter>,
    ) -> String {
        let client_id = Uuid::new_v4().to_string();
        self.lock().insert(
            client_id.clone(),
            WsClient {
                client_type,
                writer,
                relation: Relation::None,
            },
        );
        info!(
            %client_type,
            client_id = %client_id,
            connections = self.connection_count(),
            "websocket client connected"
        );
        client_id
    }

    /// Removes a connection from the table and its entry from the registry.
    ///
    /// Offers still pending toward a departing controller are withdrawn so
    /// their deliverers can offer again.
    pub fn unregister_connection(&self, client_id: &str) {
        let removed = {
            let mut clients = self.lock();
            let removed = clients.remove(client_id);
            for other in clients.values_mut() {
                let pending_to_departed = matches!(
                    &other.relation,
                    Relation::Proposed(ids) if ids.controller_id == client_id
                );
                if pending_to_departed {
                    other.relation.withdraw();
                }
            }
            removed
        };
        if let Some(client) = removed {
            self.store.delete(client.client_type, client_id);
            info!(
                client_type = %client.client_type,
                client_id,
                connections = self.connection_count(),
                "websocket client disconnected"
            );
        }
    }

    pub fn connection_count(&self) -> usize {
        self.lock().len()
    }

    /// Returns a copy of the connection's current relation.
    #[cfg(test)]
    fn relation_of(&self, client_id: &str) -> Option<Relation> {
        self.lock().get(client_id).map(|c| c.relation.clone())
    }

    // ── Browser → server ──────────────────────────────────────────────────────

    /// Processes one decoded frame from `client_id`.
    ///
    /// Validation failures are answered with the matching `...SrvErr` frame
    /// and leave the session open.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] when the sender is unknown or a write to the
    /// sender's own connection fails; the caller should end the session.
    pub async fn handle_message(&self, client_id: &str, msg: Message) -> Result<(), SessionError> {
        let from = {
            let clients = self.lock();
            let client = clients
                .get(client_id)
                .ok_or_else(|| SessionError::UnknownClient(client_id.to_string()))?;
            Sender {
                id: client_id,
                client_type: client.client_type,
                writer: Arc::clone(&client.writer),
            }
        };

        match msg.msg_type.clone() {
            MsgType::Ping => {
                debug!(client_id, "received ping");
                Ok(())
            }
            MsgType::RegisterReq => self.on_register(&from, msg).await,
            MsgType::LookupReq => self.on_lookup(&from).await,
            MsgType::SigOfferSdpReq => self.on_offer_request(&from, msg).await,
            MsgType::SigOfferSdpRes => self.on_offer_response(&from, msg).await,
            MsgType::SigAnswerSdpReq => self.on_answer_request(&from, msg).await,
            MsgType::SigAnswerSdpRes => self.on_answer_response(&from, msg).await,
            MsgType::GpConnectReq => self.on_gamepad_connect(&from, msg).await,
            MsgType::GpState => {
                self.on_gamepad_state(&from, msg).await;
                Ok(())
            }
            other => {
                warn!(client_id, msg_type = %other, "unsupported message");
                Ok(())
            }
        }
    }

    async fn reply(&self, from: &Sender<'_>, msg: &Message) -> Result<(), SessionError> {
        from.writer
            .write_message(msg)
            .await
            .map_err(|source| SessionError::Write {
                msg_type: msg.msg_type.clone(),
                source,
            })
    }

    async fn reject(
        &self,
        from: &Sender<'_>,
        msg_type: MsgType,
        reason: &str,
    ) -> Result<(), SessionError> {
        warn!(client_id = from.id, %msg_type, reason, "rejecting message");
        self.reply(from, &Message::with_error(msg_type, reason)).await
    }

    async fn on_register(&self, from: &Sender<'_>, msg: Message) -> Result<(), SessionError> {
        let name = match msg.register_request {
            Some(req) if !req.client_name.is_empty() => req.client_name,
            _ => {
                return self
                    .reject(from, MsgType::RegisterRes, "no register request parameter")
                    .await
            }
        };
        self.store.add(from.client_type, from.id, &name);
        let res = Message {
            register_response: Some(RegisterResponse {
                client_type: from.client_type,
                client_id: from.id.to_string(),
            }),
            ..Message::new(MsgType::RegisterRes)
        };
        self.reply(from, &res).await
    }

    async fn on_lookup(&self, from: &Sender<'_>) -> Result<(), SessionError> {
        let res = Message {
            lookup_response: Some(LookupResponse {
                controllers: self.store.controllers.get(),
                gamepads: self.store.gamepads.get(),
            }),
            ..Message::new(MsgType::LookupRes)
        };
        self.reply(from, &res).await
    }

    // ── Offer leg ─────────────────────────────────────────────────────────────

    async fn on_offer_request(&self, from: &Sender<'_>, msg: Message) -> Result<(), SessionError> {
        const ERR: MsgType = MsgType::SigOfferSdpSrvErr;
        let controller = match self.propose_offer(from, &msg) {
            Ok(writer) => writer,
            Err(reason) => return self.reject(from, ERR, reason).await,
        };
        if let Err(e) = controller.write_message(&msg).await {
            debug!(client_id = from.id, error = %e, "offer forward failed");
            if let Some(own) = self.lock().get_mut(from.id) {
                own.relation.withdraw();
            }
            return self
                .reject(from, ERR, "can not forward sigOfferSdpReq message")
                .await;
        }
        Ok(())
    }

    /// Validates an offer and proposes the relation on the sender.
    fn propose_offer(
        &self,
        from: &Sender<'_>,
        msg: &Message,
    ) -> Result<Arc<dyn MessageWriter>, &'static str> {
        let req = msg
            .signaling_sdp_request
            .as_ref()
            .filter(|r| r.relation_ids().is_complete() && !r.sdp.is_empty())
            .ok_or("no sigOfferSdpReq parameter")?;
        if from.client_type != ClientType::Deliverer || req.deliverer_id != from.id {
            return Err("deliverer id mismatch");
        }

        let mut clients = self.lock();
        let controller = clients
            .get(&req.controller_id)
            .filter(|c| c.client_type == ClientType::Controller)
            .map(|c| Arc::clone(&c.writer))
            .ok_or("not found controller id")?;
        let own = clients.get_mut(from.id).ok_or("not found deliverer id")?;
        if !own.relation.propose(req.relation_ids()) {
            return Err("can not update client relation");
        }
        debug!(client_id = from.id, relation = %req.relation_ids(), "relation proposed");
        Ok(controller)
    }

    async fn on_offer_response(&self, from: &Sender<'_>, msg: Message) -> Result<(), SessionError> {
        const ERR: MsgType = MsgType::SigOfferSdpSrvErr;
        let deliverer = match self.settle_offer(from, &msg) {
            Ok(writer) => writer,
            Err(reason) => return self.reject(from, ERR, reason).await,
        };
        if deliverer.write_message(&msg).await.is_err() {
            return self
                .reject(from, ERR, "can not forward sigOfferSdpRes message")
                .await;
        }
        Ok(())
    }

    /// Validates an offer response and commits (or withdraws) the relation.
    ///
    /// A response carrying an `Error` withdraws the deliverer's proposal, as
    /// does a response from a controller that is already committed elsewhere.
    /// Otherwise the deliverer's relation is committed and the controller's
    /// set to the same committed triple under one lock acquisition.
    fn settle_offer(
        &self,
        from: &Sender<'_>,
        msg: &Message,
    ) -> Result<Arc<dyn MessageWriter>, &'static str> {
        let res = msg
            .signaling_sdp_response
            .as_ref()
            .filter(|r| r.relation_ids().is_complete())
            .ok_or("no sigOfferSdpRes parameter")?;
        if from.client_type != ClientType::Controller || res.controller_id != from.id {
            return Err("controller id mismatch");
        }
        let ids = res.relation_ids();

        let mut clients = self.lock();
        let deliverer = clients
            .get_mut(&res.deliverer_id)
            .filter(|c| c.client_type == ClientType::Deliverer)
            .ok_or("not found deliverer id")?;
        if !deliverer.relation.matches(&ids) {
            return Err("client relation mismatch");
        }
        let writer = Arc::clone(&deliverer.writer);

        if let Some(reason) = msg.error_message() {
            deliverer.relation.withdraw();
            debug!(relation = %ids, reason, "offer refused by controller");
            return Ok(writer);
        }

        let own_committed = clients
            .get(from.id)
            .map_or(true, |own| own.relation.is_committed());
        if own_committed {
            if let Some(d) = clients.get_mut(&res.deliverer_id) {
                d.relation.withdraw();
            }
            return Err("can not update client relation");
        }
        let committed = clients
            .get_mut(&res.deliverer_id)
            .is_some_and(|d| d.relation.commit());
        if !committed {
            return Err("can not update client relation");
        }
        if let Some(own) = clients.get_mut(from.id) {
            own.relation.propose_and_commit(ids.clone());
        }
        info!(relation = %ids, "relation committed");
        Ok(writer)
    }

    // ── Answer leg ────────────────────────────────────────────────────────────

    async fn on_answer_request(&self, from: &Sender<'_>, msg: Message) -> Result<(), SessionError> {
        const ERR: MsgType = MsgType::SigAnswerSdpSrvErr;
        let target = msg
            .signaling_sdp_request
            .as_ref()
            .filter(|r| r.relation_ids().is_complete() && !r.sdp.is_empty())
            .ok_or("no sigAnswerSdpReq parameter")
            .and_then(|req| {
                if from.client_type != ClientType::Controller || req.controller_id != from.id {
                    return Err("controller id mismatch");
                }
                self.committed_peer(
                    from.id,
                    &req.deliverer_id,
                    ClientType::Deliverer,
                    &req.relation_ids(),
                    "not found deliverer id",
                )
            });
        self.relay(from, ERR, target, &msg, "can not forward sigAnswerSdpReq message")
            .await
    }

    async fn on_answer_response(&self, from: &Sender<'_>, msg: Message) -> Result<(), SessionError> {
        const ERR: MsgType = MsgType::SigAnswerSdpSrvErr;
        let target = msg
            .signaling_sdp_response
            .as_ref()
            .filter(|r| r.relation_ids().is_complete())
            .ok_or("no sigAnswerSdpRes parameter")
            .and_then(|res| {
                if from.client_type != ClientType::Deliverer || res.deliverer_id != from.id {
                    return Err("deliverer id mismatch");
                }
                self.committed_peer(
                    from.id,
                    &res.controller_id,
                    ClientType::Controller,
                    &res.relation_ids(),
                    "not found controller id",
                )
            });
        self.relay(from, ERR, target, &msg, "can not forward sigAnswerSdpRes message")
            .await
    }

    /// Returns the peer's writer when both sides are committed to `ids`.
    fn committed_peer(
        &self,
        own_id: &str,
        peer_id: &str,
        peer_type: ClientType,
        ids: &RelationIds,
        not_found: &'static str,
    ) -> Result<Arc<dyn MessageWriter>, &'static str> {
        let clients = self.lock();
        let peer = clients
            .get(peer_id)
            .filter(|c| c.client_type == peer_type)
            .ok_or(not_found)?;
        let own_ok = clients
            .get(own_id)
            .is_some_and(|own| own.relation.is_committed_to(ids));
        if !own_ok || !peer.relation.is_committed_to(ids) {
            return Err("client relation mismatch");
        }
        Ok(Arc::clone(&peer.writer))
    }

    async fn relay(
        &self,
        from: &Sender<'_>,
        err_type: MsgType,
        target: Result<Arc<dyn MessageWriter>, &'static str>,
        msg: &Message,
        forward_failed: &str,
    ) -> Result<(), SessionError> {
        match target {
            Ok(writer) => {
                if writer.write_message(msg).await.is_err() {
                    return self.reject(from, err_type, forward_failed).await;
                }
                Ok(())
            }
            Err(reason) => self.reject(from, err_type, reason).await,
        }
    }

    // ── Controller → gamepad ──────────────────────────────────────────────────

    /// Checks that `ids` names the sender as controller and matches its
    /// committed relation.
    fn check_controller_relation(
        &self,
        from: &Sender<'_>,
        ids: &RelationIds,
    ) -> Result<(), &'static str> {
        if from.client_type != ClientType::Controller || ids.controller_id != from.id {
            return Err("controller id mismatch");
        }
        let committed = self
            .lock()
            .get(from.id)
            .is_some_and(|own| own.relation.is_committed_to(ids));
        if !committed {
            return Err("client relation mismatch");
        }
        Ok(())
    }

    async fn on_gamepad_connect(&self, from: &Sender<'_>, msg: Message) -> Result<(), SessionError> {
        const ERR: MsgType = MsgType::GpConnectSrvErr;
        let checked = msg
            .gamepad_connect_request
            .as_ref()
            .map(|r| r.relation_ids())
            .filter(RelationIds::is_complete)
            .ok_or("no gamepad connect request parameter")
            .and_then(|ids| self.check_controller_relation(from, &ids));
        if let Err(reason) = checked {
            return self.reject(from, ERR, reason).await;
        }

        let writer = Arc::clone(&from.writer);
        let client_id = from.id.to_string();
        self.forwarder
            .to_tcp_with_error(msg, move |e| async move {
                warn!(client_id = %client_id, error = %e, "gpConnectReq delivery failed");
                let reply = Message::with_error(ERR, e.to_string());
                if let Err(e) = writer.write_message(&reply).await {
                    debug!(client_id = %client_id, error = %e, "can not write gpConnectSrvErr message");
                }
            })
            .await;
        Ok(())
    }

    async fn on_gamepad_state(&self, from: &Sender<'_>, msg: Message) {
        let checked = msg
            .gamepad_state
            .as_ref()
            .map(|s| s.relation_ids())
            .filter(RelationIds::is_complete)
            .ok_or("no gamepad state parameter")
            .and_then(|ids| self.check_controller_relation(from, &ids));
        if let Err(reason) = checked {
            debug!(client_id = from.id, reason, "dropping gpState");
            return;
        }
        // Fire-and-forget: the receipt is dropped.
        let _ = self.forwarder.to_tcp(msg).await;
    }

    // ── TCP → browser ─────────────────────────────────────────────────────────

    /// Routes a message that arrived from a gamepad device.
    ///
    /// # Errors
    ///
    /// Returns a [`ForwardError`] for `gpConnectRes` frames that cannot be
    /// delivered.  `gpVibration` failures are logged and swallowed.
    pub async fn on_from_tcp(&self, msg: Message) -> Result<(), ForwardError> {
        match msg.msg_type.clone() {
            MsgType::GpConnectRes => {
                let ids = msg
                    .gamepad_connect_response
                    .as_ref()
                    .map(|r| r.relation_ids())
                    .ok_or(ForwardError::MissingPayload(MsgType::GpConnectRes))?;
                let writer = self
                    .committed_controller(&ids)
                    .ok_or_else(|| ForwardError::NoMatchingRelation(ids.clone()))?;
                writer
                    .write_message(&msg)
                    .await
                    .map_err(|_| ForwardError::WriteFailed(MsgType::GpConnectRes))
            }
            MsgType::GpVibration => {
                let Some(ids) = msg.gamepad_vibration.as_ref().map(|v| v.relation_ids()) else {
                    debug!("dropping gpVibration without payload");
                    return Ok(());
                };
                match self.committed_controller(&ids) {
                    Some(writer) => {
                        if let Err(e) = writer.write_message(&msg).await {
                            debug!(relation = %ids, error = %e, "can not write gpVibration message");
                        }
                    }
                    None => debug!(relation = %ids, "no controller for gpVibration"),
                }
                Ok(())
            }
            MsgType::GpUnregister => {
                let gamepad_id = msg
                    .gamepad_unregister
                    .as_ref()
                    .map(|u| u.gamepad_id.clone())
                    .ok_or(ForwardError::MissingPayload(MsgType::GpUnregister))?;
                self.store.delete(ClientType::Gamepad, &gamepad_id);
                let writers: Vec<Arc<dyn MessageWriter>> = self
                    .lock()
                    .values()
                    .filter(|c| c.relation.involves_gamepad(&gamepad_id))
                    .map(|c| Arc::clone(&c.writer))
                    .collect();
                for writer in writers {
                    // Best effort.
                    let _ = writer.write_message(&msg).await;
                }
                Ok(())
            }
            other => Err(ForwardError::Unsupported(other)),
        }
    }

    fn committed_controller(&self, ids: &RelationIds) -> Option<Arc<dyn MessageWriter>> {
        self.lock()
            .values()
            .find(|c| c.client_type == ClientType::Controller && c.relation.is_committed_to(ids))
            .map(|c| Arc::clone(&c.writer))
    }
}

#[async_trait]
impl ForwardHandler for WsManager {
    async fn handle(&self, msg: Message) -> Result<(), ForwardError> {
        self.on_from_tcp(msg).await
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::writer::testing::{Inbox, RecordingWriter};
    use regap_core::protocol::messages::{
        GamepadConnectRequest, GamepadConnectResponse, GamepadState, GamepadUnregister,
        GamepadVibration, RegisterRequest, SignalingSdpRequest, SignalingSdpResponse,
    };
    use tokio::sync::mpsc;

    struct Harness {
        manager: Arc<WsManager>,
        store: Arc<ClientsStore>,
        to_tcp: mpsc::UnboundedReceiver<Message>,
    }

    /// Stands in for the TCP half: records what reaches it, fails unknown gamepads.
    struct FakeTcp(mpsc::UnboundedSender<Message>);

    #[async_trait]
    impl ForwardHandler for FakeTcp {
        async fn handle(&self, msg: Message) -> Result<(), ForwardError> {
            let _ = self.0.send(msg.clone());
            let known = msg
                .gamepad_connect_request
                .as_ref()
                .is_some_and(|r| r.gamepad_id == "g1")
                || msg.gamepad_state.is_some();
            if known {
                Ok(())
            } else {
                Err(ForwardError::UnknownDestination("gamepad".to_string()))
            }
        }
    }

    fn harness() -> Harness {
        let store = Arc::new(ClientsStore::new());
        let forwarder = Arc::new(Forwarder::new());
        let (tx, to_tcp) = mpsc::unbounded_channel();
        forwarder
            .start_from_ws_listener(Arc::new(FakeTcp(tx)))
            .unwrap();
        forwarder.start();
        let manager = Arc::new(WsManager::new(Arc::clone(&store), forwarder));
        Harness {
            manager,
            store,
            to_tcp,
        }
    }

    fn connect(h: &Harness, client_type: ClientType) -> (String, Arc<RecordingWriter>, Inbox) {
        let (writer, inbox) = RecordingWriter::new();
        let id = h.manager.register_connection(client_type, writer.clone());
        (id, writer, inbox)
    }

    fn offer(d: &str, c: &str, g: &str) -> Message {
        Message {
            signaling_sdp_request: Some(SignalingSdpRequest {
                name: "deliverer".to_string(),
                deliverer_id: d.to_string(),
                controller_id: c.to_string(),
                gamepad_id: g.to_string(),
                sdp: "offer".to_string(),
            }),
            ..Message::new(MsgType::SigOfferSdpReq)
        }
    }

    fn sdp_response(tag: MsgType, d: &str, c: &str, g: &str) -> Message {
        Message {
            signaling_sdp_response: Some(SignalingSdpResponse {
                deliverer_id: d.to_string(),
                controller_id: c.to_string(),
                gamepad_id: g.to_string(),
            }),
            ..Message::new(tag)
        }
    }

    fn answer(d: &str, c: &str, g: &str) -> Message {
        Message {
            signaling_sdp_request: Some(SignalingSdpRequest {
                name: "controller".to_string(),
                deliverer_id: d.to_string(),
                controller_id: c.to_string(),
                gamepad_id: g.to_string(),
                sdp: "answer".to_string(),
            }),
            ..Message::new(MsgType::SigAnswerSdpReq)
        }
    }

    fn connect_request(d: &str, c: &str, g: &str) -> Message {
        Message {
            gamepad_connect_request: Some(GamepadConnectRequest {
                deliverer_id: d.to_string(),
                controller_id: c.to_string(),
                gamepad_id: g.to_string(),
            }),
            ..Message::new(MsgType::GpConnectReq)
        }
    }

    fn state(d: &str, c: &str, g: &str) -> Message {
        Message {
            gamepad_state: Some(GamepadState {
                deliverer_id: d.to_string(),
                controller_id: c.to_string(),
                gamepad_id: g.to_string(),
                axes: vec![0.0, 1.0],
                ..GamepadState::default()
            }),
            ..Message::new(MsgType::GpState)
        }
    }

    /// Drives the offer leg to commit and drains both inboxes.
    async fn pair(
        h: &Harness,
        d: &str,
        d_inbox: &mut Inbox,
        c: &str,
        c_inbox: &mut Inbox,
    ) {
        h.manager.handle_message(d, offer(d, c, "g1")).await.unwrap();
        c_inbox.next().await;
        h.manager
            .handle_message(c, sdp_response(MsgType::SigOfferSdpRes, d, c, "g1"))
            .await
            .unwrap();
        d_inbox.next().await;
    }

    #[tokio::test]
    async fn test_register_replies_with_id_and_updates_store() {
        let h = harness();
        let (c, _w, mut inbox) = connect(&h, ClientType::Controller);

        let req = Message {
            register_request: Some(RegisterRequest {
                client_name: "alice".to_string(),
            }),
            ..Message::new(MsgType::RegisterReq)
        };
        h.manager.handle_message(&c, req).await.unwrap();

        let res = inbox.next().await;
        assert_eq!(res.msg_type, MsgType::RegisterRes);
        let body = res.register_response.unwrap();
        assert_eq!(body.client_id, c);
        assert_eq!(body.client_type, ClientType::Controller);
        assert!(h.store.controllers.get().iter().any(|e| e.id == c));
    }

    #[tokio::test]
    async fn test_register_without_name_is_rejected() {
        let h = harness();
        let (d, _w, mut inbox) = connect(&h, ClientType::Deliverer);

        h.manager
            .handle_message(&d, Message::new(MsgType::RegisterReq))
            .await
            .unwrap();

        let res = inbox.next().await;
        assert_eq!(res.msg_type, MsgType::RegisterRes);
        assert_eq!(res.error_message(), Some("no register request parameter"));
        assert!(h.store.deliverers.is_empty());
    }

    #[tokio::test]
    async fn test_client_ids_are_unique() {
        let h = harness();
        let ids: std::collections::HashSet<String> = (0..50)
            .map(|_| connect(&h, ClientType::Deliverer).0)
            .collect();
        assert_eq!(ids.len(), 50);
        assert_eq!(h.manager.connection_count(), 50);
    }

    #[tokio::test]
    async fn test_lookup_lists_controllers_and_gamepads() {
        let h = harness();
        let (d, _w, mut inbox) = connect(&h, ClientType::Deliverer);
        h.store.add(ClientType::Controller, "c1", "alice");
        h.store.add(ClientType::Gamepad, "g1", "pad");

        h.manager
            .handle_message(&d, Message::new(MsgType::LookupReq))
            .await
            .unwrap();

        let res = inbox.next().await.lookup_response.unwrap();
        assert_eq!(res.controllers.len(), 1);
        assert_eq!(res.gamepads[0].id, "g1");
        assert_eq!(h.manager.relation_of(&d), Some(Relation::None));
    }

    #[tokio::test]
    async fn test_offer_is_forwarded_verbatim_and_proposes() {
        let h = harness();
        let (d, _dw, mut d_inbox) = connect(&h, ClientType::Deliverer);
        let (c, _cw, mut c_inbox) = connect(&h, ClientType::Controller);

        let msg = offer(&d, &c, "g1");
        h.manager.handle_message(&d, msg.clone()).await.unwrap();

        assert_eq!(c_inbox.next().await, msg);
        d_inbox.assert_empty().await;
        assert_eq!(
            h.manager.relation_of(&d),
            Some(Relation::Proposed(RelationIds::new(&d, &c, "g1")))
        );
    }

    #[tokio::test]
    async fn test_offer_with_foreign_deliverer_id_is_rejected() {
        let h = harness();
        let (d, _dw, mut d_inbox) = connect(&h, ClientType::Deliverer);
        let (c, _cw, mut c_inbox) = connect(&h, ClientType::Controller);

        h.manager
            .handle_message(&d, offer("someone-else", &c, "g1"))
            .await
            .unwrap();

        let err = d_inbox.next().await;
        assert_eq!(err.msg_type, MsgType::SigOfferSdpSrvErr);
        assert_eq!(err.error_message(), Some("deliverer id mismatch"));
        c_inbox.assert_empty().await;
    }

    #[tokio::test]
    async fn test_offer_to_unknown_controller_is_rejected() {
        let h = harness();
        let (d, _dw, mut d_inbox) = connect(&h, ClientType::Deliverer);

        h.manager.handle_message(&d, offer(&d, "nope", "g1")).await.unwrap();

        assert_eq!(
            d_inbox.next().await.error_message(),
            Some("not found controller id")
        );
        assert_eq!(h.manager.relation_of(&d), Some(Relation::None));
    }

    #[tokio::test]
    async fn test_offer_without_sdp_is_rejected() {
        let h = harness();
        let (d, _dw, mut d_inbox) = connect(&h, ClientType::Deliverer);
        let (c, _cw, _c_inbox) = connect(&h, ClientType::Controller);
        let mut msg = offer(&d, &c, "g1");
        if let Some(req) = msg.signaling_sdp_request.as_mut() {
            req.sdp.clear();
        }

        h.manager.handle_message(&d, msg).await.unwrap();

        assert_eq!(
            d_inbox.next().await.error_message(),
            Some("no sigOfferSdpReq parameter")
        );
    }

    #[tokio::test]
    async fn test_second_offer_before_answer_is_rejected() {
        let h = harness();
        let (d, _dw, mut d_inbox) = connect(&h, ClientType::Deliverer);
        let (c, _cw, mut c_inbox) = connect(&h, ClientType::Controller);

        h.manager.handle_message(&d, offer(&d, &c, "g1")).await.unwrap();
        c_inbox.next().await;
        h.manager.handle_message(&d, offer(&d, &c, "g2")).await.unwrap();

        assert_eq!(
            d_inbox.next().await.error_message(),
            Some("can not update client relation")
        );
        c_inbox.assert_empty().await;
        assert_eq!(
            h.manager.relation_of(&d),
            Some(Relation::Proposed(RelationIds::new(&d, &c, "g1")))
        );
    }

    #[tokio::test]
    async fn test_offer_forward_failure_withdraws_proposal() {
        let h = harness();
        let (d, _dw, mut d_inbox) = connect(&h, ClientType::Deliverer);
        let (c, c_writer, _c_inbox) = connect(&h, ClientType::Controller);
        c_writer.set_failing(true);

        h.manager.handle_message(&d, offer(&d, &c, "g1")).await.unwrap();

        assert_eq!(
            d_inbox.next().await.error_message(),
            Some("can not forward sigOfferSdpReq message")
        );
        assert_eq!(h.manager.relation_of(&d), Some(Relation::None));
    }

    #[tokio::test]
    async fn test_offer_response_commits_both_sides() {
        let h = harness();
        let (d, _dw, mut d_inbox) = connect(&h, ClientType::Deliverer);
        let (c, _cw, mut c_inbox) = connect(&h, ClientType::Controller);

        pair(&h, &d, &mut d_inbox, &c, &mut c_inbox).await;

        let ids = RelationIds::new(&d, &c, "g1");
        assert_eq!(h.manager.relation_of(&d), Some(Relation::Committed(ids.clone())));
        assert_eq!(h.manager.relation_of(&c), Some(Relation::Committed(ids)));
    }

    #[tokio::test]
    async fn test_offer_response_with_error_is_forwarded_without_commit() {
        let h = harness();
        let (d, _dw, mut d_inbox) = connect(&h, ClientType::Deliverer);
        let (c, _cw, mut c_inbox) = connect(&h, ClientType::Controller);
        h.manager.handle_message(&d, offer(&d, &c, "g1")).await.unwrap();
        c_inbox.next().await;

        let mut refusal = sdp_response(MsgType::SigOfferSdpRes, &d, &c, "g1");
        refusal.error = Some(regap_core::protocol::messages::ErrorPayload::new("busy"));
        h.manager.handle_message(&c, refusal.clone()).await.unwrap();

        assert_eq!(d_inbox.next().await, refusal);
        assert_eq!(h.manager.relation_of(&d), Some(Relation::None));
        assert_eq!(h.manager.relation_of(&c), Some(Relation::None));
    }

    #[tokio::test]
    async fn test_offer_response_without_proposal_is_rejected() {
        let h = harness();
        let (d, _dw, mut d_inbox) = connect(&h, ClientType::Deliverer);
        let (c, _cw, mut c_inbox) = connect(&h, ClientType::Controller);

        h.manager
            .handle_message(&c, sdp_response(MsgType::SigOfferSdpRes, &d, &c, "g1"))
            .await
            .unwrap();

        assert_eq!(
            c_inbox.next().await.error_message(),
            Some("client relation mismatch")
        );
        d_inbox.assert_empty().await;
    }

    #[tokio::test]
    async fn test_duplicate_offer_response_is_rejected() {
        let h = harness();
        let (d, _dw, mut d_inbox) = connect(&h, ClientType::Deliverer);
        let (c, _cw, mut c_inbox) = connect(&h, ClientType::Controller);
        pair(&h, &d, &mut d_inbox, &c, &mut c_inbox).await;

        h.manager
            .handle_message(&c, sdp_response(MsgType::SigOfferSdpRes, &d, &c, "g1"))
            .await
            .unwrap();

        assert_eq!(
            c_inbox.next().await.error_message(),
            Some("can not update client relation")
        );
        d_inbox.assert_empty().await;
    }

    #[tokio::test]
    async fn test_controller_disconnect_releases_pending_offer() {
        let h = harness();
        let (d, _dw, mut d_inbox) = connect(&h, ClientType::Deliverer);
        let (c, _cw, mut c_inbox) = connect(&h, ClientType::Controller);
        let (c2, _c2w, mut c2_inbox) = connect(&h, ClientType::Controller);
        h.manager.handle_message(&d, offer(&d, &c, "g1")).await.unwrap();
        c_inbox.next().await;

        h.manager.unregister_connection(&c);

        assert_eq!(h.manager.relation_of(&d), Some(Relation::None));
        let msg = offer(&d, &c2, "g1");
        h.manager.handle_message(&d, msg.clone()).await.unwrap();
        assert_eq!(c2_inbox.next().await, msg);
        d_inbox.assert_empty().await;
        assert_eq!(
            h.manager.relation_of(&d),
            Some(Relation::Proposed(RelationIds::new(&d, &c2, "g1")))
        );
    }

    #[tokio::test]
    async fn test_controller_disconnect_keeps_other_offers() {
        let h = harness();
        let (d, _dw, _d_inbox) = connect(&h, ClientType::Deliverer);
        let (c, _cw, mut c_inbox) = connect(&h, ClientType::Controller);
        let (other, _ow, _o_inbox) = connect(&h, ClientType::Controller);
        h.manager.handle_message(&d, offer(&d, &c, "g1")).await.unwrap();
        c_inbox.next().await;

        h.manager.unregister_connection(&other);

        assert_eq!(
            h.manager.relation_of(&d),
            Some(Relation::Proposed(RelationIds::new(&d, &c, "g1")))
        );
    }

    #[tokio::test]
    async fn test_offer_response_from_committed_controller_releases_deliverer() {
        let h = harness();
        let (d1, _d1w, mut d1_inbox) = connect(&h, ClientType::Deliverer);
        let (d2, _d2w, mut d2_inbox) = connect(&h, ClientType::Deliverer);
        let (c, _cw, mut c_inbox) = connect(&h, ClientType::Controller);
        let (c2, _c2w, mut c2_inbox) = connect(&h, ClientType::Controller);
        pair(&h, &d1, &mut d1_inbox, &c, &mut c_inbox).await;
        h.manager.handle_message(&d2, offer(&d2, &c, "g1")).await.unwrap();
        c_inbox.next().await;

        h.manager
            .handle_message(&c, sdp_response(MsgType::SigOfferSdpRes, &d2, &c, "g1"))
            .await
            .unwrap();

        assert_eq!(
            c_inbox.next().await.error_message(),
            Some("can not update client relation")
        );
        assert_eq!(h.manager.relation_of(&d2), Some(Relation::None));
        assert_eq!(
            h.manager.relation_of(&c),
            Some(Relation::Committed(RelationIds::new(&d1, &c, "g1")))
        );

        let msg = offer(&d2, &c2, "g1");
        h.manager.handle_message(&d2, msg.clone()).await.unwrap();
        assert_eq!(c2_inbox.next().await, msg);
        d2_inbox.assert_empty().await;
    }

    #[tokio::test]
    async fn test_answer_leg_requires_committed_relations() {
        let h = harness();
        let (d, _dw, mut d_inbox) = connect(&h, ClientType::Deliverer);
        let (c, _cw, mut c_inbox) = connect(&h, ClientType::Controller);

        h.manager.handle_message(&c, answer(&d, &c, "g1")).await.unwrap();
        let err = c_inbox.next().await;
        assert_eq!(err.msg_type, MsgType::SigAnswerSdpSrvErr);
        assert_eq!(err.error_message(), Some("client relation mismatch"));

        pair(&h, &d, &mut d_inbox, &c, &mut c_inbox).await;

        let msg = answer(&d, &c, "g1");
        h.manager.handle_message(&c, msg.clone()).await.unwrap();
        assert_eq!(d_inbox.next().await, msg);

        let res = sdp_response(MsgType::SigAnswerSdpRes, &d, &c, "g1");
        h.manager.handle_message(&d, res.clone()).await.unwrap();
        assert_eq!(c_inbox.next().await, res);
    }

    #[tokio::test]
    async fn test_answer_with_other_gamepad_is_rejected() {
        let h = harness();
        let (d, _dw, mut d_inbox) = connect(&h, ClientType::Deliverer);
        let (c, _cw, mut c_inbox) = connect(&h, ClientType::Controller);
        pair(&h, &d, &mut d_inbox, &c, &mut c_inbox).await;

        h.manager
            .handle_message(&d, sdp_response(MsgType::SigAnswerSdpRes, &d, &c, "g2"))
            .await
            .unwrap();

        assert_eq!(
            d_inbox.next().await.error_message(),
            Some("client relation mismatch")
        );
        c_inbox.assert_empty().await;
    }

    #[tokio::test]
    async fn test_gamepad_connect_goes_to_tcp_when_committed() {
        let mut h = harness();
        let (d, _dw, mut d_inbox) = connect(&h, ClientType::Deliverer);
        let (c, _cw, mut c_inbox) = connect(&h, ClientType::Controller);
        pair(&h, &d, &mut d_inbox, &c, &mut c_inbox).await;

        let msg = connect_request(&d, &c, "g1");
        h.manager.handle_message(&c, msg.clone()).await.unwrap();

        assert_eq!(h.to_tcp.recv().await.unwrap(), msg);
        c_inbox.assert_empty().await;
    }

    #[tokio::test]
    async fn test_gamepad_connect_without_relation_is_rejected() {
        let mut h = harness();
        let (d, _dw, _d_inbox) = connect(&h, ClientType::Deliverer);
        let (c, _cw, mut c_inbox) = connect(&h, ClientType::Controller);

        h.manager
            .handle_message(&c, connect_request(&d, &c, "g1"))
            .await
            .unwrap();

        let err = c_inbox.next().await;
        assert_eq!(err.msg_type, MsgType::GpConnectSrvErr);
        assert_eq!(err.error_message(), Some("client relation mismatch"));
        assert!(h.to_tcp.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_gamepad_connect_delivery_failure_reports_server_error() {
        let h = harness();
        let (d, _dw, mut d_inbox) = connect(&h, ClientType::Deliverer);
        let (c, _cw, mut c_inbox) = connect(&h, ClientType::Controller);
        h.manager.handle_message(&d, offer(&d, &c, "g9")).await.unwrap();
        c_inbox.next().await;
        h.manager
            .handle_message(&c, sdp_response(MsgType::SigOfferSdpRes, &d, &c, "g9"))
            .await
            .unwrap();
        d_inbox.next().await;

        h.manager
            .handle_message(&c, connect_request(&d, &c, "g9"))
            .await
            .unwrap();

        let err = c_inbox.next().await;
        assert_eq!(err.msg_type, MsgType::GpConnectSrvErr);
        assert_eq!(err.error_message(), Some("not found connection for gamepad"));
    }

    #[tokio::test]
    async fn test_gamepad_state_forwarded_only_when_committed() {
        let mut h = harness();
        let (d, _dw, mut d_inbox) = connect(&h, ClientType::Deliverer);
        let (c, _cw, mut c_inbox) = connect(&h, ClientType::Controller);

        h.manager.handle_message(&c, state(&d, &c, "g1")).await.unwrap();
        c_inbox.assert_empty().await;
        assert!(h.to_tcp.try_recv().is_err());

        pair(&h, &d, &mut d_inbox, &c, &mut c_inbox).await;

        h.manager.handle_message(&c, state(&d, &c, "g2")).await.unwrap();
        let msg = state(&d, &c, "g1");
        h.manager.handle_message(&c, msg.clone()).await.unwrap();

        assert_eq!(h.to_tcp.recv().await.unwrap(), msg);
        assert!(h.to_tcp.try_recv().is_err());
        c_inbox.assert_empty().await;
    }

    #[tokio::test]
    async fn test_connect_response_routes_to_committed_controller() {
        let h = harness();
        let (d, _dw, mut d_inbox) = connect(&h, ClientType::Deliverer);
        let (c, _cw, mut c_inbox) = connect(&h, ClientType::Controller);
        pair(&h, &d, &mut d_inbox, &c, &mut c_inbox).await;

        let msg = Message {
            gamepad_connect_response: Some(GamepadConnectResponse {
                deliverer_id: d.clone(),
                controller_id: c.clone(),
                gamepad_id: "g1".to_string(),
            }),
            ..Message::new(MsgType::GpConnectRes)
        };
        h.manager.on_from_tcp(msg.clone()).await.unwrap();

        assert_eq!(c_inbox.next().await, msg);
        d_inbox.assert_empty().await;
    }

    #[tokio::test]
    async fn test_connect_response_without_match_is_an_error() {
        let h = harness();
        let msg = Message {
            gamepad_connect_response: Some(GamepadConnectResponse {
                deliverer_id: "d1".to_string(),
                controller_id: "c1".to_string(),
                gamepad_id: "g1".to_string(),
            }),
            ..Message::new(MsgType::GpConnectRes)
        };

        let err = h.manager.on_from_tcp(msg).await.unwrap_err();

        assert_eq!(
            err,
            ForwardError::NoMatchingRelation(RelationIds::new("d1", "c1", "g1"))
        );
    }

    #[tokio::test]
    async fn test_vibration_without_match_is_dropped() {
        let h = harness();
        let msg = Message {
            gamepad_vibration: Some(GamepadVibration {
                deliverer_id: "d1".to_string(),
                controller_id: "c1".to_string(),
                gamepad_id: "g1".to_string(),
                duration: 100.0,
                ..GamepadVibration::default()
            }),
            ..Message::new(MsgType::GpVibration)
        };

        assert!(h.manager.on_from_tcp(msg).await.is_ok());
    }

    #[tokio::test]
    async fn test_gamepad_unregister_updates_store_and_notifies_related() {
        let h = harness();
        let (d, _dw, mut d_inbox) = connect(&h, ClientType::Deliverer);
        let (c, _cw, mut c_inbox) = connect(&h, ClientType::Controller);
        let (_other, _ow, mut other_inbox) = connect(&h, ClientType::Controller);
        pair(&h, &d, &mut d_inbox, &c, &mut c_inbox).await;
        h.store.add(ClientType::Gamepad, "g1", "pad");

        let msg = Message {
            gamepad_unregister: Some(GamepadUnregister {
                gamepad_id: "g1".to_string(),
            }),
            ..Message::new(MsgType::GpUnregister)
        };
        h.manager.on_from_tcp(msg.clone()).await.unwrap();

        assert!(h.store.gamepads.is_empty());
        assert_eq!(d_inbox.next().await, msg);
        assert_eq!(c_inbox.next().await, msg);
        other_inbox.assert_empty().await;
    }

    #[tokio::test]
    async fn test_gamepad_unregister_reaches_browser_as_json_frame() {
        let h = harness();
        let (d, _dw, mut d_inbox) = connect(&h, ClientType::Deliverer);
        let (c, _cw, mut c_inbox) = connect(&h, ClientType::Controller);
        pair(&h, &d, &mut d_inbox, &c, &mut c_inbox).await;

        let msg = Message {
            gamepad_unregister: Some(GamepadUnregister {
                gamepad_id: "g1".to_string(),
            }),
            ..Message::new(MsgType::GpUnregister)
        };
        h.manager.on_from_tcp(msg).await.unwrap();

        let seen = regap_core::encode_text(&c_inbox.next().await).unwrap();
        assert_eq!(
            seen,
            r#"{"MsgType":"gpUnregister","GamepadUnregister":{"GamepadId":"g1"}}"#
        );
        assert_eq!(
            h.manager.relation_of(&c),
            Some(Relation::Committed(RelationIds::new(&d, &c, "g1")))
        );
    }

    #[tokio::test]
    async fn test_unregister_connection_removes_from_store() {
        let h = harness();
        let (d, _dw, mut inbox) = connect(&h, ClientType::Deliverer);
        let req = Message {
            register_request: Some(RegisterRequest {
                client_name: "bob".to_string(),
            }),
            ..Message::new(MsgType::RegisterReq)
        };
        h.manager.handle_message(&d, req).await.unwrap();
        inbox.next().await;

        h.manager.unregister_connection(&d);

        assert!(h.store.deliverers.is_empty());
        assert_eq!(h.manager.connection_count(), 0);
        assert!(matches!(
            h.manager.handle_message(&d, Message::ping()).await,
            Err(SessionError::UnknownClient(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_reply_ends_session() {
        let h = harness();
        let (d, writer, _inbox) = connect(&h, ClientType::Deliverer);
        writer.set_failing(true);

        let result = h
            .manager
            .handle_message(&d, Message::new(MsgType::LookupReq))
            .await;

        assert!(matches!(result, Err(SessionError::Write { .. })));
    }
}
