//! In-process bridge between the WebSocket half and the TCP half.
//!
//! The forwarder has two lanes:
//!
//! ```text
//!   WsManager ──to_tcp──▶ [lane] ──▶ from-WS listener  (TcpManager::on_from_ws)
//!   TcpManager ──to_ws──▶ [lane] ──▶ from-TCP listener (WsManager::on_from_tcp)
//! ```
//!
//! Each lane is a rendezvous: a send returns only after the listener has
//! taken the message off the lane.  With no listener running, or with the
//! listener busy, the producer waits.  A stalled consumer therefore stalls
//! its producers instead of buffering.
//!
//! # Lifecycle
//!
//! - Until [`Forwarder::start`] is called every send is dropped silently.
//! - Each lane accepts exactly one listener.  Starting a lane twice fails with
//!   [`ForwarderError::ListenerAlreadyStarted`].
//! - Stopping a lane is idempotent and final: the listener exits, waiting
//!   senders are released without a receipt, and later sends on that lane
//!   return immediately.
//!
//! # Delivery outcome
//!
//! A successful hand-off returns a [`DeliveryReceipt`] that resolves once the
//! listener has handled the message.  The `*_with_error` variants instead
//! spawn the supplied callback when delivery fails; there is no retry.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use regap_core::{Message, MsgType, RelationIds};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Why a listener could not deliver a forwarded message.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ForwardError {
    /// No connection exists for the destination id.
    #[error("not found connection for {0}")]
    UnknownDestination(String),

    /// No WebSocket connection holds a committed relation with these ids.
    #[error("not found connection with committed relation ({0})")]
    NoMatchingRelation(RelationIds),

    /// The payload the tag requires is absent.
    #[error("missing {0} payload")]
    MissingPayload(MsgType),

    /// The listener does not route this tag.
    #[error("unsupported message {0}")]
    Unsupported(MsgType),

    /// Writing to the destination connection failed.
    #[error("can not write {0} message")]
    WriteFailed(MsgType),

    /// The consuming listener stopped before the message was handled.
    #[error("forwarder listener stopped")]
    ListenerStopped,
}

/// Errors from forwarder lifecycle calls.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ForwarderError {
    #[error("listener already started or lane stopped")]
    ListenerAlreadyStarted,
}

/// Consumer of one forwarder lane.
#[async_trait]
pub trait ForwardHandler: Send + Sync + 'static {
    async fn handle(&self, msg: Message) -> Result<(), ForwardError>;
}

/// Resolves once the listener has handled a forwarded message.
#[derive(Debug)]
pub struct DeliveryReceipt(oneshot::Receiver<Result<(), ForwardError>>);

impl DeliveryReceipt {
    /// Waits for the listener's verdict.
    ///
    /// A listener that drops the message without answering reports
    /// [`ForwardError::ListenerStopped`].
    pub async fn outcome(self) -> Result<(), ForwardError> {
        self.0.await.unwrap_or(Err(ForwardError::ListenerStopped))
    }
}

struct Envelope {
    msg: Message,
    picked: oneshot::Sender<()>,
    reply: oneshot::Sender<Result<(), ForwardError>>,
}

struct Lane {
    name: &'static str,
    tx: mpsc::Sender<Envelope>,
    rx: Mutex<Option<mpsc::Receiver<Envelope>>>,
    stop: CancellationToken,
}

impl Lane {
    fn new(name: &'static str) -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            name,
            tx,
            rx: Mutex::new(Some(rx)),
            stop: CancellationToken::new(),
        }
    }

    fn take_receiver(&self) -> Option<mpsc::Receiver<Envelope>> {
        if self.stop.is_cancelled() {
            return None;
        }
        self.rx.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    fn spawn_listener(
        &self,
        handler: Arc<dyn ForwardHandler>,
    ) -> Result<JoinHandle<()>, ForwarderError> {
        let mut rx = self
            .take_receiver()
            .ok_or(ForwarderError::ListenerAlreadyStarted)?;
        let stop = self.stop.clone();
        let name = self.name;

        Ok(tokio::spawn(async move {
            info!("start {name} listener");
            loop {
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    envelope = rx.recv() => {
                        let Some(Envelope { msg, picked, reply }) = envelope else { break };
                        if picked.send(()).is_err() {
                            // The sender gave up before the hand-off completed.
                            continue;
                        }
                        let outcome = handler.handle(msg).await;
                        // The sender may have dropped its receipt.
                        let _ = reply.send(outcome);
                    }
                }
            }
            info!("finish {name} listener");
        }))
    }
}

enum Handoff {
    NotStarted,
    Stopped,
    Taken(DeliveryReceipt),
}

/// Two-lane bridge between the WebSocket and TCP connection managers.
pub struct Forwarder {
    to_tcp: Lane,
    to_ws: Lane,
    started: AtomicBool,
}

impl Default for Forwarder {
    fn default() -> Self {
        Self::new()
    }
}

impl Forwarder {
    pub fn new() -> Self {
        Self {
            to_tcp: Lane::new("from-ws"),
            to_ws: Lane::new("from-tcp"),
            started: AtomicBool::new(false),
        }
    }

    /// Begins accepting sends.
    pub fn start(&self) {
        self.started.store(true, Ordering::Release);
    }

    /// Stops accepting sends; later sends are dropped silently.
    pub fn stop(&self) {
        self.started.store(false, Ordering::Release);
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Hands `msg` to the TCP half.
    ///
    /// Returns `None` without blocking when the forwarder is not started or
    /// the from-WS listener was stopped.
    pub async fn to_tcp(&self, msg: Message) -> Option<DeliveryReceipt> {
        match self.hand_off(&self.to_tcp, msg).await {
            Handoff::Taken(receipt) => Some(receipt),
            Handoff::NotStarted | Handoff::Stopped => None,
        }
    }

    /// Hands `msg` to the WebSocket half.
    ///
    /// Returns `None` without blocking when the forwarder is not started or
    /// the from-TCP listener was stopped.
    pub async fn to_ws(&self, msg: Message) -> Option<DeliveryReceipt> {
        match self.hand_off(&self.to_ws, msg).await {
            Handoff::Taken(receipt) => Some(receipt),
            Handoff::NotStarted | Handoff::Stopped => None,
        }
    }

    /// Like [`Forwarder::to_tcp`], spawning `on_error` if delivery fails.
    ///
    /// A stopped lane counts as a failure; an unstarted forwarder does not.
    pub async fn to_tcp_with_error<F, Fut>(&self, msg: Message, on_error: F)
    where
        F: FnOnce(ForwardError) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handoff = self.hand_off(&self.to_tcp, msg).await;
        report_failure(handoff, on_error);
    }

    /// Like [`Forwarder::to_ws`], spawning `on_error` if delivery fails.
    ///
    /// A stopped lane counts as a failure; an unstarted forwarder does not.
    pub async fn to_ws_with_error<F, Fut>(&self, msg: Message, on_error: F)
    where
        F: FnOnce(ForwardError) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handoff = self.hand_off(&self.to_ws, msg).await;
        report_failure(handoff, on_error);
    }

    /// Spawns the consumer of messages coming from the TCP half.
    ///
    /// # Errors
    ///
    /// [`ForwarderError::ListenerAlreadyStarted`] if this lane already had a
    /// listener or was stopped.
    pub fn start_from_tcp_listener(
        &self,
        handler: Arc<dyn ForwardHandler>,
    ) -> Result<JoinHandle<()>, ForwarderError> {
        self.to_ws.spawn_listener(handler)
    }

    /// Spawns the consumer of messages coming from the WebSocket half.
    ///
    /// # Errors
    ///
    /// [`ForwarderError::ListenerAlreadyStarted`] if this lane already had a
    /// listener or was stopped.
    pub fn start_from_ws_listener(
        &self,
        handler: Arc<dyn ForwardHandler>,
    ) -> Result<JoinHandle<()>, ForwarderError> {
        self.to_tcp.spawn_listener(handler)
    }

    pub fn stop_from_tcp_listener(&self) {
        self.to_ws.stop.cancel();
    }

    pub fn stop_from_ws_listener(&self) {
        self.to_tcp.stop.cancel();
    }

    async fn hand_off(&self, lane: &Lane, msg: Message) -> Handoff {
        if !self.is_started() {
            debug!(msg_type = %msg.msg_type, "forwarder not started, dropping");
            return Handoff::NotStarted;
        }
        if lane.stop.is_cancelled() {
            debug!(msg_type = %msg.msg_type, lane = lane.name, "lane stopped, dropping");
            return Handoff::Stopped;
        }

        let (reply, receipt) = oneshot::channel();
        let (picked, picked_up) = oneshot::channel();
        let envelope = Envelope { msg, picked, reply };
        let taken = async {
            lane.tx.send(envelope).await.ok()?;
            picked_up.await.ok()
        };
        tokio::select! {
            biased;
            _ = lane.stop.cancelled() => Handoff::Stopped,
            taken = taken => match taken {
                Some(()) => Handoff::Taken(DeliveryReceipt(receipt)),
                None => Handoff::Stopped,
            },
        }
    }
}

fn report_failure<F, Fut>(handoff: Handoff, on_error: F)
where
    F: FnOnce(ForwardError) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    match handoff {
        Handoff::NotStarted => {}
        Handoff::Stopped => {
            tokio::spawn(on_error(ForwardError::ListenerStopped));
        }
        Handoff::Taken(receipt) => {
            tokio::spawn(async move {
                if let Err(e) = receipt.outcome().await {
                    on_error(e).await;
                }
            });
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
