//! WebSocket server: accept loop and per-session task management for
//! deliverer and controller browsers.
//!
//! Each accepted connection goes through the HTTP upgrade, where the path
//! picks the role (`/delivererws` or `/controllerws`) and the Basic-Auth
//! header is checked.  The session then runs two cooperating tasks:
//!
//! - the relay loop, which decodes text frames and hands them to
//!   [`WsManager::handle_message`];
//! - the ping loop, which writes a heartbeat every `ping_interval`.
//!
//! Both share the connection's write lock.  When the relay loop ends the ping
//! loop is cancelled before the socket is closed.

use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use regap_core::{decode, encode_text, ClientType, CodecError, Message};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::application::{MessageWriter, WriteError, WsManager};
use crate::infrastructure::auth::{route_for_path, subprotocol_for, BasicAuth};
use crate::infrastructure::ping::run_ping_loop;

type WsSink = SplitSink<WebSocketStream<TcpStream>, WsMessage>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

const AUTH_REALM: &str = "Basic realm=\"regapweb\"";

// ── Public API ────────────────────────────────────────────────────────────────

/// Runs the WebSocket accept loop on `listener` until `running` is cleared.
///
/// # Errors
///
/// Returns an error only if the listener's local address cannot be read.
pub async fn run_ws_server(
    listener: TcpListener,
    manager: Arc<WsManager>,
    auth: BasicAuth,
    ping_interval: Duration,
    running: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let local = listener
        .local_addr()
        .context("failed to read WebSocket listener address")?;
    info!(addr = %local, auth = auth.is_enabled(), "WebSocket server listening");

    let auth = Arc::new(auth);
    loop {
        if !running.load(Ordering::Relaxed) {
            info!("shutdown flag set; stopping WebSocket accept loop");
            break;
        }

        // Short timeout so the running flag is polled while idle.
        match timeout(Duration::from_millis(200), listener.accept()).await {
            Ok(Ok((stream, peer_addr))) => {
                debug!(peer = %peer_addr, "new browser connection");
                let manager = Arc::clone(&manager);
                let auth = Arc::clone(&auth);
                tokio::spawn(async move {
                    handle_browser_session(stream, peer_addr, manager, auth, ping_interval).await;
                });
            }
            Ok(Err(e)) => error!("WebSocket accept error: {e}"),
            Err(_) => {}
        }
    }

    Ok(())
}

// ── Write half ────────────────────────────────────────────────────────────────

/// A browser connection's write half behind its write lock.
struct WsWriter {
    sink: Mutex<WsSink>,
}

impl WsWriter {
    fn new(sink: WsSink) -> Self {
        Self {
            sink: Mutex::new(sink),
        }
    }

    async fn close(&self) {
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.close().await {
            debug!("closing WebSocket failed: {e}");
        }
    }
}

#[async_trait]
impl MessageWriter for WsWriter {
    async fn write_message(&self, msg: &Message) -> Result<(), WriteError> {
        let text = encode_text(msg)?;
        let mut sink = self.sink.lock().await;
        sink.send(WsMessage::Text(text)).await.map_err(|e| match e {
            WsError::ConnectionClosed | WsError::AlreadyClosed => WriteError::Closed,
            other => WriteError::Transport(other.to_string()),
        })
    }
}

// ── Per-session handler ───────────────────────────────────────────────────────

async fn handle_browser_session(
    stream: TcpStream,
    peer_addr: SocketAddr,
    manager: Arc<WsManager>,
    auth: Arc<BasicAuth>,
    ping_interval: Duration,
) {
    match run_session(stream, peer_addr, manager, &auth, ping_interval).await {
        Ok(()) => info!(peer = %peer_addr, "browser session closed"),
        Err(e) => warn!(peer = %peer_addr, "browser session closed with error: {e:#}"),
    }
}

async fn run_session(
    stream: TcpStream,
    peer_addr: SocketAddr,
    manager: Arc<WsManager>,
    auth: &BasicAuth,
    ping_interval: Duration,
) -> anyhow::Result<()> {
    let (ws_stream, client_type) = upgrade(stream, auth)
        .await
        .with_context(|| format!("WebSocket upgrade failed with {peer_addr}"))?;

    let (sink, mut source) = ws_stream.split();
    let writer = Arc::new(WsWriter::new(sink));
    let client_id = manager.register_connection(client_type, writer.clone());
    info!(peer = %peer_addr, client_id = %client_id, %client_type, "browser connected");

    let cancel = CancellationToken::new();
    let ping_task = tokio::spawn(run_ping_loop(
        writer.clone(),
        ping_interval,
        cancel.clone(),
        client_id.clone(),
    ));

    let result = relay_loop(&manager, &client_id, &mut source).await;

    cancel.cancel();
    if let Err(e) = ping_task.await {
        debug!(client_id = %client_id, "ping task ended abnormally: {e}");
    }
    manager.unregister_connection(&client_id);
    writer.close().await;

    result
}

/// Completes the HTTP upgrade, resolving the role from the request path.
async fn upgrade(
    stream: TcpStream,
    auth: &BasicAuth,
) -> Result<(WebSocketStream<TcpStream>, ClientType), WsError> {
    let mut route = None;
    let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        let client_type = check_upgrade(req, auth)?;
        route = Some(client_type);
        Ok(with_subprotocol(req, resp, client_type))
    };
    let ws_stream = accept_hdr_async(stream, callback).await?;

    // The callback always sets the route before accepting.
    let client_type = route.ok_or(WsError::ConnectionClosed)?;
    Ok((ws_stream, client_type))
}

/// Routes the upgrade request and checks its credentials.
fn check_upgrade(req: &Request, auth: &BasicAuth) -> Result<ClientType, ErrorResponse> {
    let path = req.uri().path();
    let Some(client_type) = route_for_path(path) else {
        debug!(path, "refusing upgrade for unknown path");
        return Err(reject(StatusCode::NOT_FOUND, "not found"));
    };

    let credentials = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    if !auth.verify(credentials) {
        warn!(path, "refusing upgrade: bad credentials");
        let mut resp = reject(StatusCode::UNAUTHORIZED, "unauthorized");
        resp.headers_mut()
            .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static(AUTH_REALM));
        return Err(resp);
    }
    Ok(client_type)
}

/// Echoes the role's sub-protocol when the browser offered it.
fn with_subprotocol(req: &Request, mut resp: Response, client_type: ClientType) -> Response {
    let wanted = subprotocol_for(client_type);
    let offered = req
        .headers()
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.split(',').any(|p| p.trim() == wanted));
    if offered {
        resp.headers_mut()
            .insert(header::SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(wanted));
    }
    resp
}

fn reject(status: StatusCode, body: &str) -> ErrorResponse {
    let mut resp = ErrorResponse::new(Some(body.to_string()));
    *resp.status_mut() = status;
    resp
}

/// Reads frames until the browser goes away or a reply cannot be written.
async fn relay_loop(
    manager: &WsManager,
    client_id: &str,
    source: &mut WsSource,
) -> anyhow::Result<()> {
    while let Some(frame) = source.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(WsError::ConnectionClosed | WsError::Protocol(_)) => {
                debug!(client_id, "browser WebSocket closed");
                break;
            }
            Err(e) => {
                warn!(client_id, "browser WebSocket error: {e}");
                break;
            }
        };

        match frame {
            WsMessage::Text(text) => {
                let msg = match decode(&text) {
                    Ok(msg) => msg,
                    Err(CodecError::Empty) => continue,
                    Err(e) => {
                        warn!(client_id, "dropping malformed frame: {e}");
                        continue;
                    }
                };
                debug!(client_id, msg_type = %msg.msg_type, "browser frame");
                manager.handle_message(client_id, msg).await?;
            }
            WsMessage::Close(_) => {
                debug!(client_id, "close frame received");
                break;
            }
            WsMessage::Binary(_) => warn!(client_id, "unexpected binary frame (ignored)"),
            WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => {}
        }
    }
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
