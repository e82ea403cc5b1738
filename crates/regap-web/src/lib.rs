//! regap-web library crate.
//!
//! The relay server behind regapweb.  Browsers connect over WebSocket as
//! *deliverers* or *controllers*; gamepad devices connect over plain TCP.
//! The server brokers WebRTC signaling between a deliverer and a controller
//! and relays gamepad traffic between a controller and a device, but only
//! for the deliverer/controller/gamepad triple both browsers committed to.
//!
//! ```text
//! Browser (JSON text frames)            Gamepad device (JSON lines)
//!         ↕                                       ↕
//! [regap-web]
//!   ├── domain/          ServerConfig and its validation
//!   ├── application/     WsManager ⇄ Forwarder ⇄ TcpManager
//!   └── infrastructure/  accept loops, upgrade auth, ping loops, config file
//! ```
//!
//! `domain` and `application` never touch a socket; connections reach the
//! managers as [`application::MessageWriter`] trait objects.

/// Domain layer: configuration types.
pub mod domain;

/// Application layer: connection managers, forwarder and wiring.
pub mod application;

/// Infrastructure layer: WebSocket and TCP servers.
pub mod infrastructure;
