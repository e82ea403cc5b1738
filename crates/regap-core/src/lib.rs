//! # regap-core
//!
//! Shared library for regapweb containing the JSON message protocol, the
//! relation (pairing) state machine, and the in-memory client registry.
//!
//! This crate is used by the relay server for both of its halves: the
//! WebSocket half that browsers (deliverers and controllers) connect to, and
//! the TCP half that gamepad devices connect to.  It has zero dependencies on
//! sockets or async runtimes.
//!
//! # Architecture overview
//!
//! regapweb lets a browser-based *controller* drive a physical gamepad device
//! that sits behind a TCP link.  A *deliverer* browser negotiates a WebRTC
//! session with the controller; the server only brokers SDP and gamepad
//! messages between the three parties.
//!
//! - **`protocol`** – The message envelope shared by both transports, its
//!   type tags and payloads, and the text/line codec.
//!
//! - **`domain`** – Pure business logic: the [`Relation`] state machine that
//!   guards which deliverer/controller/gamepad triple may exchange messages,
//!   and the [`ClientsStore`] registry used for listings.

pub mod domain;
pub mod protocol;

// Re-export the most-used types at the crate root so callers can write
// `regap_core::Message` instead of `regap_core::protocol::messages::Message`.
pub use domain::registry::{ClientTable, ClientsStore};
pub use domain::relation::{Relation, RelationIds};
pub use protocol::codec::{decode, encode_line, encode_text, CodecError};
pub use protocol::messages::{ClientType, Message, MsgType};
