//! Application layer: connection managers and the cross-transport forwarder.
//!
//! Nothing here touches a socket.  The infrastructure layer accepts
//! connections, wraps their write halves in [`MessageWriter`]s and feeds
//! decoded frames into [`WsManager`] and [`TcpManager`].

pub mod forwarder;
pub mod relay;
pub mod tcp_manager;
pub mod writer;
pub mod ws_manager;

pub use forwarder::{DeliveryReceipt, ForwardError, ForwardHandler, Forwarder, ForwarderError};
pub use relay::Relay;
pub use tcp_manager::{handshake_digest, HandshakeError, HandshakeStep, TcpManager};
pub use writer::{MessageWriter, SessionError, WriteError};
pub use ws_manager::WsManager;
