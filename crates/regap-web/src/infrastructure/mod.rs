//! Infrastructure layer for regap-web.
//!
//! Everything that touches a socket or the file system lives here:
//!
//! - the WebSocket accept loop, upgrade-time routing and Basic-Auth
//! - the gamepad TCP accept loop, handshake and line framing
//! - the per-connection ping loop shared by both
//! - reading the TOML configuration file
//!
//! Protocol decisions are made by the application layer.

pub mod auth;
pub mod config_file;
pub mod ping;
pub mod tcp_server;
pub mod ws_server;

pub use auth::BasicAuth;
pub use config_file::load_config;
pub use tcp_server::{run_tcp_server, TcpSessionTimings};
pub use ws_server::run_ws_server;
