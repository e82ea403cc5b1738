//! Domain layer for regap-web.
//!
//! Pure configuration types with no I/O.  Reading the TOML file from disk is
//! the infrastructure layer's job (see `infrastructure::config_file`).

pub mod config;

pub use config::{ConfigError, ServerConfig, TcpServerConfig, WsServerConfig};
