//! Server configuration types.
//!
//! [`ServerConfig`] mirrors the TOML file one-to-one:
//!
//! ```toml
//! verbose = false
//! ping_interval_secs = 10
//!
//! [ws_server]
//! bind_addr = "0.0.0.0:8443"
//! [ws_server.accounts]
//! alice = "secret"
//!
//! [tcp_server]
//! bind_addr = "0.0.0.0:8444"
//! secret = "shared-secret"
//! handshake_timeout_secs = 5
//! ```
//!
//! Every field has a serde default so a partial file is valid.  The only
//! setting without a usable default is the TCP shared secret, which
//! [`ServerConfig::validate`] insists on.
//!
//! The `Debug` impls redact the secret and every account password so the
//! config can be logged at startup.

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

const REDACTED: &str = "<redacted>";

/// Error type for loading and validating the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// `tcp_server.secret` is empty.
    #[error("tcp_server.secret must not be empty")]
    MissingSecret,

    /// A bind address does not parse as `ip:port`.
    #[error("{field} is not a valid socket address: '{value}'")]
    InvalidBindAddr { field: &'static str, value: String },

    /// An interval or timeout is zero.
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level server configuration.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Raise the default log level from `info` to `debug`.
    #[serde(default)]
    pub verbose: bool,
    /// Seconds between application-level `ping` frames on every connection.
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    #[serde(default)]
    pub ws_server: WsServerConfig,
    #[serde(default)]
    pub tcp_server: TcpServerConfig,
}

/// Browser-facing WebSocket listener.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct WsServerConfig {
    #[serde(default = "default_ws_bind_addr")]
    pub bind_addr: String,
    /// Basic-Auth accounts, user name to password.  Empty disables the check.
    #[serde(default)]
    pub accounts: BTreeMap<String, String>,
}

/// Gamepad-facing TCP listener.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct TcpServerConfig {
    #[serde(default = "default_tcp_bind_addr")]
    pub bind_addr: String,
    /// Shared secret whose SHA-256 hex digest devices present at handshake.
    #[serde(default)]
    pub secret: String,
    /// Per-line read timeout while waiting for `gpHandshakeReq`.
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_ping_interval_secs() -> u64 {
    10
}
fn default_ws_bind_addr() -> String {
    "0.0.0.0:8443".to_string()
}
fn default_tcp_bind_addr() -> String {
    "0.0.0.0:8444".to_string()
}
fn default_handshake_timeout_secs() -> u64 {
    5
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            verbose: false,
            ping_interval_secs: default_ping_interval_secs(),
            ws_server: WsServerConfig::default(),
            tcp_server: TcpServerConfig::default(),
        }
    }
}

impl Default for WsServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_ws_bind_addr(),
            accounts: BTreeMap::new(),
        }
    }
}

impl Default for TcpServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_tcp_bind_addr(),
            secret: String::new(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
        }
    }
}

// ── Derived values and validation ─────────────────────────────────────────────

impl ServerConfig {
    /// Checks every constraint the server relies on at startup.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint as a [`ConfigError`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tcp_server.secret.is_empty() {
            return Err(ConfigError::MissingSecret);
        }
        self.ws_server.bind_addr()?;
        self.tcp_server.bind_addr()?;
        if self.ping_interval_secs == 0 {
            return Err(ConfigError::ZeroDuration("ping_interval_secs"));
        }
        if self.tcp_server.handshake_timeout_secs == 0 {
            return Err(ConfigError::ZeroDuration("tcp_server.handshake_timeout_secs"));
        }
        Ok(())
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }
}

impl WsServerConfig {
    /// Parses `bind_addr`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidBindAddr`] when it is not `ip:port`.
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        parse_addr("ws_server.bind_addr", &self.bind_addr)
    }
}

impl TcpServerConfig {
    /// Parses `bind_addr`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidBindAddr`] when it is not `ip:port`.
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        parse_addr("tcp_server.bind_addr", &self.bind_addr)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

fn parse_addr(field: &'static str, value: &str) -> Result<SocketAddr, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidBindAddr {
        field,
        value: value.to_string(),
    })
}

// ── Redacted Debug ────────────────────────────────────────────────────────────

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("verbose", &self.verbose)
            .field("ping_interval_secs", &self.ping_interval_secs)
            .field("ws_server", &self.ws_server)
            .field("tcp_server", &self.tcp_server)
            .finish()
    }
}

impl fmt::Debug for WsServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let accounts: BTreeMap<&str, &str> = self
            .accounts
            .keys()
            .map(|user| (user.as_str(), REDACTED))
            .collect();
        f.debug_struct("WsServerConfig")
            .field("bind_addr", &self.bind_addr)
            .field("accounts", &accounts)
            .finish()
    }
}

impl fmt::Debug for TcpServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secret = if self.secret.is_empty() { "" } else { REDACTED };
        f.debug_struct("TcpServerConfig")
            .field("bind_addr", &self.bind_addr)
            .field("secret", &secret)
            .field("handshake_timeout_secs", &self.handshake_timeout_secs)
            .finish()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
