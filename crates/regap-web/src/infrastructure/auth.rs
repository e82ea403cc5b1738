//! Upgrade-time routing and HTTP Basic-Auth for browser connections.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use regap_core::ClientType;

/// Maps a WebSocket upgrade path to the role its connections take.
///
/// Returns `None` for any path other than `/delivererws` and `/controllerws`.
pub fn route_for_path(path: &str) -> Option<ClientType> {
    // Ignore a query string.
    let path = path.split('?').next().unwrap_or(path);
    match path {
        "/delivererws" => Some(ClientType::Deliverer),
        "/controllerws" => Some(ClientType::Controller),
        _ => None,
    }
}

/// The sub-protocol a browser may offer for a role.
pub fn subprotocol_for(client_type: ClientType) -> &'static str {
    client_type.as_str()
}

/// Account table checked against the `Authorization: Basic` header.
#[derive(Clone, Default)]
pub struct BasicAuth {
    accounts: BTreeMap<String, String>,
}

impl BasicAuth {
    pub fn new(accounts: BTreeMap<String, String>) -> Self {
        Self { accounts }
    }

    /// An empty account table disables the check.
    pub fn is_enabled(&self) -> bool {
        !self.accounts.is_empty()
    }

    /// Checks the raw value of an `Authorization` header.
    pub fn verify(&self, header: Option<&str>) -> bool {
        if !self.is_enabled() {
            return true;
        }
        let Some((user, password)) = header.and_then(parse_basic) else {
            return false;
        };
        self.accounts
            .get(&user)
            .is_some_and(|expected| constant_time_eq(expected, &password))
    }
}

impl std::fmt::Debug for BasicAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasicAuth")
            .field("users", &self.accounts.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Splits `Basic base64(user:password)` into its parts.
fn parse_basic(header: &str) -> Option<(String, String)> {
    let (scheme, encoded) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |diff, (l, r)| diff | (l ^ r)) == 0
}
