//! In-memory registry of client display names.
//!
//! The registry answers `lookupReq` and is otherwise write-only: connections
//! add themselves after registering and remove themselves on disconnect.
//! Each role has its own [`ClientTable`] and its own lock, so a burst of
//! gamepad churn never contends with deliverer or controller traffic.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::protocol::messages::{ClientType, NameAndId};

/// A thread-safe map from client id to display name.
#[derive(Debug, Default)]
pub struct ClientTable {
    entries: Mutex<HashMap<String, String>>,
}

impl ClientTable {
    pub fn new() -> Self {
        Self::default()
    }

    // A panic while holding the lock cannot leave the map half-updated, so a
    // poisoned lock is still safe to use.
    fn lock(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts `id` or updates its name if already present.
    pub fn add(&self, id: impl Into<String>, name: impl Into<String>) {
        self.lock().insert(id.into(), name.into());
    }

    /// Removes `id`; a missing id is a no-op.  Returns whether it was present.
    pub fn delete(&self, id: &str) -> bool {
        self.lock().remove(id).is_some()
    }

    /// Returns a snapshot of all entries in unspecified order.
    pub fn get(&self) -> Vec<NameAndId> {
        self.lock()
            .iter()
            .map(|(id, name)| NameAndId {
                name: name.clone(),
                id: id.clone(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// The three role tables, shared between the WebSocket and TCP halves.
#[derive(Debug, Default)]
pub struct ClientsStore {
    pub deliverers: ClientTable,
    pub controllers: ClientTable,
    pub gamepads: ClientTable,
}

impl ClientsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the table holding clients of `client_type`.
    pub fn table(&self, client_type: ClientType) -> &ClientTable {
        match client_type {
            ClientType::Deliverer => &self.deliverers,
            ClientType::Controller => &self.controllers,
            ClientType::Gamepad => &self.gamepads,
        }
    }

    pub fn add(&self, client_type: ClientType, id: &str, name: &str) {
        let table = self.table(client_type);
        table.add(id, name);
        debug!(%client_type, id, name, entries = table.len(), "registry add");
    }

    pub fn delete(&self, client_type: ClientType, id: &str) -> bool {
        let table = self.table(client_type);
        let removed = table.delete(id);
        if removed {
            debug!(%client_type, id, entries = table.len(), "registry delete");
        }
        removed
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
