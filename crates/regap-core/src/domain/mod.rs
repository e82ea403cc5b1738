//! Domain entities for regapweb.
//!
//! This module contains pure business logic with no transport dependencies:
//! the relation state machine that decides which deliverer/controller/gamepad
//! triple may exchange messages, and the registry of display names used to
//! answer lookups.  Both are safe to unit-test without sockets or a runtime.

/// Pairing state attached to each WebSocket connection.
///
/// See [`relation::Relation`] for the main type.
pub mod relation;

/// Name listings for deliverers, controllers and gamepads.
pub mod registry;
