//! Relation (pairing) state machine.
//!
//! A relation is the triple `{deliverer_id, controller_id, gamepad_id}` that
//! binds one signaling session.  Each WebSocket connection carries exactly one
//! [`Relation`] which moves through three states:
//!
//! ```text
//!   None ──propose──▶ Proposed ──commit──▶ Committed
//!    ▲                   │
//!    └─────withdraw──────┘
//!
//!   None | Proposed ──propose_and_commit──▶ Committed
//! ```
//!
//! The deliverer side proposes when it sends an offer and commits when the
//! controller accepts it; the controller side jumps straight to `Committed`
//! through [`Relation::propose_and_commit`].  A committed relation is final
//! for the lifetime of the connection.
//!
//! Every transition returns a `bool` so callers can branch into the right
//! error reply without matching on an error type.

use std::fmt;

/// The identifier triple a relation binds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct RelationIds {
    pub deliverer_id: String,
    pub controller_id: String,
    pub gamepad_id: String,
}

impl RelationIds {
    pub fn new(
        deliverer_id: impl Into<String>,
        controller_id: impl Into<String>,
        gamepad_id: impl Into<String>,
    ) -> Self {
        Self {
            deliverer_id: deliverer_id.into(),
            controller_id: controller_id.into(),
            gamepad_id: gamepad_id.into(),
        }
    }

    /// Returns `true` when all three ids are non-empty.
    pub fn is_complete(&self) -> bool {
        !self.deliverer_id.is_empty()
            && !self.controller_id.is_empty()
            && !self.gamepad_id.is_empty()
    }
}

impl fmt::Display for RelationIds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "deliverer={} controller={} gamepad={}",
            self.deliverer_id, self.controller_id, self.gamepad_id
        )
    }
}

/// Pairing state of one WebSocket connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Relation {
    /// No relation has been proposed yet.
    #[default]
    None,
    /// An offer is in flight; the controller has not answered.
    Proposed(RelationIds),
    /// Both sides agreed; immutable from here on.
    Committed(RelationIds),
}

impl Relation {
    /// Records an in-flight proposal.
    ///
    /// Succeeds only from [`Relation::None`]: a second offer while one is
    /// still proposed is refused, as is any offer after commit.
    pub fn propose(&mut self, ids: RelationIds) -> bool {
        match self {
            Relation::None => {
                *self = Relation::Proposed(ids);
                true
            }
            Relation::Proposed(_) | Relation::Committed(_) => false,
        }
    }

    /// Sets and commits the relation in one step.
    ///
    /// Succeeds from [`Relation::None`] or [`Relation::Proposed`]; a committed
    /// relation is never overwritten.
    pub fn propose_and_commit(&mut self, ids: RelationIds) -> bool {
        match self {
            Relation::None | Relation::Proposed(_) => {
                *self = Relation::Committed(ids);
                true
            }
            Relation::Committed(_) => false,
        }
    }

    /// Commits a proposed relation.  Fails when unset or already committed.
    pub fn commit(&mut self) -> bool {
        match std::mem::take(self) {
            Relation::Proposed(ids) => {
                *self = Relation::Committed(ids);
                true
            }
            other => {
                *self = other;
                false
            }
        }
    }

    /// Drops a proposed relation so the connection may offer again.
    pub fn withdraw(&mut self) -> bool {
        match self {
            Relation::Proposed(_) => {
                *self = Relation::None;
                true
            }
            Relation::None | Relation::Committed(_) => false,
        }
    }

    /// Returns the bound triple, proposed or committed.
    pub fn ids(&self) -> Option<&RelationIds> {
        match self {
            Relation::None => None,
            Relation::Proposed(ids) | Relation::Committed(ids) => Some(ids),
        }
    }

    /// `true` when the relation (proposed or committed) names exactly `ids`.
    pub fn matches(&self, ids: &RelationIds) -> bool {
        self.ids() == Some(ids)
    }

    /// `true` when the relation is committed to exactly `ids`.
    pub fn is_committed_to(&self, ids: &RelationIds) -> bool {
        matches!(self, Relation::Committed(own) if own == ids)
    }

    pub fn is_committed(&self) -> bool {
        matches!(self, Relation::Committed(_))
    }

    /// `true` when the relation (in any state) names `gamepad_id`.
    pub fn involves_gamepad(&self, gamepad_id: &str) -> bool {
        self.ids().is_some_and(|ids| ids.gamepad_id == gamepad_id)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
