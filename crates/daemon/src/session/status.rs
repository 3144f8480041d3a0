//! Session status state machine.
//!
//! ```text
//!            notify(waiting)              notify(completed) / exit
//!   running ────────────────▶ waiting ─────────────────────────▶ completed
//!      ▲  ◀──────────────────    │                                   ▲
//!      │     notify(running)     │                                   │
//!      └─────────────────────────┴───────────────────────────────────┘
//! ```
//!
//! `completed` is terminal: every later request is accepted and ignored.

use termhub_protocol::SessionStatus;

/// Outcome of asking a session to move to a new status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The request was applied. `from` may equal `to` when a state is re-asserted.
    Applied {
        from: SessionStatus,
        to: SessionStatus,
    },
    /// The session is already completed; nothing changed.
    Ignored,
}

impl Transition {
    /// Computes the transition from `current` towards `requested`.
    pub fn evaluate(current: SessionStatus, requested: SessionStatus) -> Self {
        if current.is_terminal() {
            return Transition::Ignored;
        }
        Transition::Applied {
            from: current,
            to: requested,
        }
    }

    /// Returns true if the request was applied.
    pub fn is_applied(&self) -> bool {
        matches!(self, Transition::Applied { .. })
    }

    /// Returns true if the observed status actually changed.
    pub fn is_change(&self) -> bool {
        matches!(self, Transition::Applied { from, to } if from != to)
    }

    /// Status after the transition, if it was applied.
    pub fn target(&self) -> Option<SessionStatus> {
        match self {
            Transition::Applied { to, .. } => Some(*to),
            Transition::Ignored => None,
        }
    }
}
