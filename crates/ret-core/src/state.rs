//! Resolution state machine for tracked messages
//!
//! A tracked message leaves `Pending` at most once and never comes back.

use crate::error::StoreError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Resolution state of a tracked message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionState {
    /// Awaiting a qualifying reply
    Pending,
    /// A qualifying reply was observed
    Responded,
    /// Closed without a reply
    Expired,
}

impl ResolutionState {
    /// Whether the message still awaits a reply
    #[inline]
    #[must_use]
    pub fn is_pending(self) -> bool {
        matches!(self, Self::Pending)
    }

    /// Whether no further transition is possible
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        allowed_transitions(self).is_empty()
    }
}

impl fmt::Display for ResolutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Responded => "responded",
            Self::Expired => "expired",
        };
        f.write_str(s)
    }
}

/// Validates a state transition.
///
/// # Errors
/// `StoreError::IllegalTransition` when `to` is not reachable from `from`.
pub fn validate_transition(from: ResolutionState, to: ResolutionState) -> Result<(), StoreError> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(StoreError::IllegalTransition { from, to })
    }
}

/// States reachable from `from` in one step
#[must_use]
pub fn allowed_transitions(from: ResolutionState) -> &'static [ResolutionState] {
    use ResolutionState::{Expired, Pending, Responded};
    match from {
        Pending => &[Responded, Expired],
        Responded | Expired => &[],
    }
}
