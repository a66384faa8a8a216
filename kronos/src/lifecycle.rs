//! Session lifecycle state machine.
//!
//! ```text
//! Idle → Creating → Advertised ⇄ Filling → Locked → InProgress → TearingDown → Closed
//!                        any live state → Failed | Closed
//! ```
//!
//! `Advertised`, `Filling`, `Locked` and `InProgress` are derived from the
//! reserved attributes and member count the backend reports, so every peer
//! agrees on them without extra messages.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{KronosError, Result};
use crate::types::{flag, AttributeMap, LOCKED_KEY, STARTED_KEY};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Idle,
    Creating,
    Advertised,
    Filling,
    Locked,
    InProgress,
    TearingDown,
    Closed,
    Failed,
}

impl LifecycleState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }

    /// Advertised through InProgress.
    pub fn is_established(self) -> bool {
        matches!(
            self,
            Self::Advertised | Self::Filling | Self::Locked | Self::InProgress
        )
    }

    /// The documented transition set. Self-transitions are not transitions.
    pub fn can_transition_to(self, next: Self) -> bool {
        use LifecycleState::*;
        if self.is_terminal() || self == next {
            return false;
        }
        match (self, next) {
            (Idle, Creating) => true,
            (Creating, Advertised | Filling | Locked | InProgress) => true,
            (Advertised, Filling) | (Filling, Advertised) => true,
            (Advertised | Filling, Locked) => true,
            (Locked, InProgress) => true,
            (TearingDown, Closed) => true,
            (Idle, _) => false,
            (_, TearingDown) => self != TearingDown,
            (_, Failed | Closed) => true,
            _ => false,
        }
    }

    /// State implied by a backend snapshot.
    pub fn derive(attributes: &AttributeMap, member_count: usize) -> Self {
        if flag(attributes, STARTED_KEY) {
            Self::InProgress
        } else if flag(attributes, LOCKED_KEY) {
            Self::Locked
        } else if member_count > 1 {
            Self::Filling
        } else {
            Self::Advertised
        }
    }

    /// Reject requests the current state does not allow.
    pub fn check(self, request: LifecycleRequest) -> Result<()> {
        use LifecycleState::*;
        let allowed = match request {
            LifecycleRequest::Create | LifecycleRequest::Join => self == Idle,
            LifecycleRequest::Lock => matches!(self, Advertised | Filling),
            LifecycleRequest::Start => self == Locked,
            LifecycleRequest::UpdateAttributes
            | LifecycleRequest::Ban
            | LifecycleRequest::Invite
            | LifecycleRequest::Leave
            | LifecycleRequest::Teardown => self.is_established(),
        };
        if allowed {
            Ok(())
        } else {
            Err(KronosError::invalid_transition(self, request))
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Creating => "creating",
            Self::Advertised => "advertised",
            Self::Filling => "filling",
            Self::Locked => "locked",
            Self::InProgress => "in progress",
            Self::TearingDown => "tearing down",
            Self::Closed => "closed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Application requests checked against the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleRequest {
    Create,
    Join,
    Lock,
    Start,
    UpdateAttributes,
    Ban,
    Invite,
    Leave,
    Teardown,
}

impl fmt::Display for LifecycleRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Create => "create",
            Self::Join => "join",
            Self::Lock => "lock",
            Self::Start => "start",
            Self::UpdateAttributes => "update attributes",
            Self::Ban => "ban",
            Self::Invite => "invite",
            Self::Leave => "leave",
            Self::Teardown => "tear down",
        };
        f.write_str(name)
    }
}
