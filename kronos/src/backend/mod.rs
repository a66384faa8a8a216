//! Backend adapter seam.
//!
//! One [`SessionBackend`] wraps one platform's native session API. Calls
//! never block: each returns a [`BackendHandle`] at once and reports exactly
//! one [`BackendCompletion`] for it later through the attached [`EventSink`].
//! Membership changes made by other players arrive on the same sink as
//! sequence-stamped [`MembershipEvent`]s.

mod loopback;

pub use loopback::{LoopbackBackend, LoopbackPlatform};

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::types::{
    AttributeMap, ConnectionState, Identity, Member, SessionDescriptor, SessionId, SessionKind,
    SessionParams, Visibility,
};

/// Correlates a backend call with its completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BackendHandle(pub u64);

impl fmt::Display for BackendHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Create,
    Search,
    Join,
    Leave,
    UpdateAttributes,
    Destroy,
    SendInvite,
}

impl OpKind {
    /// Mutating operations occupy the session's pending slot.
    pub fn is_mutating(self) -> bool {
        !matches!(self, Self::Search | Self::SendInvite)
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Create => "create",
            Self::Search => "search",
            Self::Join => "join",
            Self::Leave => "leave",
            Self::UpdateAttributes => "update_attributes",
            Self::Destroy => "destroy",
            Self::SendInvite => "send_invite",
        };
        f.write_str(name)
    }
}

/// Tagged failure reported by an adapter.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendFailure {
    #[error("backend unavailable: {reason}")]
    BackendUnavailable { reason: String },

    #[error("rate limited")]
    RateLimited,

    #[error("not authorized")]
    NotAuthorized,

    #[error("session full")]
    SessionFull,

    #[error("session not found")]
    SessionNotFound,
}

impl BackendFailure {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::BackendUnavailable {
            reason: reason.into(),
        }
    }
}

/// What a platform can do beyond the common surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendCapabilities {
    pub find_by_id: bool,
    pub invites: bool,
    pub host_migration: bool,
}

impl Default for BackendCapabilities {
    fn default() -> Self {
        Self {
            find_by_id: false,
            invites: true,
            host_migration: true,
        }
    }
}

/// Authoritative session state as the backend sees it at `sequence`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub kind: SessionKind,
    pub owner: Identity,
    pub capacity: usize,
    pub visibility: Visibility,
    pub attributes: AttributeMap,
    pub members: Vec<Member>,
    pub sequence: u64,
}

impl SessionSnapshot {
    pub fn descriptor(&self) -> SessionDescriptor {
        SessionDescriptor {
            id: self.id.clone(),
            kind: self.kind,
            owner: self.owner.clone(),
            capacity: self.capacity,
            open_slots: self.capacity.saturating_sub(self.members.len()),
            visibility: self.visibility,
            attributes: self.attributes.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CompletionPayload {
    /// Create, join and attribute updates report the resulting session.
    Session(SessionSnapshot),
    Search(Vec<SessionDescriptor>),
    Left(SessionId),
    Destroyed(SessionId),
    InviteSent,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackendCompletion {
    pub handle: BackendHandle,
    pub outcome: std::result::Result<CompletionPayload, BackendFailure>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipEventKind {
    Joined(Member),
    Left(Identity),
    TimedOut(Identity),
    ConnectionChanged {
        identity: Identity,
        state: ConnectionState,
    },
    /// Listed keys replace their prior values.
    AttributesChanged(AttributeMap),
    /// The backend destroyed the session.
    Closed,
}

/// Raw membership event, stamped with a per-session monotonic sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MembershipEvent {
    pub session_id: SessionId,
    pub sequence: u64,
    pub kind: MembershipEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    Completion(BackendCompletion),
    Membership(MembershipEvent),
    InviteReceived {
        descriptor: SessionDescriptor,
        from: Identity,
    },
}

/// Thread-safe completion queue from adapter to orchestrator.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<BackendEvent>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<BackendEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Returns false once the orchestrator is gone.
    pub fn send(&self, event: BackendEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn complete(
        &self,
        handle: BackendHandle,
        outcome: std::result::Result<CompletionPayload, BackendFailure>,
    ) -> bool {
        self.send(BackendEvent::Completion(BackendCompletion { handle, outcome }))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Platform session API, as seen by one local player.
pub trait SessionBackend: Send + Sync {
    fn name(&self) -> &str;

    /// The player this adapter acts for.
    fn local_identity(&self) -> &Identity;

    fn capabilities(&self) -> BackendCapabilities;

    /// Route completions and membership events to `sink`. Called once.
    fn attach(&self, sink: EventSink);

    fn create(&self, params: &SessionParams) -> BackendHandle;

    fn search(&self, filter: &crate::query::SearchFilter) -> BackendHandle;

    fn join(&self, descriptor: &SessionDescriptor) -> BackendHandle;

    fn leave(&self, session_id: &SessionId) -> BackendHandle;

    fn update_attributes(&self, session_id: &SessionId, attributes: &AttributeMap) -> BackendHandle;

    fn destroy(&self, session_id: &SessionId) -> BackendHandle;

    fn send_invite(&self, session_id: &SessionId, invitee: &Identity) -> BackendHandle;
}
