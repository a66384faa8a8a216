//! Read-only views of the lobby for overlays and bug reports.

use std::fmt::Write as _;

use serde::Serialize;

use crate::lifecycle::LifecycleState;
use crate::orchestrator::PendingOperation;
use crate::registry::Session;
use crate::types::{
    AttributeMap, ConnectionState, Identity, MemberRole, SessionId, SessionKind, Visibility,
};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemberView {
    pub identity: Identity,
    pub role: MemberRole,
    pub connection: ConnectionState,
    pub joined_at: u64,
}

/// Point-in-time copy of one session and its pending operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionView {
    pub id: SessionId,
    pub kind: SessionKind,
    pub state: LifecycleState,
    pub owner: Identity,
    pub host: Option<Identity>,
    pub capacity: usize,
    pub open_slots: usize,
    pub visibility: Visibility,
    pub members: Vec<MemberView>,
    pub attributes: AttributeMap,
    pub sequence: u64,
    pub pending: Option<PendingOperation>,
}

impl SessionView {
    pub fn new(session: &Session, pending: Option<&PendingOperation>) -> Self {
        Self {
            id: session.id.clone(),
            kind: session.kind,
            state: session.state,
            owner: session.owner.clone(),
            host: session.host(),
            capacity: session.capacity,
            open_slots: session.open_slots(),
            visibility: session.visibility,
            members: session
                .members
                .iter()
                .map(|m| MemberView {
                    identity: m.identity.clone(),
                    role: m.role,
                    connection: m.connection,
                    joined_at: m.joined_at,
                })
                .collect(),
            attributes: session.attributes.clone(),
            sequence: session.sequence,
            pending: pending.cloned(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Multi-line dump in a stable order.
pub fn debug_string(session: &Session, pending: Option<&PendingOperation>) -> String {
    let mut out = String::new();
    let host = session
        .host()
        .map_or_else(|| "-".to_string(), |h| h.to_string());
    let _ = writeln!(out, "session {} ({})", session.id, session.kind);
    let _ = writeln!(out, "  state: {}", session.state);
    let _ = writeln!(out, "  owner: {}  host: {}", session.owner, host);
    let _ = writeln!(
        out,
        "  slots: {}/{} open  visibility: {:?}  sequence: {}",
        session.open_slots(),
        session.capacity,
        session.visibility,
        session.sequence
    );
    let _ = writeln!(out, "  members:");
    for member in &session.members {
        let _ = writeln!(
            out,
            "    {} {:?} {:?} joined_at={}",
            member.identity, member.role, member.connection, member.joined_at
        );
    }
    if !session.attributes.is_empty() {
        let _ = writeln!(out, "  attributes:");
        for (key, value) in &session.attributes {
            let _ = writeln!(out, "    {key} = {value}");
        }
    }
    match pending {
        Some(p) => {
            let handle = p.handle.map_or_else(|| "-".to_string(), |h| h.to_string());
            let _ = writeln!(
                out,
                "  pending: {} ({}) handle={} attempt={}{}",
                p.request,
                p.op,
                handle,
                p.attempt,
                if p.migration { " migration" } else { "" }
            );
        }
        None => {
            let _ = writeln!(out, "  pending: none");
        }
    }
    out
}
