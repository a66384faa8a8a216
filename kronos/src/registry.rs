//! Session registry.
//!
//! Readers get whole `Arc<Session>` snapshots; writers replace the entry in
//! one step, so a half-applied member list is never observable. Only the
//! orchestrator's session workers write.

use std::sync::Arc;

use dashmap::DashMap;

use crate::backend::SessionSnapshot;
use crate::lifecycle::LifecycleState;
use crate::types::{
    host_of, AttributeMap, Identity, Member, MemberRole, SessionDescriptor, SessionId, SessionKind,
    Visibility,
};

/// What the local player currently believes about one session.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub id: SessionId,
    pub kind: SessionKind,
    pub owner: Identity,
    pub capacity: usize,
    pub visibility: Visibility,
    pub attributes: AttributeMap,
    /// Ordered by join time, then identity. Each identity appears once.
    pub members: Vec<Member>,
    pub state: LifecycleState,
    /// Last backend sequence folded into this snapshot.
    pub sequence: u64,
}

impl Session {
    pub fn from_snapshot(snapshot: &SessionSnapshot, state: LifecycleState) -> Self {
        let mut session = Self {
            id: snapshot.id.clone(),
            kind: snapshot.kind,
            owner: snapshot.owner.clone(),
            capacity: snapshot.capacity,
            visibility: snapshot.visibility,
            attributes: snapshot.attributes.clone(),
            members: Vec::with_capacity(snapshot.members.len()),
            state,
            sequence: snapshot.sequence,
        };
        for member in &snapshot.members {
            session.put_member(member.clone());
        }
        session.normalize();
        session
    }

    pub fn host(&self) -> Option<Identity> {
        host_of(&self.attributes)
    }

    pub fn is_host(&self, identity: &Identity) -> bool {
        self.host().as_ref() == Some(identity)
    }

    pub fn member(&self, identity: &Identity) -> Option<&Member> {
        self.members.iter().find(|m| &m.identity == identity)
    }

    pub fn is_member(&self, identity: &Identity) -> bool {
        self.member(identity).is_some()
    }

    pub fn open_slots(&self) -> usize {
        self.capacity.saturating_sub(self.members.len())
    }

    pub fn descriptor(&self) -> SessionDescriptor {
        SessionDescriptor {
            id: self.id.clone(),
            kind: self.kind,
            owner: self.owner.clone(),
            capacity: self.capacity,
            open_slots: self.open_slots(),
            visibility: self.visibility,
            attributes: self.attributes.clone(),
        }
    }

    /// Insert or replace by identity.
    pub(crate) fn put_member(&mut self, member: Member) {
        match self.members.iter_mut().find(|m| m.identity == member.identity) {
            Some(existing) => *existing = member,
            None => self.members.push(member),
        }
    }

    pub(crate) fn remove_member(&mut self, identity: &Identity) -> Option<Member> {
        let pos = self.members.iter().position(|m| &m.identity == identity)?;
        Some(self.members.remove(pos))
    }

    /// Re-sort members and derive roles from the host attribute.
    pub(crate) fn normalize(&mut self) {
        let host = self.host();
        for member in &mut self.members {
            member.role = if Some(&member.identity) == host.as_ref() {
                MemberRole::Host
            } else {
                MemberRole::Participant
            };
        }
        self.members.sort_by(|a, b| {
            a.joined_at
                .cmp(&b.joined_at)
                .then_with(|| a.identity.cmp(&b.identity))
        });
    }
}

/// Process-wide table of live local sessions.
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<Session>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    pub fn get(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|s| Arc::clone(s.value()))
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// All sessions, ordered by id.
    pub fn list(&self) -> Vec<Arc<Session>> {
        let mut sessions: Vec<Arc<Session>> =
            self.sessions.iter().map(|s| Arc::clone(s.value())).collect();
        sessions.sort_by(|a, b| a.id.cmp(&b.id));
        sessions
    }

    pub fn find_by_kind(&self, kind: SessionKind) -> Option<Arc<Session>> {
        self.sessions
            .iter()
            .find(|s| s.kind == kind)
            .map(|s| Arc::clone(s.value()))
    }

    pub(crate) fn upsert(&self, session: Session) -> Arc<Session> {
        let session = Arc::new(session);
        self.sessions.insert(session.id.clone(), Arc::clone(&session));
        session
    }

    pub(crate) fn remove(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.remove(id).map(|(_, s)| s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::HOST_KEY;

    fn snapshot(members: &[(&str, u64)]) -> SessionSnapshot {
        let mut attributes = AttributeMap::new();
        attributes.insert(HOST_KEY.into(), "alice".into());
        SessionSnapshot {
            id: SessionId::new("s-1"),
            kind: SessionKind::Game,
            owner: Identity::new("alice"),
            capacity: 4,
            visibility: Visibility::Public,
            attributes,
            members: members
                .iter()
                .map(|(who, at)| Member::new(Identity::new(*who), *at))
                .collect(),
            sequence: 3,
        }
    }

    #[test]
    fn test_session_from_snapshot() {
        let session = Session::from_snapshot(
            &snapshot(&[("carol", 30), ("alice", 10), ("bob", 20), ("bob", 25)]),
            LifecycleState::Filling,
        );
        let order: Vec<&str> = session.members.iter().map(|m| m.identity.as_str()).collect();
        assert_eq!(order, vec!["alice", "bob", "carol"]);
        assert_eq!(session.members[1].joined_at, 25);
        assert_eq!(session.members[0].role, MemberRole::Host);
        assert_eq!(session.members[1].role, MemberRole::Participant);
        assert_eq!(session.open_slots(), 1);
        assert!(session.is_host(&Identity::new("alice")));
    }

    #[test]
    fn test_registry_lifecycle() {
        let registry = SessionRegistry::new();
        let session = Session::from_snapshot(&snapshot(&[("alice", 10)]), LifecycleState::Advertised);
        let id = session.id.clone();

        let before = registry.upsert(session.clone());
        assert_eq!(registry.count(), 1);

        let mut next = session;
        next.state = LifecycleState::Locked;
        registry.upsert(next);

        // Readers holding the old snapshot keep seeing it unchanged.
        assert_eq!(before.state, LifecycleState::Advertised);
        assert_eq!(registry.get(&id).map(|s| s.state), Some(LifecycleState::Locked));
        assert!(registry.find_by_kind(SessionKind::Game).is_some());
        assert!(registry.find_by_kind(SessionKind::Party).is_none());

        registry.remove(&id);
        assert_eq!(registry.count(), 0);
        assert!(registry.get(&id).is_none());
    }
}
