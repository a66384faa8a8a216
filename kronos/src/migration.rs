//! Host migration.
//!
//! When the recorded host stops being a member, the survivor with the
//! lowest join timestamp (ties broken by identity) is promoted through an
//! ordinary attribute update. Every surviving peer computes the same
//! candidate, so concurrent promotions agree. A candidate the backend
//! refuses is excluded and selection runs again until nobody is left.

use crate::registry::Session;
use crate::types::{AttributeMap, Identity, Member, SessionId, HOST_KEY};

/// Deterministic host choice among `members`, skipping `excluded`.
pub fn select_host(members: &[Member], excluded: &[Identity]) -> Option<Identity> {
    members
        .iter()
        .filter(|m| !excluded.contains(&m.identity))
        .min_by(|a, b| {
            a.joined_at
                .cmp(&b.joined_at)
                .then_with(|| a.identity.cmp(&b.identity))
        })
        .map(|m| m.identity.clone())
}

/// Progress of one migration.
#[derive(Debug, Clone)]
pub struct HostMigration {
    session_id: SessionId,
    departed: Identity,
    excluded: Vec<Identity>,
    attempts: u32,
}

impl HostMigration {
    pub fn new(session_id: SessionId, departed: Identity) -> Self {
        Self {
            session_id,
            excluded: vec![departed.clone()],
            departed,
            attempts: 0,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn departed(&self) -> &Identity {
        &self.departed
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn next_candidate(&self, session: &Session) -> Option<Identity> {
        select_host(&session.members, &self.excluded)
    }

    /// The backend refused `candidate`.
    pub fn reject(&mut self, candidate: Identity) {
        self.attempts += 1;
        if !self.excluded.contains(&candidate) {
            self.excluded.push(candidate);
        }
    }

    /// Someone already promoted a present member.
    pub fn is_resolved(&self, session: &Session) -> bool {
        session.host().is_some_and(|host| session.is_member(&host))
    }

    pub fn promotion(candidate: &Identity) -> AttributeMap {
        let mut attributes = AttributeMap::new();
        attributes.insert(HOST_KEY.into(), candidate.as_str().into());
        attributes
    }
}
