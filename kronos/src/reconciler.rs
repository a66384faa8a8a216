//! Membership reconciliation.
//!
//! Folds backend snapshots and membership events into [`Session`] values in
//! sequence order. Anything at or below the last applied sequence is
//! dropped, so replays and late duplicates are no-ops and a join followed by
//! a leave always resolves to whichever the backend stamped last.

use std::collections::BTreeMap;

use crate::backend::{MembershipEvent, MembershipEventKind, SessionSnapshot};
use crate::lifecycle::LifecycleState;
use crate::registry::Session;
use crate::types::{AttributeMap, ConnectionState, Identity, MemberRole, SessionId};

/// Events held back while no baseline snapshot exists.
const MAX_EARLY_EVENTS: usize = 256;

/// Result of folding one input.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Reconciled {
    /// Next snapshot, `None` when the input was dropped or buffered.
    pub session: Option<Session>,
    pub dropped: bool,
    pub membership_changed: bool,
    pub joined: Vec<Identity>,
    pub left: Vec<Identity>,
    /// Keys whose value is new or different, with the new value.
    pub attributes_changed: AttributeMap,
    /// `(previous, next)` host attribute.
    pub host_changed: Option<(Option<Identity>, Option<Identity>)>,
    /// Set when the recorded host just stopped being a member.
    pub host_departed: Option<Identity>,
    pub local_departed: bool,
    pub closed: bool,
}

impl Reconciled {
    fn dropped() -> Self {
        Self {
            dropped: true,
            ..Default::default()
        }
    }

    /// Fold a later result over this one.
    fn merge(&mut self, later: Reconciled) {
        if later.session.is_some() {
            self.session = later.session;
        }
        self.membership_changed |= later.membership_changed;
        for identity in later.joined {
            self.left.retain(|i| i != &identity);
            if !self.joined.contains(&identity) {
                self.joined.push(identity);
            }
        }
        for identity in later.left {
            self.joined.retain(|i| i != &identity);
            if !self.left.contains(&identity) {
                self.left.push(identity);
            }
        }
        self.attributes_changed.extend(later.attributes_changed);
        if let Some((_, next)) = later.host_changed {
            let previous = self.host_changed.take().and_then(|(prev, _)| prev);
            self.host_changed = Some((previous, next));
        }
        self.host_departed = later.host_departed.or(self.host_departed.take());
        self.local_departed |= later.local_departed;
        self.closed |= later.closed;
    }
}

/// Per-session reconciler, owned by that session's worker.
#[derive(Debug)]
pub struct MembershipReconciler {
    session_id: SessionId,
    local: Identity,
    last_applied: Option<u64>,
    early: BTreeMap<u64, MembershipEvent>,
    dropped: u64,
}

impl MembershipReconciler {
    pub fn new(session_id: SessionId, local: Identity) -> Self {
        Self {
            session_id,
            local,
            last_applied: None,
            early: BTreeMap::new(),
            dropped: 0,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn last_applied(&self) -> Option<u64> {
        self.last_applied
    }

    /// Inputs discarded as stale so far.
    pub fn dropped_count(&self) -> u64 {
        self.dropped
    }

    /// Apply an authoritative snapshot, then any buffered events newer than it.
    pub fn apply_snapshot(&mut self, current: Option<&Session>, snapshot: &SessionSnapshot) -> Reconciled {
        if self.last_applied.is_some_and(|last| snapshot.sequence < last) {
            self.dropped += 1;
            trace_debug!(session = %self.session_id, sequence = snapshot.sequence, "dropped stale snapshot");
            return Reconciled::dropped();
        }
        let state = current.map_or(LifecycleState::Creating, |c| c.state);
        let next = Session::from_snapshot(snapshot, state);
        let mut outcome = diff(current, next, &self.local);
        self.last_applied = Some(snapshot.sequence);

        let early = std::mem::take(&mut self.early);
        for (_, event) in early.into_iter().filter(|(seq, _)| *seq > snapshot.sequence) {
            let Some(base) = outcome.session.clone() else { break };
            let later = self.apply_event(&base, &event);
            outcome.merge(later);
        }
        outcome
    }

    /// Hold an event that arrived before the first snapshot.
    pub fn defer(&mut self, event: &MembershipEvent) {
        if self.early.len() < MAX_EARLY_EVENTS {
            self.early.insert(event.sequence, event.clone());
        }
    }

    /// Apply one membership event on top of `current`.
    pub fn apply_event(&mut self, current: &Session, event: &MembershipEvent) -> Reconciled {
        let Some(last) = self.last_applied else {
            self.defer(event);
            return Reconciled::default();
        };
        if event.sequence <= last {
            self.dropped += 1;
            trace_debug!(
                session = %self.session_id,
                sequence = event.sequence,
                last,
                "dropped stale membership event"
            );
            return Reconciled::dropped();
        }

        let mut next = current.clone();
        let mut closed = false;
        match &event.kind {
            MembershipEventKind::Joined(member) => next.put_member(member.clone()),
            MembershipEventKind::Left(identity) | MembershipEventKind::TimedOut(identity) => {
                next.remove_member(identity);
            }
            MembershipEventKind::ConnectionChanged { identity, state } => {
                if let Some(member) = next.members.iter_mut().find(|m| &m.identity == identity) {
                    member.connection = *state;
                }
            }
            MembershipEventKind::AttributesChanged(attributes) => {
                for (key, value) in attributes {
                    next.attributes.insert(key.clone(), value.clone());
                }
            }
            MembershipEventKind::Closed => closed = true,
        }
        next.sequence = event.sequence;
        next.normalize();
        self.last_applied = Some(event.sequence);

        let mut outcome = diff(Some(current), next, &self.local);
        outcome.closed = closed;
        outcome
    }
}

fn member_key(session: &Session) -> Vec<(&Identity, MemberRole, ConnectionState)> {
    session
        .members
        .iter()
        .map(|m| (&m.identity, m.role, m.connection))
        .collect()
}

fn host_absent(session: &Session) -> Option<Identity> {
    session.host().filter(|host| !session.is_member(host))
}

fn diff(current: Option<&Session>, next: Session, local: &Identity) -> Reconciled {
    let mut outcome = Reconciled::default();

    match current {
        Some(current) => {
            outcome.membership_changed = member_key(current) != member_key(&next);
            outcome.joined = next
                .members
                .iter()
                .filter(|m| !current.is_member(&m.identity))
                .map(|m| m.identity.clone())
                .collect();
            outcome.left = current
                .members
                .iter()
                .filter(|m| !next.is_member(&m.identity))
                .map(|m| m.identity.clone())
                .collect();
            outcome.attributes_changed = next
                .attributes
                .iter()
                .filter(|(k, v)| current.attributes.get(*k) != Some(*v))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            let (before, after) = (current.host(), next.host());
            if before != after {
                outcome.host_changed = Some((before, after));
            }
            outcome.local_departed = current.is_member(local) && !next.is_member(local);
            if host_absent(current).is_none() {
                outcome.host_departed = host_absent(&next);
            }
        }
        None => {
            outcome.membership_changed = true;
            outcome.joined = next.members.iter().map(|m| m.identity.clone()).collect();
            outcome.attributes_changed = next.attributes.clone();
            outcome.host_departed = host_absent(&next);
        }
    }

    outcome.session = Some(next);
    outcome
}
