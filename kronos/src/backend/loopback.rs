//! In-process backend.
//!
//! A [`LoopbackPlatform`] holds authoritative sessions for any number of
//! players; each player talks to it through its own [`LoopbackBackend`].
//! Sessions enforce capacity, bans, locks and invites, stamp every change
//! with a per-session sequence, and deliver events after a configurable
//! latency. Faults and remote players can be injected for tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::{
    BackendCapabilities, BackendEvent, BackendFailure, BackendHandle, CompletionPayload, EventSink,
    MembershipEvent, MembershipEventKind, OpKind, SessionBackend, SessionSnapshot,
};
use crate::query::SearchFilter;
use crate::types::{
    banned_of, flag, host_of, AttributeMap, ConnectionState, Identity, Member, MemberRole,
    SessionDescriptor, SessionId, SessionKind, SessionParams, Visibility, HOST_KEY, LOCKED_KEY,
    STARTED_KEY,
};

type Outcome = std::result::Result<CompletionPayload, BackendFailure>;
type Outbox = Vec<(Identity, BackendEvent)>;

const CLOCK_START: u64 = 1_000;
const CLOCK_STEP: u64 = 10;

struct HostedSession {
    id: SessionId,
    kind: SessionKind,
    owner: Identity,
    capacity: usize,
    visibility: Visibility,
    attributes: AttributeMap,
    members: Vec<Member>,
    invited: HashSet<Identity>,
    sequence: u64,
}

impl HostedSession {
    fn host(&self) -> Option<Identity> {
        host_of(&self.attributes)
    }

    fn is_member(&self, identity: &Identity) -> bool {
        self.members.iter().any(|m| &m.identity == identity)
    }

    fn is_host(&self, identity: &Identity) -> bool {
        self.host().as_ref() == Some(identity)
    }

    fn refresh_roles(&mut self) {
        let host = self.host();
        for member in &mut self.members {
            member.role = if Some(&member.identity) == host.as_ref() {
                MemberRole::Host
            } else {
                MemberRole::Participant
            };
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.clone(),
            kind: self.kind,
            owner: self.owner.clone(),
            capacity: self.capacity,
            visibility: self.visibility,
            attributes: self.attributes.clone(),
            members: self.members.clone(),
            sequence: self.sequence,
        }
    }

    /// Bump the sequence and queue `kind` for every member but `except`.
    fn broadcast(
        &mut self,
        step: u64,
        except: Option<&Identity>,
        kind: MembershipEventKind,
        outbox: &mut Outbox,
    ) {
        self.sequence += step;
        for member in &self.members {
            if Some(&member.identity) == except {
                continue;
            }
            outbox.push((
                member.identity.clone(),
                BackendEvent::Membership(MembershipEvent {
                    session_id: self.id.clone(),
                    sequence: self.sequence,
                    kind: kind.clone(),
                }),
            ));
        }
    }

    fn remove_member(&mut self, identity: &Identity) -> bool {
        let before = self.members.len();
        self.members.retain(|m| &m.identity != identity);
        self.refresh_roles();
        self.members.len() != before
    }
}

struct PlatformState {
    sessions: HashMap<SessionId, HostedSession>,
    clock: u64,
    next_session: u64,
    latency: Duration,
    sequence_step: u64,
    capabilities: BackendCapabilities,
    faults: VecDeque<(OpKind, BackendFailure)>,
    swallow: usize,
}

impl PlatformState {
    fn tick(&mut self) -> u64 {
        self.clock += CLOCK_STEP;
        self.clock
    }
}

struct PlatformInner {
    state: Mutex<PlatformState>,
    couriers: DashMap<Identity, mpsc::UnboundedSender<(Instant, BackendEvent)>>,
    next_handle: AtomicU64,
}

/// Shared in-process session service.
#[derive(Clone)]
pub struct LoopbackPlatform {
    inner: Arc<PlatformInner>,
}

impl Default for LoopbackPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackPlatform {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(PlatformInner {
                state: Mutex::new(PlatformState {
                    sessions: HashMap::new(),
                    clock: CLOCK_START,
                    next_session: 0,
                    latency: Duration::from_millis(5),
                    sequence_step: 1,
                    capabilities: BackendCapabilities {
                        find_by_id: true,
                        invites: true,
                        host_migration: true,
                    },
                    faults: VecDeque::new(),
                    swallow: 0,
                }),
                couriers: DashMap::new(),
                next_handle: AtomicU64::new(0),
            }),
        }
    }

    /// Delay before each completion or event is delivered.
    pub fn with_latency(self, latency: Duration) -> Self {
        self.inner.state.lock().latency = latency;
        self
    }

    /// Sequence increment per change. Values above 1 produce gaps.
    pub fn with_sequence_step(self, step: u64) -> Self {
        self.inner.state.lock().sequence_step = step.max(1);
        self
    }

    pub fn with_capabilities(self, capabilities: BackendCapabilities) -> Self {
        self.inner.state.lock().capabilities = capabilities;
        self
    }

    /// Adapter acting for `identity`.
    pub fn backend(&self, identity: impl Into<Identity>) -> LoopbackBackend {
        LoopbackBackend {
            platform: self.clone(),
            identity: identity.into(),
        }
    }

    /// The next call of `op` fails with `failure` without touching state.
    pub fn fail_next(&self, op: OpKind, failure: BackendFailure) {
        self.inner.state.lock().faults.push_back((op, failure));
    }

    /// The next `count` calls are swallowed: never applied, never completed.
    pub fn drop_next_completions(&self, count: usize) {
        self.inner.state.lock().swallow += count;
    }

    /// Authoritative state of a session.
    pub fn session(&self, id: &SessionId) -> Option<SessionSnapshot> {
        self.inner.state.lock().sessions.get(id).map(HostedSession::snapshot)
    }

    pub fn session_count(&self) -> usize {
        self.inner.state.lock().sessions.len()
    }

    /// Add a remote player at the platform clock.
    pub fn simulate_join(&self, id: &SessionId, identity: impl Into<Identity>) -> Result<Member, BackendFailure> {
        let joined_at = self.inner.state.lock().tick();
        self.simulate_join_at(id, identity, joined_at)
    }

    /// Add a remote player with an explicit join timestamp.
    pub fn simulate_join_at(
        &self,
        id: &SessionId,
        identity: impl Into<Identity>,
        joined_at: u64,
    ) -> Result<Member, BackendFailure> {
        let identity = identity.into();
        let mut outbox = Outbox::new();
        let member = {
            let mut state = self.inner.state.lock();
            let step = state.sequence_step;
            let session = state.sessions.get_mut(id).ok_or(BackendFailure::SessionNotFound)?;
            if session.members.len() >= session.capacity {
                return Err(BackendFailure::SessionFull);
            }
            let member = Member::new(identity.clone(), joined_at);
            session.members.push(member.clone());
            session.refresh_roles();
            session.broadcast(step, Some(&identity), MembershipEventKind::Joined(member.clone()), &mut outbox);
            member
        };
        self.flush(outbox);
        Ok(member)
    }

    pub fn simulate_leave(&self, id: &SessionId, identity: &Identity) -> Result<(), BackendFailure> {
        self.simulate_departure(id, identity, MembershipEventKind::Left(identity.clone()))
    }

    /// Drop a player as if their connection was lost.
    pub fn simulate_timeout(&self, id: &SessionId, identity: &Identity) -> Result<(), BackendFailure> {
        self.simulate_departure(id, identity, MembershipEventKind::TimedOut(identity.clone()))
    }

    pub fn simulate_connection(
        &self,
        id: &SessionId,
        identity: &Identity,
        connection: ConnectionState,
    ) -> Result<(), BackendFailure> {
        let mut outbox = Outbox::new();
        {
            let mut state = self.inner.state.lock();
            let step = state.sequence_step;
            let session = state.sessions.get_mut(id).ok_or(BackendFailure::SessionNotFound)?;
            let member = session
                .members
                .iter_mut()
                .find(|m| &m.identity == identity)
                .ok_or(BackendFailure::SessionNotFound)?;
            member.connection = connection;
            let kind = MembershipEventKind::ConnectionChanged {
                identity: identity.clone(),
                state: connection,
            };
            session.broadcast(step, Some(identity), kind, &mut outbox);
        }
        self.flush(outbox);
        Ok(())
    }

    /// Destroy a session from the platform side.
    pub fn simulate_close(&self, id: &SessionId) -> Result<(), BackendFailure> {
        let mut outbox = Outbox::new();
        {
            let mut state = self.inner.state.lock();
            let step = state.sequence_step;
            let mut session = state.sessions.remove(id).ok_or(BackendFailure::SessionNotFound)?;
            session.broadcast(step, None, MembershipEventKind::Closed, &mut outbox);
        }
        self.flush(outbox);
        Ok(())
    }

    /// Deliver an arbitrary event to one player.
    pub fn inject(&self, to: &Identity, event: BackendEvent) {
        self.flush(vec![(to.clone(), event)]);
    }

    fn simulate_departure(
        &self,
        id: &SessionId,
        identity: &Identity,
        kind: MembershipEventKind,
    ) -> Result<(), BackendFailure> {
        let mut outbox = Outbox::new();
        {
            let mut state = self.inner.state.lock();
            let step = state.sequence_step;
            let session = state.sessions.get_mut(id).ok_or(BackendFailure::SessionNotFound)?;
            if !session.remove_member(identity) {
                return Err(BackendFailure::SessionNotFound);
            }
            let empty = session.members.is_empty();
            session.broadcast(step, Some(identity), kind, &mut outbox);
            if empty {
                state.sessions.remove(id);
            }
        }
        self.flush(outbox);
        Ok(())
    }

    fn attach(&self, identity: &Identity, sink: EventSink) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.couriers.insert(identity.clone(), tx);
        tokio::spawn(courier(rx, sink));
    }

    /// Run one adapter call for `caller` and schedule its completion.
    fn call(
        &self,
        caller: &Identity,
        op: OpKind,
        apply: impl FnOnce(&mut PlatformState, &mut Outbox) -> Outcome,
    ) -> BackendHandle {
        let handle = BackendHandle(self.inner.next_handle.fetch_add(1, Ordering::Relaxed) + 1);
        let mut outbox = Outbox::new();
        {
            let mut state = self.inner.state.lock();
            if state.swallow > 0 {
                state.swallow -= 1;
                trace_debug!(%handle, %op, "loopback swallowed call");
                return handle;
            }
            let injected = state
                .faults
                .iter()
                .position(|(kind, _)| *kind == op)
                .and_then(|pos| state.faults.remove(pos));
            let outcome = match injected {
                Some((_, failure)) => Err(failure),
                None => apply(&mut state, &mut outbox),
            };
            outbox.insert(
                0,
                (
                    caller.clone(),
                    BackendEvent::Completion(super::BackendCompletion { handle, outcome }),
                ),
            );
        }
        self.flush(outbox);
        handle
    }

    fn flush(&self, outbox: Outbox) {
        let due = Instant::now() + self.inner.state.lock().latency;
        for (to, event) in outbox {
            if let Some(courier) = self.inner.couriers.get(&to) {
                let _ = courier.send((due, event));
            }
        }
    }
}

async fn courier(mut rx: mpsc::UnboundedReceiver<(Instant, BackendEvent)>, sink: EventSink) {
    while let Some((due, event)) = rx.recv().await {
        tokio::time::sleep_until(due).await;
        if !sink.send(event) {
            break;
        }
    }
}

fn apply_create(
    state: &mut PlatformState,
    caller: &Identity,
    params: &SessionParams,
) -> Outcome {
    if params.capacity == 0 {
        return Err(BackendFailure::NotAuthorized);
    }
    state.next_session += 1;
    let id = SessionId::new(format!("loop-{}", state.next_session));
    let joined_at = state.tick();
    let mut attributes = params.attributes.clone();
    attributes.insert(HOST_KEY.into(), caller.as_str().into());
    let mut session = HostedSession {
        id: id.clone(),
        kind: params.kind,
        owner: caller.clone(),
        capacity: params.capacity,
        visibility: params.visibility,
        attributes,
        members: vec![Member::new(caller.clone(), joined_at)],
        invited: HashSet::new(),
        sequence: state.sequence_step,
    };
    session.refresh_roles();
    let snapshot = session.snapshot();
    state.sessions.insert(id, session);
    Ok(CompletionPayload::Session(snapshot))
}

fn apply_search(state: &PlatformState, filter: &SearchFilter) -> Outcome {
    let mut ids: Vec<&SessionId> = state.sessions.keys().collect();
    ids.sort();
    let results: Vec<SessionDescriptor> = ids
        .into_iter()
        .filter_map(|id| state.sessions.get(id))
        .map(|s| s.snapshot().descriptor())
        .filter(|d| filter.matches(d))
        .take(filter.max_results)
        .collect();
    Ok(CompletionPayload::Search(results))
}

fn apply_join(
    state: &mut PlatformState,
    caller: &Identity,
    descriptor: &SessionDescriptor,
    outbox: &mut Outbox,
) -> Outcome {
    let step = state.sequence_step;
    let joined_at = state.clock + CLOCK_STEP;
    let session = state
        .sessions
        .get_mut(&descriptor.id)
        .ok_or(BackendFailure::SessionNotFound)?;
    if session.is_member(caller) {
        return Ok(CompletionPayload::Session(session.snapshot()));
    }
    if banned_of(&session.attributes).contains(caller)
        || flag(&session.attributes, LOCKED_KEY)
        || flag(&session.attributes, STARTED_KEY)
        || (session.visibility == Visibility::InviteOnly && !session.invited.contains(caller))
    {
        return Err(BackendFailure::NotAuthorized);
    }
    if session.members.len() >= session.capacity {
        return Err(BackendFailure::SessionFull);
    }
    let member = Member::new(caller.clone(), joined_at);
    session.members.push(member.clone());
    session.invited.remove(caller);
    session.refresh_roles();
    session.broadcast(step, Some(caller), MembershipEventKind::Joined(member), outbox);
    let snapshot = session.snapshot();
    state.clock = joined_at;
    Ok(CompletionPayload::Session(snapshot))
}

fn apply_leave(
    state: &mut PlatformState,
    caller: &Identity,
    id: &SessionId,
    outbox: &mut Outbox,
) -> Outcome {
    let step = state.sequence_step;
    let session = state.sessions.get_mut(id).ok_or(BackendFailure::SessionNotFound)?;
    if !session.remove_member(caller) {
        return Err(BackendFailure::SessionNotFound);
    }
    if session.members.is_empty() {
        state.sessions.remove(id);
    } else {
        session.broadcast(step, Some(caller), MembershipEventKind::Left(caller.clone()), outbox);
    }
    Ok(CompletionPayload::Left(id.clone()))
}

fn apply_update(
    state: &mut PlatformState,
    caller: &Identity,
    id: &SessionId,
    attributes: &AttributeMap,
    outbox: &mut Outbox,
) -> Outcome {
    let step = state.sequence_step;
    let session = state.sessions.get_mut(id).ok_or(BackendFailure::SessionNotFound)?;
    if !session.is_member(caller) {
        return Err(BackendFailure::NotAuthorized);
    }
    let current = session.host();
    let host_is_member = current.as_ref().is_some_and(|h| session.is_member(h));
    for (key, value) in attributes {
        let allowed = if key == HOST_KEY {
            let requested = value.as_str().map(Identity::new);
            match requested {
                Some(requested) => {
                    session.is_member(&requested)
                        && (session.is_host(caller)
                            || !host_is_member
                            || current.as_ref() == Some(&requested))
                }
                None => false,
            }
        } else {
            session.is_host(caller)
        };
        if !allowed {
            return Err(BackendFailure::NotAuthorized);
        }
    }
    for (key, value) in attributes {
        session.attributes.insert(key.clone(), value.clone());
    }
    session.refresh_roles();
    session.broadcast(
        step,
        Some(caller),
        MembershipEventKind::AttributesChanged(attributes.clone()),
        outbox,
    );
    Ok(CompletionPayload::Session(session.snapshot()))
}

fn apply_destroy(
    state: &mut PlatformState,
    caller: &Identity,
    id: &SessionId,
    outbox: &mut Outbox,
) -> Outcome {
    let step = state.sequence_step;
    let session = state.sessions.get(id).ok_or(BackendFailure::SessionNotFound)?;
    if !session.is_host(caller) {
        return Err(BackendFailure::NotAuthorized);
    }
    if let Some(mut session) = state.sessions.remove(id) {
        session.broadcast(step, Some(caller), MembershipEventKind::Closed, outbox);
    }
    Ok(CompletionPayload::Destroyed(id.clone()))
}

fn apply_invite(
    state: &mut PlatformState,
    caller: &Identity,
    id: &SessionId,
    invitee: &Identity,
    outbox: &mut Outbox,
) -> Outcome {
    if !state.capabilities.invites {
        return Err(BackendFailure::NotAuthorized);
    }
    let session = state.sessions.get_mut(id).ok_or(BackendFailure::SessionNotFound)?;
    if !session.is_member(caller) {
        return Err(BackendFailure::NotAuthorized);
    }
    session.invited.insert(invitee.clone());
    outbox.push((
        invitee.clone(),
        BackendEvent::InviteReceived {
            descriptor: session.snapshot().descriptor(),
            from: caller.clone(),
        },
    ));
    Ok(CompletionPayload::InviteSent)
}

/// One player's adapter onto a [`LoopbackPlatform`].
#[derive(Clone)]
pub struct LoopbackBackend {
    platform: LoopbackPlatform,
    identity: Identity,
}

impl LoopbackBackend {
    pub fn platform(&self) -> &LoopbackPlatform {
        &self.platform
    }
}

impl SessionBackend for LoopbackBackend {
    fn name(&self) -> &str {
        "loopback"
    }

    fn local_identity(&self) -> &Identity {
        &self.identity
    }

    fn capabilities(&self) -> BackendCapabilities {
        self.platform.inner.state.lock().capabilities
    }

    fn attach(&self, sink: EventSink) {
        self.platform.attach(&self.identity, sink);
    }

    fn create(&self, params: &SessionParams) -> BackendHandle {
        let caller = &self.identity;
        self.platform
            .call(caller, OpKind::Create, |state, _| apply_create(state, caller, params))
    }

    fn search(&self, filter: &SearchFilter) -> BackendHandle {
        self.platform
            .call(&self.identity, OpKind::Search, |state, _| apply_search(state, filter))
    }

    fn join(&self, descriptor: &SessionDescriptor) -> BackendHandle {
        let caller = &self.identity;
        self.platform.call(caller, OpKind::Join, |state, outbox| {
            apply_join(state, caller, descriptor, outbox)
        })
    }

    fn leave(&self, session_id: &SessionId) -> BackendHandle {
        let caller = &self.identity;
        self.platform.call(caller, OpKind::Leave, |state, outbox| {
            apply_leave(state, caller, session_id, outbox)
        })
    }

    fn update_attributes(&self, session_id: &SessionId, attributes: &AttributeMap) -> BackendHandle {
        let caller = &self.identity;
        self.platform.call(caller, OpKind::UpdateAttributes, |state, outbox| {
            apply_update(state, caller, session_id, attributes, outbox)
        })
    }

    fn destroy(&self, session_id: &SessionId) -> BackendHandle {
        let caller = &self.identity;
        self.platform.call(caller, OpKind::Destroy, |state, outbox| {
            apply_destroy(state, caller, session_id, outbox)
        })
    }

    fn send_invite(&self, session_id: &SessionId, invitee: &Identity) -> BackendHandle {
        let caller = &self.identity;
        self.platform.call(caller, OpKind::SendInvite, |state, outbox| {
            apply_invite(state, caller, session_id, invitee, outbox)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AttributeValue;

    async fn completion(rx: &mut mpsc::UnboundedReceiver<BackendEvent>) -> Outcome {
        loop {
            match rx.recv().await {
                Some(BackendEvent::Completion(c)) => return c.outcome,
                Some(_) => continue,
                None => panic!("sink closed"),
            }
        }
    }

    fn attached(platform: &LoopbackPlatform, who: &str) -> (LoopbackBackend, mpsc::UnboundedReceiver<BackendEvent>) {
        let backend = platform.backend(who);
        let (sink, rx) = EventSink::channel();
        backend.attach(sink);
        (backend, rx)
    }

    fn session_of(outcome: Outcome) -> SessionSnapshot {
        match outcome {
            Ok(CompletionPayload::Session(s)) => s,
            other => panic!("expected session, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_create_and_join() {
        let platform = LoopbackPlatform::new();
        let (alice, mut alice_rx) = attached(&platform, "alice");
        let (bob, mut bob_rx) = attached(&platform, "bob");

        alice.create(&SessionParams::new(2).attribute("map", "Dune"));
        let created = session_of(completion(&mut alice_rx).await);
        assert_eq!(created.members.len(), 1);
        assert_eq!(created.members[0].role, MemberRole::Host);
        assert_eq!(created.attributes[HOST_KEY], AttributeValue::from("alice"));

        bob.join(&created.descriptor());
        let joined = session_of(completion(&mut bob_rx).await);
        assert_eq!(joined.members.len(), 2);
        assert!(joined.sequence > created.sequence);

        match alice_rx.recv().await {
            Some(BackendEvent::Membership(ev)) => {
                assert_eq!(ev.sequence, joined.sequence);
                assert!(matches!(ev.kind, MembershipEventKind::Joined(ref m) if m.identity.as_str() == "bob"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_capacity_and_bans() {
        let platform = LoopbackPlatform::new();
        let (alice, mut alice_rx) = attached(&platform, "alice");
        let (bob, mut bob_rx) = attached(&platform, "bob");

        alice.create(&SessionParams::new(1));
        let created = session_of(completion(&mut alice_rx).await);
        bob.join(&created.descriptor());
        assert_eq!(completion(&mut bob_rx).await, Err(BackendFailure::SessionFull));

        let mut banned = AttributeMap::new();
        let list = crate::types::banned_with(&banned, &Identity::new("bob"));
        banned.insert(crate::types::BANNED_KEY.into(), list);
        alice.update_attributes(&created.id, &banned);
        session_of(completion(&mut alice_rx).await);
        bob.join(&created.descriptor());
        assert_eq!(completion(&mut bob_rx).await, Err(BackendFailure::NotAuthorized));
    }

    #[tokio::test]
    async fn test_only_host_updates() {
        let platform = LoopbackPlatform::new();
        let (alice, mut alice_rx) = attached(&platform, "alice");
        let (bob, mut bob_rx) = attached(&platform, "bob");

        alice.create(&SessionParams::new(4));
        let created = session_of(completion(&mut alice_rx).await);
        bob.join(&created.descriptor());
        session_of(completion(&mut bob_rx).await);

        let mut attrs = AttributeMap::new();
        attrs.insert("map".into(), "Oasis".into());
        bob.update_attributes(&created.id, &attrs);
        assert_eq!(completion(&mut bob_rx).await, Err(BackendFailure::NotAuthorized));

        let mut promote = AttributeMap::new();
        promote.insert(HOST_KEY.into(), "bob".into());
        bob.update_attributes(&created.id, &promote);
        assert_eq!(completion(&mut bob_rx).await, Err(BackendFailure::NotAuthorized));
    }

    #[tokio::test]
    async fn test_promotion_after_host_leaves() {
        let platform = LoopbackPlatform::new();
        let (alice, mut alice_rx) = attached(&platform, "alice");
        let (bob, mut bob_rx) = attached(&platform, "bob");

        alice.create(&SessionParams::new(4));
        let created = session_of(completion(&mut alice_rx).await);
        bob.join(&created.descriptor());
        session_of(completion(&mut bob_rx).await);

        alice.leave(&created.id);
        assert_eq!(completion(&mut alice_rx).await, Ok(CompletionPayload::Left(created.id.clone())));

        let mut promote = AttributeMap::new();
        promote.insert(HOST_KEY.into(), "bob".into());
        bob.update_attributes(&created.id, &promote);
        let promoted = session_of(completion(&mut bob_rx).await);
        assert_eq!(promoted.members[0].role, MemberRole::Host);

        // Same promotion again is idempotent.
        bob.update_attributes(&created.id, &promote);
        session_of(completion(&mut bob_rx).await);
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let platform = LoopbackPlatform::new();
        let (alice, mut alice_rx) = attached(&platform, "alice");

        platform.fail_next(OpKind::Create, BackendFailure::RateLimited);
        alice.create(&SessionParams::new(2));
        assert_eq!(completion(&mut alice_rx).await, Err(BackendFailure::RateLimited));
        assert_eq!(platform.session_count(), 0);

        platform.drop_next_completions(1);
        alice.create(&SessionParams::new(2));
        alice.create(&SessionParams::new(2));
        session_of(completion(&mut alice_rx).await);
        assert_eq!(platform.session_count(), 1);
    }

    #[tokio::test]
    async fn test_sequence_gaps() {
        let platform = LoopbackPlatform::new().with_sequence_step(5);
        let (alice, mut alice_rx) = attached(&platform, "alice");
        alice.create(&SessionParams::new(4));
        let created = session_of(completion(&mut alice_rx).await);
        platform.simulate_join(&created.id, "carol").unwrap();
        match alice_rx.recv().await {
            Some(BackendEvent::Membership(ev)) => assert_eq!(ev.sequence, created.sequence + 5),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_invite_only() {
        let platform = LoopbackPlatform::new();
        let (alice, mut alice_rx) = attached(&platform, "alice");
        let (bob, mut bob_rx) = attached(&platform, "bob");

        alice.create(&SessionParams::new(4).visibility(Visibility::InviteOnly));
        let created = session_of(completion(&mut alice_rx).await);
        bob.join(&created.descriptor());
        assert_eq!(completion(&mut bob_rx).await, Err(BackendFailure::NotAuthorized));

        alice.send_invite(&created.id, &Identity::new("bob"));
        assert_eq!(completion(&mut alice_rx).await, Ok(CompletionPayload::InviteSent));
        match bob_rx.recv().await {
            Some(BackendEvent::InviteReceived { from, .. }) => assert_eq!(from.as_str(), "alice"),
            other => panic!("unexpected {other:?}"),
        }
        bob.join(&created.descriptor());
        assert_eq!(session_of(completion(&mut bob_rx).await).members.len(), 2);
    }
}
