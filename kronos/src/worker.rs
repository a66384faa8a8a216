//! Coordination tasks.
//!
//! The router drains the backend's event sink and hands every completion
//! and membership event to the worker that owns its session. One worker
//! runs per session and is the only writer of that session's registry
//! entry, so events for one session are totally ordered while different
//! sessions proceed in parallel.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use tokio::sync::{mpsc, oneshot};

use crate::backend::{
    BackendCompletion, BackendEvent, BackendFailure, CompletionPayload, MembershipEvent, OpKind,
};
use crate::dispatcher::{LobbyEvent, TerminalReason};
use crate::error::{KronosError, Result};
use crate::lifecycle::LifecycleState;
use crate::matchmaking::LastSession;
use crate::migration::HostMigration;
use crate::orchestrator::{InFlight, KindSlot, Shared};
use crate::reconciler::{MembershipReconciler, Reconciled};
use crate::registry::Session;
use crate::types::{Identity, SessionId};

type BackendOutcome = std::result::Result<CompletionPayload, BackendFailure>;

pub(crate) struct WorkerHandle {
    pub generation: u64,
    pub tx: mpsc::UnboundedSender<SessionCommand>,
}

pub(crate) enum SessionCommand {
    Completed {
        inflight: InFlight,
        outcome: BackendOutcome,
    },
    Membership(MembershipEvent),
    BeginTeardown,
    Terminate {
        state: LifecycleState,
        reason: TerminalReason,
        ack: Option<oneshot::Sender<()>>,
    },
    /// Exit if the session never materialised.
    Retire,
}

pub(crate) async fn route(shared: Arc<Shared>, mut events: mpsc::UnboundedReceiver<BackendEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            BackendEvent::Completion(completion) => route_completion(&shared, completion),
            BackendEvent::Membership(event) => route_membership(&shared, event),
            BackendEvent::InviteReceived { descriptor, from } => {
                trace_debug!(session = %descriptor.id, from = %from, "invite received");
                shared
                    .dispatcher
                    .dispatch(&LobbyEvent::InviteReceived { descriptor, from });
            }
        }
    }
    trace_debug!("backend event stream closed");
}

fn route_completion(shared: &Arc<Shared>, completion: BackendCompletion) {
    let inflight = shared.in_flight.lock().remove(&completion.handle);
    match inflight {
        Some(inflight) => deliver(shared, inflight, completion.outcome),
        None => match shared.take_abandoned(completion.handle) {
            Some(op) => release_orphan(shared, op, &completion.outcome),
            None => {
                trace_debug!(handle = %completion.handle, "discarded completion for stale handle");
            }
        },
    }
}

/// Undo a create or join that completed after its caller stopped waiting.
fn release_orphan(shared: &Shared, op: OpKind, outcome: &BackendOutcome) {
    let Ok(CompletionPayload::Session(snapshot)) = outcome else {
        return;
    };
    let id = &snapshot.id;
    let joining = shared.pending.get(id).is_some_and(|p| p.op == OpKind::Join);
    if shared.registry.contains(id) || joining {
        return;
    }
    trace_info!(session = %id, %op, "releasing session from abandoned call");
    match op {
        OpKind::Create => shared.backend.destroy(id),
        _ => shared.backend.leave(id),
    };
    shared.command(id, SessionCommand::Retire);
}

/// Route a completion to its session worker, or answer the caller directly
/// when no session is involved.
fn deliver(shared: &Arc<Shared>, inflight: InFlight, outcome: BackendOutcome) {
    let worker = match (inflight.op, &outcome) {
        (op, _) if !op.is_mutating() => None,
        (OpKind::Create | OpKind::Join, Ok(CompletionPayload::Session(snapshot))) => {
            Some(spawn_worker(shared, &snapshot.id))
        }
        _ => inflight
            .session
            .as_ref()
            .and_then(|id| shared.workers.get(id).map(|w| w.tx.clone())),
    };

    let Some(tx) = worker else {
        respond(shared, inflight, outcome);
        return;
    };
    if let Err(mpsc::error::SendError(command)) = tx.send(SessionCommand::Completed { inflight, outcome }) {
        if let SessionCommand::Completed { inflight, outcome } = command {
            respond(shared, inflight, outcome);
        }
    }
}

fn respond(shared: &Shared, inflight: InFlight, outcome: BackendOutcome) {
    let session = inflight.session;
    let failed_join = inflight.op == OpKind::Join && outcome.is_err();
    let result = outcome.map_err(|failure| KronosError::from_backend(failure, session.as_ref()));
    let _ = inflight.responder.send(result);
    if failed_join {
        if let Some(id) = &session {
            shared.command(id, SessionCommand::Retire);
        }
    }
}

fn route_membership(shared: &Arc<Shared>, event: MembershipEvent) {
    let id = event.session_id.clone();
    let existing = shared.workers.get(&id).map(|w| w.tx.clone());
    let worker = existing.or_else(|| {
        // Events can beat the join completion; keep them for the worker.
        let joining = shared.pending.get(&id).is_some_and(|p| p.op == OpKind::Join);
        joining.then(|| spawn_worker(shared, &id))
    });
    match worker {
        Some(tx) => {
            let _ = tx.send(SessionCommand::Membership(event));
        }
        None => {
            trace_debug!(session = %id, sequence = event.sequence, "dropped event for unknown session");
        }
    }
}

fn spawn_worker(shared: &Arc<Shared>, id: &SessionId) -> mpsc::UnboundedSender<SessionCommand> {
    match shared.workers.entry(id.clone()) {
        Entry::Occupied(entry) => entry.get().tx.clone(),
        Entry::Vacant(entry) => {
            let (tx, rx) = mpsc::unbounded_channel();
            let generation = shared.next_generation();
            entry.insert(WorkerHandle {
                generation,
                tx: tx.clone(),
            });
            let worker = SessionWorker {
                shared: Arc::clone(shared),
                id: id.clone(),
                generation,
                reconciler: MembershipReconciler::new(id.clone(), shared.local.clone()),
                rx,
                done: false,
            };
            tokio::spawn(worker.run());
            tx
        }
    }
}

struct SessionWorker {
    shared: Arc<Shared>,
    id: SessionId,
    generation: u64,
    reconciler: MembershipReconciler,
    rx: mpsc::UnboundedReceiver<SessionCommand>,
    done: bool,
}

impl SessionWorker {
    async fn run(mut self) {
        while let Some(command) = self.rx.recv().await {
            self.handle(command);
            if self.done {
                break;
            }
        }
        self.retire();
    }

    /// Leave the worker table, then re-route anything that raced the exit.
    fn retire(&mut self) {
        let generation = self.generation;
        self.shared
            .workers
            .remove_if(&self.id, |_, w| w.generation == generation);
        self.rx.close();
        while let Ok(command) = self.rx.try_recv() {
            if let SessionCommand::Completed { inflight, outcome } = command {
                deliver(&self.shared, inflight, outcome);
            }
        }
    }

    fn handle(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Completed { inflight, outcome } => {
                let result = match outcome {
                    Ok(payload) => self.on_success(inflight.op, payload),
                    Err(failure) => self.on_failure(inflight.op, failure),
                };
                let _ = inflight.responder.send(result);
            }
            SessionCommand::Membership(event) => self.on_membership(event),
            SessionCommand::BeginTeardown => self.begin_teardown(),
            SessionCommand::Terminate { state, reason, ack } => {
                self.terminate(state, reason);
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
            }
            SessionCommand::Retire => {
                if !self.shared.registry.contains(&self.id) {
                    self.done = true;
                }
            }
        }
    }

    fn on_success(&mut self, op: OpKind, payload: CompletionPayload) -> Result<CompletionPayload> {
        match &payload {
            CompletionPayload::Session(snapshot) => {
                let current = self.shared.registry.get(&self.id);
                if current.is_none() {
                    self.shared
                        .kinds
                        .insert(snapshot.kind, KindSlot::Occupied(self.id.clone()));
                    trace_info!(session = %self.id, %op, "session established");
                }
                let outcome = self.reconciler.apply_snapshot(current.as_deref(), snapshot);
                self.commit(current.as_deref(), outcome);
            }
            CompletionPayload::Left(_) => self.terminate(LifecycleState::Closed, TerminalReason::Left),
            CompletionPayload::Destroyed(_) => {
                self.terminate(LifecycleState::Closed, TerminalReason::TornDown)
            }
            CompletionPayload::Search(_) | CompletionPayload::InviteSent => {}
        }
        Ok(payload)
    }

    fn on_failure(&mut self, op: OpKind, failure: BackendFailure) -> Result<CompletionPayload> {
        trace_debug!(session = %self.id, %op, error = %failure, "backend call failed");
        let error = KronosError::from_backend(failure.clone(), Some(&self.id));
        let live = self.shared.registry.contains(&self.id);
        if live && matches!(op, OpKind::Leave | OpKind::Destroy) {
            match failure {
                // Already gone on the backend.
                BackendFailure::SessionNotFound => {
                    self.terminate(LifecycleState::Closed, TerminalReason::BackendClosed)
                }
                _ => self.terminate(LifecycleState::Failed, TerminalReason::BackendError),
            }
        }
        if !live {
            self.done = true;
        }
        Err(error)
    }

    fn on_membership(&mut self, event: MembershipEvent) {
        match self.shared.registry.get(&self.id) {
            Some(current) => {
                let outcome = self.reconciler.apply_event(&current, &event);
                self.commit(Some(&current), outcome);
            }
            None => self.reconciler.defer(&event),
        }
    }

    /// Publish a reconciled snapshot and its notifications.
    fn commit(&mut self, current: Option<&Session>, outcome: Reconciled) {
        let Some(mut next) = outcome.session else {
            return;
        };
        let from = current.map_or(LifecycleState::Creating, |c| c.state);
        let to = next_state(&self.id, from, &next);
        next.state = to;
        let members = next.members.clone();
        self.shared.registry.upsert(next);

        let dispatcher = &self.shared.dispatcher;
        if outcome.membership_changed {
            dispatcher.dispatch(&LobbyEvent::MembershipChanged {
                session_id: self.id.clone(),
                members,
                joined: outcome.joined,
                left: outcome.left,
            });
        }
        if !outcome.attributes_changed.is_empty() {
            dispatcher.dispatch(&LobbyEvent::AttributesChanged {
                session_id: self.id.clone(),
                changed: outcome.attributes_changed,
            });
        }
        if let (Some(_), Some((previous, Some(host)))) = (current, outcome.host_changed) {
            trace_info!(session = %self.id, host = %host, "host migrated");
            dispatcher.dispatch(&LobbyEvent::HostMigrated {
                session_id: self.id.clone(),
                from: previous,
                to: host,
            });
        }
        if from != to {
            trace_info!(session = %self.id, %from, %to, "lifecycle transition");
            dispatcher.dispatch(&LobbyEvent::LifecycleChanged {
                session_id: self.id.clone(),
                from,
                to,
                reason: None,
            });
        }

        if outcome.closed {
            self.terminate(LifecycleState::Closed, TerminalReason::BackendClosed);
        } else if outcome.local_departed {
            let reason = if to == LifecycleState::TearingDown {
                TerminalReason::Left
            } else {
                TerminalReason::Removed
            };
            self.terminate(LifecycleState::Closed, reason);
        } else if let Some(departed) = outcome.host_departed {
            self.start_migration(departed);
        }
    }

    fn start_migration(&mut self, departed: Identity) {
        if !self.shared.capabilities.host_migration {
            trace_warn!(session = %self.id, "backend cannot migrate hosts");
            self.shared.leave_backend(&self.id, OpKind::Leave);
            self.terminate(LifecycleState::Closed, TerminalReason::MigrationExhausted);
            return;
        }
        if self.shared.migrations.insert(self.id.clone(), ()).is_some() {
            return;
        }
        let migration = HostMigration::new(self.id.clone(), departed);
        tokio::spawn(Arc::clone(&self.shared).run_migration(migration));
    }

    fn begin_teardown(&mut self) {
        let Some(current) = self.shared.registry.get(&self.id) else {
            return;
        };
        let from = current.state;
        if !from.can_transition_to(LifecycleState::TearingDown) {
            return;
        }
        let mut next = (*current).clone();
        next.state = LifecycleState::TearingDown;
        self.shared.registry.upsert(next);
        trace_info!(session = %self.id, %from, "tearing down");
        self.shared.dispatcher.dispatch(&LobbyEvent::LifecycleChanged {
            session_id: self.id.clone(),
            from,
            to: LifecycleState::TearingDown,
            reason: None,
        });
    }

    /// Enter a terminal state, let listeners observe it, then drop the session.
    fn terminate(&mut self, state: LifecycleState, reason: TerminalReason) {
        self.done = true;
        let Some(current) = self.shared.registry.get(&self.id) else {
            return;
        };
        let from = current.state;
        if !from.can_transition_to(state) {
            return;
        }
        let mut next = (*current).clone();
        next.state = state;
        self.shared.registry.upsert(next);

        match state {
            LifecycleState::Failed => {
                trace_warn!(session = %self.id, %from, ?reason, "session failed")
            }
            _ => trace_info!(session = %self.id, %from, ?reason, "session closed"),
        }
        self.shared.dispatcher.dispatch(&LobbyEvent::LifecycleChanged {
            session_id: self.id.clone(),
            from,
            to: state,
            reason: Some(reason),
        });

        self.shared.registry.remove(&self.id);
        let id = &self.id;
        self.shared
            .kinds
            .remove_if(&current.kind, |_, slot| *slot == KindSlot::Occupied(id.clone()));
        self.shared.dispatcher.retire_session(id);
        self.shared.cancel_pending(id, reason);

        match reason {
            TerminalReason::Left | TerminalReason::TornDown => {
                self.shared.history.remove(&current.kind);
            }
            _ => {
                let last = LastSession::record(&current, &self.shared.local, reason);
                self.shared.history.insert(current.kind, last);
            }
        }
    }
}

/// Lifecycle state after a backend snapshot, staying inside the transition set.
fn next_state(id: &SessionId, from: LifecycleState, next: &Session) -> LifecycleState {
    if from == LifecycleState::TearingDown || from.is_terminal() {
        return from;
    }
    let derived = LifecycleState::derive(&next.attributes, next.members.len());
    if derived == from || from.can_transition_to(derived) {
        derived
    } else {
        trace_warn!(session = %id, %from, %derived, "backend state outside transition set ignored");
        from
    }
}
