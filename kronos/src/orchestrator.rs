//! Lifecycle orchestrator.
//!
//! [`Lobby`] is the application-facing entry point. Each request validates
//! against the session's lifecycle state, claims the session's single
//! pending slot, issues one non-blocking backend call and suspends until the
//! completion is applied by that session's worker or the deadline passes.
//! Timeouts are retried with exponential backoff; exhausting the retries
//! fails the session and leaves it on the backend. A create or join whose
//! caller stopped waiting is undone when its completion finally arrives.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::backend::{
    BackendCapabilities, BackendHandle, CompletionPayload, EventSink, OpKind, SessionBackend,
};
use crate::config::LobbyConfig;
use crate::dispatcher::{EventDispatcher, EventListener, ListenerId, ListenerScope, LobbyEvent, TerminalReason};
use crate::error::{KronosError, Result};
use crate::inspect::{self, SessionView};
use crate::lifecycle::{LifecycleRequest, LifecycleState};
use crate::matchmaking::{self, LastSession, MatchmakingHandle, MatchmakingMode, MatchmakingTicket, Plan};
use crate::migration::HostMigration;
use crate::query::{SearchFilter, SearchResults};
use crate::registry::{Session, SessionRegistry};
use crate::types::{
    banned_with, validate_attribute_keys, AttributeMap, Identity, SessionDescriptor, SessionId,
    SessionKind, SessionParams, BANNED_KEY, LOCKED_KEY, STARTED_KEY,
};
use crate::worker::{self, SessionCommand, WorkerHandle};

/// A mutating request awaiting its backend completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingOperation {
    pub op_id: u64,
    pub request: LifecycleRequest,
    pub op: OpKind,
    /// Handle of the current attempt, once issued.
    pub handle: Option<BackendHandle>,
    /// Zero for the first attempt.
    pub attempt: u32,
    #[serde(skip)]
    pub deadline: Option<Instant>,
    /// Issued by host migration rather than the application.
    pub migration: bool,
}

/// Who the local player's session-kind slot belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum KindSlot {
    Reserved(u64),
    Occupied(SessionId),
}

/// Correlation record for one issued backend call.
pub(crate) struct InFlight {
    pub op: OpKind,
    pub session: Option<SessionId>,
    pub responder: oneshot::Sender<Result<CompletionPayload>>,
}

/// State shared by the lobby, its router and its session workers.
pub(crate) struct Shared {
    pub local: Identity,
    pub backend: Arc<dyn SessionBackend>,
    pub config: LobbyConfig,
    pub capabilities: BackendCapabilities,
    pub registry: SessionRegistry,
    pub dispatcher: EventDispatcher,
    pub pending: DashMap<SessionId, PendingOperation>,
    pub kinds: DashMap<SessionKind, KindSlot>,
    pub in_flight: Mutex<HashMap<BackendHandle, InFlight>>,
    pub workers: DashMap<SessionId, WorkerHandle>,
    pub migrations: DashMap<SessionId, ()>,
    /// Create and join calls nobody waits for any more.
    pub abandoned: Mutex<HashMap<BackendHandle, OpKind>>,
    pub matchmaking: DashMap<SessionKind, MatchmakingTicket>,
    /// Last session of each kind that ended without the local player asking.
    pub history: DashMap<SessionKind, LastSession>,
    next_id: AtomicU64,
}

/// Claim on a session's pending slot. Released on drop.
pub(crate) struct PendingSlot<'a> {
    shared: &'a Shared,
    session: Option<SessionId>,
    op_id: u64,
}

impl PendingSlot<'_> {
    /// False once a teardown replaced this operation.
    fn is_current(&self) -> bool {
        match &self.session {
            Some(id) => self
                .shared
                .pending
                .get(id)
                .is_some_and(|p| p.op_id == self.op_id),
            None => true,
        }
    }

    fn record(&self, handle: BackendHandle, attempt: u32, deadline: Instant) -> bool {
        let Some(id) = &self.session else {
            return true;
        };
        match self.shared.pending.get_mut(id) {
            Some(mut pending) if pending.op_id == self.op_id => {
                pending.handle = Some(handle);
                pending.attempt = attempt;
                pending.deadline = Some(deadline);
                true
            }
            _ => false,
        }
    }
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        if let Some(id) = &self.session {
            self.shared.pending.remove_if(id, |_, p| p.op_id == self.op_id);
        }
    }
}

/// Claim on a session kind until the worker records the joined session.
struct KindReservation<'a> {
    shared: &'a Shared,
    kind: SessionKind,
    op_id: u64,
}

impl Drop for KindReservation<'_> {
    fn drop(&mut self) {
        self.shared
            .kinds
            .remove_if(&self.kind, |_, slot| *slot == KindSlot::Reserved(self.op_id));
    }
}

impl Shared {
    pub(crate) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn next_generation(&self) -> u64 {
        self.next_id()
    }

    fn live(&self, id: &SessionId) -> Result<Arc<Session>> {
        self.registry
            .get(id)
            .ok_or_else(|| KronosError::session_not_found(id))
    }

    pub(crate) fn state(&self, id: &SessionId) -> LifecycleState {
        self.registry.get(id).map_or(LifecycleState::Idle, |s| s.state)
    }

    /// State of the local player's session of `kind`, `Idle` if there is none.
    pub(crate) fn kind_state(&self, kind: SessionKind) -> LifecycleState {
        self.registry
            .find_by_kind(kind)
            .map_or(LifecycleState::Idle, |s| s.state)
    }

    /// Claim the pending slot or fail with `Busy`.
    fn acquire(
        &self,
        id: &SessionId,
        request: LifecycleRequest,
        op: OpKind,
        migration: bool,
    ) -> Result<PendingSlot<'_>> {
        let op_id = self.next_id();
        match self.pending.entry(id.clone()) {
            Entry::Occupied(_) => {
                trace_debug!(session = %id, %request, "rejected: pending operation");
                Err(KronosError::busy(id))
            }
            Entry::Vacant(slot) => {
                slot.insert(PendingOperation {
                    op_id,
                    request,
                    op,
                    handle: None,
                    attempt: 0,
                    deadline: None,
                    migration,
                });
                Ok(PendingSlot {
                    shared: self,
                    session: Some(id.clone()),
                    op_id,
                })
            }
        }
    }

    /// Take the slot from whatever holds it and cancel that operation.
    fn supersede(&self, id: &SessionId, request: LifecycleRequest, op: OpKind) -> PendingSlot<'_> {
        let op_id = self.next_id();
        let previous = self.pending.insert(
            id.clone(),
            PendingOperation {
                op_id,
                request,
                op,
                handle: None,
                attempt: 0,
                deadline: None,
                migration: false,
            },
        );
        if let Some(previous) = previous {
            trace_debug!(session = %id, superseded = %previous.request, "pending operation superseded");
            self.cancel(previous, KronosError::Superseded);
        }
        PendingSlot {
            shared: self,
            session: Some(id.clone()),
            op_id,
        }
    }

    fn cancel(&self, pending: PendingOperation, error: KronosError) {
        let Some(handle) = pending.handle else {
            return;
        };
        let cancelled = self.in_flight.lock().remove(&handle);
        if let Some(inflight) = cancelled {
            self.abandon(handle, inflight.op);
            let _ = inflight.responder.send(Err(error));
        }
    }

    /// Cancel whatever is pending for a session that just ended.
    pub(crate) fn cancel_pending(&self, id: &SessionId, reason: TerminalReason) {
        if let Some((_, pending)) = self.pending.remove(id) {
            self.cancel(pending, KronosError::session_ended(id, reason));
        }
    }

    /// Remember a create or join that lost its caller.
    fn abandon(&self, handle: BackendHandle, op: OpKind) {
        if matches!(op, OpKind::Create | OpKind::Join) {
            self.abandoned.lock().insert(handle, op);
        }
    }

    pub(crate) fn take_abandoned(&self, handle: BackendHandle) -> Option<OpKind> {
        self.abandoned.lock().remove(&handle)
    }

    /// Drop the local player from a session the lobby gave up on.
    pub(crate) fn leave_backend(&self, id: &SessionId, op: OpKind) {
        if !self.registry.contains(id) {
            return;
        }
        trace_info!(session = %id, %op, "leaving backend session");
        match op {
            OpKind::Destroy => self.backend.destroy(id),
            _ => self.backend.leave(id),
        };
    }

    fn reserve_kind(&self, kind: SessionKind) -> Result<KindReservation<'_>> {
        let op_id = self.next_id();
        match self.kinds.entry(kind) {
            Entry::Occupied(_) => Err(KronosError::AlreadyInSession { kind }),
            Entry::Vacant(slot) => {
                slot.insert(KindSlot::Reserved(op_id));
                Ok(KindReservation {
                    shared: self,
                    kind,
                    op_id,
                })
            }
        }
    }

    fn unbound_slot(&self) -> PendingSlot<'_> {
        PendingSlot {
            shared: self,
            session: None,
            op_id: self.next_id(),
        }
    }

    /// Hand a command to the session's worker, if it has one.
    pub(crate) fn command(&self, id: &SessionId, command: SessionCommand) -> bool {
        self.workers
            .get(id)
            .is_some_and(|worker| worker.tx.send(command).is_ok())
    }

    /// Drive a session to a terminal state and wait until listeners saw it.
    pub(crate) async fn terminate(&self, id: &SessionId, state: LifecycleState, reason: TerminalReason) {
        let (ack, done) = oneshot::channel();
        let command = SessionCommand::Terminate {
            state,
            reason,
            ack: Some(ack),
        };
        if self.command(id, command) {
            let _ = done.await;
        }
    }

    fn issue(
        &self,
        op: OpKind,
        session: Option<&SessionId>,
        call: &(dyn Fn(&dyn SessionBackend) -> BackendHandle + Send + Sync),
    ) -> (BackendHandle, oneshot::Receiver<Result<CompletionPayload>>) {
        let (tx, rx) = oneshot::channel();
        let mut table = self.in_flight.lock();
        let handle = call(self.backend.as_ref());
        table.insert(
            handle,
            InFlight {
                op,
                session: session.cloned(),
                responder: tx,
            },
        );
        (handle, rx)
    }

    /// One mutating operation with timeout, retry and backoff.
    async fn run_mutation(
        &self,
        slot: &PendingSlot<'_>,
        op: OpKind,
        call: &(dyn Fn(&dyn SessionBackend) -> BackendHandle + Send + Sync),
    ) -> Result<CompletionPayload> {
        let target = slot.session.as_ref();
        let timeout = self.config.operation_timeout();
        let mut attempt = 0u32;

        loop {
            if !slot.is_current() {
                return Err(KronosError::Superseded);
            }
            let deadline = Instant::now() + timeout;
            let (tx, mut rx) = oneshot::channel();
            let handle = {
                let mut table = self.in_flight.lock();
                let handle = call(self.backend.as_ref());
                if !slot.record(handle, attempt, deadline) {
                    return Err(KronosError::Superseded);
                }
                table.insert(
                    handle,
                    InFlight {
                        op,
                        session: target.cloned(),
                        responder: tx,
                    },
                );
                handle
            };
            trace_debug!(session = ?target, %handle, %op, attempt, "backend call issued");

            let outcome = match tokio::time::timeout_at(deadline, &mut rx).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(KronosError::Shutdown),
                Err(_) => {
                    let expired = self.in_flight.lock().remove(&handle);
                    match expired {
                        // Completion raced the deadline and is being applied.
                        None => rx.await.unwrap_or(Err(KronosError::Shutdown)),
                        Some(expired) => {
                            self.abandon(handle, expired.op);
                            Err(KronosError::OperationTimeout { attempts: attempt + 1 })
                        }
                    }
                }
            };
            match outcome {
                Err(err) if err.is_retryable() => {}
                other => return other,
            }

            attempt += 1;
            if attempt > self.config.max_retries {
                trace_warn!(session = ?target, %op, attempts = attempt, "retries exhausted");
                if let Some(id) = target {
                    self.leave_backend(id, op);
                    self.terminate(id, LifecycleState::Failed, TerminalReason::RetriesExhausted)
                        .await;
                }
                return Err(KronosError::OperationTimeout { attempts: attempt });
            }
            let backoff = self.config.backoff(attempt);
            trace_info!(session = ?target, %op, attempt, backoff_ms = backoff.as_millis() as u64, "retrying after timeout");
            tokio::time::sleep(backoff).await;
        }
    }

    /// One non-mutating call with a single deadline.
    async fn run_query(
        &self,
        op: OpKind,
        session: Option<&SessionId>,
        timeout: std::time::Duration,
        call: &(dyn Fn(&dyn SessionBackend) -> BackendHandle + Send + Sync),
    ) -> Result<CompletionPayload> {
        let (handle, mut rx) = self.issue(op, session, call);
        trace_debug!(session = ?session, %handle, %op, "backend call issued");
        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(KronosError::Shutdown),
            Err(_) => {
                let expired = self.in_flight.lock().remove(&handle);
                if expired.is_some() {
                    Err(KronosError::OperationTimeout { attempts: 1 })
                } else {
                    rx.await.unwrap_or(Err(KronosError::Shutdown))
                }
            }
        }
    }

    /// Create and host a session. `params` are not validated here.
    pub(crate) async fn create(&self, params: &SessionParams) -> Result<SessionId> {
        let kind = params.kind;
        self.kind_state(kind)
            .check(LifecycleRequest::Create)
            .map_err(|_| KronosError::AlreadyInSession { kind })?;
        let _kind = self.reserve_kind(kind)?;
        let slot = self.unbound_slot();
        let call = |b: &dyn SessionBackend| b.create(params);
        match self.run_mutation(&slot, OpKind::Create, &call).await? {
            CompletionPayload::Session(snapshot) => Ok(snapshot.id),
            other => Err(unexpected(OpKind::Create, &other)),
        }
    }

    pub(crate) async fn search(&self, filter: &SearchFilter) -> Result<SearchResults> {
        if filter.by_id.is_some() && !self.capabilities.find_by_id {
            return Err(KronosError::invalid_params(
                "backend does not support search by id",
            ));
        }
        let call = |b: &dyn SessionBackend| b.search(filter);
        let timeout = self.config.search_timeout();
        match self.run_query(OpKind::Search, None, timeout, &call).await? {
            CompletionPayload::Search(results) => Ok(SearchResults::new(results)),
            other => Err(unexpected(OpKind::Search, &other)),
        }
    }

    pub(crate) async fn join(&self, descriptor: &SessionDescriptor) -> Result<SessionId> {
        let id = &descriptor.id;
        let kind = descriptor.kind;
        let slot = self.acquire(id, LifecycleRequest::Join, OpKind::Join, false)?;
        self.state(id)
            .check(LifecycleRequest::Join)
            .map_err(|_| KronosError::AlreadyInSession { kind })?;
        self.kind_state(kind)
            .check(LifecycleRequest::Join)
            .map_err(|_| KronosError::AlreadyInSession { kind })?;
        let _kind = self.reserve_kind(kind)?;
        let call = |b: &dyn SessionBackend| b.join(descriptor);
        match self.run_mutation(&slot, OpKind::Join, &call).await? {
            CompletionPayload::Session(snapshot) => Ok(snapshot.id),
            other => Err(unexpected(OpKind::Join, &other)),
        }
    }

    pub(crate) async fn leave(&self, id: &SessionId) -> Result<()> {
        self.live(id)?.state.check(LifecycleRequest::Leave)?;
        let slot = self.supersede(id, LifecycleRequest::Leave, OpKind::Leave);
        self.command(id, SessionCommand::BeginTeardown);
        let call = |b: &dyn SessionBackend| b.leave(id);
        self.run_mutation(&slot, OpKind::Leave, &call).await?;
        Ok(())
    }

    pub(crate) async fn teardown(&self, id: &SessionId) -> Result<()> {
        let session = self.live(id)?;
        session.state.check(LifecycleRequest::Teardown)?;
        if !session.is_host(&self.local) {
            return Err(KronosError::NotAuthorized);
        }
        let slot = self.supersede(id, LifecycleRequest::Teardown, OpKind::Destroy);
        self.command(id, SessionCommand::BeginTeardown);
        let call = |b: &dyn SessionBackend| b.destroy(id);
        self.run_mutation(&slot, OpKind::Destroy, &call).await?;
        Ok(())
    }

    /// Promote a new host after the recorded one departed.
    pub(crate) async fn run_migration(self: Arc<Self>, mut migration: HostMigration) {
        let id = migration.session_id().clone();
        trace_info!(session = %id, departed = %migration.departed(), "host migration started");

        loop {
            let Some(session) = self.registry.get(&id) else { break };
            if !session.state.is_established() || migration.is_resolved(&session) {
                break;
            }
            let Some(candidate) = migration.next_candidate(&session) else {
                trace_warn!(session = %id, attempts = migration.attempts(), "host migration exhausted");
                self.leave_backend(&id, OpKind::Leave);
                self.terminate(&id, LifecycleState::Closed, TerminalReason::MigrationExhausted)
                    .await;
                break;
            };

            let Some(slot) = self.acquire_for_migration(&id).await else {
                trace_warn!(session = %id, "host migration gave up waiting for pending slot");
                self.leave_backend(&id, OpKind::Leave);
                self.terminate(&id, LifecycleState::Closed, TerminalReason::MigrationExhausted)
                    .await;
                break;
            };
            trace_debug!(session = %id, candidate = %candidate, "promoting host candidate");
            let promotion = HostMigration::promotion(&candidate);
            let call = |b: &dyn SessionBackend| b.update_attributes(&id, &promotion);
            match self.run_mutation(&slot, OpKind::UpdateAttributes, &call).await {
                Ok(_) => continue,
                Err(
                    KronosError::Superseded
                    | KronosError::Shutdown
                    | KronosError::OperationTimeout { .. },
                ) => break,
                Err(err) => {
                    trace_debug!(session = %id, candidate = %candidate, error = %err, "host candidate refused");
                    migration.reject(candidate);
                    drop(slot);
                    tokio::time::sleep(self.config.migration_retry_delay()).await;
                }
            }
        }
        self.migrations.remove(&id);
    }

    async fn acquire_for_migration(&self, id: &SessionId) -> Option<PendingSlot<'_>> {
        let mut attempts = 0;
        loop {
            match self.acquire(id, LifecycleRequest::UpdateAttributes, OpKind::UpdateAttributes, true) {
                Ok(slot) => return Some(slot),
                Err(_) if attempts < self.config.migration_busy_attempts => {
                    attempts += 1;
                    tokio::time::sleep(self.config.migration_retry_delay()).await;
                }
                Err(_) => return None,
            }
        }
    }
}

/// Builder for [`Lobby`], in the same spirit as a server builder.
#[derive(Debug, Clone, Default)]
pub struct LobbyBuilder {
    config: LobbyConfig,
}

impl LobbyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: LobbyConfig) -> Self {
        self.config = config;
        self
    }

    pub fn operation_timeout_ms(mut self, ms: u64) -> Self {
        self.config.operation_timeout_ms = ms;
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config.max_retries = retries;
        self
    }

    pub fn backoff_ms(mut self, base: u64, max: u64) -> Self {
        self.config.backoff_base_ms = base;
        self.config.backoff_max_ms = max;
        self
    }

    pub fn search_timeout_ms(mut self, ms: u64) -> Self {
        self.config.search_timeout_ms = ms;
        self
    }

    pub fn migration_retry_delay_ms(mut self, ms: u64) -> Self {
        self.config.migration_retry_delay_ms = ms;
        self
    }

    pub fn matchmaking_search_attempts(mut self, attempts: u32) -> Self {
        self.config.matchmaking_search_attempts = attempts;
        self
    }

    pub fn matchmaking_restart_delay_ms(mut self, ms: u64) -> Self {
        self.config.matchmaking_restart_delay_ms = ms;
        self
    }

    pub fn reconnect_delay_ms(mut self, ms: u64) -> Self {
        self.config.reconnect_delay_ms = ms;
        self
    }

    pub fn find_by_id_supported(mut self, supported: bool) -> Self {
        self.config.find_by_id_supported = Some(supported);
        self
    }

    /// Attach to `backend` and start the coordination task.
    /// Must be called from within a Tokio runtime.
    pub fn build(self, backend: impl SessionBackend + 'static) -> Result<Lobby> {
        self.build_shared(Arc::new(backend))
    }

    pub fn build_shared(self, backend: Arc<dyn SessionBackend>) -> Result<Lobby> {
        self.config.validate()?;
        let mut capabilities = backend.capabilities();
        if let Some(find_by_id) = self.config.find_by_id_supported {
            capabilities.find_by_id = find_by_id;
        }
        let shared = Arc::new(Shared {
            local: backend.local_identity().clone(),
            backend: Arc::clone(&backend),
            config: self.config,
            capabilities,
            registry: SessionRegistry::new(),
            dispatcher: EventDispatcher::new(),
            pending: DashMap::new(),
            kinds: DashMap::new(),
            in_flight: Mutex::new(HashMap::new()),
            workers: DashMap::new(),
            migrations: DashMap::new(),
            abandoned: Mutex::new(HashMap::new()),
            matchmaking: DashMap::new(),
            history: DashMap::new(),
            next_id: AtomicU64::new(1),
        });

        let (sink, events) = EventSink::channel();
        backend.attach(sink);
        let router = tokio::spawn(worker::route(Arc::clone(&shared), events));
        trace_info!(backend = backend.name(), local = %shared.local, "lobby started");

        Ok(Lobby { shared, router })
    }
}

/// Application-facing orchestrator for one local player.
pub struct Lobby {
    shared: Arc<Shared>,
    router: JoinHandle<()>,
}

impl Drop for Lobby {
    fn drop(&mut self) {
        for ticket in self.shared.matchmaking.iter() {
            ticket.cancel.cancel();
        }
        self.router.abort();
        self.shared.workers.clear();
    }
}

impl Lobby {
    pub fn local_identity(&self) -> &Identity {
        &self.shared.local
    }

    pub fn config(&self) -> &LobbyConfig {
        &self.shared.config
    }

    pub fn capabilities(&self) -> BackendCapabilities {
        self.shared.capabilities
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.shared.registry
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.shared.dispatcher
    }

    pub fn session(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.shared.registry.get(id)
    }

    /// Local lifecycle state of `id`. Sessions the player is not in are `Idle`.
    pub fn state(&self, id: &SessionId) -> LifecycleState {
        self.shared.state(id)
    }

    pub fn pending(&self, id: &SessionId) -> Option<PendingOperation> {
        self.shared.pending.get(id).map(|p| p.value().clone())
    }

    pub fn subscribe(&self, scope: ListenerScope) -> mpsc::UnboundedReceiver<LobbyEvent> {
        self.shared.dispatcher.subscribe(scope).1
    }

    pub fn on_event(&self, scope: ListenerScope, listener: impl EventListener + 'static) -> ListenerId {
        self.shared.dispatcher.register(scope, listener)
    }

    pub fn unregister(&self, id: ListenerId) -> bool {
        self.shared.dispatcher.unregister(id)
    }

    /// Create and host a new session.
    pub async fn request_create(&self, params: SessionParams) -> Result<SessionId> {
        params.validate()?;
        self.shared.create(&params).await
    }

    pub async fn request_search(&self, filter: SearchFilter) -> Result<SearchResults> {
        self.shared.search(&filter).await
    }

    pub async fn request_join(&self, descriptor: &SessionDescriptor) -> Result<SessionId> {
        self.shared.join(descriptor).await
    }

    /// Join a session the local player was invited to.
    pub async fn accept_invite(&self, descriptor: &SessionDescriptor) -> Result<SessionId> {
        if self.shared.registry.contains(&descriptor.id) {
            return Err(KronosError::AlreadyInSession {
                kind: descriptor.kind,
            });
        }
        if descriptor.is_banned(&self.shared.local) {
            return Err(KronosError::Banned);
        }
        self.shared.join(descriptor).await
    }

    /// Leave a session. Supersedes any pending operation on it.
    pub async fn request_leave(&self, id: &SessionId) -> Result<()> {
        self.shared.leave(id).await
    }

    /// Destroy a hosted session. Supersedes any pending operation on it.
    pub async fn request_teardown(&self, id: &SessionId) -> Result<()> {
        self.shared.teardown(id).await
    }

    /// Find or host a session on a background task.
    ///
    /// Only one run per session kind may be active, except
    /// [`MatchmakingMode::SearchOnly`], which never joins anything.
    pub fn request_matchmake(
        &self,
        params: SessionParams,
        filter: SearchFilter,
        mode: MatchmakingMode,
    ) -> Result<MatchmakingHandle> {
        params.validate()?;
        let plan = Plan::matchmake(&self.shared.config, params, filter, mode);
        matchmaking::start(Arc::clone(&self.shared), plan)
    }

    /// Return to the last session of `kind` that ended involuntarily.
    ///
    /// A former host recreates it; everyone else searches for the
    /// recreated session after a short delay and joins it.
    pub fn request_reconnect(&self, kind: SessionKind) -> Result<MatchmakingHandle> {
        matchmaking::reconnect(Arc::clone(&self.shared), kind)
    }

    pub fn last_session(&self, kind: SessionKind) -> Option<LastSession> {
        self.shared.history.get(&kind).map(|last| last.value().clone())
    }

    pub async fn request_lock(&self, id: &SessionId) -> Result<()> {
        self.host_update(id, LifecycleRequest::Lock, |_| {
            Ok(AttributeMap::from([(LOCKED_KEY.to_string(), true.into())]))
        })
        .await
    }

    pub async fn request_start(&self, id: &SessionId) -> Result<()> {
        self.host_update(id, LifecycleRequest::Start, |_| {
            Ok(AttributeMap::from([(STARTED_KEY.to_string(), true.into())]))
        })
        .await
    }

    /// Merge application attributes. Each key replaces its prior value.
    pub async fn request_update_attributes(&self, id: &SessionId, attributes: AttributeMap) -> Result<()> {
        self.host_update(id, LifecycleRequest::UpdateAttributes, move |_| {
            if attributes.is_empty() {
                return Err(KronosError::invalid_params("no attributes to update"));
            }
            validate_attribute_keys(&attributes)?;
            Ok(attributes)
        })
        .await
    }

    /// Ban `identity` from joining the session again.
    pub async fn request_ban(&self, id: &SessionId, identity: &Identity) -> Result<()> {
        let local = self.shared.local.clone();
        self.host_update(id, LifecycleRequest::Ban, move |session| {
            if identity == &local {
                return Err(KronosError::invalid_params("host cannot ban itself"));
            }
            let banned = banned_with(&session.attributes, identity);
            Ok(AttributeMap::from([(BANNED_KEY.to_string(), banned)]))
        })
        .await
    }

    pub async fn request_invite(&self, id: &SessionId, invitee: &Identity) -> Result<()> {
        if !self.shared.capabilities.invites {
            return Err(KronosError::invalid_params("backend does not support invites"));
        }
        self.shared.live(id)?.state.check(LifecycleRequest::Invite)?;
        let call = |b: &dyn SessionBackend| b.send_invite(id, invitee);
        let timeout = self.shared.config.operation_timeout();
        self.shared
            .run_query(OpKind::SendInvite, Some(id), timeout, &call)
            .await?;
        Ok(())
    }

    /// Read-only view of every live session.
    pub fn snapshot(&self) -> Vec<SessionView> {
        self.shared
            .registry
            .list()
            .iter()
            .map(|s| SessionView::new(s, self.pending(&s.id).as_ref()))
            .collect()
    }

    /// Multi-line description of one session.
    pub fn debug_string(&self, id: &SessionId) -> Option<String> {
        let session = self.shared.registry.get(id)?;
        Some(inspect::debug_string(&session, self.pending(id).as_ref()))
    }

    /// Busy check, state check, host check, then one attribute update.
    async fn host_update(
        &self,
        id: &SessionId,
        request: LifecycleRequest,
        build: impl FnOnce(&Session) -> Result<AttributeMap>,
    ) -> Result<()> {
        let slot = self
            .shared
            .acquire(id, request, OpKind::UpdateAttributes, false)?;
        let session = self.shared.live(id)?;
        session.state.check(request)?;
        if !session.is_host(&self.shared.local) {
            return Err(KronosError::NotAuthorized);
        }
        let attributes = build(&session)?;
        let call = |b: &dyn SessionBackend| b.update_attributes(id, &attributes);
        self.shared
            .run_mutation(&slot, OpKind::UpdateAttributes, &call)
            .await?;
        Ok(())
    }
}

fn unexpected(op: OpKind, payload: &CompletionPayload) -> KronosError {
    trace_warn!(%op, ?payload, "unexpected completion payload");
    KronosError::BackendUnavailable {
        reason: format!("unexpected completion for {op}"),
    }
}
