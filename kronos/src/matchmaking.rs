//! Matchmaking and reconnect.
//!
//! A matchmaking run searches, tries each result in turn and hosts a new
//! session when nothing could be joined. Runs execute on their own task;
//! the [`MatchmakingHandle`] reports progress and can cancel. A canceled
//! run that already created or joined a session tears it down or leaves
//! before it reports [`MatchmakingState::Canceled`].
//!
//! Reconnect is a matchmaking run built from the last session of a kind
//! that ended without the local player asking.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::LobbyConfig;
use crate::dispatcher::TerminalReason;
use crate::error::{KronosError, Result};
use crate::orchestrator::Shared;
use crate::query::SearchFilter;
use crate::registry::Session;
use crate::types::{
    Identity, SessionDescriptor, SessionId, SessionKind, SessionParams, Visibility, HOST_KEY,
    RECONNECT_KEY, RESERVED_PREFIX,
};

#[derive(Debug, Clone, PartialEq)]
pub enum MatchmakingMode {
    /// Search, join the first result that accepts, otherwise host.
    Default,
    CreateOnly,
    /// Report what a search finds without joining anything.
    SearchOnly,
    JoinOnly(SessionDescriptor),
}

impl fmt::Display for MatchmakingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Default => "default",
            Self::CreateOnly => "create only",
            Self::SearchOnly => "search only",
            Self::JoinOnly(_) => "join only",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchmakingState {
    NotStarted,
    Starting,
    Searching,
    JoiningSession,
    CreatingSession,
    Complete,
    Canceling,
    Canceled,
    Failure,
}

impl MatchmakingState {
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Complete | Self::Canceled | Self::Failure)
    }
}

impl fmt::Display for MatchmakingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotStarted => "not started",
            Self::Starting => "starting",
            Self::Searching => "searching",
            Self::JoiningSession => "joining session",
            Self::CreatingSession => "creating session",
            Self::Complete => "complete",
            Self::Canceling => "canceling",
            Self::Canceled => "canceled",
            Self::Failure => "failure",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MatchmakingOutcome {
    /// Search-only results, never empty.
    Found(Vec<SessionDescriptor>),
    NoResults,
    Created(SessionId),
    Joined(SessionId),
}

impl MatchmakingOutcome {
    /// Session the local player ended up in, if any.
    pub fn session_id(&self) -> Option<&SessionId> {
        match self {
            Self::Created(id) | Self::Joined(id) => Some(id),
            Self::Found(_) | Self::NoResults => None,
        }
    }
}

/// Last session of a kind the local player lost without leaving.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LastSession {
    pub session_id: SessionId,
    /// Shared by every incarnation of the session.
    pub reconnect_id: String,
    pub kind: SessionKind,
    pub was_host: bool,
    pub host: Option<Identity>,
    /// Application attributes only.
    pub params: SessionParams,
    pub member_count: usize,
    pub reason: TerminalReason,
}

impl LastSession {
    pub(crate) fn record(session: &Session, local: &Identity, reason: TerminalReason) -> Self {
        let reconnect_id = session
            .attributes
            .get(RECONNECT_KEY)
            .and_then(|v| v.as_str())
            .map_or_else(|| session.id.as_str().to_string(), str::to_string);
        let attributes = session
            .attributes
            .iter()
            .filter(|(key, _)| !key.starts_with(RESERVED_PREFIX))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        Self {
            session_id: session.id.clone(),
            reconnect_id,
            kind: session.kind,
            was_host: session.is_host(local),
            host: session.host(),
            params: SessionParams {
                kind: session.kind,
                capacity: session.capacity,
                visibility: session.visibility,
                attributes,
            },
            member_count: session.members.len(),
            reason,
        }
    }
}

/// One active run per session kind.
pub(crate) struct MatchmakingTicket {
    pub id: u64,
    pub cancel: CancellationToken,
}

/// Releases the kind's ticket when the run ends.
struct TicketGuard {
    shared: Arc<Shared>,
    kind: SessionKind,
    id: Option<u64>,
}

impl Drop for TicketGuard {
    fn drop(&mut self) {
        if let Some(id) = self.id {
            self.shared.matchmaking.remove_if(&self.kind, |_, t| t.id == id);
        }
    }
}

/// What a run does, resolved from the request and the lobby config.
pub(crate) struct Plan {
    mode: MatchmakingMode,
    params: SessionParams,
    filter: SearchFilter,
    search_attempts: u32,
    no_host: bool,
    start_delay: Duration,
    restart_delay: Duration,
    reconnect: bool,
}

impl Plan {
    pub(crate) fn matchmake(
        config: &LobbyConfig,
        params: SessionParams,
        filter: SearchFilter,
        mode: MatchmakingMode,
    ) -> Self {
        Self {
            mode,
            params,
            filter,
            search_attempts: config.matchmaking_search_attempts,
            no_host: false,
            start_delay: Duration::ZERO,
            restart_delay: config.matchmaking_restart_delay(),
            reconnect: false,
        }
    }

    fn reconnect(config: &LobbyConfig, last: &LastSession) -> Self {
        if last.was_host {
            let mut params = last.params.clone();
            params
                .attributes
                .insert(RECONNECT_KEY.into(), last.reconnect_id.as_str().into());
            return Self {
                mode: MatchmakingMode::CreateOnly,
                params,
                filter: SearchFilter::new(),
                search_attempts: 1,
                no_host: true,
                start_delay: Duration::ZERO,
                restart_delay: Duration::ZERO,
                reconnect: true,
            };
        }
        let mut filter = SearchFilter::new()
            .kind(last.kind)
            .eq(RECONNECT_KEY, last.reconnect_id.as_str());
        if let Some(host) = &last.host {
            filter = filter.eq(HOST_KEY, host.as_str());
        }
        if last.params.visibility != Visibility::Public {
            filter = filter.include_private();
        }
        Self {
            mode: MatchmakingMode::Default,
            params: last.params.clone(),
            filter,
            search_attempts: config.reconnect_search_attempts,
            no_host: true,
            start_delay: config.reconnect_delay(),
            restart_delay: config.reconnect_delay(),
            reconnect: true,
        }
    }

    fn kind(&self) -> SessionKind {
        match &self.mode {
            MatchmakingMode::JoinOnly(descriptor) => descriptor.kind,
            _ => self.params.kind,
        }
    }
}

/// Progress and control for one matchmaking run.
pub struct MatchmakingHandle {
    kind: SessionKind,
    state: Arc<watch::Sender<MatchmakingState>>,
    cancel: CancellationToken,
    task: JoinHandle<Result<MatchmakingOutcome>>,
}

impl MatchmakingHandle {
    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    pub fn state(&self) -> MatchmakingState {
        *self.state.borrow()
    }

    /// Receiver that observes every state change.
    pub fn watch(&self) -> watch::Receiver<MatchmakingState> {
        self.state.subscribe()
    }

    /// Ask the run to stop. A create or join already issued still completes
    /// and is undone before the run reports `Canceled`.
    pub fn cancel(&self) {
        self.state.send_if_modified(|state| {
            if state.is_finished() || *state == MatchmakingState::Canceling {
                return false;
            }
            *state = MatchmakingState::Canceling;
            true
        });
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn outcome(self) -> Result<MatchmakingOutcome> {
        match self.task.await {
            Ok(result) => result,
            Err(_) => Err(KronosError::Shutdown),
        }
    }
}

pub(crate) fn start(shared: Arc<Shared>, plan: Plan) -> Result<MatchmakingHandle> {
    let kind = plan.kind();
    let cancel = CancellationToken::new();
    let searching = plan.mode == MatchmakingMode::SearchOnly;

    let ticket = if searching {
        None
    } else {
        if shared.kinds.contains_key(&kind) {
            return Err(KronosError::AlreadyInSession { kind });
        }
        let id = shared.next_id();
        match shared.matchmaking.entry(kind) {
            Entry::Occupied(_) => return Err(KronosError::MatchmakingInProgress { kind }),
            Entry::Vacant(slot) => {
                slot.insert(MatchmakingTicket {
                    id,
                    cancel: cancel.clone(),
                });
            }
        }
        Some(id)
    };
    let guard = TicketGuard {
        shared: Arc::clone(&shared),
        kind,
        id: ticket,
    };

    let (state, _) = watch::channel(MatchmakingState::NotStarted);
    let state = Arc::new(state);
    trace_info!(%kind, mode = %plan.mode, reconnect = plan.reconnect, "matchmaking requested");
    let run = Run {
        shared,
        plan,
        state: Arc::clone(&state),
        cancel: cancel.clone(),
    };
    let task = tokio::spawn(async move {
        let _guard = guard;
        run.execute().await
    });

    Ok(MatchmakingHandle {
        kind,
        state,
        cancel,
        task,
    })
}

pub(crate) fn reconnect(shared: Arc<Shared>, kind: SessionKind) -> Result<MatchmakingHandle> {
    if shared.kinds.contains_key(&kind) {
        return Err(KronosError::AlreadyInSession { kind });
    }
    let last = shared
        .history
        .get(&kind)
        .map(|last| last.value().clone())
        .ok_or_else(|| KronosError::invalid_params(format!("no {kind} session to reconnect to")))?;
    trace_info!(%kind, session = %last.session_id, reconnect_id = %last.reconnect_id, host = last.was_host, "reconnecting");
    let plan = Plan::reconnect(&shared.config, &last);
    start(shared, plan)
}

/// Errors that end a run instead of moving on to the next result.
fn is_fatal(err: &KronosError) -> bool {
    matches!(
        err,
        KronosError::Canceled
            | KronosError::Shutdown
            | KronosError::AlreadyInSession { .. }
            | KronosError::MatchmakingInProgress { .. }
            | KronosError::InvalidParams(_)
            | KronosError::Config(_)
    )
}

struct Run {
    shared: Arc<Shared>,
    plan: Plan,
    state: Arc<watch::Sender<MatchmakingState>>,
    cancel: CancellationToken,
}

impl Run {
    async fn execute(self) -> Result<MatchmakingOutcome> {
        self.set(MatchmakingState::Starting);
        let result = self.drive().await;
        let end = match &result {
            Ok(_) => MatchmakingState::Complete,
            Err(KronosError::Canceled) => MatchmakingState::Canceled,
            Err(_) => MatchmakingState::Failure,
        };
        match &result {
            Ok(outcome) => {
                trace_info!(mode = %self.plan.mode, ?outcome, "matchmaking complete");
                if self.plan.reconnect && outcome.session_id().is_some() {
                    self.shared.history.remove(&self.plan.kind());
                }
            }
            Err(err) => trace_info!(mode = %self.plan.mode, state = %end, error = %err, "matchmaking ended"),
        }
        self.set(end);
        result
    }

    /// Move to `next` unless a cancel is already showing.
    fn set(&self, next: MatchmakingState) {
        self.state.send_if_modified(|state| {
            let hold = *state == MatchmakingState::Canceling && !next.is_finished();
            if hold || *state == next {
                return false;
            }
            *state = next;
            true
        });
    }

    async fn drive(&self) -> Result<MatchmakingOutcome> {
        self.pause(self.plan.start_delay).await?;
        match &self.plan.mode {
            MatchmakingMode::CreateOnly => self.create().await,
            MatchmakingMode::JoinOnly(descriptor) => self.join(descriptor).await,
            MatchmakingMode::SearchOnly => {
                let found = self.search(&self.plan.filter).await?;
                if found.is_empty() {
                    Ok(MatchmakingOutcome::NoResults)
                } else {
                    Ok(MatchmakingOutcome::Found(found))
                }
            }
            MatchmakingMode::Default => self.search_then_host().await,
        }
    }

    async fn search_then_host(&self) -> Result<MatchmakingOutcome> {
        let mut filter = self.plan.filter.clone();
        if filter.kind.is_none() {
            filter.kind = Some(self.plan.params.kind);
        }
        for pass in 0..self.plan.search_attempts {
            if pass > 0 {
                self.pause(self.plan.restart_delay).await?;
            }
            let results = self.search(&filter).await?;
            trace_debug!(pass, results = results.len(), "matchmaking search pass");
            for descriptor in results {
                if descriptor.is_banned(&self.shared.local) {
                    filter.ignored_sessions.push(descriptor.id);
                    continue;
                }
                match self.join(&descriptor).await {
                    Ok(outcome) => return Ok(outcome),
                    Err(err) if is_fatal(&err) => return Err(err),
                    Err(err) => {
                        trace_debug!(session = %descriptor.id, error = %err, "matchmaking join refused");
                        filter.ignored_sessions.push(descriptor.id);
                    }
                }
            }
        }
        if self.plan.no_host {
            return Ok(MatchmakingOutcome::NoResults);
        }
        self.create().await
    }

    async fn pause(&self, delay: Duration) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(KronosError::Canceled);
        }
        if delay.is_zero() {
            return Ok(());
        }
        tokio::select! {
            _ = self.cancel.cancelled() => Err(KronosError::Canceled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    async fn search(&self, filter: &SearchFilter) -> Result<Vec<SessionDescriptor>> {
        if self.cancel.is_cancelled() {
            return Err(KronosError::Canceled);
        }
        self.set(MatchmakingState::Searching);
        tokio::select! {
            _ = self.cancel.cancelled() => Err(KronosError::Canceled),
            results = self.shared.search(filter) => Ok(results?.collect()),
        }
    }

    async fn join(&self, descriptor: &SessionDescriptor) -> Result<MatchmakingOutcome> {
        if self.cancel.is_cancelled() {
            return Err(KronosError::Canceled);
        }
        self.set(MatchmakingState::JoiningSession);
        let id = self.shared.join(descriptor).await?;
        if self.cancel.is_cancelled() {
            trace_info!(session = %id, "matchmaking canceled after join, leaving");
            if let Err(err) = self.shared.leave(&id).await {
                trace_warn!(session = %id, error = %err, "leave after cancel failed");
            }
            return Err(KronosError::Canceled);
        }
        Ok(MatchmakingOutcome::Joined(id))
    }

    async fn create(&self) -> Result<MatchmakingOutcome> {
        if self.cancel.is_cancelled() {
            return Err(KronosError::Canceled);
        }
        self.set(MatchmakingState::CreatingSession);
        let id = self.shared.create(&self.plan.params).await?;
        if self.cancel.is_cancelled() {
            trace_info!(session = %id, "matchmaking canceled after create, tearing down");
            if let Err(err) = self.shared.teardown(&id).await {
                trace_warn!(session = %id, error = %err, "teardown after cancel failed");
            }
            return Err(KronosError::Canceled);
        }
        Ok(MatchmakingOutcome::Created(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::LifecycleState;
    use crate::types::{AttributeMap, Member};

    fn session(attributes: AttributeMap) -> Session {
        Session {
            id: SessionId::new("s-1"),
            kind: SessionKind::Party,
            owner: Identity::new("alice"),
            capacity: 4,
            visibility: Visibility::Private,
            attributes,
            members: vec![
                Member::new(Identity::new("alice"), 1_000),
                Member::new(Identity::new("bob"), 1_010),
            ],
            state: LifecycleState::Filling,
            sequence: 3,
        }
    }

    fn attributes(pairs: &[(&str, &str)]) -> AttributeMap {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), (*value).into()))
            .collect()
    }

    #[test]
    fn test_last_session_keeps_app_attributes() {
        let s = session(attributes(&[(HOST_KEY, "alice"), ("map", "Dune")]));
        let last = LastSession::record(&s, &Identity::new("bob"), TerminalReason::BackendClosed);
        assert_eq!(last.reconnect_id, "s-1");
        assert!(!last.was_host);
        assert_eq!(last.host, Some(Identity::new("alice")));
        assert_eq!(last.member_count, 2);
        assert_eq!(last.params.attributes, attributes(&[("map", "Dune")]));
        assert_eq!(last.params.capacity, 4);
    }

    #[test]
    fn test_reconnect_id_survives_incarnations() {
        let s = session(attributes(&[(HOST_KEY, "alice"), (RECONNECT_KEY, "s-0")]));
        let last = LastSession::record(&s, &Identity::new("alice"), TerminalReason::Removed);
        assert_eq!(last.reconnect_id, "s-0");
        assert!(last.was_host);
    }

    #[test]
    fn test_reconnect_plans() {
        let config = LobbyConfig::default();
        let s = session(attributes(&[(HOST_KEY, "alice"), ("map", "Dune")]));

        let host = Plan::reconnect(&config, &LastSession::record(&s, &Identity::new("alice"), TerminalReason::BackendClosed));
        assert_eq!(host.mode, MatchmakingMode::CreateOnly);
        assert_eq!(host.params.attributes[RECONNECT_KEY].as_str(), Some("s-1"));
        assert_eq!(host.start_delay, Duration::ZERO);

        let client = Plan::reconnect(&config, &LastSession::record(&s, &Identity::new("bob"), TerminalReason::BackendClosed));
        assert_eq!(client.mode, MatchmakingMode::Default);
        assert!(client.no_host);
        assert!(client.filter.include_private);
        assert_eq!(client.filter.kind, Some(SessionKind::Party));
        assert_eq!(client.filter.conditions.len(), 2);
        assert_eq!(client.search_attempts, config.reconnect_search_attempts);
        assert_eq!(client.start_delay, config.reconnect_delay());
    }

    #[test]
    fn test_fatal_errors_stop_the_run() {
        assert!(is_fatal(&KronosError::Canceled));
        assert!(is_fatal(&KronosError::AlreadyInSession { kind: SessionKind::Game }));
        assert!(!is_fatal(&KronosError::SessionFull { id: SessionId::new("x") }));
        assert!(!is_fatal(&KronosError::NotAuthorized));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(MatchmakingState::JoiningSession.to_string(), "joining session");
        assert!(MatchmakingState::Canceled.is_finished());
        assert!(!MatchmakingState::Canceling.is_finished());
    }
}
