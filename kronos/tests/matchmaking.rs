//! Matchmaking and reconnect over the loopback platform.

use std::time::Duration;

use kronos::{
    BackendFailure, Identity, KronosError, LifecycleState, ListenerScope, Lobby, LobbyBuilder,
    LobbyEvent, LoopbackPlatform, MatchmakingMode, MatchmakingOutcome, MatchmakingState, OpKind,
    SearchFilter, SessionId, SessionKind, SessionParams, TerminalReason,
};
use kronos_test_support::EventRecorder;

const WAIT: Duration = Duration::from_secs(5);

fn lobby(platform: &LoopbackPlatform, name: &str) -> (Lobby, EventRecorder) {
    let lobby = LobbyBuilder::new()
        .operation_timeout_ms(1_000)
        .max_retries(3)
        .backoff_ms(50, 200)
        .matchmaking_restart_delay_ms(100)
        .build(platform.backend(name))
        .unwrap();
    let events = EventRecorder::new(lobby.subscribe(ListenerScope::Global));
    (lobby, events)
}

fn closed_with(event: &LobbyEvent, reason: TerminalReason) -> bool {
    matches!(event, LobbyEvent::LifecycleChanged { to: LifecycleState::Closed, reason: Some(r), .. } if *r == reason)
}

fn created(outcome: &MatchmakingOutcome) -> SessionId {
    match outcome {
        MatchmakingOutcome::Created(id) => id.clone(),
        other => panic!("expected a created session, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_default_mode_moves_on_after_refused_join() {
    let platform = LoopbackPlatform::new();
    let (alice, _alice_events) = lobby(&platform, "alice");
    let (carol, _carol_events) = lobby(&platform, "carol");
    let (bob, _bob_events) = lobby(&platform, "bob");
    let first = alice.request_create(SessionParams::new(4)).await.unwrap();
    let second = carol.request_create(SessionParams::new(4)).await.unwrap();

    platform.fail_next(OpKind::Join, BackendFailure::SessionFull);
    let handle = bob
        .request_matchmake(SessionParams::new(4), SearchFilter::new(), MatchmakingMode::Default)
        .unwrap();
    let watch = handle.watch();
    let outcome = handle.outcome().await.unwrap();

    assert_eq!(outcome, MatchmakingOutcome::Joined(second.clone()));
    assert_eq!(*watch.borrow(), MatchmakingState::Complete);
    assert!(bob.session(&first).is_none());
    assert_eq!(bob.session(&second).unwrap().members.len(), 2);
    assert_eq!(platform.session_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_default_mode_hosts_when_nothing_joinable() {
    let platform = LoopbackPlatform::new();
    let (alice, _alice_events) = lobby(&platform, "alice");
    let (bob, _bob_events) = lobby(&platform, "bob");
    let banned = alice.request_create(SessionParams::new(4)).await.unwrap();
    alice.request_ban(&banned, &Identity::new("bob")).await.unwrap();

    let params = SessionParams::new(2).attribute("map", "Dune");
    let handle = bob
        .request_matchmake(params, SearchFilter::new(), MatchmakingMode::Default)
        .unwrap();
    let id = created(&handle.outcome().await.unwrap());

    assert_ne!(id, banned);
    let session = bob.session(&id).unwrap();
    assert!(session.is_host(&Identity::new("bob")));
    assert_eq!(session.attributes["map"].as_str(), Some("Dune"));
    assert_eq!(platform.session(&banned).unwrap().members.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_create_only_mode() {
    let platform = LoopbackPlatform::new();
    let (alice, _events) = lobby(&platform, "alice");
    let (bob, _bob_events) = lobby(&platform, "bob");
    bob.request_create(SessionParams::new(4)).await.unwrap();

    let handle = alice
        .request_matchmake(SessionParams::new(4), SearchFilter::new(), MatchmakingMode::CreateOnly)
        .unwrap();
    let id = created(&handle.outcome().await.unwrap());
    assert_eq!(alice.state(&id), LifecycleState::Advertised);
    assert_eq!(platform.session_count(), 2);

    let again = alice.request_matchmake(
        SessionParams::new(4),
        SearchFilter::new(),
        MatchmakingMode::CreateOnly,
    );
    assert!(matches!(again, Err(KronosError::AlreadyInSession { kind: SessionKind::Game })));
}

#[tokio::test(start_paused = true)]
async fn test_search_only_mode() {
    let platform = LoopbackPlatform::new();
    let (alice, _alice_events) = lobby(&platform, "alice");
    let (bob, _bob_events) = lobby(&platform, "bob");

    let empty = bob
        .request_matchmake(SessionParams::new(4), SearchFilter::new(), MatchmakingMode::SearchOnly)
        .unwrap();
    assert_eq!(empty.outcome().await, Ok(MatchmakingOutcome::NoResults));

    let id = alice
        .request_create(SessionParams::new(4).attribute("map", "Dune"))
        .await
        .unwrap();
    let filter = SearchFilter::new().eq("map", "Dune");
    let found = bob
        .request_matchmake(SessionParams::new(4), filter, MatchmakingMode::SearchOnly)
        .unwrap();
    match found.outcome().await.unwrap() {
        MatchmakingOutcome::Found(results) => {
            assert_eq!(results.len(), 1);
            assert_eq!(results[0].id, id);
        }
        other => panic!("expected results, got {other:?}"),
    }
    assert!(bob.registry().list().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_join_only_mode() {
    let platform = LoopbackPlatform::new();
    let (alice, _alice_events) = lobby(&platform, "alice");
    let (carol, _carol_events) = lobby(&platform, "carol");
    let (bob, _bob_events) = lobby(&platform, "bob");
    let full = alice.request_create(SessionParams::new(1)).await.unwrap();
    let open = carol.request_create(SessionParams::new(4)).await.unwrap();

    let descriptor = platform.session(&full).unwrap().descriptor();
    let handle = bob
        .request_matchmake(SessionParams::new(4), SearchFilter::new(), MatchmakingMode::JoinOnly(descriptor))
        .unwrap();
    let watch = handle.watch();
    assert_eq!(
        handle.outcome().await,
        Err(KronosError::SessionFull { id: full.clone() })
    );
    assert_eq!(*watch.borrow(), MatchmakingState::Failure);

    let descriptor = platform.session(&open).unwrap().descriptor();
    let handle = bob
        .request_matchmake(SessionParams::new(4), SearchFilter::new(), MatchmakingMode::JoinOnly(descriptor))
        .unwrap();
    assert_eq!(handle.outcome().await, Ok(MatchmakingOutcome::Joined(open.clone())));
    assert_eq!(bob.state(&open), LifecycleState::Filling);
}

#[tokio::test(start_paused = true)]
async fn test_one_run_per_kind() {
    let platform = LoopbackPlatform::new().with_latency(Duration::from_millis(500));
    let (alice, _events) = lobby(&platform, "alice");

    let first = alice
        .request_matchmake(SessionParams::new(4), SearchFilter::new(), MatchmakingMode::Default)
        .unwrap();
    let second = alice.request_matchmake(
        SessionParams::new(4),
        SearchFilter::new(),
        MatchmakingMode::CreateOnly,
    );
    assert!(matches!(
        second,
        Err(KronosError::MatchmakingInProgress { kind: SessionKind::Game })
    ));

    let party = alice
        .request_matchmake(
            SessionParams::new(4).kind(SessionKind::Party),
            SearchFilter::new(),
            MatchmakingMode::SearchOnly,
        )
        .unwrap();
    assert_eq!(party.outcome().await, Ok(MatchmakingOutcome::NoResults));

    tokio::time::sleep(Duration::from_millis(100)).await;
    first.cancel();
    assert_eq!(first.state(), MatchmakingState::Canceling);
    assert_eq!(first.outcome().await, Err(KronosError::Canceled));

    // The ticket is released once the run ends.
    let next = alice
        .request_matchmake(SessionParams::new(4), SearchFilter::new(), MatchmakingMode::SearchOnly)
        .unwrap();
    assert_eq!(next.outcome().await, Ok(MatchmakingOutcome::NoResults));
    alice
        .request_matchmake(SessionParams::new(4), SearchFilter::new(), MatchmakingMode::CreateOnly)
        .unwrap()
        .cancel();
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_create_tears_down() {
    let platform = LoopbackPlatform::new().with_latency(Duration::from_millis(500));
    let (alice, mut events) = lobby(&platform, "alice");

    let handle = alice
        .request_matchmake(SessionParams::new(4), SearchFilter::new(), MatchmakingMode::CreateOnly)
        .unwrap();
    let watch = handle.watch();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(handle.state(), MatchmakingState::CreatingSession);
    assert_eq!(platform.session_count(), 1);

    handle.cancel();
    assert_eq!(handle.outcome().await, Err(KronosError::Canceled));
    assert_eq!(*watch.borrow(), MatchmakingState::Canceled);
    assert_eq!(platform.session_count(), 0);
    assert!(alice.registry().list().is_empty());

    events.drain();
    assert_eq!(events.count(|e| closed_with(e, TerminalReason::TornDown)), 1);
    assert!(alice.last_session(SessionKind::Game).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_after_backend_close() {
    let platform = LoopbackPlatform::new();
    let (alice, mut alice_events) = lobby(&platform, "alice");
    let (bob, mut bob_events) = lobby(&platform, "bob");
    let params = SessionParams::new(4)
        .kind(SessionKind::Party)
        .attribute("mode", "coop");
    let id = alice.request_create(params).await.unwrap();
    bob.request_join(&platform.session(&id).unwrap().descriptor())
        .await
        .unwrap();

    platform.simulate_close(&id).unwrap();
    alice_events
        .next_matching(WAIT, |e| closed_with(e, TerminalReason::BackendClosed))
        .await
        .unwrap();
    bob_events
        .next_matching(WAIT, |e| closed_with(e, TerminalReason::BackendClosed))
        .await
        .unwrap();

    let host = alice.last_session(SessionKind::Party).unwrap();
    assert!(host.was_host);
    assert_eq!(host.reconnect_id, id.as_str());
    let client = bob.last_session(SessionKind::Party).unwrap();
    assert!(!client.was_host);
    assert_eq!(client.host, Some(Identity::new("alice")));
    assert_eq!(client.member_count, 2);

    let host_run = alice.request_reconnect(SessionKind::Party).unwrap();
    let client_run = bob.request_reconnect(SessionKind::Party).unwrap();
    let (host_outcome, client_outcome) = tokio::join!(host_run.outcome(), client_run.outcome());
    let recreated = created(&host_outcome.unwrap());
    assert_eq!(client_outcome, Ok(MatchmakingOutcome::Joined(recreated.clone())));
    assert_ne!(recreated, id);

    let backend = platform.session(&recreated).unwrap();
    assert_eq!(backend.attributes["kronos.reconnect"].as_str(), Some(id.as_str()));
    assert_eq!(backend.attributes["mode"].as_str(), Some("coop"));
    assert_eq!(backend.members.len(), 2);
    assert!(alice.last_session(SessionKind::Party).is_none());
    assert!(bob.last_session(SessionKind::Party).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_needs_involuntary_loss() {
    let platform = LoopbackPlatform::new();
    let (alice, mut events) = lobby(&platform, "alice");

    assert!(matches!(
        alice.request_reconnect(SessionKind::Game),
        Err(KronosError::InvalidParams(_))
    ));

    let id = alice.request_create(SessionParams::new(4)).await.unwrap();
    alice.request_leave(&id).await.unwrap();
    assert!(alice.last_session(SessionKind::Game).is_none());
    assert!(matches!(
        alice.request_reconnect(SessionKind::Game),
        Err(KronosError::InvalidParams(_))
    ));

    let id = alice.request_create(SessionParams::new(4)).await.unwrap();
    platform.simulate_close(&id).unwrap();
    events
        .next_matching(WAIT, |e| closed_with(e, TerminalReason::BackendClosed))
        .await
        .unwrap();
    assert!(alice.last_session(SessionKind::Game).is_some());

    alice.request_create(SessionParams::new(4)).await.unwrap();
    assert!(matches!(
        alice.request_reconnect(SessionKind::Game),
        Err(KronosError::AlreadyInSession { kind: SessionKind::Game })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_client_reconnect_gives_up_or_cancels() {
    let platform = LoopbackPlatform::new();
    let (alice, _alice_events) = lobby(&platform, "alice");
    let (bob, mut bob_events) = lobby(&platform, "bob");
    let id = alice.request_create(SessionParams::new(4)).await.unwrap();
    bob.request_join(&platform.session(&id).unwrap().descriptor())
        .await
        .unwrap();
    platform.simulate_close(&id).unwrap();
    bob_events
        .next_matching(WAIT, |e| closed_with(e, TerminalReason::BackendClosed))
        .await
        .unwrap();

    // Nobody recreates the session.
    let run = bob.request_reconnect(SessionKind::Game).unwrap();
    assert_eq!(run.outcome().await, Ok(MatchmakingOutcome::NoResults));
    assert!(bob.registry().list().is_empty());
    assert_eq!(platform.session_count(), 0);

    let run = bob.request_reconnect(SessionKind::Game).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(run.state(), MatchmakingState::Starting);
    run.cancel();
    assert_eq!(run.outcome().await, Err(KronosError::Canceled));
    assert!(bob.last_session(SessionKind::Game).is_some());
}
