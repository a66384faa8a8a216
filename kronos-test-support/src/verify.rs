//! Notification recording and ordering checks.

use std::collections::HashMap;
use std::time::Duration;

use kronos::{LifecycleState, LobbyEvent, SessionId};
use tokio::sync::mpsc::UnboundedReceiver;

/// Records every event a lobby subscription yields.
pub struct EventRecorder {
    rx: UnboundedReceiver<LobbyEvent>,
    seen: Vec<LobbyEvent>,
}

impl EventRecorder {
    pub fn new(rx: UnboundedReceiver<LobbyEvent>) -> Self {
        Self { rx, seen: Vec::new() }
    }

    /// Wait for the next event satisfying `pred`, recording everything on the way.
    pub async fn next_matching(
        &mut self,
        timeout: Duration,
        pred: impl Fn(&LobbyEvent) -> bool,
    ) -> Option<LobbyEvent> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let event = tokio::time::timeout_at(deadline, self.rx.recv()).await.ok()??;
            self.seen.push(event.clone());
            if pred(&event) {
                return Some(event);
            }
        }
    }

    /// Wait until `id` enters `state`.
    pub async fn wait_for_state(
        &mut self,
        id: &SessionId,
        state: LifecycleState,
        timeout: Duration,
    ) -> Option<LobbyEvent> {
        self.next_matching(timeout, |event| {
            matches!(event, LobbyEvent::LifecycleChanged { session_id, to, .. }
                if session_id == id && *to == state)
        })
        .await
    }

    /// Record whatever is already queued.
    pub fn drain(&mut self) -> &[LobbyEvent] {
        while let Ok(event) = self.rx.try_recv() {
            self.seen.push(event);
        }
        &self.seen
    }

    pub fn events(&self) -> &[LobbyEvent] {
        &self.seen
    }

    pub fn count(&self, pred: impl Fn(&LobbyEvent) -> bool) -> usize {
        self.seen.iter().filter(|event| pred(event)).count()
    }

    /// `(from, to)` pairs observed for `id`, in order.
    pub fn transitions(&self, id: &SessionId) -> Vec<(LifecycleState, LifecycleState)> {
        self.seen
            .iter()
            .filter_map(|event| match event {
                LobbyEvent::LifecycleChanged {
                    session_id,
                    from,
                    to,
                    ..
                } if session_id == id => Some((*from, *to)),
                _ => None,
            })
            .collect()
    }
}

/// Check that each session's lifecycle notifications form one chain of
/// legal transitions and that nothing follows its terminal state.
pub fn verify_lifecycle_chain(events: &[LobbyEvent]) -> Result<(), String> {
    let mut current: HashMap<&SessionId, LifecycleState> = HashMap::new();
    for (index, event) in events.iter().enumerate() {
        let Some(id) = session_of(event) else { continue };
        if current.get(id).is_some_and(|state| state.is_terminal()) {
            return Err(format!("event #{index} for {id} after terminal state"));
        }
        if let LobbyEvent::LifecycleChanged { from, to, .. } = event {
            if let Some(previous) = current.get(id) {
                if previous != from {
                    return Err(format!(
                        "event #{index} for {id}: from {from} but last state was {previous}"
                    ));
                }
            }
            if !from.can_transition_to(*to) {
                return Err(format!("event #{index} for {id}: illegal {from} -> {to}"));
            }
            current.insert(id, *to);
        }
    }
    Ok(())
}

fn session_of(event: &LobbyEvent) -> Option<&SessionId> {
    match event {
        LobbyEvent::InviteReceived { .. } => None,
        other => Some(other.session_id()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn changed(id: &str, from: LifecycleState, to: LifecycleState) -> LobbyEvent {
        LobbyEvent::LifecycleChanged {
            session_id: SessionId::new(id),
            from,
            to,
            reason: None,
        }
    }

    #[test]
    fn test_valid_chain() {
        let events = vec![
            changed("a", LifecycleState::Creating, LifecycleState::Advertised),
            changed("b", LifecycleState::Creating, LifecycleState::Filling),
            changed("a", LifecycleState::Advertised, LifecycleState::Filling),
            changed("a", LifecycleState::Filling, LifecycleState::Closed),
        ];
        assert_eq!(verify_lifecycle_chain(&events), Ok(()));
    }

    #[test]
    fn test_broken_chain() {
        let events = vec![
            changed("a", LifecycleState::Creating, LifecycleState::Advertised),
            changed("a", LifecycleState::Locked, LifecycleState::InProgress),
        ];
        assert!(verify_lifecycle_chain(&events).is_err());
    }

    #[test]
    fn test_event_after_terminal() {
        let events = vec![
            changed("a", LifecycleState::Advertised, LifecycleState::Closed),
            LobbyEvent::AttributesChanged {
                session_id: SessionId::new("a"),
                changed: Default::default(),
            },
        ];
        assert!(verify_lifecycle_chain(&events).is_err());
    }

    #[tokio::test]
    async fn test_recorder_waits_for_state() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let mut recorder = EventRecorder::new(rx);
        tx.send(changed("a", LifecycleState::Creating, LifecycleState::Advertised)).unwrap();
        tx.send(changed("a", LifecycleState::Advertised, LifecycleState::Filling)).unwrap();

        let id = SessionId::new("a");
        let hit = recorder
            .wait_for_state(&id, LifecycleState::Filling, Duration::from_secs(1))
            .await;
        assert!(hit.is_some());
        assert_eq!(recorder.transitions(&id).len(), 2);

        let miss = recorder
            .wait_for_state(&id, LifecycleState::Locked, Duration::from_millis(10))
            .await;
        assert!(miss.is_none());
    }
}
