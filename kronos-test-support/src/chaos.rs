//! Chaos utilities for membership event streams.
//!
//! Real platforms deliver membership events late, twice, or out of order.
//! [`EventChaos`] scrambles a batch the same way, seeded so a failing run
//! can be replayed.

use kronos::{BackendEvent, Identity, LoopbackPlatform, MembershipEvent};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// What happened to one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChaosAction {
    Deliver,
    Duplicate,
    Drop,
}

/// Seeded scrambler for batches of membership events.
///
/// # Example
///
/// ```
/// use kronos_test_support::chaos::EventChaos;
///
/// let mut chaos = EventChaos::new(7)
///     .with_reorder_probability(0.3)
///     .with_duplicate_probability(0.1);
/// let out = chaos.scramble(Vec::new());
/// assert!(out.is_empty());
/// ```
pub struct EventChaos {
    rng: StdRng,
    reorder_probability: f64,
    duplicate_probability: f64,
    drop_probability: f64,
    duplicated: usize,
    dropped: usize,
    swapped: usize,
}

impl EventChaos {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            reorder_probability: 0.0,
            duplicate_probability: 0.0,
            drop_probability: 0.0,
            duplicated: 0,
            dropped: 0,
            swapped: 0,
        }
    }

    /// Reorders and duplicates, no loss.
    pub fn mild(seed: u64) -> Self {
        Self::new(seed)
            .with_reorder_probability(0.3)
            .with_duplicate_probability(0.1)
    }

    pub fn with_reorder_probability(mut self, prob: f64) -> Self {
        self.reorder_probability = prob.clamp(0.0, 1.0);
        self
    }

    pub fn with_duplicate_probability(mut self, prob: f64) -> Self {
        self.duplicate_probability = prob.clamp(0.0, 1.0);
        self
    }

    pub fn with_drop_probability(mut self, prob: f64) -> Self {
        self.drop_probability = prob.clamp(0.0, 1.0);
        self
    }

    pub fn decide(&mut self) -> ChaosAction {
        let roll = self.rng.gen::<f64>();
        if roll < self.drop_probability {
            ChaosAction::Drop
        } else if roll < self.drop_probability + self.duplicate_probability {
            ChaosAction::Duplicate
        } else {
            ChaosAction::Deliver
        }
    }

    /// Apply drops and duplicates, then swap random neighbours.
    pub fn scramble(&mut self, events: Vec<MembershipEvent>) -> Vec<MembershipEvent> {
        let mut out = Vec::with_capacity(events.len());
        for event in events {
            match self.decide() {
                ChaosAction::Deliver => out.push(event),
                ChaosAction::Duplicate => {
                    self.duplicated += 1;
                    out.push(event.clone());
                    out.push(event);
                }
                ChaosAction::Drop => self.dropped += 1,
            }
        }
        for i in 1..out.len() {
            if self.rng.gen::<f64>() < self.reorder_probability {
                out.swap(i - 1, i);
                self.swapped += 1;
            }
        }
        out
    }

    /// Scramble `events` and hand them to `to` through the platform.
    pub fn inject(&mut self, platform: &LoopbackPlatform, to: &Identity, events: Vec<MembershipEvent>) -> usize {
        let scrambled = self.scramble(events);
        let count = scrambled.len();
        for event in scrambled {
            platform.inject(to, BackendEvent::Membership(event));
        }
        count
    }

    pub fn duplicated(&self) -> usize {
        self.duplicated
    }

    pub fn dropped(&self) -> usize {
        self.dropped
    }

    pub fn swapped(&self) -> usize {
        self.swapped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kronos::{MembershipEventKind, SessionId};

    fn batch(n: u64) -> Vec<MembershipEvent> {
        (1..=n)
            .map(|sequence| MembershipEvent {
                session_id: SessionId::new("s-1"),
                sequence,
                kind: MembershipEventKind::Left(Identity::new(format!("p{sequence}"))),
            })
            .collect()
    }

    #[test]
    fn test_no_chaos_passes_through() {
        let mut chaos = EventChaos::new(1);
        let out = chaos.scramble(batch(10));
        let seqs: Vec<u64> = out.iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, (1..=10).collect::<Vec<_>>());
    }

    #[test]
    fn test_same_seed_same_result() {
        let mut a = EventChaos::mild(42).with_drop_probability(0.1);
        let mut b = EventChaos::mild(42).with_drop_probability(0.1);
        assert_eq!(a.scramble(batch(50)), b.scramble(batch(50)));
    }

    #[test]
    fn test_counts_match_output() {
        let mut chaos = EventChaos::new(9)
            .with_duplicate_probability(0.2)
            .with_drop_probability(0.2);
        let out = chaos.scramble(batch(200));
        assert_eq!(out.len(), 200 + chaos.duplicated() - chaos.dropped());
        assert!(chaos.duplicated() > 0);
        assert!(chaos.dropped() > 0);
    }

    #[test]
    fn test_full_reorder_keeps_events() {
        let mut chaos = EventChaos::new(3).with_reorder_probability(1.0);
        let mut out: Vec<u64> = chaos.scramble(batch(8)).iter().map(|e| e.sequence).collect();
        assert_eq!(chaos.swapped(), 7);
        out.sort_unstable();
        assert_eq!(out, (1..=8).collect::<Vec<_>>());
    }
}
