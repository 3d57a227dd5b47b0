//! Fixed-interval replication of authoritative states

use crate::history::StateHistoryStore;
use log::debug;
use shared::ReplicatedState;

/// Decides when the latest state of every character is sent to observers.
///
/// A single deadline is kept. When a tick finds the deadline passed, one
/// broadcast happens and the deadline moves forward by exactly one interval,
/// even if the tick was late by several intervals. A stalled server therefore
/// catches up one interval per tick instead of sending a burst.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicationScheduler {
    interval: u64,
    next_deadline: u64,
}

impl ReplicationScheduler {
    pub fn new(interval: u64, now: u64) -> Self {
        Self {
            interval,
            next_deadline: now.saturating_add(interval),
        }
    }

    /// Restarts the schedule so the first broadcast is one interval from `now`.
    pub fn reset(&mut self, now: u64) {
        self.next_deadline = now.saturating_add(self.interval);
    }

    pub fn interval(&self) -> u64 {
        self.interval
    }

    pub fn next_deadline(&self) -> u64 {
        self.next_deadline
    }

    /// Returns whether a broadcast is due, advancing the deadline if so.
    pub fn poll(&mut self, now: u64) -> bool {
        if now < self.next_deadline {
            return false;
        }
        self.next_deadline = self.next_deadline.saturating_add(self.interval);
        true
    }

    /// Collects the latest state of every tracked entity when a broadcast is due.
    pub fn collect(&mut self, now: u64, store: &StateHistoryStore) -> Option<Vec<ReplicatedState>> {
        if !self.poll(now) {
            return None;
        }

        let states: Vec<ReplicatedState> = store
            .tracked()
            .into_iter()
            .filter_map(|entity| {
                store
                    .latest(entity)
                    .map(|state| ReplicatedState::new(entity, &state))
            })
            .collect();

        debug!(
            "Replicating {} states at {} ms, next at {} ms",
            states.len(),
            now,
            self.next_deadline
        );
        Some(states)
    }
}
