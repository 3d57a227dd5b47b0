//! Delayed display of remote characters

use crate::history::StateHistoryStore;
use crate::time_shift::{delayed_time, set_to_time, TransformSink};
use shared::EntityId;

/// Shows every remote character `render_delay` milliseconds in the past,
/// where the history almost always holds a sample on both sides.
///
/// The local viewer's own character is skipped: it is displayed at its
/// authoritative latest state by the prediction path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeShiftRenderer {
    render_delay: u64,
}

impl TimeShiftRenderer {
    pub fn new(render_delay: u64) -> Self {
        Self { render_delay }
    }

    pub fn render_delay(&self) -> u64 {
        self.render_delay
    }

    pub fn render_time(&self, now: u64) -> Option<u64> {
        delayed_time(now, self.render_delay)
    }

    /// Updates the visual transform of every tracked entity but `viewer`.
    ///
    /// Returns the number of entities whose transform was applied.
    pub fn update<S: TransformSink + ?Sized>(
        &self,
        now: u64,
        store: &StateHistoryStore,
        viewer: Option<EntityId>,
        sink: &mut S,
    ) -> usize {
        let render_time = self.render_time(now);
        store
            .tracked()
            .into_iter()
            .filter(|entity| Some(*entity) != viewer)
            .filter(|entity| set_to_time(store, *entity, render_time, sink))
            .count()
    }
}
