//! Reconstructing an entity's pose at an arbitrary past time
//!
//! Both the per-tick renderer and the lag compensator display entities at a
//! point in time other than "now". They share the algorithm in this module:
//! bracket the requested time in the entity's history, then interpolate
//! between the two samples or extrapolate past the newest one. If the time
//! predates every retained sample nothing is applied and the entity keeps
//! whatever transform it displayed before.

use crate::history::{Bracket, StateHistoryStore};
use nalgebra::{UnitQuaternion, Vector3};
use shared::{CharacterState, EntityId};
use std::collections::HashMap;

/// Position and orientation of an entity as displayed in the world.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub position: Vector3<f32>,
    pub rotation: UnitQuaternion<f32>,
}

impl Pose {
    pub fn new(position: Vector3<f32>, rotation: UnitQuaternion<f32>) -> Self {
        Self { position, rotation }
    }

    pub fn of(state: &CharacterState) -> Self {
        Self::new(state.position, state.rotation)
    }
}

/// Receives transforms for entities owned by the external entity store.
///
/// `apply_transform` is used for visual, time-shifted display.
/// `apply_state` is the authoritative path taken when an input has been
/// processed; stores that keep more than the transform (velocity, mode)
/// override it.
pub trait TransformSink {
    fn apply_transform(&mut self, entity: EntityId, position: Vector3<f32>, rotation: UnitQuaternion<f32>);

    fn apply_state(&mut self, entity: EntityId, state: &CharacterState) {
        self.apply_transform(entity, state.position, state.rotation);
    }
}

impl TransformSink for HashMap<EntityId, Pose> {
    fn apply_transform(&mut self, entity: EntityId, position: Vector3<f32>, rotation: UnitQuaternion<f32>) {
        self.insert(entity, Pose::new(position, rotation));
    }
}

/// `now - delay`, or `None` when that lies before the clock's origin.
///
/// No state can be older than time zero, so a `None` render time always
/// means "insufficient data".
pub fn delayed_time(now: u64, delay: u64) -> Option<u64> {
    now.checked_sub(delay)
}

/// Blends two bracketing samples at `time`.
///
/// `time` is expected to lie in `[previous.time, next.time)`. Landing exactly
/// on `previous.time` returns the sample unchanged.
pub fn interpolate(previous: &CharacterState, next: &CharacterState, time: u64) -> Pose {
    if time <= previous.time || next.time <= previous.time {
        return Pose::of(previous);
    }

    let span = (next.time - previous.time) as f64;
    let t = ((time - previous.time) as f64 / span).min(1.0) as f32;

    let position = previous.position.lerp(&next.position, t);
    let rotation = previous
        .rotation
        .try_slerp(&next.rotation, t, 1.0e-6)
        .unwrap_or_else(|| previous.rotation.nlerp(&next.rotation, t));

    Pose::new(position, rotation)
}

/// Projects the newest sample forward along its velocity.
///
/// Orientation is held; no collision is re-resolved.
pub fn extrapolate(previous: &CharacterState, time: u64) -> Pose {
    if time <= previous.time {
        return Pose::of(previous);
    }

    let elapsed = (time - previous.time) as f32 / 1000.0;
    Pose::new(previous.position + previous.velocity * elapsed, previous.rotation)
}

/// Resolves a bracket into a pose, or `None` when `time` predates it.
pub fn pose_at(bracket: &Bracket, time: u64) -> Option<Pose> {
    let previous = bracket.previous.as_ref()?;
    Some(match &bracket.next {
        Some(next) => interpolate(previous, next, time),
        None => extrapolate(previous, time),
    })
}

/// Displays `entity` as it was at `time`.
///
/// Returns whether a transform was applied. Unknown entities and times
/// older than the retained history leave the sink untouched.
pub fn set_to_time<S: TransformSink + ?Sized>(
    store: &StateHistoryStore,
    entity: EntityId,
    time: Option<u64>,
    sink: &mut S,
) -> bool {
    let Some(time) = time else {
        return false;
    };

    match pose_at(&store.find_bracket(entity, time), time) {
        Some(pose) => {
            sink.apply_transform(entity, pose.position, pose.rotation);
            true
        }
        None => false,
    }
}
