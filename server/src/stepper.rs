//! Movement stepping contract
//!
//! The prediction system never resolves motion itself. It hands the last
//! authoritative state and the next input to a [`MovementStepper`] and
//! stores whatever comes back. A stepper must be deterministic: the same
//! state, input and world produce the same result, and the resulting state
//! carries the input's timestamp.

use nalgebra::Vector3;
use shared::{CharacterMoveInput, CharacterState, EntityId, MovementMode};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum StepFailure {
    #[error("input at {input} ms does not advance the state at {last} ms")]
    NonIncreasingTime { last: u64, input: u64 },
    #[error("degenerate input: {0}")]
    DegenerateInput(String),
    #[error("world query failed: {0}")]
    WorldQuery(String),
}

/// Per-character movement parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MovementSettings {
    /// Horizontal speed in units per second.
    pub walk_speed: f32,
    pub run_factor: f32,
    pub jump_speed: f32,
    pub gravity: f32,
    pub max_fall_speed: f32,
}

impl Default for MovementSettings {
    fn default() -> Self {
        Self {
            walk_speed: 5.0,
            run_factor: 1.5,
            jump_speed: 8.0,
            gravity: 9.81,
            max_fall_speed: 50.0,
        }
    }
}

/// What a stepper may know about the entity it advances.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EntityContext {
    pub entity: EntityId,
    pub settings: MovementSettings,
}

impl EntityContext {
    pub fn new(entity: EntityId) -> Self {
        Self {
            entity,
            settings: MovementSettings::default(),
        }
    }
}

/// Resolves the stepping context of a tracked entity.
pub trait EntityContexts {
    fn context(&self, entity: EntityId) -> Option<EntityContext>;
}

impl EntityContexts for HashMap<EntityId, EntityContext> {
    fn context(&self, entity: EntityId) -> Option<EntityContext> {
        self.get(&entity).copied()
    }
}

/// Advances one authoritative state by one input.
pub trait MovementStepper {
    fn step(
        &self,
        last: &CharacterState,
        input: &CharacterMoveInput,
        context: &EntityContext,
    ) -> Result<CharacterState, StepFailure>;
}

/// Kinematic stepper over a flat floor.
///
/// Walking characters accelerate instantly to the requested horizontal
/// speed, fall under gravity and land on the floor plane. Ghosting and
/// swimming characters fly freely without gravity. No collision against
/// other geometry is resolved.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KinematicStepper {
    pub floor_height: f32,
}

impl Default for KinematicStepper {
    fn default() -> Self {
        Self { floor_height: 0.0 }
    }
}

impl KinematicStepper {
    pub fn new(floor_height: f32) -> Self {
        Self { floor_height }
    }

    fn free_flight(
        &self,
        last: &CharacterState,
        input: &CharacterMoveInput,
        speed: f32,
        dt: f32,
    ) -> (Vector3<f32>, Vector3<f32>, bool) {
        let velocity = clamp_unit(input.movement) * speed;
        (last.position + velocity * dt, velocity, false)
    }

    fn walk(
        &self,
        last: &CharacterState,
        input: &CharacterMoveInput,
        settings: &MovementSettings,
        speed: f32,
        dt: f32,
    ) -> (Vector3<f32>, Vector3<f32>, bool) {
        let horizontal = clamp_unit(Vector3::new(input.movement.x, 0.0, input.movement.z)) * speed;

        let mut vertical = last.velocity.y;
        let mut grounded = last.grounded;
        if grounded && input.actions.jump {
            vertical = settings.jump_speed;
            grounded = false;
        }
        if !grounded {
            vertical = (vertical - settings.gravity * dt).max(-settings.max_fall_speed);
        }

        let mut velocity = Vector3::new(horizontal.x, vertical, horizontal.z);
        let mut position = last.position + velocity * dt;

        // Land on the floor plane
        if position.y <= self.floor_height {
            position.y = self.floor_height;
            if velocity.y < 0.0 {
                velocity.y = 0.0;
            }
            grounded = velocity.y <= 0.0;
        }

        (position, velocity, grounded)
    }
}

impl MovementStepper for KinematicStepper {
    fn step(
        &self,
        last: &CharacterState,
        input: &CharacterMoveInput,
        context: &EntityContext,
    ) -> Result<CharacterState, StepFailure> {
        if input.time <= last.time {
            return Err(StepFailure::NonIncreasingTime {
                last: last.time,
                input: input.time,
            });
        }
        if !input.movement.iter().all(|component| component.is_finite()) {
            return Err(StepFailure::DegenerateInput(format!(
                "non-finite movement {:?}",
                input.movement
            )));
        }

        let settings = &context.settings;
        let dt = (input.time - last.time) as f32 / 1000.0;
        let mut speed = settings.walk_speed;
        if input.actions.run {
            speed *= settings.run_factor;
        }

        let (position, velocity, grounded, movement_mode) = match last.movement_mode {
            MovementMode::Ghosting => {
                let (p, v, g) = self.free_flight(last, input, speed, dt);
                (p, v, g, MovementMode::Ghosting)
            }
            MovementMode::Swimming => {
                let (p, v, g) = self.free_flight(last, input, speed * 0.5, dt);
                (p, v, g, MovementMode::Swimming)
            }
            MovementMode::Walking | MovementMode::Falling | MovementMode::Climbing => {
                let (p, v, g) = self.walk(last, input, settings, speed, dt);
                let mode = if g {
                    MovementMode::Walking
                } else {
                    MovementMode::Falling
                };
                (p, v, g, mode)
            }
        };

        Ok(CharacterState {
            time: input.time,
            sequence: last.sequence.wrapping_add(1),
            position,
            rotation: input.look_rotation,
            velocity,
            movement_mode,
            grounded,
        })
    }
}

/// Scales a direction down to unit length, leaving shorter vectors alone.
fn clamp_unit(direction: Vector3<f32>) -> Vector3<f32> {
    let magnitude = direction.norm();
    if magnitude > 1.0 {
        direction / magnitude
    } else {
        direction
    }
}
