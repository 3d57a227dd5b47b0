//! In-process entity store
//!
//! Holds the game objects the prediction system works on: their capability
//! flags, displayed transform, owning client and movement parameters. The
//! prediction core only sees this store through its traits, never through
//! the entity records themselves.

use crate::lag_compensation::EntityOwners;
use crate::prediction::CharacterSource;
use crate::stepper::{EntityContext, EntityContexts, MovementSettings};
use crate::time_shift::{Pose, TransformSink};
use log::info;
use nalgebra::{UnitQuaternion, Vector3};
use shared::{CharacterState, ClientId, EntityId, MovementMode};
use std::collections::HashMap;

/// Default collision radius used for directional queries.
pub const CHARACTER_RADIUS: f32 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    pub movement: bool,
    pub location: bool,
}

impl Capabilities {
    pub const CHARACTER: Capabilities = Capabilities {
        movement: true,
        location: true,
    };

    /// Whether the prediction system should track the entity.
    pub fn is_character(&self) -> bool {
        self.movement && self.location
    }
}

#[derive(Debug, Clone)]
pub struct WorldEntity {
    pub id: EntityId,
    pub capabilities: Capabilities,
    pub pose: Pose,
    pub velocity: Vector3<f32>,
    pub movement_mode: MovementMode,
    pub grounded: bool,
    pub owner: Option<ClientId>,
    pub settings: MovementSettings,
    pub radius: f32,
}

#[derive(Debug)]
pub struct EntityWorld {
    entities: HashMap<EntityId, WorldEntity>,
    next_entity_id: u64,
}

impl Default for EntityWorld {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityWorld {
    pub fn new() -> Self {
        Self {
            entities: HashMap::new(),
            next_entity_id: 1,
        }
    }

    pub fn spawn(&mut self, pose: Pose, capabilities: Capabilities, owner: Option<ClientId>) -> EntityId {
        let id = EntityId(self.next_entity_id);
        self.next_entity_id += 1;

        self.entities.insert(
            id,
            WorldEntity {
                id,
                capabilities,
                pose,
                velocity: Vector3::zeros(),
                movement_mode: MovementMode::default(),
                grounded: false,
                owner,
                settings: MovementSettings::default(),
                radius: CHARACTER_RADIUS,
            },
        );
        info!("Spawned {} at {:?}", id, pose.position);
        id
    }

    /// Spawns a character for a client at a spawn point derived from its id.
    pub fn spawn_character(&mut self, client_id: ClientId) -> EntityId {
        let spawn_x = (client_id as f32 * 3.0) % 30.0;
        let pose = Pose::new(Vector3::new(spawn_x, 0.0, 0.0), UnitQuaternion::identity());
        self.spawn(pose, Capabilities::CHARACTER, Some(client_id))
    }

    pub fn despawn(&mut self, entity: EntityId) -> Option<WorldEntity> {
        let removed = self.entities.remove(&entity);
        if removed.is_some() {
            info!("Despawned {}", entity);
        }
        removed
    }

    pub fn get(&self, entity: EntityId) -> Option<&WorldEntity> {
        self.entities.get(&entity)
    }

    pub fn get_mut(&mut self, entity: EntityId) -> Option<&mut WorldEntity> {
        self.entities.get_mut(&entity)
    }

    pub fn pose(&self, entity: EntityId) -> Option<Pose> {
        self.entities.get(&entity).map(|record| record.pose)
    }

    pub fn entity_owned_by(&self, client: ClientId) -> Option<EntityId> {
        let mut owned: Vec<EntityId> = self
            .entities
            .values()
            .filter(|record| record.owner == Some(client) && record.capabilities.is_character())
            .map(|record| record.id)
            .collect();
        owned.sort_unstable();
        owned.first().copied()
    }

    /// Snapshot of entity ownership, for queries that also write transforms.
    pub fn owners(&self) -> HashMap<EntityId, ClientId> {
        self.entities
            .values()
            .filter_map(|record| record.owner.map(|owner| (record.id, owner)))
            .collect()
    }

    /// Snapshot of every entity's stepping context.
    pub fn contexts(&self) -> HashMap<EntityId, EntityContext> {
        self.entities
            .values()
            .map(|record| {
                (
                    record.id,
                    EntityContext {
                        entity: record.id,
                        settings: record.settings,
                    },
                )
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Casts a ray against the displayed transform of every character.
    ///
    /// Characters are spheres of their `radius`. Returns the nearest hit
    /// within `max_distance` and its distance along the ray, skipping `exclude`.
    pub fn ray_cast(
        &self,
        origin: Vector3<f32>,
        direction: Vector3<f32>,
        max_distance: f32,
        exclude: Option<EntityId>,
    ) -> Option<(EntityId, f32)> {
        let direction = direction.try_normalize(f32::EPSILON)?;

        self.entities
            .values()
            .filter(|record| Some(record.id) != exclude && record.capabilities.is_character())
            .filter_map(|record| {
                ray_sphere(origin, direction, record.pose.position, record.radius)
                    .filter(|distance| *distance <= max_distance)
                    .map(|distance| (record.id, distance))
            })
            .min_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)))
    }
}

/// Distance along a normalized ray to the first intersection with a sphere.
fn ray_sphere(origin: Vector3<f32>, direction: Vector3<f32>, center: Vector3<f32>, radius: f32) -> Option<f32> {
    let to_center = center - origin;
    let along = to_center.dot(&direction);
    let closest_sq = to_center.norm_squared() - along * along;
    let radius_sq = radius * radius;
    if closest_sq > radius_sq {
        return None;
    }

    let half_chord = (radius_sq - closest_sq).sqrt();
    let near = along - half_chord;
    let far = along + half_chord;
    if far < 0.0 {
        None
    } else if near < 0.0 {
        // Origin inside the sphere
        Some(0.0)
    } else {
        Some(near)
    }
}

impl TransformSink for EntityWorld {
    fn apply_transform(&mut self, entity: EntityId, position: Vector3<f32>, rotation: UnitQuaternion<f32>) {
        if let Some(record) = self.entities.get_mut(&entity) {
            record.pose = Pose::new(position, rotation);
        }
    }

    fn apply_state(&mut self, entity: EntityId, state: &CharacterState) {
        if let Some(record) = self.entities.get_mut(&entity) {
            record.pose = Pose::of(state);
            record.velocity = state.velocity;
            record.movement_mode = state.movement_mode;
            record.grounded = state.grounded;
        }
    }
}

impl EntityOwners for EntityWorld {
    fn owner_of(&self, entity: EntityId) -> Option<ClientId> {
        self.entities.get(&entity).and_then(|record| record.owner)
    }
}

impl EntityContexts for EntityWorld {
    fn context(&self, entity: EntityId) -> Option<EntityContext> {
        self.entities.get(&entity).map(|record| EntityContext {
            entity,
            settings: record.settings,
        })
    }
}

impl CharacterSource for EntityWorld {
    fn characters(&self) -> Vec<(EntityId, Pose)> {
        let mut characters: Vec<(EntityId, Pose)> = self
            .entities
            .values()
            .filter(|record| record.capabilities.is_character())
            .map(|record| (record.id, record.pose))
            .collect();
        characters.sort_unstable_by_key(|(entity, _)| *entity);
        characters
    }
}
