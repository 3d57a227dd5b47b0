use nalgebra::{Quaternion, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: u32 = 1;

/// Number of states retained per entity.
pub const HISTORY_CAPACITY: usize = 128;
/// Milliseconds between two replication broadcasts.
pub const REPLICATION_INTERVAL_MS: u64 = 50;
/// How far behind the server clock remote entities are displayed.
pub const RENDER_DELAY_MS: u64 = 100;
pub const MAX_INPUT_OVERFLOW_MS: u64 = 100;
pub const MAX_INPUT_UNDERFLOW_MS: u64 = 100;

/// Client identifiers are assigned by the server's client manager.
pub type ClientId = u32;

/// Opaque handle of an entity owned by the entity store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(pub u64);

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "entity#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MovementMode {
    #[default]
    Walking,
    Falling,
    Swimming,
    Climbing,
    Ghosting,
}

/// One timestamped authoritative snapshot of a character's motion.
///
/// States are values: the history never edits one in place, a new state is
/// produced for every processed input.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CharacterState {
    /// Authoritative simulation clock in milliseconds.
    pub time: u64,
    pub sequence: u32,
    pub position: Vector3<f32>,
    pub rotation: UnitQuaternion<f32>,
    /// World units per second.
    pub velocity: Vector3<f32>,
    pub movement_mode: MovementMode,
    pub grounded: bool,
}

impl CharacterState {
    /// State used to seed a freshly tracked entity: zero velocity, default mode.
    pub fn initial(time: u64, position: Vector3<f32>, rotation: UnitQuaternion<f32>) -> Self {
        Self {
            time,
            sequence: 0,
            position,
            rotation,
            velocity: Vector3::zeros(),
            movement_mode: MovementMode::default(),
            grounded: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ActionFlags {
    pub jump: bool,
    pub run: bool,
}

/// A single movement input as received from the owning client.
#[derive(Debug, Clone, PartialEq)]
pub struct CharacterMoveInput {
    pub sequence: u32,
    /// Client-stamped time in milliseconds; becomes the resulting state's time.
    pub time: u64,
    /// Desired movement direction, not necessarily normalized.
    pub movement: Vector3<f32>,
    pub look_rotation: UnitQuaternion<f32>,
    pub actions: ActionFlags,
}

impl CharacterMoveInput {
    /// An input that requests no movement, keeping the given look rotation.
    pub fn idle(sequence: u32, time: u64, look_rotation: UnitQuaternion<f32>) -> Self {
        Self {
            sequence,
            time,
            movement: Vector3::zeros(),
            look_rotation,
            actions: ActionFlags::default(),
        }
    }
}

/// Wire form of a [`CharacterState`] for one entity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReplicatedState {
    pub entity_id: u64,
    pub time: u64,
    pub sequence: u32,
    pub position: [f32; 3],
    /// Quaternion as `[x, y, z, w]`.
    pub rotation: [f32; 4],
    pub velocity: [f32; 3],
    pub movement_mode: MovementMode,
    pub grounded: bool,
}

impl ReplicatedState {
    pub fn new(entity: EntityId, state: &CharacterState) -> Self {
        Self {
            entity_id: entity.0,
            time: state.time,
            sequence: state.sequence,
            position: state.position.into(),
            rotation: rotation_to_wire(&state.rotation),
            velocity: state.velocity.into(),
            movement_mode: state.movement_mode,
            grounded: state.grounded,
        }
    }

    pub fn entity(&self) -> EntityId {
        EntityId(self.entity_id)
    }

    pub fn to_character_state(&self) -> CharacterState {
        CharacterState {
            time: self.time,
            sequence: self.sequence,
            position: Vector3::from(self.position),
            rotation: rotation_from_wire(self.rotation),
            velocity: Vector3::from(self.velocity),
            movement_mode: self.movement_mode,
            grounded: self.grounded,
        }
    }
}

pub fn rotation_to_wire(rotation: &UnitQuaternion<f32>) -> [f32; 4] {
    let q = rotation.quaternion();
    [q.i, q.j, q.k, q.w]
}

/// Rebuilds a unit quaternion from `[x, y, z, w]`, renormalizing whatever arrived.
pub fn rotation_from_wire(raw: [f32; 4]) -> UnitQuaternion<f32> {
    let [x, y, z, w] = raw;
    let q = Quaternion::new(w, x, y, z);
    if q.norm_squared() <= f32::EPSILON {
        return UnitQuaternion::identity();
    }
    UnitQuaternion::from_quaternion(q)
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub enum Packet {
    Connect {
        client_version: u32,
    },
    Input {
        sequence: u32,
        time: u64,
        movement: [f32; 3],
        look_rotation: [f32; 4],
        jump: bool,
        run: bool,
    },
    UseItemInDirection {
        item: u64,
        direction: [f32; 3],
        client_time: u64,
    },
    Disconnect,

    Connected {
        client_id: ClientId,
        entity_id: u64,
        /// Server clock at acceptance; clients stamp inputs relative to it
        server_time: u64,
    },
    CharacterStates {
        server_time: u64,
        states: Vec<ReplicatedState>,
    },
    UseItemResult {
        item: u64,
        hit_entity: Option<u64>,
    },
    Disconnected {
        reason: String,
    },
}

impl Packet {
    pub fn from_input(input: &CharacterMoveInput) -> Self {
        Packet::Input {
            sequence: input.sequence,
            time: input.time,
            movement: input.movement.into(),
            look_rotation: rotation_to_wire(&input.look_rotation),
            jump: input.actions.jump,
            run: input.actions.run,
        }
    }

    /// Extracts the movement input carried by an `Input` packet.
    pub fn to_input(&self) -> Option<CharacterMoveInput> {
        match self {
            Packet::Input {
                sequence,
                time,
                movement,
                look_rotation,
                jump,
                run,
            } => Some(CharacterMoveInput {
                sequence: *sequence,
                time: *time,
                movement: Vector3::from(*movement),
                look_rotation: rotation_from_wire(*look_rotation),
                actions: ActionFlags {
                    jump: *jump,
                    run: *run,
                },
            }),
            _ => None,
        }
    }
}
