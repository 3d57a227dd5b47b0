//! Performance benchmarks for critical prediction paths

use nalgebra::{UnitQuaternion, Vector3};
use server::config::PredictionConfig;
use server::history::StateHistoryStore;
use server::prediction::ServerPredictionSystem;
use server::stepper::{EntityContexts, KinematicStepper};
use server::time_shift::{pose_at, Pose};
use server::world::{Capabilities, EntityWorld};
use shared::{ActionFlags, CharacterMoveInput, CharacterState, EntityId, ReplicatedState};
use std::time::Instant;

fn state(time: u64, x: f32) -> CharacterState {
    CharacterState {
        velocity: Vector3::new(1.0, 0.0, 0.0),
        ..CharacterState::initial(time, Vector3::new(x, 0.0, 0.0), UnitQuaternion::identity())
    }
}

/// Benchmarks bracket search over a full history
#[test]
fn benchmark_bracket_search() {
    let mut store = StateHistoryStore::new(shared::HISTORY_CAPACITY);
    let entity = EntityId(1);
    store.create(entity, state(0, 0.0)).unwrap();
    for i in 1..shared::HISTORY_CAPACITY as u64 {
        store.append(entity, state(i * 16, i as f32)).unwrap();
    }

    let iterations = 100_000u64;
    let span = shared::HISTORY_CAPACITY as u64 * 16;
    let start = Instant::now();

    let mut found = 0;
    for i in 0..iterations {
        let time = (i * 7) % span;
        if pose_at(&store.find_bracket(entity, time), time).is_some() {
            found += 1;
        }
    }

    let duration = start.elapsed();
    println!(
        "Bracket search: {} iterations in {:?} ({:.2} ns/iter)",
        iterations,
        duration,
        duration.as_nanos() as f64 / iterations as f64
    );

    assert_eq!(found, iterations);
    // Should complete in under 1 second for 100k iterations
    assert!(duration.as_millis() < 1000);
}

/// Benchmarks appending past capacity, where every append evicts
#[test]
fn benchmark_history_append() {
    let mut store = StateHistoryStore::new(shared::HISTORY_CAPACITY);
    let entities: Vec<EntityId> = (1..=100).map(EntityId).collect();
    for entity in &entities {
        store.create(*entity, state(0, 0.0)).unwrap();
    }

    let frames = 1_000u64;
    let start = Instant::now();

    for frame in 1..=frames {
        for entity in &entities {
            store.append(*entity, state(frame, frame as f32)).unwrap();
        }
    }

    let duration = start.elapsed();
    println!(
        "History append: {} entities × {} frames in {:?} ({:.2} μs/frame)",
        entities.len(),
        frames,
        duration,
        duration.as_micros() as f64 / frames as f64
    );

    for entity in &entities {
        assert_eq!(store.len(*entity), shared::HISTORY_CAPACITY);
    }
    // Should complete in under 2 seconds
    assert!(duration.as_millis() < 2000);
}

/// Benchmarks full simulation ticks with many characters
#[test]
fn benchmark_simulation_tick() {
    let mut world = EntityWorld::new();
    for i in 0..64 {
        world.spawn(
            Pose::new(Vector3::new(i as f32, 0.0, 0.0), UnitQuaternion::identity()),
            Capabilities::CHARACTER,
            Some(i),
        );
    }
    let mut system =
        ServerPredictionSystem::new(PredictionConfig::default(), KinematicStepper::default()).unwrap();
    system.init(0);
    system.sync_entities(0, &world);

    let ticks = 500u64;
    let start = Instant::now();
    let mut broadcasts = 0;

    for tick in 1..=ticks {
        let now = tick * 16;
        for (entity, _) in server::prediction::CharacterSource::characters(&world) {
            let Some(context) = world.context(entity) else {
                continue;
            };
            let input = CharacterMoveInput {
                sequence: tick as u32,
                time: now,
                movement: Vector3::new(1.0, 0.0, (tick % 3) as f32 - 1.0),
                look_rotation: UnitQuaternion::identity(),
                actions: ActionFlags {
                    jump: tick % 50 == 0,
                    run: tick % 2 == 0,
                },
            };
            system
                .on_input(now, entity, &input, &context, &mut world)
                .unwrap();
        }
        let contexts = world.contexts();
        if system.update(now, None, &contexts, &mut world).is_some() {
            broadcasts += 1;
        }
    }

    let duration = start.elapsed();
    println!(
        "Simulation: {} characters × {} ticks in {:?} ({:.2} μs/tick)",
        world.len(),
        ticks,
        duration,
        duration.as_micros() as f64 / ticks as f64
    );

    // 8000 ms of simulated time at one broadcast per 50 ms
    assert_eq!(broadcasts, 160);
    // Should complete in under 5 seconds
    assert!(duration.as_millis() < 5000);
}

/// Benchmarks network packet serialization performance
#[test]
fn benchmark_packet_serialization() {
    use bincode::{deserialize, serialize};
    use shared::Packet;

    let states: Vec<ReplicatedState> = (0..50)
        .map(|i| ReplicatedState::new(EntityId(i), &state(i * 10, i as f32)))
        .collect();

    let packet = Packet::CharacterStates {
        server_time: 1234567890,
        states,
    };

    let iterations = 10_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let serialized = serialize(&packet).unwrap();
        let _deserialized: Packet = deserialize(&serialized).unwrap();
    }

    let duration = start.elapsed();
    println!(
        "Packet serialization: {} iterations in {:?} ({:.2} μs/iter)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    // Should complete in under 2 seconds
    assert!(duration.as_millis() < 2000);
}
