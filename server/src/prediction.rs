//! Authoritative character prediction
//!
//! [`ServerPredictionSystem`] is the single owner of the state histories and
//! drives the per-tick work:
//!
//! - inputs are stepped through the [`MovementStepper`], appended to the
//!   entity's history and applied to the entity as its authoritative state
//! - the replication scheduler decides whether the latest states go out
//! - the renderer moves every remote character to the delayed render time
//! - lag compensation rewinds and restores the displayed world on request
//!
//! Everything runs on the simulation task, one call at a time. The system
//! never dereferences game objects: entity data reaches it through the
//! [`CharacterSource`], [`EntityContexts`], [`EntityOwners`] and
//! [`TransformSink`] traits implemented by the entity store.

use crate::config::{ConfigError, PredictionConfig};
use crate::history::{HistoryError, StateHistoryStore};
use crate::lag_compensation::{CompensationError, CompensationRequest, EntityOwners, LagCompensator};
use crate::renderer::TimeShiftRenderer;
use crate::replication::ReplicationScheduler;
use crate::stepper::{EntityContext, EntityContexts, MovementStepper, StepFailure};
use crate::time_shift::{Pose, TransformSink};
use log::{debug, info, warn};
use shared::{CharacterMoveInput, CharacterState, EntityId, ReplicatedState};
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum InputError {
    #[error("input for {entity} at {time} ms is beyond the accepted limit of {limit} ms")]
    Overflow { entity: EntityId, time: u64, limit: u64 },
    #[error(transparent)]
    Step(#[from] StepFailure),
    #[error(transparent)]
    History(#[from] HistoryError),
}

/// Enumerates the entities that currently carry both the movement and the
/// location capability, together with their current transform.
pub trait CharacterSource {
    fn characters(&self) -> Vec<(EntityId, Pose)>;
}

/// Entities whose tracking changed during [`ServerPredictionSystem::sync_entities`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub attached: Vec<EntityId>,
    pub detached: Vec<EntityId>,
}

pub struct ServerPredictionSystem<M: MovementStepper> {
    config: PredictionConfig,
    stepper: M,
    store: StateHistoryStore,
    scheduler: ReplicationScheduler,
    renderer: TimeShiftRenderer,
    compensator: LagCompensator,
}

impl<M: MovementStepper> ServerPredictionSystem<M> {
    pub fn new(config: PredictionConfig, stepper: M) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            stepper,
            store: StateHistoryStore::new(config.history_capacity),
            scheduler: ReplicationScheduler::new(config.replication_interval_ms, 0),
            renderer: TimeShiftRenderer::new(config.render_delay_ms),
            compensator: LagCompensator::new(config.render_delay_ms),
        })
    }

    /// Starts the system at server time `now`.
    pub fn init(&mut self, now: u64) {
        self.scheduler.reset(now);
        info!(
            "Prediction system started at {} ms (replication every {} ms, render delay {} ms)",
            now, self.config.replication_interval_ms, self.config.render_delay_ms
        );
    }

    /// Stops the system, dropping every history.
    pub fn shutdown(&mut self) {
        info!(
            "Prediction system stopped, dropping {} histories",
            self.store.entity_count()
        );
        self.store.clear();
    }

    pub fn config(&self) -> &PredictionConfig {
        &self.config
    }

    pub fn store(&self) -> &StateHistoryStore {
        &self.store
    }

    pub fn stepper(&self) -> &M {
        &self.stepper
    }

    pub fn compensator(&self) -> &LagCompensator {
        &self.compensator
    }

    pub fn is_tracked(&self, entity: EntityId) -> bool {
        self.store.contains(entity)
    }

    pub fn latest(&self, entity: EntityId) -> Option<CharacterState> {
        self.store.latest(entity)
    }

    /// Starts tracking an entity that gained movement and location.
    pub fn on_attach(&mut self, now: u64, entity: EntityId, pose: Pose) -> Result<(), HistoryError> {
        let initial = CharacterState::initial(now, pose.position, pose.rotation);
        self.store.create(entity, initial)?;
        info!("Tracking {} at {:?}", entity, pose.position);
        Ok(())
    }

    /// Stops tracking an entity that lost movement or location.
    pub fn on_detach(&mut self, entity: EntityId) -> bool {
        let removed = self.store.remove(entity);
        if removed {
            info!("Stopped tracking {}", entity);
        }
        removed
    }

    /// Reconciles the tracked set with the entities that currently qualify.
    pub fn sync_entities<C: CharacterSource + ?Sized>(&mut self, now: u64, source: &C) -> SyncReport {
        let characters = source.characters();
        let present: HashSet<EntityId> = characters.iter().map(|(entity, _)| *entity).collect();
        let mut report = SyncReport::default();

        for entity in self.store.tracked() {
            if !present.contains(&entity) && self.on_detach(entity) {
                report.detached.push(entity);
            }
        }

        for (entity, pose) in characters {
            if self.store.contains(entity) {
                continue;
            }
            if self.on_attach(now, entity, pose).is_ok() {
                report.attached.push(entity);
            }
        }

        report.attached.sort_unstable();
        report
    }

    /// Processes one movement input for `entity`.
    ///
    /// The new state is appended to the history and applied to the entity as
    /// its authoritative state. Returns `Ok(None)` for untracked entities.
    ///
    /// Inputs stamped at or before the latest state are clamped to one
    /// millisecond after it. Inputs too far ahead of the server clock, and
    /// inputs the stepper rejects, are dropped; the entity keeps its last
    /// valid state.
    pub fn on_input<S: TransformSink + ?Sized>(
        &mut self,
        now: u64,
        entity: EntityId,
        input: &CharacterMoveInput,
        context: &EntityContext,
        sink: &mut S,
    ) -> Result<Option<CharacterState>, InputError> {
        let Some(latest) = self.store.latest(entity) else {
            return Ok(None);
        };

        let limit = now.saturating_add(self.config.max_input_overflow_ms);
        if input.time > limit {
            warn!(
                "Dropping input {} for {}: stamped {} ms, limit {} ms",
                input.sequence, entity, input.time, limit
            );
            return Err(InputError::Overflow {
                entity,
                time: input.time,
                limit,
            });
        }

        let mut input = input.clone();
        if input.time <= latest.time {
            debug!(
                "Clamping input {} for {} from {} ms to {} ms",
                input.sequence,
                entity,
                input.time,
                latest.time + 1
            );
            input.time = latest.time + 1;
        }

        self.step_and_apply(entity, &latest, &input, context, sink)
            .map(Some)
    }

    /// Runs one simulation tick.
    ///
    /// Returns the states to broadcast when replication is due. `viewer` is
    /// the local player's character, if this process has one; it is left at
    /// its authoritative state instead of the delayed render time.
    ///
    /// Must not run while a lag-compensation window is open.
    pub fn update<C, S>(
        &mut self,
        now: u64,
        viewer: Option<EntityId>,
        contexts: &C,
        sink: &mut S,
    ) -> Option<Vec<ReplicatedState>>
    where
        C: EntityContexts + ?Sized,
        S: TransformSink + ?Sized,
    {
        self.advance_silent(now, contexts, sink);
        let replicated = self.scheduler.collect(now, &self.store);
        self.renderer.update(now, &self.store, viewer, sink);
        replicated
    }

    /// The latest state of every tracked entity, for on-demand sends.
    pub fn snapshot(&self) -> Vec<ReplicatedState> {
        self.store
            .tracked()
            .into_iter()
            .filter_map(|entity| {
                self.store
                    .latest(entity)
                    .map(|state| ReplicatedState::new(entity, &state))
            })
            .collect()
    }

    pub fn begin_compensation<O, S>(
        &mut self,
        request: CompensationRequest,
        owners: &O,
        sink: &mut S,
    ) -> Result<usize, CompensationError>
    where
        O: EntityOwners + ?Sized,
        S: TransformSink + ?Sized,
    {
        self.compensator.begin(request, &self.store, owners, sink)
    }

    pub fn restore_to_present<S: TransformSink + ?Sized>(&mut self, now: u64, sink: &mut S) -> usize {
        self.compensator.restore_to_present(now, &self.store, sink)
    }

    /// Runs `query` against the world as the requesting client saw it.
    pub fn compensate<O, S, R, F>(
        &mut self,
        request: CompensationRequest,
        now: u64,
        owners: &O,
        sink: &mut S,
        query: F,
    ) -> Result<R, CompensationError>
    where
        O: EntityOwners + ?Sized,
        S: TransformSink + ?Sized,
        F: FnOnce(&S) -> R,
    {
        self.compensator
            .compensate(request, now, &self.store, owners, sink, query)
    }

    fn step_and_apply<S: TransformSink + ?Sized>(
        &mut self,
        entity: EntityId,
        latest: &CharacterState,
        input: &CharacterMoveInput,
        context: &EntityContext,
        sink: &mut S,
    ) -> Result<CharacterState, InputError> {
        let state = match self.stepper.step(latest, input, context) {
            Ok(state) => state,
            Err(failure) => {
                warn!(
                    "Dropping input {} for {}: {}",
                    input.sequence, entity, failure
                );
                return Err(failure.into());
            }
        };

        self.store.append(entity, state)?;
        sink.apply_state(entity, &state);
        Ok(state)
    }

    /// Steps entities whose client has gone quiet with an idle input, so
    /// their authoritative state keeps up with the server clock.
    fn advance_silent<C, S>(&mut self, now: u64, contexts: &C, sink: &mut S)
    where
        C: EntityContexts + ?Sized,
        S: TransformSink + ?Sized,
    {
        let Some(horizon) = now.checked_sub(self.config.max_input_underflow_ms) else {
            return;
        };

        for entity in self.store.tracked() {
            let Some(latest) = self.store.latest(entity) else {
                continue;
            };
            if latest.time >= horizon {
                continue;
            }

            let context = contexts
                .context(entity)
                .unwrap_or_else(|| EntityContext::new(entity));
            let idle = CharacterMoveInput::idle(latest.sequence, horizon, latest.rotation);
            if self
                .step_and_apply(entity, &latest, &idle, &context, sink)
                .is_ok()
            {
                debug!("Advanced silent {} to {} ms", entity, horizon);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use nalgebra::{UnitQuaternion, Vector3};
    use shared::ActionFlags;
    use std::cell::Cell;
    use std::collections::HashMap;

    /// Moves the character by its input vector per second, nothing else.
    struct LinearStepper;

    impl MovementStepper for LinearStepper {
        fn step(
            &self,
            last: &CharacterState,
            input: &CharacterMoveInput,
            _context: &EntityContext,
        ) -> Result<CharacterState, StepFailure> {
            if input.movement.x < 0.0 {
                return Err(StepFailure::WorldQuery("blocked".to_string()));
            }
            let dt = (input.time - last.time) as f32 / 1000.0;
            Ok(CharacterState {
                time: input.time,
                sequence: last.sequence + 1,
                position: last.position + input.movement * dt,
                rotation: input.look_rotation,
                velocity: input.movement,
                ..*last
            })
        }
    }

    /// Returns a state with a stale timestamp on the second call.
    struct BrokenClockStepper {
        calls: Cell<u32>,
    }

    impl MovementStepper for BrokenClockStepper {
        fn step(
            &self,
            last: &CharacterState,
            input: &CharacterMoveInput,
            _context: &EntityContext,
        ) -> Result<CharacterState, StepFailure> {
            self.calls.set(self.calls.get() + 1);
            let time = if self.calls.get() == 2 { last.time } else { input.time };
            Ok(CharacterState { time, ..*last })
        }
    }

    struct NoContexts;

    impl EntityContexts for NoContexts {
        fn context(&self, _entity: EntityId) -> Option<EntityContext> {
            None
        }
    }

    struct Characters(Vec<(EntityId, Pose)>);

    impl CharacterSource for Characters {
        fn characters(&self) -> Vec<(EntityId, Pose)> {
            self.0.clone()
        }
    }

    fn origin() -> Pose {
        Pose::new(Vector3::zeros(), UnitQuaternion::identity())
    }

    fn move_input(time: u64, x: f32) -> CharacterMoveInput {
        CharacterMoveInput {
            sequence: time as u32,
            time,
            movement: Vector3::new(x, 0.0, 0.0),
            look_rotation: UnitQuaternion::identity(),
            actions: ActionFlags::default(),
        }
    }

    fn system() -> ServerPredictionSystem<LinearStepper> {
        let mut system = ServerPredictionSystem::new(PredictionConfig::default(), LinearStepper).unwrap();
        system.init(0);
        system
    }

    #[test]
    fn test_rejects_invalid_config() {
        let config = PredictionConfig {
            history_capacity: 0,
            ..Default::default()
        };
        assert!(ServerPredictionSystem::new(config, LinearStepper).is_err());
    }

    #[test]
    fn test_input_is_stepped_stored_and_applied() {
        let mut system = system();
        let entity = EntityId(1);
        let mut sink: HashMap<EntityId, Pose> = HashMap::new();
        system.on_attach(0, entity, origin()).unwrap();

        let state = system
            .on_input(50, entity, &move_input(50, 20.0), &EntityContext::new(entity), &mut sink)
            .unwrap()
            .unwrap();

        assert_eq!(state.time, 50);
        assert_approx_eq!(state.position.x, 1.0, 1e-5);
        assert_eq!(system.latest(entity), Some(state));
        assert_eq!(system.store().len(entity), 2);
        assert_eq!(sink[&entity].position, state.position);
    }

    #[test]
    fn test_duplicate_attach_is_an_error() {
        let mut system = system();
        let entity = EntityId(1);
        system.on_attach(0, entity, origin()).unwrap();
        assert_eq!(
            system.on_attach(10, entity, origin()),
            Err(HistoryError::DuplicateEntity(entity))
        );
    }

    #[test]
    fn test_stale_input_is_clamped() {
        let mut system = system();
        let entity = EntityId(1);
        let mut sink: HashMap<EntityId, Pose> = HashMap::new();
        system.on_attach(0, entity, origin()).unwrap();
        let context = EntityContext::new(entity);

        system
            .on_input(100, entity, &move_input(80, 1.0), &context, &mut sink)
            .unwrap();
        let clamped = system
            .on_input(100, entity, &move_input(60, 1.0), &context, &mut sink)
            .unwrap()
            .unwrap();

        assert_eq!(clamped.time, 81);
        let times: Vec<u64> = system.store().get(entity).unwrap().iter().map(|s| s.time).collect();
        assert_eq!(times, vec![0, 80, 81]);
    }

    #[test]
    fn test_overflowing_input_is_dropped() {
        let mut system = system();
        let entity = EntityId(1);
        let mut sink: HashMap<EntityId, Pose> = HashMap::new();
        system.on_attach(0, entity, origin()).unwrap();

        let result = system.on_input(
            100,
            entity,
            &move_input(201, 1.0),
            &EntityContext::new(entity),
            &mut sink,
        );
        assert_eq!(
            result,
            Err(InputError::Overflow {
                entity,
                time: 201,
                limit: 200
            })
        );
        assert_eq!(system.store().len(entity), 1);
        assert!(sink.is_empty());
    }

    #[test]
    fn test_step_failure_keeps_last_state() {
        let mut system = system();
        let entity = EntityId(1);
        let mut sink: HashMap<EntityId, Pose> = HashMap::new();
        system.on_attach(0, entity, origin()).unwrap();
        let context = EntityContext::new(entity);

        let result = system.on_input(50, entity, &move_input(50, -1.0), &context, &mut sink);
        assert!(matches!(result, Err(InputError::Step(_))));
        assert_eq!(system.latest(entity).unwrap().time, 0);

        // The next good input still goes through
        assert!(system
            .on_input(60, entity, &move_input(60, 1.0), &context, &mut sink)
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_stepper_breaking_monotonicity_is_reported() {
        let mut system = ServerPredictionSystem::new(
            PredictionConfig::default(),
            BrokenClockStepper { calls: Cell::new(0) },
        )
        .unwrap();
        let entity = EntityId(1);
        let mut sink: HashMap<EntityId, Pose> = HashMap::new();
        system.on_attach(0, entity, origin()).unwrap();
        let context = EntityContext::new(entity);

        system
            .on_input(10, entity, &move_input(10, 0.0), &context, &mut sink)
            .unwrap();
        let result = system.on_input(20, entity, &move_input(20, 0.0), &context, &mut sink);
        assert!(matches!(
            result,
            Err(InputError::History(HistoryError::NonMonotonicTime { .. }))
        ));
        assert_eq!(system.store().len(entity), 2);
    }

    #[test]
    fn test_input_for_unknown_entity_is_ignored() {
        let mut system = system();
        let mut sink: HashMap<EntityId, Pose> = HashMap::new();
        let ghost = EntityId(77);

        let result = system.on_input(10, ghost, &move_input(10, 1.0), &EntityContext::new(ghost), &mut sink);
        assert_eq!(result, Ok(None));
    }

    #[test]
    fn test_sync_entities_attaches_and_detaches() {
        let mut system = system();

        let first = Characters(vec![(EntityId(2), origin()), (EntityId(1), origin())]);
        let report = system.sync_entities(0, &first);
        assert_eq!(report.attached, vec![EntityId(1), EntityId(2)]);
        assert!(report.detached.is_empty());

        let second = Characters(vec![(EntityId(2), origin()), (EntityId(3), origin())]);
        let report = system.sync_entities(10, &second);
        assert_eq!(report.attached, vec![EntityId(3)]);
        assert_eq!(report.detached, vec![EntityId(1)]);
        assert_eq!(system.store().tracked(), vec![EntityId(2), EntityId(3)]);
        assert_eq!(system.latest(EntityId(3)).unwrap().time, 10);
    }

    #[test]
    fn test_update_replicates_on_schedule() {
        let mut system = system();
        let mut sink: HashMap<EntityId, Pose> = HashMap::new();
        system.on_attach(0, EntityId(1), origin()).unwrap();

        assert!(system.update(20, None, &NoContexts, &mut sink).is_none());
        let states = system.update(50, None, &NoContexts, &mut sink).unwrap();
        assert_eq!(states.len(), 1);
        assert!(system.update(60, None, &NoContexts, &mut sink).is_none());
        assert!(system.update(100, None, &NoContexts, &mut sink).is_some());
    }

    #[test]
    fn test_update_advances_silent_entities() {
        let mut system = system();
        let entity = EntityId(1);
        let mut sink: HashMap<EntityId, Pose> = HashMap::new();
        system.on_attach(0, entity, origin()).unwrap();

        system.update(100, None, &NoContexts, &mut sink);
        assert_eq!(system.store().len(entity), 1);

        system.update(250, None, &NoContexts, &mut sink);
        assert_eq!(system.latest(entity).unwrap().time, 150);
        assert_eq!(system.store().len(entity), 2);
    }

    #[test]
    fn test_shutdown_drops_histories() {
        let mut system = system();
        system.on_attach(0, EntityId(1), origin()).unwrap();
        system.shutdown();
        assert_eq!(system.store().entity_count(), 0);
        assert!(!system.is_tracked(EntityId(1)));
    }

    #[test]
    fn test_snapshot_lists_latest_states() {
        let mut system = system();
        let mut sink: HashMap<EntityId, Pose> = HashMap::new();
        system.on_attach(0, EntityId(1), origin()).unwrap();
        system.on_attach(0, EntityId(2), origin()).unwrap();
        system
            .on_input(30, EntityId(2), &move_input(30, 1.0), &EntityContext::new(EntityId(2)), &mut sink)
            .unwrap();

        let snapshot = system.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[1].entity_id, 2);
        assert_eq!(snapshot[1].time, 30);
    }
}
