//! Bounded per-entity state history
//!
//! Every tracked character owns a ring of its most recent authoritative
//! states, ordered by time. The renderer and the lag compensator query this
//! ring for the two samples surrounding a point in time; the prediction
//! system is the only writer.
//!
//! Invariants kept by this module:
//! - states of one entity are stored in strictly increasing `time` order
//! - a ring never holds more than `capacity` states; the oldest is evicted
//! - unknown entities are never an error on read, append or remove

use log::debug;
use shared::{CharacterState, EntityId};
use std::collections::{HashMap, VecDeque};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum HistoryError {
    #[error("{0} already has a state history")]
    DuplicateEntity(EntityId),
    #[error("state at {time} ms for {entity} is not after the latest state at {latest} ms")]
    NonMonotonicTime {
        entity: EntityId,
        time: u64,
        latest: u64,
    },
}

/// The retained samples surrounding a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Bracket {
    /// Retained state with the greatest time at or before the query time.
    pub previous: Option<CharacterState>,
    /// Retained state with the smallest time after the query time.
    pub next: Option<CharacterState>,
}

/// Time-ordered ring of one entity's states.
#[derive(Debug, Clone)]
pub struct StateHistory {
    states: VecDeque<CharacterState>,
    capacity: usize,
}

impl StateHistory {
    pub fn new(capacity: usize, initial: CharacterState) -> Self {
        let capacity = capacity.max(1);
        let mut states = VecDeque::with_capacity(capacity);
        states.push_back(initial);
        Self { states, capacity }
    }

    /// Appends a state, evicting the oldest one when the ring is full.
    pub fn push(&mut self, entity: EntityId, state: CharacterState) -> Result<(), HistoryError> {
        if let Some(latest) = self.states.back() {
            if state.time <= latest.time {
                return Err(HistoryError::NonMonotonicTime {
                    entity,
                    time: state.time,
                    latest: latest.time,
                });
            }
        }

        if self.states.len() >= self.capacity {
            self.states.pop_front();
        }
        self.states.push_back(state);
        Ok(())
    }

    pub fn latest(&self) -> Option<&CharacterState> {
        self.states.back()
    }

    pub fn oldest(&self) -> Option<&CharacterState> {
        self.states.front()
    }

    pub fn bracket(&self, time: u64) -> Bracket {
        let split = self.states.partition_point(|state| state.time <= time);
        Bracket {
            previous: split
                .checked_sub(1)
                .and_then(|index| self.states.get(index))
                .copied(),
            next: self.states.get(split).copied(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &CharacterState> {
        self.states.iter()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

/// Owns the history of every tracked entity.
///
/// Created once when the prediction system starts and dropped when it shuts
/// down; the store never owns entity lifetime, only the entity → history
/// association.
#[derive(Debug)]
pub struct StateHistoryStore {
    histories: HashMap<EntityId, StateHistory>,
    capacity: usize,
}

impl StateHistoryStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            histories: HashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Starts tracking an entity from its initial state.
    ///
    /// Creating a history twice is a lifecycle bug upstream and is reported
    /// rather than silently overwriting the existing ring.
    pub fn create(&mut self, entity: EntityId, initial: CharacterState) -> Result<(), HistoryError> {
        if self.histories.contains_key(&entity) {
            return Err(HistoryError::DuplicateEntity(entity));
        }

        self.histories
            .insert(entity, StateHistory::new(self.capacity, initial));
        debug!("Created state history for {} at {} ms", entity, initial.time);
        Ok(())
    }

    /// Appends a state to an entity's history.
    ///
    /// Returns `Ok(false)` when the entity is not tracked.
    pub fn append(&mut self, entity: EntityId, state: CharacterState) -> Result<bool, HistoryError> {
        match self.histories.get_mut(&entity) {
            Some(history) => history.push(entity, state).map(|_| true),
            None => Ok(false),
        }
    }

    pub fn latest(&self, entity: EntityId) -> Option<CharacterState> {
        self.histories
            .get(&entity)
            .and_then(|history| history.latest())
            .copied()
    }

    /// Finds the retained states surrounding `time`.
    ///
    /// Unknown entities yield an empty bracket.
    pub fn find_bracket(&self, entity: EntityId, time: u64) -> Bracket {
        self.histories
            .get(&entity)
            .map(|history| history.bracket(time))
            .unwrap_or_default()
    }

    /// Stops tracking an entity. Removing an unknown entity does nothing.
    pub fn remove(&mut self, entity: EntityId) -> bool {
        let removed = self.histories.remove(&entity).is_some();
        if removed {
            debug!("Dropped state history for {}", entity);
        }
        removed
    }

    pub fn get(&self, entity: EntityId) -> Option<&StateHistory> {
        self.histories.get(&entity)
    }

    pub fn contains(&self, entity: EntityId) -> bool {
        self.histories.contains_key(&entity)
    }

    /// Tracked entities in ascending id order.
    pub fn tracked(&self) -> Vec<EntityId> {
        let mut entities: Vec<EntityId> = self.histories.keys().copied().collect();
        entities.sort_unstable();
        entities
    }

    pub fn len(&self, entity: EntityId) -> usize {
        self.histories.get(&entity).map_or(0, StateHistory::len)
    }

    pub fn entity_count(&self) -> usize {
        self.histories.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.histories.clear();
    }
}
