//! Rewinding the world to what a client saw
//!
//! A client renders remote characters `render_delay` behind its own clock.
//! When it asks for something that depends on where those characters were
//! (shooting, using an item in a direction), the server evaluates the request
//! against the same picture: every other character is rewound to
//! `client_time - render_delay`, while the requester's own character stays at
//! its latest authoritative state since the client predicted it locally.
//!
//! A compensation window is opened with [`LagCompensator::begin`] and closed
//! with [`LagCompensator::restore_to_present`]. Only the displayed transforms
//! move during a window; the histories are read, never written. Windows do not
//! nest, as both ends rewrite the same displayed transforms.
//!
//! `restore_to_present` returns *every* tracked entity, including the
//! requester's and the local viewer's, to the delayed render time. The
//! per-tick renderer skips the local viewer; the restore does not.

use crate::history::StateHistoryStore;
use crate::time_shift::{delayed_time, set_to_time, TransformSink};
use log::{debug, warn};
use shared::{ClientId, EntityId};
use std::collections::HashMap;
use thiserror::Error;

/// Resolves which client owns an entity.
pub trait EntityOwners {
    fn owner_of(&self, entity: EntityId) -> Option<ClientId>;
}

impl EntityOwners for HashMap<EntityId, ClientId> {
    fn owner_of(&self, entity: EntityId) -> Option<ClientId> {
        self.get(&entity).copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompensationRequest {
    pub requesting_client: ClientId,
    /// The requesting client's clock when it issued the request, in ms.
    pub client_time: u64,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CompensationError {
    #[error("compensation for client {active} is still open, cannot start one for client {requested}")]
    AlreadyActive {
        active: ClientId,
        requested: ClientId,
    },
}

#[derive(Debug, Clone)]
pub struct LagCompensator {
    render_delay: u64,
    active: Option<CompensationRequest>,
}

impl LagCompensator {
    pub fn new(render_delay: u64) -> Self {
        Self {
            render_delay,
            active: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn active(&self) -> Option<&CompensationRequest> {
        self.active.as_ref()
    }

    /// Rewinds every tracked entity to the requesting client's perceived past.
    ///
    /// Returns the number of entities whose transform was applied.
    pub fn begin<O, S>(
        &mut self,
        request: CompensationRequest,
        store: &StateHistoryStore,
        owners: &O,
        sink: &mut S,
    ) -> Result<usize, CompensationError>
    where
        O: EntityOwners + ?Sized,
        S: TransformSink + ?Sized,
    {
        if let Some(active) = &self.active {
            warn!(
                "Rejected lag compensation for client {} while client {} is open",
                request.requesting_client, active.requesting_client
            );
            return Err(CompensationError::AlreadyActive {
                active: active.requesting_client,
                requested: request.requesting_client,
            });
        }
        self.active = Some(request);

        let rewind_time = delayed_time(request.client_time, self.render_delay);
        let mut applied = 0;
        for entity in store.tracked() {
            if owners.owner_of(entity) == Some(request.requesting_client) {
                if let Some(latest) = store.latest(entity) {
                    sink.apply_state(entity, &latest);
                    applied += 1;
                }
            } else if set_to_time(store, entity, rewind_time, sink) {
                applied += 1;
            }
        }

        debug!(
            "Lag compensation for client {} at {} ms: {} entities rewound to {:?}",
            request.requesting_client, request.client_time, applied, rewind_time
        );
        Ok(applied)
    }

    /// Closes the compensation window and puts every tracked entity back at
    /// `now - render_delay`.
    ///
    /// Returns the number of entities whose transform was applied.
    pub fn restore_to_present<S: TransformSink + ?Sized>(
        &mut self,
        now: u64,
        store: &StateHistoryStore,
        sink: &mut S,
    ) -> usize {
        self.active = None;

        let render_time = delayed_time(now, self.render_delay);
        store
            .tracked()
            .into_iter()
            .filter(|entity| set_to_time(store, *entity, render_time, sink))
            .count()
    }

    /// Runs `query` against the rewound world and restores it afterwards.
    pub fn compensate<O, S, R, F>(
        &mut self,
        request: CompensationRequest,
        now: u64,
        store: &StateHistoryStore,
        owners: &O,
        sink: &mut S,
        query: F,
    ) -> Result<R, CompensationError>
    where
        O: EntityOwners + ?Sized,
        S: TransformSink + ?Sized,
        F: FnOnce(&S) -> R,
    {
        self.begin(request, store, owners, sink)?;
        let result = query(&*sink);
        self.restore_to_present(now, store, sink);
        Ok(result)
    }
}
