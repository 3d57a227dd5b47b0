//! Lag-compensated item use

use crate::lag_compensation::{CompensationError, CompensationRequest};
use crate::prediction::ServerPredictionSystem;
use crate::stepper::MovementStepper;
use crate::world::EntityWorld;
use log::{debug, info};
use nalgebra::Vector3;
use shared::{ClientId, EntityId};

/// How far a directional use reaches, in world units.
pub const USE_RANGE: f32 = 50.0;

/// A client's request to use an item along a direction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UseItemInDirection {
    pub item: u64,
    pub direction: Vector3<f32>,
    /// The client's clock when the item was used.
    pub client_time: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UseOutcome {
    pub user: EntityId,
    pub hit: Option<(EntityId, f32)>,
}

/// Resolves a directional use against the world as `client` saw it.
///
/// The user's character is taken at its latest authoritative state and every
/// other character at the client's delayed view; the displayed world is
/// restored to the present before returning. Clients without a character
/// get `Ok(None)`.
pub fn use_item_in_direction<M: MovementStepper>(
    system: &mut ServerPredictionSystem<M>,
    world: &mut EntityWorld,
    client: ClientId,
    request: &UseItemInDirection,
    now: u64,
) -> Result<Option<UseOutcome>, CompensationError> {
    let Some(user) = world.entity_owned_by(client) else {
        debug!("Client {} used item {} without a character", client, request.item);
        return Ok(None);
    };

    let compensation = CompensationRequest {
        requesting_client: client,
        client_time: request.client_time,
    };
    let owners = world.owners();
    let direction = request.direction;

    let hit = system.compensate(compensation, now, &owners, world, |view| {
        let origin = view.pose(user)?.position;
        view.ray_cast(origin, direction, USE_RANGE, Some(user))
    })?;

    match hit {
        Some((target, distance)) => info!(
            "Client {} hit {} with item {} at distance {:.2}",
            client, target, request.item, distance
        ),
        None => debug!("Client {} used item {} and hit nothing", client, request.item),
    }

    Ok(Some(UseOutcome { user, hit }))
}
