//! Client connection management and input queuing for the character server
//!
//! This module handles the server-side bookkeeping of connected clients:
//! - Client connection lifecycle (connect, disconnect, timeout)
//! - The character entity each client controls
//! - Per-client input queues, kept in arrival order
//! - Connection health monitoring and capacity limits
//!
//! Inputs are never reordered here. Arrival order per client is the order in
//! which the prediction system steps them; timestamps that went backwards in
//! transit are clamped later, when the input is applied.

use log::info;
use shared::{CharacterMoveInput, ClientId, EntityId};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Clients silent for longer than this are dropped.
pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Represents a connected client and their input state
#[derive(Debug)]
pub struct Client {
    /// Unique client identifier assigned by the server
    pub id: ClientId,
    /// Network address for sending responses
    pub addr: SocketAddr,
    /// Last time we received any packet from this client
    pub last_seen: Instant,
    /// Character entity controlled by this client, once spawned
    pub entity: Option<EntityId>,
    /// Inputs waiting for the next tick, in arrival order
    pub pending_inputs: Vec<CharacterMoveInput>,
}

impl Client {
    /// Creates a new client with the current timestamp
    ///
    /// The client starts without a character; the server assigns one once
    /// the connection is accepted.
    pub fn new(id: ClientId, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            last_seen: Instant::now(),
            entity: None,
            pending_inputs: Vec::new(),
        }
    }

    /// Queues an input behind everything that arrived before it.
    pub fn add_input(&mut self, input: CharacterMoveInput) {
        self.touch();
        self.pending_inputs.push(input);
    }

    /// Marks the client as alive at the current instant
    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    /// Checks if the client has exceeded the connection timeout
    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }
}

/// Manages all connected clients and their queued inputs
pub struct ClientManager {
    /// Connected clients indexed by their unique ID
    clients: HashMap<ClientId, Client>,
    /// Next available client ID for new connections
    next_client_id: ClientId,
    /// Maximum number of concurrent clients allowed
    max_clients: usize,
}

impl ClientManager {
    /// Creates a new client manager with the specified capacity limit
    ///
    /// Client IDs start from 1 and increment for each new connection.
    pub fn new(max_clients: usize) -> Self {
        Self {
            clients: HashMap::new(),
            next_client_id: 1,
            max_clients,
        }
    }

    /// Attempts to add a new client connection
    ///
    /// Returns Some(client_id) if successful, None if server is at capacity.
    pub fn add_client(&mut self, addr: SocketAddr) -> Option<ClientId> {
        if self.clients.len() >= self.max_clients {
            return None;
        }

        let client_id = self.next_client_id;
        self.next_client_id += 1;

        let client = Client::new(client_id, addr);
        info!("Client {} connected from {}", client_id, addr);
        self.clients.insert(client_id, client);

        Some(client_id)
    }

    /// Removes a client from the server
    ///
    /// Returns the removed client so the caller can release its character,
    /// or None if the ID was not connected.
    pub fn remove_client(&mut self, client_id: &ClientId) -> Option<Client> {
        let removed = self.clients.remove(client_id);
        if let Some(client) = &removed {
            info!("Client {} disconnected", client.id);
        }
        removed
    }

    /// Finds a client ID by their network address
    pub fn find_client_by_addr(&self, addr: SocketAddr) -> Option<ClientId> {
        self.clients
            .iter()
            .find(|(_, client)| client.addr == addr)
            .map(|(id, _)| *id)
    }

    /// Records the character entity a client controls
    ///
    /// Returns false if the client ID is invalid.
    pub fn set_entity(&mut self, client_id: ClientId, entity: EntityId) -> bool {
        match self.clients.get_mut(&client_id) {
            Some(client) => {
                client.entity = Some(entity);
                true
            }
            None => false,
        }
    }

    /// Returns the character entity controlled by a client, if any
    pub fn entity_of(&self, client_id: ClientId) -> Option<EntityId> {
        self.clients.get(&client_id).and_then(|client| client.entity)
    }

    /// Refreshes a client's activity timestamp
    ///
    /// Used for packets that carry no input but still prove the client is alive.
    pub fn touch(&mut self, client_id: ClientId) {
        if let Some(client) = self.clients.get_mut(&client_id) {
            client.touch();
        }
    }

    /// Adds an input to a specific client's pending queue
    ///
    /// Returns false if the client ID is invalid.
    pub fn add_input(&mut self, client_id: ClientId, input: CharacterMoveInput) -> bool {
        if let Some(client) = self.clients.get_mut(&client_id) {
            client.add_input(input);
            true
        } else {
            false
        }
    }

    /// Takes every queued input, grouped per client in arrival order.
    ///
    /// Clients are visited in ascending id order so a tick is reproducible.
    pub fn drain_inputs(&mut self) -> Vec<(ClientId, Vec<CharacterMoveInput>)> {
        let mut drained: Vec<(ClientId, Vec<CharacterMoveInput>)> = self
            .clients
            .iter_mut()
            .filter(|(_, client)| !client.pending_inputs.is_empty())
            .map(|(id, client)| (*id, std::mem::take(&mut client.pending_inputs)))
            .collect();
        drained.sort_unstable_by_key(|(id, _)| *id);
        drained
    }

    /// Checks for and removes timed-out clients
    ///
    /// Returns the removed clients so their characters can be despawned.
    pub fn check_timeouts(&mut self, timeout: Duration) -> Vec<Client> {
        let timed_out: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|(_, client)| client.is_timed_out(timeout))
            .map(|(id, _)| *id)
            .collect();

        timed_out
            .iter()
            .filter_map(|client_id| self.remove_client(client_id))
            .collect()
    }

    /// Gets all client IDs and their network addresses
    pub fn get_client_addrs(&self) -> Vec<(ClientId, SocketAddr)> {
        self.clients
            .iter()
            .map(|(id, client)| (*id, client.addr))
            .collect()
    }

    /// Returns the number of currently connected clients
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Returns true if no clients are currently connected
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{UnitQuaternion, Vector3};
    use shared::ActionFlags;

    fn test_addr() -> SocketAddr {
        "127.0.0.1:8080".parse().unwrap()
    }

    fn test_addr2() -> SocketAddr {
        "127.0.0.1:8081".parse().unwrap()
    }

    fn input(sequence: u32, time: u64) -> CharacterMoveInput {
        CharacterMoveInput {
            sequence,
            time,
            movement: Vector3::x(),
            look_rotation: UnitQuaternion::identity(),
            actions: ActionFlags::default(),
        }
    }

    #[test]
    fn test_client_creation() {
        let addr = test_addr();
        let client = Client::new(1, addr);

        assert_eq!(client.id, 1);
        assert_eq!(client.addr, addr);
        assert!(client.entity.is_none());
        assert!(client.pending_inputs.is_empty());
    }

    #[test]
    fn test_client_keeps_arrival_order() {
        let mut client = Client::new(1, test_addr());

        client.add_input(input(2, 100));
        client.add_input(input(1, 50));

        assert_eq!(client.pending_inputs.len(), 2);
        assert_eq!(client.pending_inputs[0].sequence, 2);
        assert_eq!(client.pending_inputs[1].sequence, 1);
    }

    #[test]
    fn test_client_timeout() {
        let mut client = Client::new(1, test_addr());

        assert!(!client.is_timed_out(Duration::from_secs(1)));

        client.last_seen = Instant::now() - Duration::from_secs(2);

        assert!(client.is_timed_out(Duration::from_secs(1)));
    }

    #[test]
    fn test_add_client_max_capacity() {
        let mut manager = ClientManager::new(1);

        assert_eq!(manager.add_client(test_addr()), Some(1));
        assert_eq!(manager.add_client(test_addr2()), None);
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_remove_client() {
        let mut manager = ClientManager::new(2);
        let client_id = manager.add_client(test_addr()).unwrap();
        manager.set_entity(client_id, EntityId(5));

        let removed = manager.remove_client(&client_id).unwrap();
        assert_eq!(removed.entity, Some(EntityId(5)));
        assert!(manager.is_empty());
        assert!(manager.remove_client(&client_id).is_none());
    }

    #[test]
    fn test_find_client_by_addr() {
        let mut manager = ClientManager::new(2);
        let client_id1 = manager.add_client(test_addr()).unwrap();
        let _client_id2 = manager.add_client(test_addr2()).unwrap();

        assert_eq!(manager.find_client_by_addr(test_addr()), Some(client_id1));

        let unknown_addr: SocketAddr = "192.168.1.1:9999".parse().unwrap();
        assert_eq!(manager.find_client_by_addr(unknown_addr), None);
    }

    #[test]
    fn test_entity_assignment() {
        let mut manager = ClientManager::new(2);
        let client_id = manager.add_client(test_addr()).unwrap();

        assert_eq!(manager.entity_of(client_id), None);
        assert!(manager.set_entity(client_id, EntityId(3)));
        assert_eq!(manager.entity_of(client_id), Some(EntityId(3)));
        assert!(!manager.set_entity(99, EntityId(4)));
    }

    #[test]
    fn test_add_input_to_nonexistent_client() {
        let mut manager = ClientManager::new(2);
        assert!(!manager.add_input(999, input(1, 100)));
    }

    #[test]
    fn test_drain_inputs_groups_by_client() {
        let mut manager = ClientManager::new(3);
        let client_id1 = manager.add_client(test_addr()).unwrap();
        let client_id2 = manager.add_client(test_addr2()).unwrap();

        manager.add_input(client_id2, input(1, 50));
        manager.add_input(client_id1, input(1, 100));
        manager.add_input(client_id1, input(2, 90));

        let drained = manager.drain_inputs();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].0, client_id1);
        let times: Vec<u64> = drained[0].1.iter().map(|i| i.time).collect();
        assert_eq!(times, vec![100, 90]);
        assert_eq!(drained[1].0, client_id2);

        assert!(manager.drain_inputs().is_empty());
    }

    #[test]
    fn test_check_timeouts_returns_removed_clients() {
        let mut manager = ClientManager::new(2);
        let stale = manager.add_client(test_addr()).unwrap();
        let _fresh = manager.add_client(test_addr2()).unwrap();
        manager.clients.get_mut(&stale).unwrap().last_seen = Instant::now() - Duration::from_secs(10);

        let removed = manager.check_timeouts(CLIENT_TIMEOUT);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].id, stale);
        assert_eq!(manager.len(), 1);
    }
}
