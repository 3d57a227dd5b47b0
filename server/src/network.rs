//! Server network layer handling UDP communications and simulation loop coordination

use crate::client_manager::{Client, ClientManager, CLIENT_TIMEOUT};
use crate::config::PredictionConfig;
use crate::interaction::{use_item_in_direction, UseItemInDirection};
use crate::prediction::ServerPredictionSystem;
use crate::stepper::{EntityContexts, KinematicStepper};
use crate::utils::ServerClock;
use crate::world::EntityWorld;
use bincode::{deserialize, serialize};
use log::{debug, error, info, warn};
use nalgebra::Vector3;
use shared::{ClientId, EntityId, Packet, PROTOCOL_VERSION};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};
use tokio::time::interval;

/// Messages sent from network tasks to main server loop
#[derive(Debug)]
pub enum ServerMessage {
    /// A decoded packet from the receiver task
    PacketReceived {
        packet: Packet,
        addr: SocketAddr,
    },
    /// A client went silent; its character must be released
    ClientTimeout {
        client_id: ClientId,
        entity: Option<EntityId>,
    },
    /// Stops the main loop and drops every history
    Shutdown,
}

/// Messages sent from simulation loop to network tasks
#[derive(Debug)]
pub enum GameMessage {
    /// Sends a packet to a single address
    SendPacket {
        packet: Packet,
        addr: SocketAddr,
    },
    /// Sends a packet to every connected client except `exclude`
    BroadcastPacket {
        packet: Packet,
        exclude: Option<ClientId>,
    },
}

/// Main server coordinating networking and character simulation
pub struct Server {
    socket: Arc<UdpSocket>,
    clients: Arc<RwLock<ClientManager>>,
    world: EntityWorld,
    system: ServerPredictionSystem<KinematicStepper>,
    clock: ServerClock,
    tick_duration: Duration,
    tick: u64,

    // Communication channels
    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
    game_tx: mpsc::UnboundedSender<GameMessage>,
    game_rx: mpsc::UnboundedReceiver<GameMessage>,
}

impl Server {
    /// Binds the server socket and builds the prediction system
    ///
    /// Fails if the configuration is invalid or the address cannot be bound.
    /// The server clock starts here, so every timestamp the server hands out
    /// counts from this call.
    pub async fn new(
        addr: &str,
        tick_duration: Duration,
        max_clients: usize,
        config: PredictionConfig,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let system = ServerPredictionSystem::new(config, KinematicStepper::default())?;
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        info!("Server listening on {}", socket.local_addr()?);

        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let (game_tx, game_rx) = mpsc::unbounded_channel();

        Ok(Server {
            socket,
            clients: Arc::new(RwLock::new(ClientManager::new(max_clients))),
            world: EntityWorld::new(),
            system,
            clock: ServerClock::new(),
            tick_duration,
            tick: 0,
            server_tx,
            server_rx,
            game_tx,
            game_rx,
        })
    }

    /// Address the server socket is bound to
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Entity store holding every character's displayed pose
    pub fn world(&self) -> &EntityWorld {
        &self.world
    }

    /// Prediction system driving histories, replication and display
    pub fn system(&self) -> &ServerPredictionSystem<KinematicStepper> {
        &self.system
    }

    /// Returns a sender for injecting messages into the main loop
    ///
    /// Sending `ServerMessage::Shutdown` makes `run` return after dropping
    /// every history.
    pub fn shutdown_sender(&self) -> mpsc::UnboundedSender<ServerMessage> {
        self.server_tx.clone()
    }

    /// Spawns task that continuously listens for incoming packets
    async fn spawn_network_receiver(&self) {
        let socket = Arc::clone(&self.socket);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; 2048];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        if let Ok(packet) = deserialize::<Packet>(&buffer[0..len]) {
                            if let Err(e) =
                                server_tx.send(ServerMessage::PacketReceived { packet, addr })
                            {
                                error!("Failed to send packet to main loop: {}", e);
                                break;
                            }
                        } else {
                            warn!("Failed to deserialize packet from {}", addr);
                        }
                    }
                    Err(e) => {
                        error!("Error receiving packet: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    /// Spawns task that processes outgoing packet queue
    async fn spawn_network_sender(&mut self) {
        let socket = Arc::clone(&self.socket);
        let clients = Arc::clone(&self.clients);
        let mut game_rx = std::mem::replace(&mut self.game_rx, mpsc::unbounded_channel().1);

        tokio::spawn(async move {
            while let Some(message) = game_rx.recv().await {
                match message {
                    GameMessage::SendPacket { packet, addr } => {
                        if let Err(e) = Self::send_packet_impl(&socket, &packet, addr).await {
                            error!("Failed to send packet to {}: {}", addr, e);
                        }
                    }
                    GameMessage::BroadcastPacket { packet, exclude } => {
                        let client_addrs = {
                            let clients_guard = clients.read().await;
                            clients_guard.get_client_addrs()
                        };

                        for (client_id, addr) in client_addrs {
                            if Some(client_id) == exclude {
                                continue;
                            }

                            if let Err(e) = Self::send_packet_impl(&socket, &packet, addr).await {
                                error!("Failed to send to client {}: {}", client_id, e);
                            }
                        }
                    }
                }
            }
        });
    }

    /// Spawns task that monitors client timeouts
    async fn spawn_timeout_checker(&self) {
        let clients = Arc::clone(&self.clients);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));

            loop {
                interval.tick().await;

                let timed_out = {
                    let mut clients_guard = clients.write().await;
                    clients_guard.check_timeouts(CLIENT_TIMEOUT)
                };

                for client in timed_out {
                    let message = ServerMessage::ClientTimeout {
                        client_id: client.id,
                        entity: client.entity,
                    };
                    if let Err(e) = server_tx.send(message) {
                        error!("Failed to send timeout message: {}", e);
                        return;
                    }
                }
            }
        });
    }

    /// Serializes and sends a packet to a specific address
    async fn send_packet_impl(
        socket: &UdpSocket,
        packet: &Packet,
        addr: SocketAddr,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let data = serialize(packet)?;
        socket.send_to(&data, addr).await?;
        Ok(())
    }

    /// Queues a packet for the sender task
    fn send_packet(&self, packet: Packet, addr: SocketAddr) {
        if let Err(e) = self.game_tx.send(GameMessage::SendPacket { packet, addr }) {
            error!("Failed to queue packet for sending: {}", e);
        }
    }

    /// Queues a packet for every connected client
    fn broadcast_packet(&self, packet: Packet, exclude: Option<ClientId>) {
        if let Err(e) = self.game_tx.send(GameMessage::BroadcastPacket { packet, exclude }) {
            error!("Failed to queue broadcast packet: {}", e);
        }
    }

    /// Finds the client connected from `addr`
    async fn client_at(&self, addr: SocketAddr) -> Option<ClientId> {
        let clients = self.clients.read().await;
        clients.find_client_by_addr(addr)
    }

    /// Removes a character from the world and from prediction.
    fn release_character(&mut self, client_id: ClientId, entity: Option<EntityId>) {
        if let Some(entity) = entity {
            self.world.despawn(entity);
            self.system.on_detach(entity);
            debug!("Released {} of client {}", entity, client_id);
        }
    }

    /// Releases everything a removed client owned
    fn drop_client(&mut self, client: Client) {
        self.release_character(client.id, client.entity);
    }

    /// Processes incoming packets at server time `now`
    ///
    /// Connecting spawns a character and answers with `Connected` carrying
    /// `now`, so the client can stamp its inputs on the server clock, followed
    /// by an immediate state snapshot.
    async fn handle_packet(&mut self, packet: Packet, addr: SocketAddr, now: u64) {
        match packet {
            Packet::Connect { client_version } => {
                info!(
                    "Client connecting from {} (version: {})",
                    addr, client_version
                );

                if client_version != PROTOCOL_VERSION {
                    let response = Packet::Disconnected {
                        reason: "Protocol version mismatch".to_string(),
                    };
                    self.send_packet(response, addr);
                    return;
                }

                // Remove existing connection if present
                if let Some(existing_id) = self.client_at(addr).await {
                    info!("Removing existing client {} from {}", existing_id, addr);
                    let removed = self.clients.write().await.remove_client(&existing_id);
                    if let Some(client) = removed {
                        self.drop_client(client);
                    }
                }

                let client_id = {
                    let mut clients = self.clients.write().await;
                    clients.add_client(addr)
                };

                let Some(client_id) = client_id else {
                    let response = Packet::Disconnected {
                        reason: "Server full".to_string(),
                    };
                    self.send_packet(response, addr);
                    return;
                };

                let entity = self.world.spawn_character(client_id);
                self.clients.write().await.set_entity(client_id, entity);
                self.system.sync_entities(now, &self.world);

                self.send_packet(
                    Packet::Connected {
                        client_id,
                        entity_id: entity.0,
                        server_time: now,
                    },
                    addr,
                );
                self.send_packet(
                    Packet::CharacterStates {
                        server_time: now,
                        states: self.system.snapshot(),
                    },
                    addr,
                );
            }

            Packet::Input { .. } => {
                let Some(input) = packet.to_input() else {
                    return;
                };
                if let Some(client_id) = self.client_at(addr).await {
                    let mut clients = self.clients.write().await;
                    clients.add_input(client_id, input);
                }
            }

            Packet::UseItemInDirection {
                item,
                direction,
                client_time,
            } => {
                let Some(client_id) = self.client_at(addr).await else {
                    return;
                };
                self.clients.write().await.touch(client_id);

                let request = UseItemInDirection {
                    item,
                    direction: Vector3::from(direction),
                    client_time,
                };
                match use_item_in_direction(&mut self.system, &mut self.world, client_id, &request, now) {
                    Ok(outcome) => {
                        let hit_entity = outcome
                            .and_then(|outcome| outcome.hit)
                            .map(|(entity, _)| entity.0);
                        self.send_packet(Packet::UseItemResult { item, hit_entity }, addr);
                    }
                    Err(e) => warn!("Item use from client {} rejected: {}", client_id, e),
                }
            }

            Packet::Disconnect => {
                if let Some(client_id) = self.client_at(addr).await {
                    let removed = self.clients.write().await.remove_client(&client_id);
                    if let Some(client) = removed {
                        self.drop_client(client);
                    }
                }
            }

            _ => {
                warn!("Unexpected packet type from client at {}", addr);
            }
        }
    }

    /// Feeds every queued input through the prediction system
    async fn process_inputs(&mut self, now: u64) {
        let all_inputs: Vec<_> = {
            let mut clients = self.clients.write().await;
            clients
                .drain_inputs()
                .into_iter()
                .map(|(client_id, inputs)| (client_id, clients.entity_of(client_id), inputs))
                .collect()
        };

        for (client_id, entity, inputs) in all_inputs {
            let Some(entity) = entity else {
                continue;
            };
            let Some(context) = self.world.context(entity) else {
                continue;
            };

            for input in inputs {
                match self
                    .system
                    .on_input(now, entity, &input, &context, &mut self.world)
                {
                    Ok(Some(_)) => {}
                    Ok(None) => debug!("Input for untracked {} ignored", entity),
                    Err(e) => debug!("Input {} from client {} dropped: {}", input.sequence, client_id, e),
                }
            }
        }
    }

    /// Runs one server tick at server time `now`
    ///
    /// Applies queued inputs, reconciles the tracked set with the world, then
    /// advances prediction and broadcasts states when replication is due.
    async fn tick(&mut self, now: u64) {
        self.process_inputs(now).await;

        let report = self.system.sync_entities(now, &self.world);
        if !report.attached.is_empty() || !report.detached.is_empty() {
            debug!(
                "Tick {}: attached {:?}, detached {:?}",
                self.tick, report.attached, report.detached
            );
        }

        let contexts = self.world.contexts();
        let replicated = self.system.update(now, None, &contexts, &mut self.world);
        self.tick += 1;

        let Some(states) = replicated else {
            return;
        };
        let client_count = {
            let clients = self.clients.read().await;
            clients.len()
        };
        if client_count == 0 {
            return;
        }

        self.broadcast_packet(
            Packet::CharacterStates {
                server_time: now,
                states,
            },
            None,
        );
    }

    /// Main server loop coordinating all operations
    ///
    /// Returns once a `ServerMessage::Shutdown` arrives, after the prediction
    /// system has dropped its histories.
    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        // Initialize concurrent tasks
        self.spawn_network_receiver().await;
        self.spawn_network_sender().await;
        self.spawn_timeout_checker().await;

        let mut tick_interval = interval(self.tick_duration);
        self.system.init(self.clock.now_ms());

        info!("Server started successfully");

        loop {
            tokio::select! {
                // Handle network events
                message = self.server_rx.recv() => {
                    match message {
                        Some(ServerMessage::PacketReceived { packet, addr }) => {
                            let now = self.clock.now_ms();
                            self.handle_packet(packet, addr, now).await;
                        },
                        Some(ServerMessage::ClientTimeout { client_id, entity }) => {
                            self.release_character(client_id, entity);
                        },
                        Some(ServerMessage::Shutdown) | None => {
                            info!("Server shutting down");
                            break;
                        }
                    }
                },

                // Handle server tick events
                _ = tick_interval.tick() => {
                    let now = self.clock.now_ms();
                    self.tick(now).await;

                    // Periodic performance monitoring
                    if self.tick % 60 == 0 {
                        debug!("Tick {} at {} ms: {} characters tracked",
                               self.tick, now, self.system.store().entity_count());
                    }
                },
            }
        }

        self.system.shutdown();
        Ok(())
    }
}
