//! # Character Prediction Server Library
//!
//! This library provides the authoritative server side of networked character
//! movement. It owns the canonical movement history of every character,
//! replicates authoritative states to observers at a fixed cadence, renders
//! remote characters slightly in the past so they move smoothly, and rewinds
//! the world to what a client saw when that client performs an action that
//! depends on where other characters were.
//!
//! ## Core Responsibilities
//!
//! ### Authoritative Movement
//! Client movement inputs are stepped through a deterministic
//! [`stepper::MovementStepper`]. Every result is appended to a bounded,
//! time-ordered per-character history and applied to the character as its
//! authoritative state.
//!
//! ### State Replication
//! The [`replication::ReplicationScheduler`] keeps a single deadline. Each
//! tick that finds it passed broadcasts the latest state of every tracked
//! character and moves the deadline forward by one interval.
//!
//! ### Time-Shifted Rendering
//! Remote characters are displayed at `now - render_delay`: interpolated
//! between the two bracketing samples, extrapolated past the newest one, and
//! left alone when the render time predates the history.
//!
//! ### Lag Compensation
//! A directional action is evaluated against the world the requesting client
//! was looking at. Afterwards every character, the requester included, is
//! returned to the present render time.
//!
//! ## Architecture Design
//!
//! ### Single-Threaded Simulation
//! Histories, scheduler, renderer and compensator are owned by one
//! [`prediction::ServerPredictionSystem`] and touched only from the
//! simulation loop. Networking runs on separate tasks and talks to the loop
//! over channels.
//!
//! ### Trait Seams
//! The prediction core never holds game objects. The entity store
//! ([`world::EntityWorld`]) reaches it through small traits: which entities
//! are characters, which client owns an entity, what stepping context an
//! entity has, and where to write a displayed transform.
//!
//! ## Module Organization
//!
//! - `config`: tunable delays, intervals and capacities
//! - `history`: bounded per-entity state histories and bracket search
//! - `stepper`: movement stepping contract and a kinematic implementation
//! - `time_shift`: interpolation, extrapolation and set-to-time
//! - `renderer`: per-tick delayed rendering of remote characters
//! - `replication`: fixed-interval replication scheduling
//! - `lag_compensation`: rewind and restore of the displayed world
//! - `prediction`: the system tying the above together
//! - `world`: in-process entity store and ray queries
//! - `interaction`: lag-compensated directional item use
//! - `client_manager`: connected clients and their input queues
//! - `network`: UDP server and simulation loop
//! - `utils`: server clock
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::PredictionConfig;
//! use server::network::Server;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // 60Hz ticks, at most 32 clients, default delays and history size
//!     let mut server = Server::new(
//!         "127.0.0.1:8080",
//!         Duration::from_millis(16),
//!         32,
//!         PredictionConfig::default(),
//!     ).await?;
//!
//!     // Runs until the network tasks shut down:
//!     // - accepts clients and spawns a character for each
//!     // - steps queued inputs into the character histories
//!     // - replicates latest states every 50ms
//!     // - answers item use with lag compensation
//!     server.run().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod client_manager;
pub mod config;
pub mod history;
pub mod interaction;
pub mod lag_compensation;
pub mod network;
pub mod prediction;
pub mod renderer;
pub mod replication;
pub mod stepper;
pub mod time_shift;
pub mod utils;
pub mod world;
