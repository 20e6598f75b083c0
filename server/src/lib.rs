//! # Game Hosting Library
//!
//! This library hosts Warcraft III games over the W3GS protocol. The host owns
//! the lobby, relays every player's opaque actions once per latency interval,
//! and keeps the game going through lag, desyncs and reconnects until it ends.
//!
//! ## Core Responsibilities
//!
//! ### Lobby
//! Joins are checked against the host counter, entry key, reserved names and
//! bans before a slot is assigned. The lobby tracks slots, teams and colors,
//! uploads the map to players who lack it, measures pings and runs the
//! countdown. A virtual host and optional fake players keep the lobby
//! joinable and the teams balanced.
//!
//! ### Action Relay
//! The host never simulates the game. Actions are queued per frame and
//! flushed to everyone at a fixed interval; a ping equalizer holds back
//! players with better connections so all of them see actions at the same
//! moment. Keepalive checksums are compared per frame to detect desyncs.
//!
//! ### Resilience
//! Players who fall too far behind get a lag screen and can be voted out.
//! Reconnect-capable clients (GProxy) survive dropped sockets: packets they
//! miss are buffered and replayed once they come back.
//!
//! ## Architecture Design
//!
//! ### Sans-IO Session
//! [`session::Game`] is a plain state machine. It consumes packets, closed
//! connections and the current time, and produces queued sends and
//! lifecycle events. Nothing in it blocks or reads a clock, so every
//! scenario can be tested with an explicit millisecond counter.
//!
//! ### Single Event Loop
//! [`network::Server`] owns the game and runs one `tokio::select!` loop.
//! Socket reads and writes happen in small spawned tasks that only exchange
//! messages with the loop.
//!
//! ## Module Organization
//!
//! - `session`: the game state machine (join, lobby, playing, GProxy)
//! - `slot_table`: slot ownership, teams, colors and layouts
//! - `user` / `virtual_user`: networked and virtual occupants
//! - `action_queue`: per-frame action batches and the ping equalizer
//! - `w3mmd` / `dota_stats`: stats collectors fed from the action stream
//! - `hcl`: host command line encoding into handicaps
//! - `map`: map descriptors and the shared map data cache
//! - `persistence` / `collaborators`: records, bans and chat announcements
//! - `config` / `error`: tunables and error types
//! - `network`: sockets, discovery and the main loop
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::map::MapDescriptor;
//! use server::network::{AppContext, Server};
//! use server::persistence::MemoryPersistence;
//! use server::session::GameSetup;
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let map = MapDescriptor::load(Path::new("maps/dota.json"))?;
//!     let setup = GameSetup::new("dota -ap", map);
//!     let context = Arc::new(AppContext::new());
//!
//!     let mut server = Server::new(
//!         ServerConfig::default(),
//!         setup,
//!         Box::new(MemoryPersistence::new()),
//!         context,
//!     )
//!     .await?;
//!
//!     // Runs until the game ends or the context is told to exit
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod action_queue;
pub mod collaborators;
pub mod config;
pub mod dota_stats;
pub mod error;
pub mod hcl;
pub mod map;
pub mod network;
pub mod persistence;
pub mod session;
pub mod slot_table;
pub mod user;
pub mod virtual_user;
pub mod w3mmd;
