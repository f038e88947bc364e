//! Maestro Core - Lavalink client library.
//!
//! This crate manages a pool of Lavalink audio nodes for a Discord music
//! host: it keeps one WebSocket session per node, ranks nodes by a load
//! penalty for player placement, and mirrors per-guild playback state
//! (queue, history, filters, position) in [`Player`] objects that survive
//! node fail-over.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`node`]: node registry, selection, WebSocket session and REST client
//! - [`player`]: per-guild players, queue/history, persistence
//! - [`filters`]: the audio filter chain sent over the `filters` op
//! - [`track`]: queries, tracks and the load-result cache
//! - [`events`]: domain events and host hook dispatch
//! - [`protocol`]: wire types for the JSON-over-WebSocket protocol
//! - [`region`]: Discord voice-region coordinates for distance scoring
//! - [`config`]: node and pool configuration
//! - [`error`]: centralized error types
//!
//! # Getting started
//!
//! Build a [`NodePool`], register nodes with [`NodePool::add_node`], then
//! create players through [`NodePool::players`]. Register an
//! [`EventHook`] to observe node and track lifecycle events.

#![warn(clippy::all)]

pub mod backoff;
pub mod config;
pub mod error;
pub mod events;
pub mod filters;
pub mod node;
pub mod player;
pub mod protocol;
pub mod region;
pub mod track;

// Re-export commonly used types at the crate root
pub use backoff::Backoff;
pub use config::{NodeConfig, PoolConfig};
pub use error::{MaestroError, MaestroResult, RestError, RestResult};
pub use events::{Event, EventDispatcher, EventHook};
pub use filters::FilterSet;
pub use node::{Node, NodePool};
pub use player::{PlayOptions, Player, PlayerPool, SavedPlayer};
pub use protocol::{LoadResult, LoadType, NodeStats, TrackEndReason};
pub use track::{Query, Source, Track, TrackCache};
