//! `dungeon_server`
//!
//! Authoritative side of the prediction model:
//! - Fixed timestep loop
//! - Applies each client's commands once, in sequence order
//! - Acknowledges the last processed command with the authoritative position
//! - Relays position updates to the other clients
//!
//! Networking model:
//! - TCP: handshake, map transfer, joins and leaves
//! - UDP: command batches, acks and position updates

pub mod server;

pub use server::GameServer;
