//! `dungeon_client`
//!
//! Client-side systems:
//! - Connection management (reliable + unreliable channels)
//! - Input sampling and command generation
//! - Local prediction with collision
//! - Command outbox with resend and backoff
//! - Acknowledgment handling and reconciliation
//! - Interpolation for remote entity positions

pub mod ack;
pub mod client;
pub mod input;
pub mod interp;
pub mod outbox;
pub mod pipeline;
pub mod predict;
pub mod reconcile;

pub use client::GameClient;
pub use pipeline::PredictionPipeline;
