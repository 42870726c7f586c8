//! `dungeon_shared`
//!
//! Shared libraries used by both client and server.
//!
//! Design goals:
//! - Deterministic movement: client prediction and the server run the same
//!   step function with the same constants.
//! - Clear separation of concerns (math, movement, collision, net, config).
//! - Traits for the collaborators the prediction pipeline consumes.
//! - No `unsafe`.

pub mod collision;
pub mod command;
pub mod config;
pub mod error;
pub mod math;
pub mod movement;
pub mod net;

pub mod prelude {
    //! Commonly used exports.

    pub use crate::collision::*;
    pub use crate::command::*;
    pub use crate::config::*;
    pub use crate::error::*;
    pub use crate::math::*;
    pub use crate::movement::*;
    pub use crate::net::*;
}
