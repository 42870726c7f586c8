//! Local prediction.
//!
//! Commands are applied to the controlled entity as soon as they are sampled,
//! using the shared movement contract so the server reaches the same result.

use std::sync::Arc;

use dungeon_shared::{
    command::Command,
    math::Vec2,
    movement::{self, CollisionWorld},
    net::EntityId,
};

/// The locally controlled entity. Owns the only mutable copy of its position.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlledEntity {
    id: EntityId,
    position: Vec2,
    radius: f32,
}

impl ControlledEntity {
    pub fn new(id: EntityId, spawn: Vec2, radius: f32) -> Self {
        Self {
            id,
            position: spawn,
            radius,
        }
    }

    pub fn id(&self) -> &EntityId {
        &self.id
    }

    /// Current predicted position.
    pub fn position(&self) -> Vec2 {
        self.position
    }

    pub fn radius(&self) -> f32 {
        self.radius
    }

    /// Only the predictor and the reconciler move the entity.
    pub(crate) fn set_position(&mut self, position: Vec2) {
        self.position = position;
    }
}

/// Applies commands locally, optionally resolving collisions.
#[derive(Clone, Default)]
pub struct Predictor {
    collision: Option<Arc<dyn CollisionWorld>>,
}

impl std::fmt::Debug for Predictor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Predictor")
            .field("collision", &self.collision.is_some())
            .finish()
    }
}

impl Predictor {
    pub fn new(collision: Option<Arc<dyn CollisionWorld>>) -> Self {
        Self { collision }
    }

    pub fn set_collision(&mut self, collision: Option<Arc<dyn CollisionWorld>>) {
        self.collision = collision;
    }

    pub fn has_collision(&self) -> bool {
        self.collision.is_some()
    }

    /// Position reached by applying `command` from `from`.
    pub fn advance(&self, from: Vec2, command: &Command, radius: f32) -> Vec2 {
        movement::apply(from, command, radius, self.collision.as_deref()).position
    }

    /// Moves the entity and returns the command stamped with the result.
    pub fn predict(&self, entity: &mut ControlledEntity, command: Command) -> Command {
        let next = self.advance(entity.position(), &command, entity.radius());
        entity.set_position(next);
        command.with_result(next)
    }
}
