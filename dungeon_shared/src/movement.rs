//! Movement contract shared by client prediction and the authoritative server.
//!
//! Both sides must produce bit-identical positions for the same command, so
//! the speed constant and the step function live here and nowhere else.

use crate::{
    command::{Command, Intent},
    math::Vec2,
};

/// Movement speed in pixels per second. Not a tunable: the server uses it too.
pub const MOVE_SPEED: f32 = 300.0;

/// Upper bound on a single command's `delta_time`, in seconds.
pub const MAX_DELTA_TIME: f32 = 0.25;

/// Collision collaborator.
pub trait CollisionWorld: Send + Sync {
    /// True if a circle of `radius` centred at `at` overlaps an obstacle.
    fn check_collision(&self, at: Vec2, radius: f32) -> bool;

    /// Adjusts a move from `from` to `to` so it does not end inside an obstacle.
    ///
    /// Slides along walls: full move, then horizontal only, then vertical
    /// only, otherwise stays put.
    fn resolve_collision(&self, from: Vec2, to: Vec2, radius: f32) -> Vec2 {
        if !self.check_collision(to, radius) {
            return to;
        }
        let horizontal = Vec2::new(to.x, from.y);
        if !self.check_collision(horizontal, radius) {
            return horizontal;
        }
        let vertical = Vec2::new(from.x, to.y);
        if !self.check_collision(vertical, radius) {
            return vertical;
        }
        from
    }
}

/// World without obstacles.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenWorld;

impl CollisionWorld for OpenWorld {
    fn check_collision(&self, _at: Vec2, _radius: f32) -> bool {
        false
    }
}

/// Result of applying one command.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MoveResult {
    pub position: Vec2,
    /// True when collision resolution changed the candidate position.
    pub collided: bool,
}

/// Clamps a client-reported frame delta into the accepted range.
pub fn clamp_delta(delta_time: f32) -> f32 {
    if delta_time.is_finite() {
        delta_time.clamp(0.0, MAX_DELTA_TIME)
    } else {
        0.0
    }
}

/// Unobstructed target: `from + direction * (MOVE_SPEED * delta_time)`.
pub fn candidate(from: Vec2, intent: Intent, delta_time: f32) -> Vec2 {
    from + intent.direction() * (MOVE_SPEED * clamp_delta(delta_time))
}

/// Applies a command from `from`, resolving against `collision` if present.
pub fn apply(
    from: Vec2,
    command: &Command,
    radius: f32,
    collision: Option<&dyn CollisionWorld>,
) -> MoveResult {
    let target = candidate(from, command.intent, command.delta_time);
    match collision {
        Some(world) => {
            let position = world.resolve_collision(from, target, radius);
            MoveResult {
                position,
                collided: position != target,
            }
        }
        None => MoveResult {
            position: target,
            collided: false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Solid everywhere with x >= wall_x.
    struct VerticalWall {
        wall_x: f32,
    }

    impl CollisionWorld for VerticalWall {
        fn check_collision(&self, at: Vec2, radius: f32) -> bool {
            at.x + radius >= self.wall_x
        }
    }

    #[test]
    fn moves_right_at_move_speed() {
        let cmd = Command::new(5, Intent::RIGHT, 0, 0.1);
        let result = apply(Vec2::new(100.0, 40.0), &cmd, 10.0, None);
        assert!((result.position.x - 130.0).abs() < 1e-4);
        assert_eq!(result.position.y, 40.0);
        assert!(!result.collided);
    }

    #[test]
    fn delta_is_clamped() {
        let cmd = Command::new(1, Intent::DOWN, 0, 10.0);
        let result = apply(Vec2::ZERO, &cmd, 10.0, None);
        assert!((result.position.y - MOVE_SPEED * MAX_DELTA_TIME).abs() < 1e-4);
        assert_eq!(clamp_delta(f32::NAN), 0.0);
        assert_eq!(clamp_delta(-1.0), 0.0);
    }

    #[test]
    fn slides_along_wall() {
        let wall = VerticalWall { wall_x: 120.0 };
        let cmd = Command::new(1, Intent::RIGHT | Intent::DOWN, 0, 0.1);
        let from = Vec2::new(100.0, 40.0);
        let result = apply(from, &cmd, 10.0, Some(&wall));
        assert!(result.collided);
        assert_eq!(result.position.x, from.x);
        assert!(result.position.y > from.y);
    }

    #[test]
    fn blocked_move_stays_put() {
        let wall = VerticalWall { wall_x: 115.0 };
        let cmd = Command::new(1, Intent::RIGHT, 0, 0.1);
        let from = Vec2::new(100.0, 40.0);
        let result = apply(from, &cmd, 10.0, Some(&wall));
        assert!(result.collided);
        assert_eq!(result.position, from);
    }

    #[test]
    fn open_world_never_collides() {
        let cmd = Command::new(1, Intent::LEFT, 0, 0.05);
        let result = apply(Vec2::ZERO, &cmd, 10.0, Some(&OpenWorld));
        assert!(!result.collided);
    }
}
