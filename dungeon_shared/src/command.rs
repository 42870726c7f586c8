//! Movement commands and server acknowledgments.
//!
//! A `Command` is one sequenced movement intent issued by the client. It is
//! immutable once issued: the predicted position is attached at construction
//! time by `Command::with_result`, never patched in place.

use serde::{Deserialize, Serialize};

use crate::math::Vec2;

/// Per-entity command sequence number. Zero means "nothing issued yet".
pub type Sequence = u32;

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn unix_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

bitflags::bitflags! {
    /// Pressed movement directions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct Intent: u8 {
        const UP = 1 << 0;
        const DOWN = 1 << 1;
        const LEFT = 1 << 2;
        const RIGHT = 1 << 3;
    }
}

impl Intent {
    pub fn from_keys(up: bool, down: bool, left: bool, right: bool) -> Self {
        let mut intent = Intent::empty();
        intent.set(Intent::UP, up);
        intent.set(Intent::DOWN, down);
        intent.set(Intent::LEFT, left);
        intent.set(Intent::RIGHT, right);
        intent
    }

    /// True when no direction is pressed.
    pub fn is_idle(self) -> bool {
        self.is_empty()
    }

    /// Unit direction in screen space (+x right, +y down).
    ///
    /// Opposing keys cancel out. Diagonals are normalized so they are not
    /// faster than straight moves.
    pub fn direction(self) -> Vec2 {
        let axis = |neg: Intent, pos: Intent| -> f32 {
            let mut v = 0.0;
            if self.contains(neg) {
                v -= 1.0;
            }
            if self.contains(pos) {
                v += 1.0;
            }
            v
        };
        Vec2::new(
            axis(Intent::LEFT, Intent::RIGHT),
            axis(Intent::UP, Intent::DOWN),
        )
        .normalize_or_zero()
    }
}

/// One sequenced movement command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub sequence: Sequence,
    pub intent: Intent,
    /// Wall-clock issue time, milliseconds since the Unix epoch.
    pub issued_at_ms: i64,
    /// Seconds elapsed since the previous simulation step.
    pub delta_time: f32,
    /// Position the client predicted after applying this command.
    pub resulting_position: Option<Vec2>,
}

impl Command {
    pub fn new(sequence: Sequence, intent: Intent, issued_at_ms: i64, delta_time: f32) -> Self {
        Self {
            sequence,
            intent,
            issued_at_ms,
            delta_time,
            resulting_position: None,
        }
    }

    /// Consumes the command and returns it stamped with the predicted result.
    pub fn with_result(self, position: Vec2) -> Self {
        Self {
            resulting_position: Some(position),
            ..self
        }
    }
}

/// Server acknowledgment of processed commands.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Acknowledgment {
    /// Highest command sequence the server has applied.
    pub last_sequence: Sequence,
    /// Server position of the entity after `last_sequence`.
    pub authoritative_position: Vec2,
    /// Whether the server's last move was blocked by an obstacle.
    pub collided: bool,
}
