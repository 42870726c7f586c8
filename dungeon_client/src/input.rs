//! Input handling.
//!
//! In a real client this would integrate with windowing and key bindings.
//! Here the frame loop hands in an `InputState` and the sampler turns it into
//! sequenced `Command`s.

use std::time::Duration;

use dungeon_shared::{
    command::{unix_millis, Command, Intent, Sequence},
    movement::clamp_delta,
};
use tokio::time::Instant;
use tracing::warn;

/// Pressed movement keys at a moment in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InputState {
    pub up: bool,
    pub down: bool,
    pub left: bool,
    pub right: bool,
}

impl InputState {
    pub fn intent(self) -> Intent {
        Intent::from_keys(self.up, self.down, self.left, self.right)
    }
}

/// Produces sequenced commands, one per simulation step with active intent.
#[derive(Debug, Clone)]
pub struct InputSampler {
    last_sequence: Sequence,
    last_step: Option<Instant>,
    /// Delta used for the very first step, which has no predecessor.
    nominal_dt: f32,
}

impl InputSampler {
    pub fn new(nominal_dt: Duration) -> Self {
        Self {
            last_sequence: 0,
            last_step: None,
            nominal_dt: nominal_dt.as_secs_f32(),
        }
    }

    /// Restarts numbering for a freshly created entity.
    pub fn reset(&mut self) {
        self.last_sequence = 0;
        self.last_step = None;
    }

    /// Sequence of the most recently issued command, 0 if none.
    pub fn last_sequence(&self) -> Sequence {
        self.last_sequence
    }

    /// Samples one step, stamping the command with the current wall clock.
    pub fn sample(&mut self, input: InputState, now: Instant) -> Option<Command> {
        self.sample_at(input.intent(), now, unix_millis())
    }

    /// Samples one step with an explicit issue time.
    ///
    /// The step clock advances even when no command is produced, so the next
    /// command's delta only covers the time since this step.
    pub fn sample_at(&mut self, intent: Intent, now: Instant, issued_at_ms: i64) -> Option<Command> {
        let dt = match self.last_step {
            Some(prev) => now.saturating_duration_since(prev).as_secs_f32(),
            None => self.nominal_dt,
        };
        self.last_step = Some(now);

        if intent.is_idle() {
            return None;
        }

        let Some(sequence) = self.last_sequence.checked_add(1) else {
            warn!(last = self.last_sequence, "Command sequence space exhausted");
            return None;
        };
        self.last_sequence = sequence;
        Some(Command::new(
            sequence,
            intent,
            issued_at_ms,
            clamp_delta(dt),
        ))
    }
}
