//! Server reconciliation.
//!
//! When an acknowledgment lands, the authoritative position is compared with
//! the locally predicted one. Small differences are ignored so harmless
//! timing drift never shows up as jitter. Larger ones rewind the entity to the
//! server's position and replay every command the server has not confirmed.

use dungeon_shared::{
    command::{Acknowledgment, Command},
    math::Vec2,
};
use tracing::debug;

use crate::predict::{ControlledEntity, Predictor};

/// Reconciler phase. `Reconciling` only lasts for the duration of a replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReconcileState {
    #[default]
    Predicting,
    Reconciling,
}

/// Result of handling one acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReconcileOutcome {
    /// Divergence within threshold; nothing changed.
    InSync { distance: f32 },
    /// Rewound to the server position and replayed pending commands.
    Corrected {
        distance: f32,
        replayed: usize,
        before: Vec2,
        after: Vec2,
    },
}

impl ReconcileOutcome {
    pub fn was_corrected(&self) -> bool {
        matches!(self, ReconcileOutcome::Corrected { .. })
    }
}

/// Replays `commands` in order starting at `start`.
///
/// Pure: the same start and the same commands always give the same result.
pub fn replay<'a, I>(start: Vec2, commands: I, predictor: &Predictor, radius: f32) -> (Vec2, usize)
where
    I: IntoIterator<Item = &'a Command>,
{
    commands
        .into_iter()
        .fold((start, 0), |(pos, n), cmd| (predictor.advance(pos, cmd, radius), n + 1))
}

#[derive(Debug, Clone)]
pub struct Reconciler {
    threshold: f32,
    state: ReconcileState,
    corrections: u64,
}

impl Reconciler {
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold,
            state: ReconcileState::Predicting,
            corrections: 0,
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn state(&self) -> ReconcileState {
        self.state
    }

    /// Number of replays performed so far.
    pub fn corrections(&self) -> u64 {
        self.corrections
    }

    /// Compares `ack` with the entity and replays `pending` if they diverge.
    ///
    /// Commands at or below `ack.last_sequence` are skipped; the rest are
    /// replayed in the order given, which must be issuance order.
    pub fn reconcile<'a, I>(
        &mut self,
        ack: &Acknowledgment,
        entity: &mut ControlledEntity,
        pending: I,
        predictor: &Predictor,
    ) -> ReconcileOutcome
    where
        I: IntoIterator<Item = &'a Command>,
    {
        let before = entity.position();
        let distance = before.distance(ack.authoritative_position);
        if distance <= self.threshold {
            return ReconcileOutcome::InSync { distance };
        }

        self.state = ReconcileState::Reconciling;
        let unconfirmed = pending
            .into_iter()
            .filter(|c| c.sequence > ack.last_sequence);
        let (after, replayed) = replay(
            ack.authoritative_position,
            unconfirmed,
            predictor,
            entity.radius(),
        );
        entity.set_position(after);
        self.corrections += 1;
        self.state = ReconcileState::Predicting;

        debug!(
            entity = %entity.id(),
            last_sequence = ack.last_sequence,
            distance,
            replayed,
            collided = ack.collided,
            "Reconciled with server"
        );

        ReconcileOutcome::Corrected {
            distance,
            replayed,
            before,
            after,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dungeon_shared::command::Intent;

    fn entity_at(x: f32, y: f32) -> ControlledEntity {
        ControlledEntity::new("p1".into(), Vec2::new(x, y), 12.0)
    }

    fn ack(last_sequence: u32, x: f32, y: f32) -> Acknowledgment {
        Acknowledgment {
            last_sequence,
            authoritative_position: Vec2::new(x, y),
            collided: false,
        }
    }

    #[test]
    fn small_divergence_is_ignored() {
        let mut reconciler = Reconciler::new(12.0);
        let mut entity = entity_at(110.0, 40.0);
        let outcome = reconciler.reconcile(
            &ack(5, 100.0, 40.0),
            &mut entity,
            std::iter::empty(),
            &Predictor::default(),
        );
        assert_eq!(outcome, ReconcileOutcome::InSync { distance: 10.0 });
        assert_eq!(entity.position(), Vec2::new(110.0, 40.0));
        assert_eq!(reconciler.corrections(), 0);
    }

    #[test]
    fn large_divergence_rewinds_and_replays() {
        let predictor = Predictor::default();
        let mut reconciler = Reconciler::new(12.0);
        let mut entity = entity_at(115.0, 40.0);
        let pending = vec![
            Command::new(6, Intent::RIGHT, 0, 0.1),
            Command::new(7, Intent::DOWN, 0, 0.05),
            Command::new(8, Intent::RIGHT, 0, 0.02),
        ];

        let outcome =
            reconciler.reconcile(&ack(5, 100.0, 40.0), &mut entity, &pending, &predictor);

        let expected = Vec2::new(100.0 + 30.0 + 6.0, 40.0 + 15.0);
        assert!(entity.position().distance(expected) < 1e-3);
        match outcome {
            ReconcileOutcome::Corrected {
                distance, replayed, ..
            } => {
                assert_eq!(distance, 15.0);
                assert_eq!(replayed, 3);
            }
            other => panic!("expected correction, got {other:?}"),
        }
        assert_eq!(reconciler.state(), ReconcileState::Predicting);
        assert_eq!(reconciler.corrections(), 1);
    }

    #[test]
    fn acknowledged_commands_are_not_replayed() {
        let predictor = Predictor::default();
        let mut reconciler = Reconciler::new(5.0);
        let mut entity = entity_at(0.0, 0.0);
        let pending = vec![
            Command::new(4, Intent::RIGHT, 0, 0.1),
            Command::new(5, Intent::RIGHT, 0, 0.1),
        ];
        let outcome = reconciler.reconcile(&ack(4, 50.0, 0.0), &mut entity, &pending, &predictor);
        assert!(outcome.was_corrected());
        assert!((entity.position().x - 80.0).abs() < 1e-3);
    }

    #[test]
    fn replay_is_deterministic() {
        let predictor = Predictor::default();
        let commands: Vec<Command> = (1..=20)
            .map(|i| {
                let intent = if i % 3 == 0 {
                    Intent::UP | Intent::LEFT
                } else {
                    Intent::RIGHT
                };
                Command::new(i, intent, 0, 0.016 + i as f32 * 0.001)
            })
            .collect();
        let start = Vec2::new(100.0, 40.0);
        let a = replay(start, &commands, &predictor, 12.0);
        let b = replay(start, &commands, &predictor, 12.0);
        assert_eq!(a, b);
        assert_eq!(a.1, 20);
    }
}
