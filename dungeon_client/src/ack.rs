//! Acknowledgment handling.

use dungeon_shared::command::Acknowledgment;

use crate::{
    outbox::Outbox,
    predict::{ControlledEntity, Predictor},
    reconcile::{ReconcileOutcome, Reconciler},
};

/// Result of one acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AckReport {
    /// Commands removed from the outbox.
    pub pruned: usize,
    /// Commands still awaiting acknowledgment.
    pub remaining: usize,
    pub outcome: ReconcileOutcome,
}

/// Prunes confirmed commands, then reconciles against what is left.
pub fn handle_ack(
    ack: &Acknowledgment,
    entity: &mut ControlledEntity,
    outbox: &mut Outbox,
    reconciler: &mut Reconciler,
    predictor: &Predictor,
) -> AckReport {
    let pruned = outbox.prune(ack.last_sequence);
    let outcome = reconciler.reconcile(ack, entity, outbox.pending(), predictor);
    AckReport {
        pruned,
        remaining: outbox.len(),
        outcome,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use dungeon_shared::{
        command::{Command, Intent},
        config::RetryConfig,
        math::Vec2,
    };

    fn setup(start: Vec2) -> (ControlledEntity, Outbox, Reconciler, Predictor) {
        (
            ControlledEntity::new("p1".into(), start, 12.0),
            Outbox::new(Duration::from_millis(16), RetryConfig::default()),
            Reconciler::new(12.0),
            Predictor::default(),
        )
    }

    #[test]
    fn matching_ack_empties_outbox_without_correction() {
        let (mut entity, mut outbox, mut reconciler, predictor) = setup(Vec2::new(100.0, 40.0));
        let cmd = predictor.predict(&mut entity, Command::new(5, Intent::RIGHT, 0, 0.1));
        outbox.push(cmd).unwrap();

        let ack = Acknowledgment {
            last_sequence: 5,
            authoritative_position: Vec2::new(130.0, 40.0),
            collided: false,
        };
        let report = handle_ack(&ack, &mut entity, &mut outbox, &mut reconciler, &predictor);

        assert_eq!(report.pruned, 1);
        assert_eq!(report.remaining, 0);
        assert!(!report.outcome.was_corrected());
        assert!(outbox.is_empty());
        assert!(entity.position().distance(Vec2::new(130.0, 40.0)) < 1e-3);
    }

    #[test]
    fn stale_position_triggers_replay_of_unacked() {
        let (mut entity, mut outbox, mut reconciler, predictor) = setup(Vec2::new(115.0, 40.0));
        for seq in 6..=8 {
            outbox
                .push(Command::new(seq, Intent::RIGHT, 0, 0.01))
                .unwrap();
        }
        let ack = Acknowledgment {
            last_sequence: 5,
            authoritative_position: Vec2::new(100.0, 40.0),
            collided: false,
        };
        let report = handle_ack(&ack, &mut entity, &mut outbox, &mut reconciler, &predictor);

        assert_eq!(report.pruned, 0);
        assert_eq!(report.remaining, 3);
        assert!(report.outcome.was_corrected());
        assert!((entity.position().x - 109.0).abs() < 1e-3);
    }
}
