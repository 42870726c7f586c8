//! Prediction pipeline.
//!
//! Wires the sampler, predictor, outbox and reconciler around the single
//! controlled entity:
//!
//! ```text
//! input -> sampler -> predictor -> entity position
//!                           \-> outbox -> network (every send tick)
//! ack -> outbox.prune -> reconciler -> entity position (replay)
//! ```
//!
//! Every operation that needs the entity returns
//! `PredictionError::NoControlledEntity` when none is attached.

use std::sync::Arc;

use dungeon_shared::{
    command::{Acknowledgment, Command, Intent},
    config::GameConfig,
    error::{PredictionError, PredictionResult},
    math::Vec2,
    movement::CollisionWorld,
    net::EntityId,
};
use tokio::time::Instant;
use tracing::info;

use crate::{
    ack::{handle_ack, AckReport},
    input::{InputSampler, InputState},
    outbox::{CommandSink, FlushOutcome, Outbox},
    predict::{ControlledEntity, Predictor},
    reconcile::Reconciler,
};

#[derive(Debug)]
pub struct PredictionPipeline {
    entity: Option<ControlledEntity>,
    sampler: InputSampler,
    predictor: Predictor,
    outbox: Outbox,
    reconciler: Reconciler,
    radius: f32,
}

impl PredictionPipeline {
    pub fn new(cfg: &GameConfig) -> Self {
        Self {
            entity: None,
            sampler: InputSampler::new(cfg.frame_interval()),
            predictor: Predictor::default(),
            outbox: Outbox::new(cfg.send_interval(), cfg.retry),
            reconciler: Reconciler::new(cfg.reconcile_threshold),
            radius: cfg.entity_radius,
        }
    }

    pub fn set_collision(&mut self, collision: Option<Arc<dyn CollisionWorld>>) {
        self.predictor.set_collision(collision);
    }

    /// Starts controlling a new entity. Sequence numbering and the outbox
    /// start over.
    pub fn attach(&mut self, id: EntityId, spawn: Vec2) {
        info!(entity = %id, x = spawn.x, y = spawn.y, "Controlling entity");
        self.entity = Some(ControlledEntity::new(id, spawn, self.radius));
        self.sampler.reset();
        self.outbox.clear();
    }

    pub fn detach(&mut self) -> Option<ControlledEntity> {
        self.outbox.clear();
        self.entity.take()
    }

    pub fn entity(&self) -> PredictionResult<&ControlledEntity> {
        self.entity.as_ref().ok_or(PredictionError::NoControlledEntity)
    }

    /// Current predicted position, for rendering and the camera.
    pub fn position(&self) -> PredictionResult<Vec2> {
        self.entity().map(ControlledEntity::position)
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn last_sequence(&self) -> u32 {
        self.sampler.last_sequence()
    }

    /// One simulation step: sample, predict, queue.
    pub fn step(&mut self, input: InputState, now: Instant) -> PredictionResult<Option<Command>> {
        self.step_at(input.intent(), now, dungeon_shared::command::unix_millis())
    }

    /// Like `step` with an explicit issue timestamp.
    pub fn step_at(
        &mut self,
        intent: Intent,
        now: Instant,
        issued_at_ms: i64,
    ) -> PredictionResult<Option<Command>> {
        let entity = self
            .entity
            .as_mut()
            .ok_or(PredictionError::NoControlledEntity)?;
        let Some(command) = self.sampler.sample_at(intent, now, issued_at_ms) else {
            return Ok(None);
        };
        let command = self.predictor.predict(entity, command);
        self.outbox.push(command.clone())?;
        Ok(Some(command))
    }

    /// Applies a server acknowledgment.
    pub fn on_ack(&mut self, ack: &Acknowledgment) -> PredictionResult<AckReport> {
        let entity = self
            .entity
            .as_mut()
            .ok_or(PredictionError::NoControlledEntity)?;
        Ok(handle_ack(
            ack,
            entity,
            &mut self.outbox,
            &mut self.reconciler,
            &self.predictor,
        ))
    }

    /// Sends pending commands if the network tick is due.
    pub async fn flush<S>(&mut self, sink: &mut S, now: Instant) -> PredictionResult<FlushOutcome>
    where
        S: CommandSink + ?Sized,
    {
        Ok(self.outbox.flush(sink, now).await?)
    }
}
