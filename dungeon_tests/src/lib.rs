//! Shared helpers for the integration tests.
//!
//! `LossyLink` stands in for the datagram channel: it runs the authoritative
//! movement in-process and drops batches and acknowledgments at random, the
//! way an unreliable transport would, without reporting the loss.

use std::sync::Arc;

use async_trait::async_trait;
use dungeon_client::outbox::CommandSink;
use dungeon_shared::{
    command::{Acknowledgment, Command, Sequence},
    math::Vec2,
    movement::{self, CollisionWorld},
};
use rand::{rngs::StdRng, Rng, SeedableRng};

/// Installs a test-friendly subscriber once per process.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();
}

/// Authoritative simulation of a single entity.
pub struct LoopbackServer {
    position: Vec2,
    radius: f32,
    last_processed: Sequence,
    collided: bool,
    collision: Option<Arc<dyn CollisionWorld>>,
    applied: Vec<Sequence>,
}

impl LoopbackServer {
    pub fn new(spawn: Vec2, radius: f32, collision: Option<Arc<dyn CollisionWorld>>) -> Self {
        Self {
            position: spawn,
            radius,
            last_processed: 0,
            collided: false,
            collision,
            applied: Vec::new(),
        }
    }

    /// Applies unseen commands in order and acknowledges the batch.
    pub fn receive(&mut self, commands: &[Command]) -> Acknowledgment {
        for cmd in commands {
            if cmd.sequence <= self.last_processed {
                continue;
            }
            let result = movement::apply(self.position, cmd, self.radius, self.collision.as_deref());
            self.position = result.position;
            self.collided = result.collided;
            self.last_processed = cmd.sequence;
            self.applied.push(cmd.sequence);
        }
        Acknowledgment {
            last_sequence: self.last_processed,
            authoritative_position: self.position,
            collided: self.collided,
        }
    }

    pub fn position(&self) -> Vec2 {
        self.position
    }

    /// Every sequence applied, in application order.
    pub fn applied(&self) -> &[Sequence] {
        &self.applied
    }
}

/// Unreliable link to a `LoopbackServer`.
pub struct LossyLink {
    rng: StdRng,
    loss: f64,
    pub server: LoopbackServer,
    acks: Vec<Acknowledgment>,
    pub batches_lost: u32,
    pub acks_lost: u32,
}

impl LossyLink {
    /// `loss` is the drop probability in each direction.
    pub fn new(server: LoopbackServer, loss: f64, seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            loss: loss.clamp(0.0, 1.0),
            server,
            acks: Vec::new(),
            batches_lost: 0,
            acks_lost: 0,
        }
    }

    /// Acknowledgments that made it back since the last call.
    pub fn take_acks(&mut self) -> Vec<Acknowledgment> {
        std::mem::take(&mut self.acks)
    }
}

#[async_trait]
impl CommandSink for LossyLink {
    async fn send_batch(&mut self, commands: &[Command]) -> anyhow::Result<()> {
        if self.rng.gen_bool(self.loss) {
            self.batches_lost += 1;
            return Ok(());
        }
        let ack = self.server.receive(commands);
        if self.rng.gen_bool(self.loss) {
            self.acks_lost += 1;
        } else {
            self.acks.push(ack);
        }
        Ok(())
    }
}

/// Sink whose first `failures` sends error out, as a closed socket would.
#[derive(Default)]
pub struct FlakySink {
    pub failures: u32,
    pub delivered: Vec<Vec<Command>>,
}

impl FlakySink {
    pub fn failing(failures: u32) -> Self {
        Self {
            failures,
            delivered: Vec::new(),
        }
    }
}

#[async_trait]
impl CommandSink for FlakySink {
    async fn send_batch(&mut self, commands: &[Command]) -> anyhow::Result<()> {
        if self.failures > 0 {
            self.failures -= 1;
            anyhow::bail!("network unreachable");
        }
        self.delivered.push(commands.to_vec());
        Ok(())
    }
}
