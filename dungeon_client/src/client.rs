//! Client implementation.
//!
//! The client maintains:
//! - A reliable control stream (handshake, map, joins and leaves), drained by
//!   a background task into a channel
//! - An unreliable datagram socket (command batches, acks, remote moves)
//! - The prediction pipeline for the controlled entity
//! - The remote entity interpolator
//!
//! Everything runs on the caller's task; nothing here is shared between
//! threads.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use dungeon_shared::{
    collision::TileGrid,
    command::Command,
    config::GameConfig,
    error::{OutboxError, PredictionError},
    math::Vec2,
    net::{
        commands_fitting_datagram, ClientId, CommandBatch, EntityId, MapInfo, NetMsg,
        ReliableConn, UnreliableConn, PROTOCOL_VERSION,
    },
};
use tokio::{
    net::TcpStream,
    sync::mpsc::{self, error::TryRecvError},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, info, warn};

use crate::{
    input::InputState,
    interp::{RemoteInterpolator, UpdateOutcome},
    outbox::{CommandSink, FlushOutcome},
    pipeline::PredictionPipeline,
};

/// Upper bound on datagrams handled per poll.
const MAX_DATAGRAMS_PER_POLL: usize = 256;

/// Client connection state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientState {
    /// Not connected to any server.
    Disconnected,
    /// Handshake done, entity attached.
    Playing,
}

/// Sends command batches over the unreliable channel.
pub struct UdpCommandSink<'a> {
    conn: &'a UnreliableConn,
    client_id: ClientId,
}

impl<'a> UdpCommandSink<'a> {
    pub fn new(conn: &'a UnreliableConn, client_id: ClientId) -> Self {
        Self { conn, client_id }
    }
}

#[async_trait]
impl CommandSink for UdpCommandSink<'_> {
    async fn send_batch(&mut self, commands: &[Command]) -> anyhow::Result<()> {
        self.conn
            .send(&NetMsg::Commands(CommandBatch {
                client_id: self.client_id,
                commands: commands.to_vec(),
            }))
            .await
    }

    fn batch_limit(&self, commands: &[Command]) -> usize {
        match commands_fitting_datagram(commands) {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "Cannot size command batch");
                commands.len()
            }
        }
    }
}

/// High-level game client.
pub struct GameClient {
    pub client_id: ClientId,
    pub entity_id: EntityId,
    pub state: ClientState,
    pub map: Option<TileGrid>,
    pub pipeline: PredictionPipeline,
    pub remotes: RemoteInterpolator,
    pub unreliable: UnreliableConn,

    reliable_rx: mpsc::Receiver<NetMsg>,
    reader: JoinHandle<()>,
}

impl GameClient {
    /// Connects to a server and performs handshake.
    pub async fn connect(cfg: &GameConfig) -> anyhow::Result<Self> {
        let server_addr: SocketAddr = cfg.server_addr.parse().context("parse server_addr")?;

        info!(server = %server_addr, "Connecting to server");

        // Bind UDP first so we can tell the server where to send datagrams.
        let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let unreliable = UnreliableConn::connect(bind, server_addr).await?;
        let client_udp_port = unreliable.local_addr().context("udp local_addr")?.port();

        let stream = TcpStream::connect(server_addr)
            .await
            .context("tcp connect")?;
        stream.set_nodelay(true).context("tcp nodelay")?;
        let mut reliable = ReliableConn::new(stream);

        reliable
            .send(&NetMsg::Hello {
                protocol: PROTOCOL_VERSION,
                name: cfg.player_name.clone(),
            })
            .await?;
        reliable.send(&NetMsg::UdpHello { client_udp_port }).await?;

        let (client_id, entity_id, spawn) = match reliable.recv().await? {
            NetMsg::Welcome {
                client_id,
                entity,
                spawn,
            } => (client_id, entity, spawn),
            other => anyhow::bail!("expected Welcome, got {other:?}"),
        };

        let map = match reliable.recv().await? {
            NetMsg::MapInfo(info) => grid_from_info(&info)?,
            other => anyhow::bail!("expected MapInfo, got {other:?}"),
        };

        info!(client_id = ?client_id, entity = %entity_id, map = %map.name, "Connected to server");

        let mut pipeline = PredictionPipeline::new(cfg);
        pipeline.set_collision(Some(Arc::new(map.clone())));
        pipeline.attach(entity_id.clone(), spawn);

        let (tx, reliable_rx) = mpsc::channel(64);
        let reader = tokio::spawn(async move {
            loop {
                match reliable.recv().await {
                    Ok(msg) => {
                        if tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "Reliable stream closed");
                        break;
                    }
                }
            }
        });

        Ok(Self {
            client_id,
            entity_id,
            state: ClientState::Playing,
            map: Some(map),
            pipeline,
            remotes: RemoteInterpolator::new(cfg.interp_factor, cfg.unsequenced_guard()),
            unreliable,
            reliable_rx,
            reader,
        })
    }

    /// Predicted position of the controlled entity.
    pub fn position(&self) -> anyhow::Result<Vec2> {
        Ok(self.pipeline.position()?)
    }

    /// One render frame: ease remote entities, then sample and predict.
    pub fn frame(&mut self, input: InputState, now: Instant) -> anyhow::Result<Option<Command>> {
        self.remotes.step();
        if self.state != ClientState::Playing {
            return Ok(None);
        }
        Ok(self.pipeline.step(input, now)?)
    }

    /// Network tick: resend every unacknowledged command if due.
    pub async fn network_tick(&mut self, now: Instant) -> anyhow::Result<FlushOutcome> {
        if self.state != ClientState::Playing {
            return Ok(FlushOutcome::Empty);
        }
        let mut sink = UdpCommandSink::new(&self.unreliable, self.client_id);
        match self.pipeline.flush(&mut sink, now).await {
            Ok(outcome) => Ok(outcome),
            Err(PredictionError::Outbox(e @ OutboxError::RetriesExhausted { .. })) => {
                warn!(error = %e, pending = self.pipeline.outbox().len(), "Giving up on server");
                self.state = ClientState::Disconnected;
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Drains both channels. Returns the number of messages handled.
    pub fn poll_network(&mut self, now: Instant) -> anyhow::Result<usize> {
        let mut handled = 0;

        loop {
            match self.reliable_rx.try_recv() {
                Ok(msg) => {
                    self.handle_message(msg, now)?;
                    handled += 1;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    if self.state != ClientState::Disconnected {
                        info!("Server closed the reliable stream");
                        self.state = ClientState::Disconnected;
                    }
                    break;
                }
            }
        }

        for _ in 0..MAX_DATAGRAMS_PER_POLL {
            match self.unreliable.try_recv() {
                Ok(Some(msg)) => {
                    self.handle_message(msg, now)?;
                    handled += 1;
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Dropping bad datagram");
                }
            }
        }

        Ok(handled)
    }

    /// Waits up to `timeout` for datagrams, then drains everything queued.
    pub async fn wait_network(&mut self, timeout: std::time::Duration) -> anyhow::Result<usize> {
        let mut handled = 0;
        if let Some(msg) = self.unreliable.recv_timeout(timeout).await? {
            self.handle_message(msg, Instant::now())?;
            handled += 1;
        }
        Ok(handled + self.poll_network(Instant::now())?)
    }

    fn handle_message(&mut self, msg: NetMsg, now: Instant) -> anyhow::Result<()> {
        match msg {
            NetMsg::Ack(ack) => match self.pipeline.on_ack(&ack) {
                Ok(report) => {
                    debug!(
                        last_sequence = ack.last_sequence,
                        pruned = report.pruned,
                        remaining = report.remaining,
                        corrected = report.outcome.was_corrected(),
                        "Ack"
                    );
                }
                Err(e) => debug!(error = %e, "Ack without a controlled entity"),
            },
            NetMsg::PlayerMoved(update) => {
                if update.id != self.entity_id
                    && self.remotes.on_update(&update, now) == UpdateOutcome::Created
                {
                    info!(entity = %update.id, "Remote player seen");
                }
            }
            NetMsg::PlayerJoined { id, position } => {
                if id != self.entity_id {
                    info!(entity = %id, "Player joined");
                    self.remotes.on_join(id, position, now);
                }
            }
            NetMsg::PlayerLeft { id } => {
                info!(entity = %id, "Player left");
                self.remotes.remove(&id);
            }
            NetMsg::MapInfo(info) => {
                let grid = grid_from_info(&info)?;
                info!(map = %grid.name, "Map changed");
                self.pipeline.set_collision(Some(Arc::new(grid.clone())));
                self.map = Some(grid);
            }
            NetMsg::Disconnect { reason } => {
                info!(reason = %reason, "Disconnected from server");
                self.state = ClientState::Disconnected;
            }
            other => {
                debug!(?other, "Unhandled message");
            }
        }
        Ok(())
    }

    /// Tells the server we are leaving and drops local state.
    pub async fn disconnect(&mut self) -> anyhow::Result<()> {
        if self.state == ClientState::Disconnected {
            return Ok(());
        }
        self.state = ClientState::Disconnected;
        self.pipeline.detach();
        self.remotes.clear();
        self.reader.abort();
        self.unreliable
            .send(&NetMsg::Disconnect {
                reason: "client quit".to_string(),
            })
            .await
    }

    /// Returns the server address of the datagram channel.
    pub fn server_peer(&self) -> SocketAddr {
        self.unreliable.peer_addr()
    }
}

impl Drop for GameClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

fn grid_from_info(info: &MapInfo) -> anyhow::Result<TileGrid> {
    TileGrid::from_rows(info.name.clone(), &info.rows, info.tile_size)
        .with_context(|| format!("build map {}", info.name))
}
