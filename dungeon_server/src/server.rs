//! Server implementation.
//!
//! An authoritative server loop. It supports:
//! - Grid map loading (file or built-in arena)
//! - Client connection with map transfer and join/leave notifications
//! - Applying client command batches with the shared movement contract
//! - Acknowledging the last processed command with the authoritative position
//! - Broadcasting sequenced position updates to the other clients
//! - Console commands (status, kick, quit)
//!
//! Determinism notes:
//! - Movement uses the exact step function the clients predict with.
//! - Commands are applied strictly in sequence order, each at most once.
//! - Clients are iterated in id order.

use std::{
    collections::BTreeMap,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use anyhow::Context;
use dungeon_shared::{
    collision::TileGrid,
    command::{Acknowledgment, Sequence},
    config::GameConfig,
    math::Vec2,
    movement::{self, CollisionWorld},
    net::{
        ClientId, CommandBatch, EntityId, MapInfo, NetMsg, ReliableConn, ReliableListener,
        RemoteUpdate, PROTOCOL_VERSION,
    },
};
use tokio::{net::UdpSocket, sync::mpsc, time::Instant};
use tracing::{debug, info, warn};

/// Predicted and authoritative positions further apart than this are logged.
const PREDICTION_MISMATCH_LOG: f32 = 0.5;

/// Connected client state.
struct ClientSlot {
    name: String,
    entity: EntityId,
    reliable: ReliableConn,
    udp_peer: SocketAddr,
    position: Vec2,
    last_processed: Sequence,
    last_collided: bool,
    /// Sequence stamped on this entity's broadcast moves.
    update_seq: Sequence,
    moved: bool,
}

/// Game server.
pub struct GameServer {
    pub cfg: GameConfig,
    grid: TileGrid,
    clients: BTreeMap<ClientId, ClientSlot>,

    tcp: ReliableListener,
    udp: UdpSocket,

    tick: u32,

    /// Channel for console commands from stdin.
    console_rx: Option<mpsc::Receiver<String>>,
    quit: bool,
}

impl GameServer {
    /// Creates a new server with the given config.
    pub async fn new(cfg: GameConfig) -> anyhow::Result<Self> {
        let addr: SocketAddr = cfg.server_addr.parse().context("parse server_addr")?;
        let tcp = ReliableListener::bind(addr).await?;
        // Same port for datagrams, so clients only need one address.
        let udp_addr = tcp.local_addr()?;
        let udp = UdpSocket::bind(udp_addr).await.context("udp bind")?;
        let grid = load_grid(&cfg)?;
        Ok(Self::from_parts(cfg, grid, tcp, udp))
    }

    fn from_parts(mut cfg: GameConfig, grid: TileGrid, tcp: ReliableListener, udp: UdpSocket) -> Self {
        if let Ok(addr) = tcp.local_addr() {
            cfg.server_addr = addr.to_string();
        }
        info!(map = %grid.name, width = grid.width(), height = grid.height(), "Map loaded");
        Self {
            cfg,
            grid,
            clients: BTreeMap::new(),
            tcp,
            udp,
            tick: 0,
            console_rx: None,
            quit: false,
        }
    }

    /// Sets the console input receiver.
    pub fn set_console_input(&mut self, rx: mpsc::Receiver<String>) {
        self.console_rx = Some(rx);
    }

    /// Returns the local address (after binding).
    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.tcp.local_addr()
    }

    pub fn tick(&self) -> u32 {
        self.tick
    }

    pub fn grid(&self) -> &TileGrid {
        &self.grid
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// True once `quit` was entered on the console.
    pub fn should_quit(&self) -> bool {
        self.quit
    }

    /// Authoritative position of a client's entity.
    pub fn position_of(&self, client_id: ClientId) -> Option<Vec2> {
        self.clients.get(&client_id).map(|c| c.position)
    }

    /// Last command sequence applied for a client.
    pub fn last_processed(&self, client_id: ClientId) -> Option<Sequence> {
        self.clients.get(&client_id).map(|c| c.last_processed)
    }

    /// Map info for network transmission.
    pub fn map_info(&self) -> MapInfo {
        MapInfo {
            name: self.grid.name.clone(),
            tile_size: self.grid.tile_size,
            rows: self.grid.rows(),
        }
    }

    /// Accepts exactly one client (handshake + map info).
    pub async fn accept_one(&mut self) -> anyhow::Result<ClientId> {
        let (conn, peer) = self.tcp.accept().await?;
        self.handle_new_connection(conn, peer).await
    }

    /// Accepts a client with timeout (non-blocking).
    pub async fn try_accept(&mut self, timeout: Duration) -> anyhow::Result<Option<ClientId>> {
        match tokio::time::timeout(timeout, self.tcp.accept()).await {
            Ok(Ok((conn, peer))) => self.handle_new_connection(conn, peer).await.map(Some),
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(None), // Timeout
        }
    }

    async fn handle_new_connection(
        &mut self,
        mut conn: ReliableConn,
        peer: SocketAddr,
    ) -> anyhow::Result<ClientId> {
        let name = match conn.recv().await? {
            NetMsg::Hello { protocol, name } if protocol == PROTOCOL_VERSION => name,
            other => anyhow::bail!("unexpected handshake msg: {other:?}"),
        };
        let client_udp_port = match conn.recv().await? {
            NetMsg::UdpHello { client_udp_port } => client_udp_port,
            other => anyhow::bail!("expected UdpHello, got {other:?}"),
        };

        let id = ClientId::new_unique();
        let entity = EntityId::for_client(id);
        let spawns = self.grid.spawn_points();
        let spawn = if spawns.is_empty() {
            Vec2::ZERO
        } else {
            spawns[self.clients.len() % spawns.len()]
        };

        conn.send(&NetMsg::Welcome {
            client_id: id,
            entity: entity.clone(),
            spawn,
        })
        .await?;
        conn.send(&NetMsg::MapInfo(self.map_info())).await?;

        // Tell the newcomer about everyone already here.
        for other in self.clients.values() {
            conn.send(&NetMsg::PlayerJoined {
                id: other.entity.clone(),
                position: other.position,
            })
            .await?;
        }

        let udp_peer = SocketAddr::new(peer.ip(), client_udp_port);
        self.clients.insert(
            id,
            ClientSlot {
                name: name.clone(),
                entity: entity.clone(),
                reliable: conn,
                udp_peer,
                position: spawn,
                last_processed: 0,
                last_collided: false,
                update_seq: 0,
                moved: false,
            },
        );
        info!(client_id = ?id, entity = %entity, name = %name, %udp_peer, "Client connected");

        self.broadcast_reliable(
            Some(id),
            NetMsg::PlayerJoined {
                id: entity,
                position: spawn,
            },
        )
        .await;
        Ok(id)
    }

    /// Runs the server for a number of ticks.
    pub async fn run_for_ticks(&mut self, ticks: u32) -> anyhow::Result<()> {
        let dt = self.cfg.tick_interval();
        let mut next = Instant::now();

        for _ in 0..ticks {
            next += dt;
            self.step().await?;
            tokio::time::sleep_until(next).await;
        }
        Ok(())
    }

    /// Executes one fixed simulation step.
    pub async fn step(&mut self) -> anyhow::Result<()> {
        self.process_console_commands().await?;
        self.recv_datagrams().await?;
        self.broadcast_moves().await;
        self.tick += 1;
        Ok(())
    }

    async fn process_console_commands(&mut self) -> anyhow::Result<()> {
        // Collect lines first to avoid borrow conflict
        let lines: Vec<String> = if let Some(ref mut rx) = self.console_rx {
            let mut collected = Vec::new();
            while let Ok(line) = rx.try_recv() {
                collected.push(line);
            }
            collected
        } else {
            Vec::new()
        };

        for line in lines {
            for out in self.exec_console(&line).await? {
                println!("{out}");
            }
        }
        Ok(())
    }

    /// Executes a console command.
    pub async fn exec_console(&mut self, line: &str) -> anyhow::Result<Vec<String>> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.is_empty() {
            return Ok(Vec::new());
        }

        match tokens[0] {
            "status" => {
                let mut out = Vec::new();
                out.push(format!("Tick: {}", self.tick));
                out.push(format!("Map: {}", self.grid.name));
                out.push(format!("Clients: {}", self.clients.len()));
                for (id, c) in &self.clients {
                    out.push(format!(
                        "  {:?} {} ({}): udp={} pos=({:.1}, {:.1}) last_seq={} collided={}",
                        id,
                        c.entity,
                        c.name,
                        c.udp_peer,
                        c.position.x,
                        c.position.y,
                        c.last_processed,
                        c.last_collided
                    ));
                }
                Ok(out)
            }
            "kick" => {
                let Some(id) = tokens.get(1).and_then(|t| t.parse::<u32>().ok()) else {
                    return Ok(vec!["Usage: kick <client id>".to_string()]);
                };
                if self.drop_client(ClientId(id), "kicked").await {
                    Ok(vec![format!("Kicked client {id}")])
                } else {
                    Ok(vec![format!("No client {id}")])
                }
            }
            "quit" | "exit" => {
                info!("Server shutting down");
                self.quit = true;
                Ok(vec!["Shutting down".to_string()])
            }
            other => Ok(vec![format!("Unknown command: {other}")]),
        }
    }

    async fn recv_datagrams(&mut self) -> anyhow::Result<()> {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            match self.udp.try_recv_from(&mut buf) {
                Ok((n, from)) => match serde_json::from_slice::<NetMsg>(&buf[..n]) {
                    Ok(msg) => self.handle_udp_message(from, msg).await,
                    Err(e) => debug!(%from, error = %e, "Undecodable datagram"),
                },
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e).context("udp recv"),
            }
        }
        Ok(())
    }

    async fn handle_udp_message(&mut self, from: SocketAddr, msg: NetMsg) {
        match msg {
            NetMsg::Commands(batch) => {
                let client_id = batch.client_id;
                if let Some(ack) = self.on_commands(from, batch) {
                    self.send_datagram(from, &NetMsg::Ack(ack)).await;
                } else {
                    debug!(client_id = ?client_id, %from, "Command batch rejected");
                }
            }
            NetMsg::Disconnect { reason } => {
                let id = self
                    .clients
                    .iter()
                    .find(|(_, c)| c.udp_peer == from)
                    .map(|(id, _)| *id);
                if let Some(id) = id {
                    info!(client_id = ?id, reason = %reason, "Client disconnected");
                    self.drop_client(id, &reason).await;
                }
            }
            other => {
                debug!(?other, "Unexpected UDP message");
            }
        }
    }

    /// Applies every new command in the batch and returns the acknowledgment.
    /// Batches from an unknown client or from another host than the one that
    /// did the handshake are rejected.
    fn on_commands(&mut self, from: SocketAddr, batch: CommandBatch) -> Option<Acknowledgment> {
        let radius = self.cfg.entity_radius;
        let grid = &self.grid;
        let c = self.clients.get_mut(&batch.client_id)?;
        if from.ip() != c.udp_peer.ip() {
            warn!(
                entity = %c.entity,
                %from,
                expected = %c.udp_peer.ip(),
                "Command batch from foreign address"
            );
            return None;
        }
        // The port may change behind NAT.
        c.udp_peer = from;

        for cmd in &batch.commands {
            // Resent commands arrive again until acknowledged.
            if cmd.sequence <= c.last_processed {
                continue;
            }
            let result = movement::apply(c.position, cmd, radius, Some(grid as &dyn CollisionWorld));
            if let Some(claimed) = cmd.resulting_position {
                let diff = claimed.distance(result.position);
                if diff > PREDICTION_MISMATCH_LOG {
                    debug!(
                        entity = %c.entity,
                        sequence = cmd.sequence,
                        diff,
                        "Client prediction differs from server"
                    );
                }
            }
            c.position = result.position;
            c.last_collided = result.collided;
            c.last_processed = cmd.sequence;
            c.moved = true;
        }

        Some(Acknowledgment {
            last_sequence: c.last_processed,
            authoritative_position: c.position,
            collided: c.last_collided,
        })
    }

    /// Sends a sequenced position update for every entity that moved.
    async fn broadcast_moves(&mut self) {
        let mut updates = Vec::new();
        for c in self.clients.values_mut() {
            if c.moved {
                c.moved = false;
                c.update_seq += 1;
                updates.push(RemoteUpdate {
                    id: c.entity.clone(),
                    position: c.position,
                    sequence: Some(c.update_seq),
                });
            }
        }
        for update in updates {
            let peers: Vec<SocketAddr> = self
                .clients
                .values()
                .filter(|c| c.entity != update.id)
                .map(|c| c.udp_peer)
                .collect();
            let msg = NetMsg::PlayerMoved(update);
            for peer in peers {
                self.send_datagram(peer, &msg).await;
            }
        }
    }

    async fn send_datagram(&self, to: SocketAddr, msg: &NetMsg) {
        match serde_json::to_vec(msg) {
            Ok(payload) => {
                if let Err(e) = self.udp.send_to(&payload, to).await {
                    debug!(%to, error = %e, "UDP send failed");
                }
            }
            Err(e) => warn!(error = %e, "Serialize datagram"),
        }
    }

    /// Sends to every client except `except`. Clients whose stream fails are
    /// dropped.
    async fn broadcast_reliable(&mut self, except: Option<ClientId>, msg: NetMsg) {
        let mut queue = vec![(except, msg)];
        while let Some((except, msg)) = queue.pop() {
            let mut failed = Vec::new();
            for (id, c) in self.clients.iter_mut() {
                if Some(*id) == except {
                    continue;
                }
                if let Err(e) = c.reliable.send(&msg).await {
                    warn!(client_id = ?id, error = %e, "Reliable send failed");
                    failed.push(*id);
                }
            }
            for id in failed {
                if let Some(c) = self.clients.remove(&id) {
                    info!(client_id = ?id, entity = %c.entity, "Client dropped");
                    queue.push((None, NetMsg::PlayerLeft { id: c.entity }));
                }
            }
        }
    }

    /// Removes a client and tells everyone else. Returns false if unknown.
    pub async fn drop_client(&mut self, id: ClientId, reason: &str) -> bool {
        let Some(mut c) = self.clients.remove(&id) else {
            return false;
        };
        let _ = c
            .reliable
            .send(&NetMsg::Disconnect {
                reason: reason.to_string(),
            })
            .await;
        info!(client_id = ?id, entity = %c.entity, reason, "Client removed");
        self.broadcast_reliable(None, NetMsg::PlayerLeft { id: c.entity })
            .await;
        true
    }
}

fn load_grid(cfg: &GameConfig) -> anyhow::Result<TileGrid> {
    match &cfg.map {
        Some(path) => TileGrid::load(path, dungeon_shared::collision::DEFAULT_TILE_SIZE),
        None => Ok(TileGrid::arena(24, 18)),
    }
}

/// Helper for tests: bind to an ephemeral port.
pub async fn bind_ephemeral(tick_hz: u32) -> anyhow::Result<(GameServer, GameConfig)> {
    bind_ephemeral_with(TileGrid::arena(24, 18), tick_hz).await
}

/// Like `bind_ephemeral` with a specific map.
pub async fn bind_ephemeral_with(
    grid: TileGrid,
    tick_hz: u32,
) -> anyhow::Result<(GameServer, GameConfig)> {
    let cfg = GameConfig {
        server_addr: format!("{}:{}", IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
        tick_hz,
        ..Default::default()
    };

    // Bind TCP first to get an ephemeral port, then bind UDP to that same port.
    let tcp = ReliableListener::bind(cfg.server_addr.parse()?).await?;
    let addr = tcp.local_addr()?;
    let udp_bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port());
    let udp = UdpSocket::bind(udp_bind).await?;

    let server = GameServer::from_parts(cfg, grid, tcp, udp);
    let cfg = server.cfg.clone();
    Ok((server, cfg))
}

#[cfg(test)]
mod tests {
    use dungeon_shared::command::{Command, Intent};
    use tokio::net::TcpStream;

    use super::*;

    struct RawClient {
        reliable: ReliableConn,
        udp: UdpSocket,
        client_id: ClientId,
        spawn: Vec2,
    }

    async fn raw_handshake(addr: SocketAddr, name: &str) -> anyhow::Result<RawClient> {
        let udp = UdpSocket::bind("127.0.0.1:0").await?;
        udp.connect(addr).await?;
        let mut reliable = ReliableConn::new(TcpStream::connect(addr).await?);
        reliable
            .send(&NetMsg::Hello {
                protocol: PROTOCOL_VERSION,
                name: name.to_string(),
            })
            .await?;
        reliable
            .send(&NetMsg::UdpHello {
                client_udp_port: udp.local_addr()?.port(),
            })
            .await?;
        let (client_id, spawn) = match reliable.recv().await? {
            NetMsg::Welcome {
                client_id, spawn, ..
            } => (client_id, spawn),
            other => anyhow::bail!("expected Welcome, got {other:?}"),
        };
        match reliable.recv().await? {
            NetMsg::MapInfo(_) => {}
            other => anyhow::bail!("expected MapInfo, got {other:?}"),
        }
        Ok(RawClient {
            reliable,
            udp,
            client_id,
            spawn,
        })
    }

    async fn connect(server: &mut GameServer, name: &str) -> anyhow::Result<RawClient> {
        let addr = server.local_addr()?;
        let (accepted, client) = tokio::join!(server.accept_one(), raw_handshake(addr, name));
        let client = client?;
        assert_eq!(accepted?, client.client_id);
        Ok(client)
    }

    async fn send_udp(client: &RawClient, msg: &NetMsg) -> anyhow::Result<()> {
        client.udp.send(&serde_json::to_vec(msg)?).await?;
        Ok(())
    }

    /// Steps the server until the socket receives something.
    async fn step_until_recv(server: &mut GameServer, udp: &UdpSocket) -> anyhow::Result<NetMsg> {
        let mut buf = vec![0u8; 64 * 1024];
        for _ in 0..100 {
            server.step().await?;
            if let Ok(n) = tokio::time::timeout(Duration::from_millis(10), udp.recv(&mut buf)).await
            {
                return Ok(serde_json::from_slice(&buf[..n?])?);
            }
        }
        anyhow::bail!("nothing received")
    }

    #[tokio::test]
    async fn handshake_assigns_spawn_and_map() -> anyhow::Result<()> {
        let (mut server, _cfg) = bind_ephemeral(60).await?;
        let client = connect(&mut server, "alice").await?;

        assert_eq!(server.client_count(), 1);
        assert_eq!(client.spawn, server.grid().spawn_points()[0]);
        assert_eq!(server.position_of(client.client_id), Some(client.spawn));
        assert_eq!(server.last_processed(client.client_id), Some(0));
        Ok(())
    }

    #[tokio::test]
    async fn wrong_protocol_is_rejected() -> anyhow::Result<()> {
        let (mut server, _cfg) = bind_ephemeral(60).await?;
        let addr = server.local_addr()?;
        let client = async {
            let mut conn = ReliableConn::new(TcpStream::connect(addr).await?);
            conn.send(&NetMsg::Hello {
                protocol: PROTOCOL_VERSION + 1,
                name: "old".to_string(),
            })
            .await?;
            anyhow::Ok(conn)
        };
        let (accepted, conn) = tokio::join!(server.accept_one(), client);
        conn?;
        assert!(accepted.is_err());
        assert_eq!(server.client_count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn resent_commands_apply_once() -> anyhow::Result<()> {
        let (mut server, _cfg) = bind_ephemeral(60).await?;
        let client = connect(&mut server, "alice").await?;

        let c1 = Command::new(1, Intent::RIGHT, 0, 0.1);
        let c2 = Command::new(2, Intent::DOWN, 0, 0.1);
        let c3 = Command::new(3, Intent::RIGHT, 0, 0.1);

        send_udp(
            &client,
            &NetMsg::Commands(CommandBatch {
                client_id: client.client_id,
                commands: vec![c1.clone(), c2.clone()],
            }),
        )
        .await?;
        let NetMsg::Ack(first) = step_until_recv(&mut server, &client.udp).await? else {
            anyhow::bail!("expected ack");
        };
        assert_eq!(first.last_sequence, 2);

        // The unacknowledged prefix is resent along with the new command.
        send_udp(
            &client,
            &NetMsg::Commands(CommandBatch {
                client_id: client.client_id,
                commands: vec![c1, c2, c3],
            }),
        )
        .await?;
        let NetMsg::Ack(second) = step_until_recv(&mut server, &client.udp).await? else {
            anyhow::bail!("expected ack");
        };

        let expected = client.spawn + Vec2::new(60.0, 30.0);
        assert_eq!(second.last_sequence, 3);
        assert!(second.authoritative_position.distance(expected) < 1e-3);
        assert!(!second.collided);
        assert_eq!(server.last_processed(client.client_id), Some(3));
        Ok(())
    }

    #[tokio::test]
    async fn walls_stop_movement_and_set_collided() -> anyhow::Result<()> {
        let grid = TileGrid::from_rows("closet", &["###", "#S#", "###"], 32.0)?;
        let (mut server, _cfg) = bind_ephemeral_with(grid, 60).await?;
        let client = connect(&mut server, "alice").await?;

        send_udp(
            &client,
            &NetMsg::Commands(CommandBatch {
                client_id: client.client_id,
                commands: vec![Command::new(1, Intent::UP, 0, 0.1)],
            }),
        )
        .await?;
        let NetMsg::Ack(ack) = step_until_recv(&mut server, &client.udp).await? else {
            anyhow::bail!("expected ack");
        };
        assert!(ack.collided);
        assert_eq!(ack.authoritative_position, client.spawn);
        Ok(())
    }

    #[tokio::test]
    async fn moves_reach_other_clients_and_leaves_are_announced() -> anyhow::Result<()> {
        let (mut server, _cfg) = bind_ephemeral(60).await?;
        let alice = connect(&mut server, "alice").await?;
        let mut bob = connect(&mut server, "bob").await?;
        let mut alice_reliable = alice.reliable;

        // Alice learns about bob over the reliable stream.
        let alice_entity = EntityId::for_client(alice.client_id);
        let bob_entity = EntityId::for_client(bob.client_id);
        match alice_reliable.recv().await? {
            NetMsg::PlayerJoined { id, .. } => assert_eq!(id, bob_entity),
            other => anyhow::bail!("expected PlayerJoined, got {other:?}"),
        }
        // Bob was told about alice during his handshake.
        match bob.reliable.recv().await? {
            NetMsg::PlayerJoined { id, .. } => assert_eq!(id, alice_entity),
            other => anyhow::bail!("expected PlayerJoined, got {other:?}"),
        }

        let alice_udp = alice.udp;
        alice_udp
            .send(&serde_json::to_vec(&NetMsg::Commands(CommandBatch {
                client_id: alice.client_id,
                commands: vec![Command::new(1, Intent::LEFT, 0, 0.1)],
            }))?)
            .await?;
        let NetMsg::PlayerMoved(update) = step_until_recv(&mut server, &bob.udp).await? else {
            anyhow::bail!("expected PlayerMoved");
        };
        assert_eq!(update.id, alice_entity);
        assert_eq!(update.sequence, Some(1));
        assert!(update.position.distance(alice.spawn - Vec2::new(30.0, 0.0)) < 1e-3);

        alice_udp
            .send(&serde_json::to_vec(&NetMsg::Disconnect {
                reason: "bye".to_string(),
            })?)
            .await?;
        for _ in 0..100 {
            server.step().await?;
            if server.client_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(server.client_count(), 1);
        match bob.reliable.recv().await? {
            NetMsg::PlayerLeft { id } => assert_eq!(id, alice_entity),
            other => anyhow::bail!("expected PlayerLeft, got {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn console_commands() -> anyhow::Result<()> {
        let (mut server, _cfg) = bind_ephemeral(60).await?;
        let status = server.exec_console("status").await?;
        assert!(status.iter().any(|l| l == "Clients: 0"));
        assert_eq!(
            server.exec_console("kick 999").await?,
            vec!["No client 999".to_string()]
        );
        assert!(server.exec_console("").await?.is_empty());
        assert!(!server.should_quit());
        server.exec_console("quit").await?;
        assert!(server.should_quit());
        Ok(())
    }

    #[tokio::test]
    async fn batches_from_another_host_are_rejected() -> anyhow::Result<()> {
        let (mut server, _cfg) = bind_ephemeral(60).await?;
        let client = connect(&mut server, "alice").await?;
        let legit = client.udp.local_addr()?;

        let forged = CommandBatch {
            client_id: client.client_id,
            commands: vec![Command::new(1, Intent::RIGHT, 0, 0.1)],
        };
        let spoofer: SocketAddr = "10.1.2.3:40001".parse()?;
        assert!(server.on_commands(spoofer, forged.clone()).is_none());
        assert_eq!(server.last_processed(client.client_id), Some(0));
        assert_eq!(server.position_of(client.client_id), Some(client.spawn));

        // Same host, new port: accepted and acknowledged there.
        let rebound = SocketAddr::new(legit.ip(), legit.port().wrapping_add(1));
        let ack = server
            .on_commands(rebound, forged)
            .ok_or_else(|| anyhow::anyhow!("batch from handshake host rejected"))?;
        assert_eq!(ack.last_sequence, 1);
        Ok(())
    }
}
