//! Networking primitives.
//!
//! Goals:
//! - Provide a simple reliable (TCP) and unreliable (UDP) channel.
//! - Provide the command, acknowledgment and remote-entity message types.
//! - Keep serialization explicit and versionable.
//!
//! TCP carries the handshake, map transfer, joins and leaves. UDP carries
//! command batches, acknowledgments and remote position updates; anything
//! sent over it may be lost, which is why the client outbox resends every
//! unacknowledged command.

use std::{
    fmt,
    net::SocketAddr,
    sync::atomic::{AtomicU32, Ordering},
};

use anyhow::Context;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream, UdpSocket},
    time,
};

use crate::{
    command::{Acknowledgment, Command, Sequence},
    math::Vec2,
};

/// Protocol version for compatibility checks.
pub const PROTOCOL_VERSION: u32 = 1;

/// Frames above this size are rejected before allocation.
pub const MAX_FRAME_LEN: usize = 1 << 20;

/// Largest datagram either side sends. Below the UDP payload limit and the
/// receive buffers.
pub const MAX_DATAGRAM_LEN: usize = 60 * 1024;

/// Room reserved for the `Commands` envelope around the command list.
const BATCH_ENVELOPE_LEN: usize = 128;

static NEXT_CLIENT_ID: AtomicU32 = AtomicU32::new(1);

/// Identifies a connected client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(pub u32);

impl ClientId {
    pub fn new_unique() -> Self {
        ClientId(NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Entity id as seen on the wire, e.g. `"p2"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    pub fn for_client(id: ClientId) -> Self {
        EntityId(format!("p{}", id.0))
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        EntityId(s.to_string())
    }
}

/// High-level message envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum NetMsg {
    // ─── Connection handshake ───
    Hello {
        protocol: u32,
        name: String,
    },
    /// Client announces its UDP port to the server.
    UdpHello {
        client_udp_port: u16,
    },
    Welcome {
        client_id: ClientId,
        entity: EntityId,
        spawn: Vec2,
    },

    // ─── Map ───
    /// Server tells the client which grid to collide against.
    MapInfo(MapInfo),

    // ─── Remote entities ───
    /// Another player entered. Joins carry no sequence number.
    PlayerJoined {
        id: EntityId,
        position: Vec2,
    },
    /// Another player moved.
    PlayerMoved(RemoteUpdate),
    /// Another player left.
    PlayerLeft {
        id: EntityId,
    },

    // ─── Prediction ───
    /// Client -> server: every unacknowledged command, in issuance order.
    Commands(CommandBatch),
    /// Server -> client: last processed command and resulting position.
    Ack(Acknowledgment),

    // ─── Disconnect ───
    Disconnect {
        reason: String,
    },
}

/// Map sent to clients after the handshake.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MapInfo {
    pub name: String,
    pub tile_size: f32,
    /// ASCII rows, see `collision::TileGrid`.
    pub rows: Vec<String>,
}

/// Batch of commands from one client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandBatch {
    pub client_id: ClientId,
    pub commands: Vec<Command>,
}

/// Position update for a remote entity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteUpdate {
    pub id: EntityId,
    pub position: Vec2,
    /// Server-side update counter for this entity.
    pub sequence: Option<Sequence>,
}

/// Reliable connection over TCP with length-prefixed frames.
#[derive(Debug)]
pub struct ReliableConn {
    stream: TcpStream,
}

impl ReliableConn {
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }

    pub async fn send(&mut self, msg: &NetMsg) -> anyhow::Result<()> {
        let payload = serde_json::to_vec(msg).context("serialize msg")?;
        let mut buf = BytesMut::with_capacity(4 + payload.len());
        buf.put_u32(payload.len() as u32);
        buf.extend_from_slice(&payload);
        self.stream.write_all(&buf).await.context("tcp write")?;
        Ok(())
    }

    pub async fn recv(&mut self) -> anyhow::Result<NetMsg> {
        let mut len_buf = [0u8; 4];
        self.stream
            .read_exact(&mut len_buf)
            .await
            .context("tcp read len")?;
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_FRAME_LEN {
            anyhow::bail!("frame of {len} bytes exceeds limit");
        }
        let mut payload = vec![0u8; len];
        self.stream
            .read_exact(&mut payload)
            .await
            .context("tcp read payload")?;
        let msg = serde_json::from_slice(&payload).context("deserialize msg")?;
        Ok(msg)
    }

    pub fn peer_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.stream.peer_addr()?)
    }
}

/// Unreliable channel over UDP.
#[derive(Debug)]
pub struct UnreliableConn {
    socket: UdpSocket,
    peer: SocketAddr,
}

impl UnreliableConn {
    pub async fn connect(bind_addr: SocketAddr, peer: SocketAddr) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(bind_addr).await.context("udp bind")?;
        socket.connect(peer).await.context("udp connect")?;
        Ok(Self { socket, peer })
    }

    pub async fn send(&self, msg: &NetMsg) -> anyhow::Result<()> {
        let payload = encode_to_bytes(msg)?;
        if payload.len() > MAX_DATAGRAM_LEN {
            anyhow::bail!("datagram of {} bytes exceeds limit", payload.len());
        }
        self.socket.send(&payload).await.context("udp send")?;
        Ok(())
    }

    pub async fn recv(&self) -> anyhow::Result<NetMsg> {
        let mut buf = vec![0u8; 64 * 1024];
        let n = self.socket.recv(&mut buf).await.context("udp recv")?;
        decode_from_bytes(&buf[..n])
    }

    /// Returns a queued datagram without waiting, if any.
    pub fn try_recv(&self) -> anyhow::Result<Option<NetMsg>> {
        let mut buf = vec![0u8; 64 * 1024];
        match self.socket.try_recv(&mut buf) {
            Ok(n) => Ok(Some(decode_from_bytes(&buf[..n])?)),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e).context("udp recv"),
        }
    }

    /// Receives a datagram within the given timeout.
    pub async fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> anyhow::Result<Option<NetMsg>> {
        let mut buf = vec![0u8; 64 * 1024];
        match time::timeout(timeout, self.socket.recv(&mut buf)).await {
            Ok(Ok(n)) => Ok(Some(decode_from_bytes(&buf[..n])?)),
            Ok(Err(e)) => Err(e).context("udp recv")?,
            Err(_) => Ok(None),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

/// TCP server listener.
pub struct ReliableListener {
    listener: TcpListener,
}

impl ReliableListener {
    pub async fn bind(addr: SocketAddr) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await.context("tcp bind")?;
        Ok(Self { listener })
    }

    pub async fn accept(&self) -> anyhow::Result<(ReliableConn, SocketAddr)> {
        let (stream, addr) = self.listener.accept().await.context("tcp accept")?;
        stream.set_nodelay(true).context("tcp nodelay")?;
        Ok((ReliableConn::new(stream), addr))
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

/// Number of leading commands whose `Commands` datagram fits in
/// `MAX_DATAGRAM_LEN`. At least one for a non-empty list.
pub fn commands_fitting_datagram(commands: &[Command]) -> anyhow::Result<usize> {
    let mut used = BATCH_ENVELOPE_LEN;
    for (i, cmd) in commands.iter().enumerate() {
        // Element plus separating comma.
        used += serde_json::to_vec(cmd).context("serialize command")?.len() + 1;
        if used > MAX_DATAGRAM_LEN {
            return Ok(i.max(1));
        }
    }
    Ok(commands.len())
}

/// Convenience codec helpers.
pub fn encode_to_bytes(msg: &NetMsg) -> anyhow::Result<Bytes> {
    let payload = serde_json::to_vec(msg).context("serialize")?;
    Ok(Bytes::from(payload))
}

pub fn decode_from_bytes(b: &[u8]) -> anyhow::Result<NetMsg> {
    serde_json::from_slice(b).context("deserialize")
}
