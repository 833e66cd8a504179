//! WebSocket relay with room-based routing.
//!
//! Architecture:
//! ```text
//! ws://host/<room>
//! Client A ──┐
//!            ├── Room ── BroadcastGroup ──► every other peer in the room
//! Client B ──┘
//! ```
//!
//! The relay holds no document state: peers own the CRDT and heal each
//! other through the sync handshake. Client-to-relay messages are raw
//! binary payloads; relay-to-client messages are bincode [`RelayFrame`]s
//! so the receiver learns who sent each payload.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::RoomManager;
use crate::channel::{RoomFrame, CHANNEL_CAPACITY};

/// Relay configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Maximum peers per room (0 = unlimited)
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: CHANNEL_CAPACITY,
        }
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    RoomFull,
    MissingRoom,
}

/// Relay-to-client frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayFrame {
    /// First frame on an accepted connection.
    Welcome { peer_id: Uuid },
    /// A payload broadcast by another peer.
    Data { from: Uuid, payload: Vec<u8> },
    /// The join was refused; the relay closes the socket next.
    Rejected { reason: RejectReason },
}

impl RelayFrame {
    pub fn encode(&self) -> Result<Vec<u8>, RelayError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| RelayError::Codec(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, RelayError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| RelayError::Codec(e.to_string()))?;
        Ok(frame)
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("frame codec error: {0}")]
    Codec(String),
}

/// Room name addressed by a request path `/<room>`. Inner slashes are kept.
pub fn room_from_path(path: &str) -> Option<String> {
    let room = path.trim_matches('/');
    (!room.is_empty()).then(|| room.to_string())
}

/// The relay server.
pub struct RelayServer {
    config: ServerConfig,
    rooms: Arc<RoomManager>,
    stats: Arc<RwLock<ServerStats>>,
}

impl RelayServer {
    pub fn new(config: ServerConfig) -> Self {
        let max_peers = (config.max_peers_per_room > 0).then_some(config.max_peers_per_room);
        let rooms = Arc::new(RoomManager::new(config.broadcast_capacity, max_peers));
        Self {
            config,
            rooms,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), RelayError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), RelayError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let rooms = self.rooms.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, rooms, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_rooms = self.rooms.room_count().await;
        stats
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn room_manager(&self) -> &Arc<RoomManager> {
        &self.rooms
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    rooms: Arc<RoomManager>,
    stats: Arc<RwLock<ServerStats>>,
) -> Result<(), RelayError> {
    let mut path = String::new();
    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        path = req.uri().path().to_string();
        Ok(resp)
    })
    .await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    stats.write().await.total_connections += 1;

    let Some(room) = room_from_path(&path) else {
        stats.write().await.rejected_connections += 1;
        log::warn!("Rejected {addr}: no room in path '{path}'");
        let frame = RelayFrame::Rejected {
            reason: RejectReason::MissingRoom,
        };
        ws_sender.send(Message::Binary(frame.encode()?.into())).await?;
        ws_sender.close().await?;
        return Ok(());
    };

    let group = rooms.get_or_create(&room).await;
    let peer_id = Uuid::new_v4();
    let mut broadcast_rx = match group.add_peer(&room, peer_id).await {
        Ok(rx) => rx,
        Err(e) => {
            stats.write().await.rejected_connections += 1;
            log::warn!("Rejected {addr}: {e}");
            rooms.remove_if_empty(&room).await;
            let frame = RelayFrame::Rejected {
                reason: RejectReason::RoomFull,
            };
            ws_sender.send(Message::Binary(frame.encode()?.into())).await?;
            ws_sender.close().await?;
            return Ok(());
        }
    };

    stats.write().await.active_connections += 1;
    log::info!("Peer {peer_id} ({addr}) joined room {room}");

    let result = async {
        let welcome = RelayFrame::Welcome { peer_id };
        ws_sender.send(Message::Binary(welcome.encode()?.into())).await?;

        loop {
            tokio::select! {
                msg = ws_receiver.next() => match msg {
                    Some(Ok(Message::Binary(data))) => {
                        {
                            let mut s = stats.write().await;
                            s.total_messages += 1;
                            s.total_bytes += data.len() as u64;
                        }
                        group.broadcast(RoomFrame { from: peer_id, payload: Arc::new(data.to_vec()) });
                    }
                    Some(Ok(Message::Ping(data))) => {
                        ws_sender.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Connection closed from {addr}");
                        break;
                    }
                    Some(Err(e)) => {
                        log::warn!("WebSocket error from {addr}: {e}");
                        break;
                    }
                    Some(Ok(_)) => {}
                },
                frame = broadcast_rx.recv() => match frame {
                    // Never echo to the sender.
                    Ok(frame) if frame.from == peer_id => {}
                    Ok(frame) => {
                        let data = RelayFrame::Data { from: frame.from, payload: frame.payload.to_vec() };
                        ws_sender.send(Message::Binary(data.encode()?.into())).await?;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Peer {peer_id} lagged by {n} frames");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        Ok::<(), RelayError>(())
    }
    .await;

    group.remove_peer(&peer_id).await;
    if rooms.remove_if_empty(&room).await {
        log::info!("Room {room} removed (empty)");
    }
    stats.write().await.active_connections -= 1;

    result
}
