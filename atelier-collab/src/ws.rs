//! [`RealtimeClient`] over a WebSocket connection to the relay.
//!
//! `join` dials `<base_url>/<room>` and waits for the relay's welcome
//! before handing back a [`RoomHandle`]. One background task then moves
//! outgoing payloads to the socket and incoming relay frames to the handle.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use crate::channel::{RealtimeClient, RoomFrame, RoomHandle, TransportError, CHANNEL_CAPACITY};
use crate::server::{RejectReason, RelayFrame};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct WsRealtimeClient {
    base_url: String,
    connect_timeout: Duration,
}

impl WsRealtimeClient {
    /// `base_url` like `ws://127.0.0.1:9090`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn room_url(&self, room: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), room)
    }
}

/// Dial and wait for the relay's verdict.
async fn handshake(url: &str, room: &str) -> Result<(Uuid, WsStream), TransportError> {
    let failed = |reason: String| TransportError::SubscribeFailed {
        room: room.to_string(),
        reason,
    };

    let (mut ws_stream, _) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| failed(e.to_string()))?;

    while let Some(msg) = ws_stream.next().await {
        match msg.map_err(|e| failed(e.to_string()))? {
            Message::Binary(data) => match RelayFrame::decode(&data) {
                Ok(RelayFrame::Welcome { peer_id }) => return Ok((peer_id, ws_stream)),
                Ok(RelayFrame::Rejected {
                    reason: RejectReason::RoomFull,
                }) => return Err(TransportError::RoomFull(room.to_string())),
                Ok(RelayFrame::Rejected { reason }) => return Err(failed(format!("{reason:?}"))),
                Ok(RelayFrame::Data { .. }) => {}
                Err(e) => log::warn!("Dropping undecodable relay frame: {e}"),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }
    Err(failed("connection closed before welcome".into()))
}

async fn pump(
    ws_stream: WsStream,
    room: String,
    mut outgoing: mpsc::Receiver<Vec<u8>>,
    incoming: mpsc::Sender<RoomFrame>,
) {
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    loop {
        tokio::select! {
            biased;
            out = outgoing.recv() => match out {
                Some(payload) => {
                    if let Err(e) = ws_sender.send(Message::Binary(payload.into())).await {
                        log::warn!("Send to room {room} failed: {e}");
                        break;
                    }
                }
                None => break,
            },
            msg = ws_receiver.next() => match msg {
                Some(Ok(Message::Binary(data))) => match RelayFrame::decode(&data) {
                    Ok(RelayFrame::Data { from, payload }) => {
                        let frame = RoomFrame { from, payload: Arc::new(payload) };
                        if incoming.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Ok(other) => log::debug!("Ignoring relay frame {other:?} in room {room}"),
                    Err(e) => log::warn!("Dropping undecodable relay frame in room {room}: {e}"),
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    log::warn!("WebSocket error in room {room}: {e}");
                    break;
                }
                Some(Ok(_)) => {}
            },
            _ = incoming.closed() => break,
        }
    }

    let _ = ws_sender.close().await;
    log::debug!("Left relay room {room}");
}

#[async_trait]
impl RealtimeClient for WsRealtimeClient {
    async fn join(&self, room: &str) -> Result<RoomHandle, TransportError> {
        let url = self.room_url(room);
        let (peer_id, ws_stream) = tokio::time::timeout(self.connect_timeout, handshake(&url, room))
            .await
            .map_err(|_| TransportError::SubscribeFailed {
                room: room.to_string(),
                reason: "timed out".into(),
            })??;

        let (out_tx, out_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(pump(ws_stream, room.to_string(), out_rx, in_tx));

        log::info!("Joined relay room {room} as {peer_id}");
        Ok(RoomHandle {
            room: room.to_string(),
            peer_id,
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}
