//! In-process realtime hub.
//!
//! Implements every realtime primitive ([`RealtimeClient`],
//! [`PresenceChannel`], [`ChangeFeed`]) on top of [`RoomManager`] and plain
//! tokio channels. Peers in the same process share one hub; a database-side
//! publisher drives the change feed through [`RealtimeHub::publish_change`].
//!
//! ```text
//! peer A ──outgoing──► pump A ──┐                 ┌──► pump B ──incoming──► peer B
//!                               ├─ BroadcastGroup ┤
//! peer C ──outgoing──► pump C ──┘   (room)        └──► pump C ──incoming──► peer C
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, Mutex};
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, RoomManager};
use crate::channel::{
    ChangeEvent, ChangeFeed, PresenceChannel, PresenceEvent, PresenceRecord, RealtimeClient,
    RoomFrame, RoomHandle, TransportError, CHANNEL_CAPACITY,
};

/// Presence of one room, keyed by connection so an actor may hold several.
#[derive(Default)]
struct PresenceRoom {
    records: Vec<PresenceRecord>,
    subscribers: Vec<(Uuid, mpsc::Sender<PresenceEvent>)>,
}

impl PresenceRoom {
    fn online(&self) -> Vec<PresenceRecord> {
        self.records.clone()
    }

    fn actors(&self) -> Vec<String> {
        let mut actors: Vec<String> = Vec::new();
        for record in &self.records {
            if !actors.contains(&record.actor_id) {
                actors.push(record.actor_id.clone());
            }
        }
        actors
    }

    fn notify(&self, room: &str, change: PresenceEvent) {
        let online = self.online();
        for (connection, tx) in &self.subscribers {
            deliver(room, *connection, tx, change.clone());
            deliver(room, *connection, tx, PresenceEvent::Sync(online.clone()));
        }
    }
}

fn deliver(room: &str, connection: Uuid, tx: &mpsc::Sender<PresenceEvent>, event: PresenceEvent) {
    match tx.try_send(event) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            log::warn!("Presence queue of {connection} in {room} is full, event dropped");
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            log::debug!("Presence subscriber {connection} in {room} is gone");
        }
    }
}

/// Shared in-process implementation of the realtime primitives.
#[derive(Clone)]
pub struct RealtimeHub {
    rooms: Arc<RoomManager>,
    presence: Arc<Mutex<HashMap<String, PresenceRoom>>>,
    feeds: Arc<Mutex<HashMap<String, Vec<mpsc::Sender<ChangeEvent>>>>>,
}

impl Default for RealtimeHub {
    fn default() -> Self {
        Self::new(CHANNEL_CAPACITY, None)
    }
}

impl RealtimeHub {
    pub fn new(broadcast_capacity: usize, max_peers_per_room: Option<usize>) -> Self {
        Self {
            rooms: Arc::new(RoomManager::new(broadcast_capacity, max_peers_per_room)),
            presence: Arc::new(Mutex::new(HashMap::new())),
            feeds: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Deliver a row change to every subscriber of its project.
    /// Returns the number of subscribers reached.
    pub async fn publish_change(&self, event: ChangeEvent) -> usize {
        let targets: Vec<mpsc::Sender<ChangeEvent>> = {
            let mut feeds = self.feeds.lock().await;
            let Some(subscribers) = feeds.get_mut(&event.project_id) else {
                return 0;
            };
            subscribers.retain(|tx| !tx.is_closed());
            subscribers.clone()
        };

        let mut delivered = 0;
        for tx in targets {
            if tx.send(event.clone()).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.room_count().await
    }

    pub async fn online(&self, room: &str) -> Vec<PresenceRecord> {
        self.presence
            .lock()
            .await
            .get(room)
            .map(PresenceRoom::online)
            .unwrap_or_default()
    }

    /// Actors with at least one live connection in `room`.
    pub async fn online_actors(&self, room: &str) -> Vec<String> {
        self.presence
            .lock()
            .await
            .get(room)
            .map(PresenceRoom::actors)
            .unwrap_or_default()
    }
}

/// Forward between one peer's channels and its room until either side goes away.
async fn pump(
    rooms: Arc<RoomManager>,
    group: Arc<BroadcastGroup>,
    room: String,
    peer_id: Uuid,
    mut outgoing: mpsc::Receiver<Vec<u8>>,
    incoming: mpsc::Sender<RoomFrame>,
    mut rx: broadcast::Receiver<RoomFrame>,
) {
    loop {
        tokio::select! {
            // Outgoing first: a last frame queued before leaving is still delivered.
            biased;
            out = outgoing.recv() => match out {
                Some(payload) => {
                    group.broadcast(RoomFrame { from: peer_id, payload: Arc::new(payload) });
                }
                None => break,
            },
            frame = rx.recv() => match frame {
                Ok(frame) if frame.from == peer_id => {}
                Ok(frame) => {
                    if incoming.send(frame).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("Peer {peer_id} lagged {n} frames behind in room {room}");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = incoming.closed() => break,
        }
    }

    group.remove_peer(&peer_id).await;
    rooms.remove_if_empty(&room).await;
    log::debug!("Peer {peer_id} left room {room}");
}

#[async_trait]
impl RealtimeClient for RealtimeHub {
    async fn join(&self, room: &str) -> Result<RoomHandle, TransportError> {
        let group = self.rooms.get_or_create(room).await;
        let peer_id = Uuid::new_v4();
        let rx = group.add_peer(room, peer_id).await?;

        let (out_tx, out_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(pump(
            self.rooms.clone(),
            group,
            room.to_string(),
            peer_id,
            out_rx,
            in_tx,
            rx,
        ));

        log::debug!("Peer {peer_id} joined room {room}");
        Ok(RoomHandle {
            room: room.to_string(),
            peer_id,
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}

#[async_trait]
impl PresenceChannel for RealtimeHub {
    async fn track(
        &self,
        room: &str,
        record: PresenceRecord,
    ) -> Result<mpsc::Receiver<PresenceEvent>, TransportError> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let mut presence = self.presence.lock().await;
        let state = presence.entry(room.to_string()).or_default();

        // Re-tracking a connection replaces its record.
        let connection = record.connection_id;
        state.records.retain(|r| r.connection_id != connection);
        state.subscribers.retain(|(c, s)| *c != connection && !s.is_closed());
        state.records.push(record.clone());

        state.notify(room, PresenceEvent::Join(record));
        deliver(room, connection, &tx, PresenceEvent::Sync(state.online()));
        state.subscribers.push((connection, tx));

        Ok(rx)
    }

    async fn untrack(&self, room: &str, connection_id: Uuid) {
        let mut presence = self.presence.lock().await;
        let Some(state) = presence.get_mut(room) else {
            return;
        };
        let Some(pos) = state
            .records
            .iter()
            .position(|r| r.connection_id == connection_id)
        else {
            return;
        };

        let record = state.records.remove(pos);
        state
            .subscribers
            .retain(|(c, s)| *c != connection_id && !s.is_closed());

        state.notify(room, PresenceEvent::Leave(record));
        if state.records.is_empty() {
            presence.remove(room);
        }
    }
}

#[async_trait]
impl ChangeFeed for RealtimeHub {
    async fn subscribe_changes(
        &self,
        project_id: &str,
    ) -> Result<mpsc::Receiver<ChangeEvent>, TransportError> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.feeds
            .lock()
            .await
            .entry(project_id.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}
