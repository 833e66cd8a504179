//! Fan-out broadcast to N-1 peers with backpressure.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers.
//! Each peer gets an independent receiver that buffers up to `capacity`
//! frames; a peer that falls further behind observes `Lagged` and skips
//! ahead (the periodic sync step-1 heals what it missed).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::channel::{RoomFrame, TransportError};

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub active_peers: usize,
}

/// A broadcast group for a single room.
///
/// All peers in the same room share one broadcast channel. Frames carry
/// their sender so that receivers can skip their own.
pub struct BroadcastGroup {
    sender: broadcast::Sender<RoomFrame>,
    peers: RwLock<HashSet<Uuid>>,
    capacity: usize,
    /// None = unlimited.
    max_peers: Option<usize>,
    messages_sent: AtomicU64,
}

impl BroadcastGroup {
    /// `capacity` bounds the per-peer buffer before lagging peers drop frames.
    pub fn new(capacity: usize, max_peers: Option<usize>) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            peers: RwLock::new(HashSet::new()),
            capacity,
            max_peers,
            messages_sent: AtomicU64::new(0),
        }
    }

    /// Add a peer and return its receiver.
    pub async fn add_peer(
        &self,
        room: &str,
        peer_id: Uuid,
    ) -> Result<broadcast::Receiver<RoomFrame>, TransportError> {
        let mut peers = self.peers.write().await;
        if self.max_peers.is_some_and(|max| peers.len() >= max) {
            return Err(TransportError::RoomFull(room.to_string()));
        }
        peers.insert(peer_id);
        Ok(self.sender.subscribe())
    }

    pub async fn remove_peer(&self, peer_id: &Uuid) -> bool {
        self.peers.write().await.remove(peer_id)
    }

    /// Send a frame to every subscriber. Returns the receiver count.
    /// Lock-free: tokio broadcast::send + atomic stats.
    pub fn broadcast(&self, frame: RoomFrame) -> usize {
        let count = self.sender.send(frame).unwrap_or(0);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn has_peer(&self, peer_id: &Uuid) -> bool {
        self.peers.read().await.contains(peer_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            active_peers: self.peers.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Room manager: maps room names to broadcast groups.
///
/// Each room gets its own broadcast group so that frames are isolated
/// between rooms.
pub struct RoomManager {
    rooms: RwLock<HashMap<String, Arc<BroadcastGroup>>>,
    default_capacity: usize,
    max_peers_per_room: Option<usize>,
}

impl RoomManager {
    pub fn new(default_capacity: usize, max_peers_per_room: Option<usize>) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
            max_peers_per_room,
        }
    }

    /// Get or create the group for `room`.
    pub async fn get_or_create(&self, room: &str) -> Arc<BroadcastGroup> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(group) = rooms.get(room) {
                return group.clone();
            }
        }

        // Slow path: double-check under the write lock
        let mut rooms = self.rooms.write().await;
        rooms
            .entry(room.to_string())
            .or_insert_with(|| {
                Arc::new(BroadcastGroup::new(
                    self.default_capacity,
                    self.max_peers_per_room,
                ))
            })
            .clone()
    }

    /// Drop the room once its last peer is gone.
    pub async fn remove_if_empty(&self, room: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(group) = rooms.get(room) {
            if group.peer_count().await == 0 {
                rooms.remove(room);
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_rooms(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(from: Uuid, bytes: &[u8]) -> RoomFrame {
        RoomFrame {
            from,
            payload: Arc::new(bytes.to_vec()),
        }
    }

    #[tokio::test]
    async fn test_broadcast_group_add_remove() {
        let group = BroadcastGroup::new(16, None);
        let peer = Uuid::new_v4();

        let _rx = group.add_peer("r", peer).await.unwrap();
        assert_eq!(group.peer_count().await, 1);
        assert!(group.has_peer(&peer).await);

        assert!(group.remove_peer(&peer).await);
        assert_eq!(group.peer_count().await, 0);
        assert!(!group.has_peer(&peer).await);
    }

    #[tokio::test]
    async fn test_broadcast_fan_out() {
        let group = BroadcastGroup::new(16, None);
        let alice = Uuid::new_v4();
        let mut rx1 = group.add_peer("r", alice).await.unwrap();
        let mut rx2 = group.add_peer("r", Uuid::new_v4()).await.unwrap();
        let mut rx3 = group.add_peer("r", Uuid::new_v4()).await.unwrap();

        // All receivers get it, including the sender: filtering is the caller's job.
        assert_eq!(group.broadcast(frame(alice, &[1, 2, 3])), 3);

        for rx in [&mut rx1, &mut rx2, &mut rx3] {
            let got = rx.recv().await.unwrap();
            assert_eq!(got.from, alice);
            assert_eq!(*got.payload, vec![1, 2, 3]);
        }
    }

    #[tokio::test]
    async fn test_peer_cap() {
        let group = BroadcastGroup::new(16, Some(1));
        let _rx = group.add_peer("tiny", Uuid::new_v4()).await.unwrap();
        assert_eq!(
            group.add_peer("tiny", Uuid::new_v4()).await.err(),
            Some(TransportError::RoomFull("tiny".into()))
        );
    }

    #[tokio::test]
    async fn test_broadcast_stats() {
        let group = BroadcastGroup::new(16, None);
        let peer = Uuid::new_v4();
        let _rx = group.add_peer("r", peer).await.unwrap();

        group.broadcast(frame(peer, &[0]));
        group.broadcast(frame(peer, &[1]));

        let stats = group.stats().await;
        assert_eq!(stats.messages_sent, 2);
        assert_eq!(stats.active_peers, 1);
    }

    #[tokio::test]
    async fn test_lagging_peer_skips_ahead() {
        let group = BroadcastGroup::new(2, None);
        let peer = Uuid::new_v4();
        let mut rx = group.add_peer("r", peer).await.unwrap();
        for i in 0..5u8 {
            group.broadcast(frame(peer, &[i]));
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(3))
        ));
        assert_eq!(*rx.recv().await.unwrap().payload, vec![3]);
    }

    #[tokio::test]
    async fn test_room_manager_get_or_create() {
        let manager = RoomManager::new(16, None);
        let room1 = manager.get_or_create("project-1").await;
        let room2 = manager.get_or_create("project-1").await;
        assert!(Arc::ptr_eq(&room1, &room2));

        let _other = manager.get_or_create("project-2").await;
        assert_eq!(manager.room_count().await, 2);
        let rooms = manager.active_rooms().await;
        assert!(rooms.contains(&"project-1".to_string()));
        assert!(rooms.contains(&"project-2".to_string()));
    }

    #[tokio::test]
    async fn test_room_manager_cleanup() {
        let manager = RoomManager::new(16, None);
        let room = manager.get_or_create("doc").await;
        let peer = Uuid::new_v4();
        let _rx = room.add_peer("doc", peer).await.unwrap();

        // Room not empty: shouldn't remove
        assert!(!manager.remove_if_empty("doc").await);

        room.remove_peer(&peer).await;
        assert!(manager.remove_if_empty("doc").await);
        assert_eq!(manager.room_count().await, 0);
    }
}
