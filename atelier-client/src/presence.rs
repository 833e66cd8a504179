//! Presence integration: bridges a [`PresenceChannel`] with the store's
//! online list.
//!
//! ## Data flow
//!
//! ```text
//!  PresenceChannel::track()
//!       │                               ─── Sync / Join / Leave events
//!       ▼
//!  PresenceTracker task
//!       │──► CanvasStore::set_presence()   (full list on every Sync)
//!       └──► broadcast::Sender<PresenceEvent>  (for UI toasts etc.)
//! ```

use std::sync::Arc;

use atelier_collab::{PresenceChannel, PresenceEvent, PresenceRecord, TransportError};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::store::CanvasStore;

const EVENT_CAPACITY: usize = 64;

/// Tracks the local actor in a project's presence channel and mirrors the
/// online list into the store.
pub struct PresenceTracker {
    channel: Arc<dyn PresenceChannel>,
    room: String,
    actor_id: String,
    connection_id: Uuid,
    events: broadcast::Sender<PresenceEvent>,
    task: JoinHandle<()>,
}

impl PresenceTracker {
    /// Announce `record` in `room` and start following presence events.
    pub async fn start(
        channel: Arc<dyn PresenceChannel>,
        room: &str,
        record: PresenceRecord,
        store: CanvasStore,
    ) -> Result<Self, TransportError> {
        let actor_id = record.actor_id.clone();
        let connection_id = record.connection_id;
        let rx = channel.track(room, record).await?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let task = tokio::spawn(follow(rx, store, events.clone()));

        log::info!("Tracking presence of {actor_id} in {room} ({connection_id})");
        Ok(Self {
            channel,
            room: room.to_string(),
            actor_id,
            connection_id,
            events,
            task,
        })
    }

    /// Join, leave and online-list events as they arrive.
    pub fn subscribe(&self) -> broadcast::Receiver<PresenceEvent> {
        self.events.subscribe()
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn actor_id(&self) -> &str {
        &self.actor_id
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    /// Withdraw the local record and stop following events.
    pub async fn stop(self) {
        self.channel.untrack(&self.room, self.connection_id).await;
        self.task.abort();
        log::info!("Stopped presence of {} in {}", self.actor_id, self.room);
    }
}

async fn follow(
    mut rx: mpsc::Receiver<PresenceEvent>,
    store: CanvasStore,
    events: broadcast::Sender<PresenceEvent>,
) {
    while let Some(event) = rx.recv().await {
        match &event {
            PresenceEvent::Sync(online) => store.set_presence(online.clone()),
            PresenceEvent::Join(record) => log::debug!("{} joined", record.actor_id),
            PresenceEvent::Leave(record) => log::debug!("{} left", record.actor_id),
        }
        // No UI subscribers is fine.
        let _ = events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atelier_collab::RealtimeHub;
    use std::time::Duration;

    async fn wait_for(store: &CanvasStore, count: usize) {
        for _ in 0..100 {
            if store.presence().len() == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("presence never reached {count}");
    }

    #[tokio::test]
    async fn test_tracker_mirrors_online_list() {
        let hub = Arc::new(RealtimeHub::default());
        let alice_store = CanvasStore::new();
        let bob_store = CanvasStore::new();

        let alice = PresenceTracker::start(
            hub.clone(),
            "p1",
            PresenceRecord::new("alice", Some("Alice".into())),
            alice_store.clone(),
        )
        .await
        .unwrap();
        wait_for(&alice_store, 1).await;

        let mut alice_events = alice.subscribe();
        let bob = PresenceTracker::start(
            hub.clone(),
            "p1",
            PresenceRecord::new("bob", None),
            bob_store.clone(),
        )
        .await
        .unwrap();
        wait_for(&alice_store, 2).await;
        wait_for(&bob_store, 2).await;

        let joined = loop {
            match alice_events.recv().await.unwrap() {
                PresenceEvent::Join(record) => break record,
                _ => continue,
            }
        };
        assert_eq!(joined.actor_id, "bob");

        bob.stop().await;
        wait_for(&alice_store, 1).await;
        assert_eq!(alice_store.presence()[0].actor_id, "alice");
        alice.stop().await;
        assert!(hub.online("p1").await.is_empty());
    }

    #[tokio::test]
    async fn test_second_tab_outlives_first() {
        let hub = Arc::new(RealtimeHub::default());
        let first_store = CanvasStore::new();
        let second_store = CanvasStore::new();

        let first = PresenceTracker::start(
            hub.clone(),
            "p1",
            PresenceRecord::new("alice", None),
            first_store.clone(),
        )
        .await
        .unwrap();
        let second = PresenceTracker::start(
            hub.clone(),
            "p1",
            PresenceRecord::new("alice", None),
            second_store.clone(),
        )
        .await
        .unwrap();
        assert_ne!(first.connection_id(), second.connection_id());
        wait_for(&second_store, 2).await;
        assert_eq!(second_store.online_actors(), vec!["alice".to_string()]);

        first.stop().await;
        wait_for(&second_store, 1).await;
        assert_eq!(second_store.presence()[0].connection_id, second.connection_id());
        assert_eq!(hub.online_actors("p1").await, vec!["alice".to_string()]);

        second.stop().await;
        assert!(hub.online_actors("p1").await.is_empty());
    }
}
