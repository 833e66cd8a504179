//! Realtime room primitives consumed by the transport provider and the
//! REST sync engine.
//!
//! Three capabilities, each behind a trait so that the in-process
//! [`RealtimeHub`](crate::hub::RealtimeHub) and the WebSocket
//! [`WsRealtimeClient`](crate::ws::WsRealtimeClient) are interchangeable:
//!
//! - [`RealtimeClient`]: room-scoped binary broadcast (sender excluded)
//! - [`PresenceChannel`]: ephemeral "who is here" tracking per room
//! - [`ChangeFeed`]: row-level INSERT/UPDATE/DELETE events per project

use std::sync::Arc;

use async_trait::async_trait;
use atelier_core::CanvasItem;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Buffer size of per-subscriber channels.
pub const CHANNEL_CAPACITY: usize = 256;

/// Realtime channel failures. Never fatal: callers flip a connection flag.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("subscribe to room '{room}' failed: {reason}")]
    SubscribeFailed { room: String, reason: String },
    #[error("room '{0}' is full")]
    RoomFull(String),
    #[error("channel closed")]
    ChannelClosed,
    #[error("not connected")]
    NotConnected,
}

// ───────────────────────────────────────────────────────────────────
// Room broadcast
// ───────────────────────────────────────────────────────────────────

/// A frame received from another peer in the room.
#[derive(Debug, Clone)]
pub struct RoomFrame {
    pub from: Uuid,
    pub payload: Arc<Vec<u8>>,
}

/// A confirmed room subscription.
///
/// Dropping `outgoing` (or the whole handle) leaves the room.
/// `incoming` yields `None` once the underlying channel is gone.
#[derive(Debug)]
pub struct RoomHandle {
    pub room: String,
    pub peer_id: Uuid,
    pub outgoing: mpsc::Sender<Vec<u8>>,
    pub incoming: mpsc::Receiver<RoomFrame>,
}

#[async_trait]
pub trait RealtimeClient: Send + Sync {
    /// Subscribe to `room`. Resolves once the subscription is acknowledged.
    async fn join(&self, room: &str) -> Result<RoomHandle, TransportError>;
}

// ───────────────────────────────────────────────────────────────────
// Presence
// ───────────────────────────────────────────────────────────────────

/// Ephemeral per-connection record. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    /// One per tracked connection; an actor with two tabs has two.
    #[serde(default = "Uuid::new_v4")]
    pub connection_id: Uuid,
    pub actor_id: String,
    /// Milliseconds since the Unix epoch.
    pub joined_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl PresenceRecord {
    pub fn new(actor_id: impl Into<String>, name: Option<String>) -> Self {
        Self {
            connection_id: Uuid::new_v4(),
            actor_id: actor_id.into(),
            joined_at: now_millis(),
            name,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PresenceEvent {
    /// Full online list; sent on subscribe and after every change.
    Sync(Vec<PresenceRecord>),
    Join(PresenceRecord),
    Leave(PresenceRecord),
}

#[async_trait]
pub trait PresenceChannel: Send + Sync {
    /// Announce `record` in `room` and receive presence events for it.
    async fn track(
        &self,
        room: &str,
        record: PresenceRecord,
    ) -> Result<mpsc::Receiver<PresenceEvent>, TransportError>;

    /// Withdraw one connection's record. Unknown connections are ignored.
    async fn untrack(&self, room: &str, connection_id: Uuid);
}

// ───────────────────────────────────────────────────────────────────
// Change feed
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// One row-level change of a canvas item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub project_id: String,
    /// New row, for INSERT and UPDATE.
    pub record: Option<CanvasItem>,
    /// Id of the removed row, for DELETE.
    pub old_id: Option<String>,
    /// Actor whose write produced the change.
    pub actor_id: Option<String>,
}

impl ChangeEvent {
    pub fn insert(item: CanvasItem, actor_id: Option<String>) -> Self {
        Self {
            kind: ChangeKind::Insert,
            project_id: item.project_id.clone(),
            record: Some(item),
            old_id: None,
            actor_id,
        }
    }

    pub fn update(item: CanvasItem, actor_id: Option<String>) -> Self {
        Self {
            kind: ChangeKind::Update,
            project_id: item.project_id.clone(),
            record: Some(item),
            old_id: None,
            actor_id,
        }
    }

    pub fn delete(
        project_id: impl Into<String>,
        id: impl Into<String>,
        actor_id: Option<String>,
    ) -> Self {
        Self {
            kind: ChangeKind::Delete,
            project_id: project_id.into(),
            record: None,
            old_id: Some(id.into()),
            actor_id,
        }
    }

    /// Id of the affected item, whichever side carries it.
    pub fn item_id(&self) -> Option<&str> {
        self.record
            .as_ref()
            .map(|r| r.id.as_str())
            .or(self.old_id.as_deref())
    }
}

#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Receive every change to items of `project_id` from now on.
    /// Dropping the receiver ends the subscription.
    async fn subscribe_changes(
        &self,
        project_id: &str,
    ) -> Result<mpsc::Receiver<ChangeEvent>, TransportError>;
}

pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use atelier_core::NewItem;

    #[test]
    fn test_change_event_item_id() {
        let item = CanvasItem::from_new("i1", "p1", &NewItem::default());
        assert_eq!(ChangeEvent::insert(item.clone(), None).item_id(), Some("i1"));
        assert_eq!(ChangeEvent::update(item, None).project_id, "p1");
        assert_eq!(ChangeEvent::delete("p1", "i2", None).item_id(), Some("i2"));
    }

    #[test]
    fn test_change_event_json_shape() {
        let event = ChangeEvent::delete("p1", "i2", Some("alice".into()));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "DELETE");
        assert_eq!(json["oldId"], "i2");
        assert_eq!(json["actorId"], "alice");
    }

    #[test]
    fn test_presence_record_stamps_join_time() {
        let record = PresenceRecord::new("bob", Some("Bob".into()));
        assert!(record.joined_at > 0);
        assert_eq!(record.actor_id, "bob");
        assert_ne!(
            record.connection_id,
            PresenceRecord::new("bob", None).connection_id
        );
    }

    #[test]
    fn test_presence_record_without_connection_gets_one() {
        let record: PresenceRecord =
            serde_json::from_value(serde_json::json!({ "actorId": "bob", "joinedAt": 1 })).unwrap();
        assert_eq!(record.actor_id, "bob");
        assert!(!record.connection_id.is_nil());
    }
}
