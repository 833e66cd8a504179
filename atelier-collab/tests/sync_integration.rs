//! End-to-end sync between providers sharing an in-process hub.
//!
//! Verifies:
//! - Incremental updates reach every other peer
//! - A late joiner catches up through the step-1/step-2 handshake
//! - The periodic resync heals state neither side broadcast
//! - Updates made while not connected are replayed on connect
//! - Awareness announce, query, leave and timeout sweep

use std::sync::Arc;
use std::time::Duration;

use atelier_collab::awareness::Awareness;
use atelier_collab::protocol;
use atelier_collab::{
    ConnectionStatus, ProviderConfig, ProviderEvent, RealtimeClient, RealtimeHub,
    TransportError, TransportProvider,
};
use atelier_core::collab::{SharedDocument, UpdateOrigin};
use atelier_core::{CanvasItem, ItemPatch, NewItem};
use serde_json::json;

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn item(id: &str) -> CanvasItem {
    CanvasItem::from_new(id, "project", &NewItem::default())
}

fn provider(hub: &RealtimeHub) -> TransportProvider {
    TransportProvider::new(
        SharedDocument::new(),
        Arc::new(hub.clone()),
        ProviderConfig::default(),
    )
}

/// Poll `check` until it holds or roughly a second of (virtual) time passes.
async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

fn ids(doc: &SharedDocument) -> Vec<String> {
    let mut ids: Vec<String> = doc.items().into_iter().map(|i| i.id).collect();
    ids.sort();
    ids
}

// ─── Document sync ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_updates_reach_other_peers() {
    let hub = RealtimeHub::default();
    let mut a = provider(&hub);
    let mut b = provider(&hub);
    a.connect("room").await.unwrap();
    b.connect("room").await.unwrap();

    a.document().push_item(&item("i1"), UpdateOrigin::Local);
    assert!(eventually(|| b.document().item_count() == 1).await);

    let patch = ItemPatch {
        x: Some(250.0),
        ..ItemPatch::default()
    };
    assert!(b.document().update_item("i1", &patch, UpdateOrigin::Local));
    assert!(eventually(|| a.document().item("i1").is_some_and(|i| i.x == 250.0)).await);

    a.document().remove_item("i1", UpdateOrigin::Local);
    assert!(eventually(|| b.document().item_count() == 0).await);
}

#[tokio::test]
async fn test_late_joiner_catches_up() {
    let hub = RealtimeHub::default();
    let mut a = provider(&hub);
    a.document().push_item(&item("early"), UpdateOrigin::Local);
    a.connect("room").await.unwrap();

    let mut b = provider(&hub);
    let mut events = b.subscribe();
    b.connect("room").await.unwrap();

    assert!(eventually(|| ids(b.document()) == vec!["early"]).await);

    let mut saw_synced = false;
    while let Ok(event) = events.try_recv() {
        saw_synced |= event == ProviderEvent::Synced;
    }
    assert!(saw_synced);
}

#[tokio::test(start_paused = true)]
async fn test_resync_heals_divergence() {
    let hub = RealtimeHub::default();
    let mut a = provider(&hub);
    let mut b = provider(&hub);
    // Written before either observer exists: only a handshake can carry them.
    a.document().push_item(&item("from-a"), UpdateOrigin::Local);
    b.document().push_item(&item("from-b"), UpdateOrigin::Local);

    a.connect("room").await.unwrap();
    b.connect("room").await.unwrap();

    // B's connect step-1 gives B everything A has.
    assert!(eventually(|| ids(b.document()) == vec!["from-a", "from-b"]).await);

    // A learns B's item once a resync tick carries A's step-1 to B.
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(eventually(|| ids(a.document()) == vec!["from-a", "from-b"]).await);
}

#[tokio::test]
async fn test_queued_updates_replay_on_connect() {
    let hub = RealtimeHub::new(64, Some(2));
    let mut b = provider(&hub);
    b.connect("room").await.unwrap();
    let occupant = hub.join("room").await.unwrap();

    let mut a = provider(&hub);
    assert_eq!(
        a.connect("room").await.err(),
        Some(TransportError::RoomFull("room".into()))
    );
    a.document().push_item(&item("offline"), UpdateOrigin::Local);
    assert_eq!(a.queued_updates(), 1);

    drop(occupant);
    let mut connected = false;
    for _ in 0..100 {
        if a.connect("room").await.is_ok() {
            connected = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(connected);
    assert_eq!(a.queued_updates(), 0);
    assert!(eventually(|| ids(b.document()) == vec!["offline"]).await);
}

#[tokio::test]
async fn test_remote_updates_are_not_echoed() {
    let hub = RealtimeHub::default();
    let mut a = provider(&hub);
    let mut b = provider(&hub);
    a.connect("room").await.unwrap();
    b.connect("room").await.unwrap();

    // A raw listener sees exactly one update frame per local edit.
    let mut spy = hub.join("room").await.unwrap();
    a.document().push_item(&item("i1"), UpdateOrigin::Local);
    assert!(eventually(|| b.document().item_count() == 1).await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut updates = 0;
    while let Ok(frame) = spy.incoming.try_recv() {
        if let Ok(protocol::Message::Sync(protocol::SyncMessage::Update(_))) =
            protocol::decode(&frame.payload)
        {
            updates += 1;
        }
    }
    assert_eq!(updates, 1);
}

// ─── Awareness ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_awareness_announce_and_leave() {
    let hub = RealtimeHub::default();
    let mut b = provider(&hub);
    b.connect("room").await.unwrap();

    let mut a = provider(&hub);
    a.set_local_awareness(Some(json!({ "name": "alice" })));
    a.connect("room").await.unwrap();
    let alice = a.local_client_id();

    assert!(
        eventually(|| b.awareness_states().get(&alice) == Some(&json!({ "name": "alice" }))).await
    );

    a.set_local_awareness(Some(json!({ "name": "alice", "cursor": [1, 2] })));
    assert!(eventually(|| {
        b.awareness_states()
            .get(&alice)
            .is_some_and(|s| s["cursor"] == json!([1, 2]))
    })
    .await);

    a.disconnect();
    assert_eq!(a.status(), ConnectionStatus::Disconnected);
    assert!(eventually(|| !b.awareness_states().contains_key(&alice)).await);
}

#[tokio::test]
async fn test_query_awareness_collects_peers() {
    let hub = RealtimeHub::default();
    let mut a = provider(&hub);
    a.set_local_awareness(Some(json!({ "name": "alice" })));
    a.connect("room").await.unwrap();

    // B arrives silently, then asks.
    let mut b = provider(&hub);
    b.connect("room").await.unwrap();
    assert!(b.query_awareness());
    let alice = a.local_client_id();
    assert!(eventually(|| b.awareness_states().contains_key(&alice)).await);
}

#[tokio::test(start_paused = true)]
async fn test_silent_peer_times_out() {
    let hub = RealtimeHub::default();
    let mut b = provider(&hub);
    b.connect("room").await.unwrap();

    // A peer that announces once and then goes quiet.
    let ghost = hub.join("room").await.unwrap();
    let mut awareness = Awareness::new(999);
    awareness.set_local_state(Some(json!({ "name": "ghost" })));
    let frame = protocol::encode_awareness(awareness.encode_update(&[999]));
    ghost.outgoing.send(frame).await.unwrap();
    assert!(eventually(|| b.awareness_states().contains_key(&999)).await);

    tokio::time::sleep(Duration::from_secs(36)).await;
    assert!(eventually(|| !b.awareness_states().contains_key(&999)).await);
    // The local state is renewed, never swept.
    assert!(b.awareness_states().len() <= 1);
}
