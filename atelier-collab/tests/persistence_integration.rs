//! Persistence integration tests.
//!
//! Verifies:
//! - Document edits survive closing and reopening the RocksDB mirror
//! - The update log is folded into a snapshot at the trim size
//! - Room isolation under one database
//! - A mirror-loaded document syncs to peers like any other

use std::sync::Arc;
use std::time::Duration;

use atelier_collab::storage::{MirrorBackend, PersistenceAdapter, RocksMirror, StoreConfig};
use atelier_collab::{ProviderConfig, RealtimeHub, TransportProvider};
use atelier_core::collab::{SettingValue, SharedDocument, UpdateOrigin, SETTING_GRID_SIZE};
use atelier_core::{CanvasItem, NewItem};
use tempfile::tempdir;

fn item(id: &str) -> CanvasItem {
    CanvasItem::from_new(id, "project", &NewItem::default())
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

#[tokio::test]
async fn test_document_survives_restart() {
    let dir = tempdir().unwrap();

    {
        let mirror: Arc<dyn MirrorBackend> =
            Arc::new(RocksMirror::open(StoreConfig::for_testing(dir.path())).unwrap());
        let doc = SharedDocument::new();
        let adapter = PersistenceAdapter::open(doc.clone(), mirror, "p1", 500).await;
        doc.push_item(&item("a"), UpdateOrigin::Local);
        doc.push_item(&item("b"), UpdateOrigin::Local);
        doc.set_setting(SETTING_GRID_SIZE, SettingValue::Number(32.0), UpdateOrigin::Local);
        doc.set_project_name("Moodboard", UpdateOrigin::Local);
        adapter.close().await.unwrap();
    }

    let mirror: Arc<dyn MirrorBackend> =
        Arc::new(RocksMirror::open(StoreConfig::for_testing(dir.path())).unwrap());
    let doc = SharedDocument::new();
    let adapter = PersistenceAdapter::open(doc.clone(), mirror, "p1", 500).await;
    assert!(adapter.is_synced());

    let ids: Vec<String> = doc.items().into_iter().map(|i| i.id).collect();
    assert_eq!(ids, vec!["a", "b"]);
    assert_eq!(doc.settings().grid_size, 32.0);
    assert_eq!(doc.project_name().as_deref(), Some("Moodboard"));
}

#[tokio::test]
async fn test_unclosed_log_is_replayed() {
    let dir = tempdir().unwrap();
    let mirror = Arc::new(RocksMirror::open(StoreConfig::for_testing(dir.path())).unwrap());

    let doc = SharedDocument::new();
    let adapter = PersistenceAdapter::open(doc.clone(), mirror.clone(), "p1", 500).await;
    for i in 0..5 {
        doc.push_item(&item(&format!("i{i}")), UpdateOrigin::Local);
    }
    assert!(eventually(|| mirror.metadata("p1").ok().flatten().is_some_and(|m| m.update_count == 5)).await);
    // No close: only the log exists.
    drop(adapter);

    let reloaded = SharedDocument::new();
    let _adapter = PersistenceAdapter::open(reloaded.clone(), mirror, "p1", 500).await;
    assert_eq!(reloaded.item_count(), 5);
}

#[tokio::test]
async fn test_log_is_trimmed_into_snapshot() {
    let dir = tempdir().unwrap();
    let mirror = Arc::new(RocksMirror::open(StoreConfig::for_testing(dir.path())).unwrap());

    let doc = SharedDocument::new();
    let _adapter = PersistenceAdapter::open(doc.clone(), mirror.clone(), "p1", 10).await;
    for i in 0..25 {
        doc.push_item(&item(&format!("i{i}")), UpdateOrigin::Local);
    }

    // 25 updates at a trim size of 10: two compactions, five left in the log.
    assert!(eventually(|| mirror.metadata("p1").ok().flatten().is_some_and(|m| m.next_seq == 25)).await);
    let meta = mirror.metadata("p1").unwrap().unwrap();
    assert_eq!(meta.update_count, 5);
    assert!(meta.snapshot_size > 0);
    assert_eq!(mirror.load("p1").unwrap().len(), 6);
}

#[tokio::test]
async fn test_rooms_are_isolated() {
    let dir = tempdir().unwrap();
    let mirror: Arc<dyn MirrorBackend> =
        Arc::new(RocksMirror::open(StoreConfig::for_testing(dir.path())).unwrap());

    let one = SharedDocument::new();
    let two = SharedDocument::new();
    let a1 = PersistenceAdapter::open(one.clone(), mirror.clone(), "one", 500).await;
    let a2 = PersistenceAdapter::open(two.clone(), mirror.clone(), "two", 500).await;
    one.push_item(&item("only-in-one"), UpdateOrigin::Local);
    a1.close().await.unwrap();
    a2.close().await.unwrap();

    let reloaded = SharedDocument::new();
    let _adapter = PersistenceAdapter::open(reloaded.clone(), mirror, "two", 500).await;
    assert_eq!(reloaded.item_count(), 0);
}

#[tokio::test]
async fn test_mirrored_state_reaches_peers() {
    let dir = tempdir().unwrap();
    let mirror: Arc<dyn MirrorBackend> =
        Arc::new(RocksMirror::open(StoreConfig::for_testing(dir.path())).unwrap());
    {
        let doc = SharedDocument::new();
        let adapter = PersistenceAdapter::open(doc.clone(), mirror.clone(), "p1", 500).await;
        doc.push_item(&item("offline-edit"), UpdateOrigin::Local);
        adapter.close().await.unwrap();
    }

    let hub = RealtimeHub::default();
    let mut peer = TransportProvider::new(
        SharedDocument::new(),
        Arc::new(hub.clone()),
        ProviderConfig::default(),
    );
    peer.connect("p1").await.unwrap();

    // Mirror first, then network.
    let doc = SharedDocument::new();
    let _adapter = PersistenceAdapter::open(doc.clone(), mirror, "p1", 500).await;
    let mut provider = TransportProvider::new(doc, Arc::new(hub.clone()), ProviderConfig::default());
    provider.connect("p1").await.unwrap();

    // The peer learns our state from our reply to its step-1. Reconnecting
    // sends one now instead of at the next resync tick.
    peer.disconnect();
    peer.connect("p1").await.unwrap();
    assert!(eventually(|| peer.document().item("offline-edit").is_some()).await);
}
