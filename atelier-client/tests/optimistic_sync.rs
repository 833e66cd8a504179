//! Optimistic mutations against an in-memory item store.
//!
//! Verifies:
//! - A created item is visible under a temporary id before the server
//!   answers, then replaced in place by the server's item
//! - Failed deletes restore the original order and surface the error
//! - bringToFront is idempotent and always yields the strict maximum zIndex
//! - Viewport helpers (zoom to cursor, fit to screen) hold their invariants

use std::sync::Arc;
use std::time::Duration;

use atelier_client::{CanvasStore, MemoryItemApi, SyncEngine, SyncError, SyncPhase};
use atelier_core::{is_temporary_id, Camera, CanvasItem, NewItem, Point};

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn row(id: &str, z: i64) -> CanvasItem {
    CanvasItem::from_new(
        id,
        "p1",
        &NewItem {
            z_index: Some(z),
            width: Some(100.0),
            height: Some(100.0),
            ..NewItem::default()
        },
    )
}

async fn loaded_engine(api: &MemoryItemApi) -> Arc<SyncEngine> {
    let engine = Arc::new(SyncEngine::new(
        Arc::new(api.clone()),
        CanvasStore::new(),
        "p1",
        "me",
    ));
    engine.load_canvas().await.unwrap();
    engine
}

// ─── Create ──────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_create_is_visible_then_replaced_in_place() {
    let api = MemoryItemApi::new();
    api.seed(row("a", 0));
    api.seed(row("c", 2));
    let engine = loaded_engine(&api).await;
    api.set_latency(Some(Duration::from_millis(100)));

    let task = tokio::spawn({
        let engine = engine.clone();
        async move {
            engine
                .create_item(NewItem {
                    z_index: Some(1),
                    ..NewItem::default()
                })
                .await
        }
    });

    tokio::time::sleep(Duration::from_millis(10)).await;
    let ids = engine.store().item_ids();
    assert_eq!(ids.len(), 3);
    assert_eq!(ids[0], "a");
    assert!(is_temporary_id(&ids[1]));
    assert_eq!(ids[2], "c");
    assert_eq!(engine.store().sync_phase(), SyncPhase::Syncing);

    let created = task.await.unwrap().unwrap();
    let ids = engine.store().item_ids();
    assert_eq!(ids, vec!["a".to_string(), created.id.clone(), "c".to_string()]);
    assert!(!ids.iter().any(|id| is_temporary_id(id)));
    assert_eq!(engine.store().sync_phase(), SyncPhase::Synced);
}

#[tokio::test]
async fn test_create_failure_leaves_no_partial_state() {
    let api = MemoryItemApi::new();
    api.seed(row("a", 0));
    let engine = loaded_engine(&api).await;
    api.set_failure(Some(SyncError::Network("offline".into())));

    assert!(engine.create_item(NewItem::default()).await.is_err());
    assert_eq!(engine.store().item_ids(), vec!["a"]);
    assert_eq!(engine.store().sync_phase(), SyncPhase::Error);
}

// ─── Delete ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_failed_delete_restores_original_order() {
    let api = MemoryItemApi::new();
    api.seed(row("A", 0));
    api.seed(row("B", 0));
    let engine = loaded_engine(&api).await;
    assert_eq!(engine.store().item_ids(), vec!["A", "B"]);

    api.set_failure(Some(SyncError::Http {
        status: 503,
        body: "unavailable".into(),
    }));
    assert!(engine.delete_item("A").await.is_err());

    assert_eq!(engine.store().item_ids(), vec!["A", "B"]);
    let status = engine.store().sync_status();
    assert!(status.sync_error.unwrap().contains("503"));
}

#[tokio::test]
async fn test_successful_delete() {
    let api = MemoryItemApi::new();
    api.seed(row("A", 0));
    api.seed(row("B", 0));
    let engine = loaded_engine(&api).await;

    engine.delete_item("A").await.unwrap();
    assert_eq!(engine.store().item_ids(), vec!["B"]);
    assert_eq!(api.rows("p1").len(), 1);
}

// ─── Z-order ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_bring_to_front_is_idempotent() {
    let api = MemoryItemApi::new();
    for (id, z) in [("a", 4), ("b", -2), ("c", 9), ("d", 9)] {
        api.seed(row(id, z));
    }
    let engine = loaded_engine(&api).await;

    engine.bring_to_front("b").await.unwrap();
    let order = engine.store().item_ids();
    assert_eq!(order.last().map(String::as_str), Some("b"));

    engine.bring_to_front("b").await.unwrap();
    assert_eq!(engine.store().item_ids(), order);

    let items = engine.store().items();
    let front = items.iter().find(|i| i.id == "b").unwrap().z_index;
    assert!(items
        .iter()
        .filter(|i| i.id != "b")
        .all(|i| i.z_index < front));
}

// ─── Viewport ────────────────────────────────────────────────────────────────

#[test]
fn test_zoom_to_cursor_keeps_point_under_cursor() {
    let store = CanvasStore::new();
    let cases = [
        (Camera { x: 0.0, y: 0.0, zoom: 1.0 }, Point::new(400.0, 300.0), 2.0),
        (Camera { x: -120.5, y: 33.0, zoom: 0.25 }, Point::new(12.0, 900.0), 0.1),
        (Camera { x: 5000.0, y: -5000.0, zoom: 4.0 }, Point::new(0.0, 0.0), 7.5),
    ];
    for (camera, cursor, new_zoom) in cases {
        store.set_camera(camera);
        assert!(store.zoom_to_cursor(cursor, new_zoom));
        let after = store.camera();
        let before_world = (cursor.x - camera.x) / camera.zoom;
        let after_world = (cursor.x - after.x) / after.zoom;
        assert!((before_world - after_world).abs() < 1e-9);
        let before_world = (cursor.y - camera.y) / camera.zoom;
        let after_world = (cursor.y - after.y) / after.zoom;
        assert!((before_world - after_world).abs() < 1e-9);
    }
}

#[test]
fn test_fit_to_screen_caps_zoom_at_one() {
    let store = CanvasStore::new();
    store.set_viewport_size(800.0, 600.0);
    store.add_item(CanvasItem::from_new(
        "wide",
        "p1",
        &NewItem {
            x: -3000.0,
            y: 250.0,
            width: Some(400.0),
            height: Some(400.0),
            ..NewItem::default()
        },
    ));

    assert!(store.fit_to_screen(100.0));
    assert_eq!(store.camera().zoom, 1.0);
}
