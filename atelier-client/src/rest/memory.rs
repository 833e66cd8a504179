//! In-process item API.
//!
//! Holds rows in memory and optionally publishes every successful write on
//! a [`RealtimeHub`] change feed, tagged with the writing actor, the way the
//! hosted store's replication stream does. Handles created with
//! [`MemoryItemApi::for_actor`] share one database.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use atelier_collab::{ChangeEvent, RealtimeHub};
use atelier_core::{CanvasItem, CanvasState, ItemPatch, NewItem, ViewportPatch};

use super::api::ItemApi;
use super::SyncError;

#[derive(Default)]
struct MemoryDb {
    items: Vec<CanvasItem>,
    states: HashMap<String, CanvasState>,
    next_id: u64,
    failure: Option<SyncError>,
    latency: Option<Duration>,
    requests: Vec<String>,
}

#[derive(Clone, Default)]
pub struct MemoryItemApi {
    db: Arc<Mutex<MemoryDb>>,
    feed: Option<RealtimeHub>,
    actor_id: Option<String>,
}

impl MemoryItemApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish successful writes on `hub`'s change feed.
    pub fn with_change_feed(mut self, hub: RealtimeHub) -> Self {
        self.feed = Some(hub);
        self
    }

    /// A handle on the same database whose writes are attributed to `actor_id`.
    pub fn for_actor(&self, actor_id: impl Into<String>) -> Self {
        Self {
            db: self.db.clone(),
            feed: self.feed.clone(),
            actor_id: Some(actor_id.into()),
        }
    }

    fn db(&self) -> MutexGuard<'_, MemoryDb> {
        self.db.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every request fail with `error` until cleared with `None`.
    pub fn set_failure(&self, error: Option<SyncError>) {
        self.db().failure = error;
    }

    /// Delay every request by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.db().latency = latency;
    }

    /// Seed a row directly, bypassing the feed.
    pub fn seed(&self, item: CanvasItem) {
        self.db().items.push(item);
    }

    pub fn seed_state(&self, project_id: &str, state: CanvasState) {
        self.db().states.insert(project_id.to_string(), state);
    }

    pub fn rows(&self, project_id: &str) -> Vec<CanvasItem> {
        self.db()
            .items
            .iter()
            .filter(|i| i.project_id == project_id)
            .cloned()
            .collect()
    }

    pub fn state(&self, project_id: &str) -> Option<CanvasState> {
        self.db().states.get(project_id).cloned()
    }

    /// Requests received so far, as `"<operation> <target>"`.
    pub fn requests(&self) -> Vec<String> {
        self.db().requests.clone()
    }

    pub fn request_count(&self, operation: &str) -> usize {
        self.db()
            .requests
            .iter()
            .filter(|r| r.split(' ').next() == Some(operation))
            .count()
    }

    /// Log the request, wait out any latency, then fail if configured to.
    async fn begin(&self, operation: &str, target: &str) -> Result<(), SyncError> {
        let latency = {
            let mut db = self.db();
            db.requests.push(format!("{operation} {target}"));
            db.latency
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        match self.db().failure.clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn publish(&self, event: ChangeEvent) {
        if let Some(hub) = &self.feed {
            hub.publish_change(event).await;
        }
    }
}

#[async_trait]
impl ItemApi for MemoryItemApi {
    async fn list(&self, project_id: &str) -> Result<Vec<CanvasItem>, SyncError> {
        self.begin("list", project_id).await?;
        let mut rows = self.rows(project_id);
        rows.sort_by_key(|i| i.z_index);
        Ok(rows)
    }

    async fn create(&self, project_id: &str, data: &NewItem) -> Result<CanvasItem, SyncError> {
        self.begin("create", project_id).await?;
        let item = {
            let mut db = self.db();
            db.next_id += 1;
            let mut item = CanvasItem::from_new(format!("item-{}", db.next_id), project_id, data);
            if item.created_by.is_none() {
                item.created_by = self.actor_id.clone();
            }
            let now = now_stamp();
            item.created_at = Some(now.clone());
            item.updated_at = Some(now);
            db.items.push(item.clone());
            item
        };
        self.publish(ChangeEvent::insert(item.clone(), self.actor_id.clone()))
            .await;
        Ok(item)
    }

    async fn update(&self, id: &str, patch: &ItemPatch) -> Result<CanvasItem, SyncError> {
        self.begin("update", id).await?;
        let item = {
            let mut db = self.db();
            let row = db
                .items
                .iter_mut()
                .find(|i| i.id == id)
                .ok_or_else(|| SyncError::NotFound(id.to_string()))?;
            row.apply_patch(patch);
            row.updated_at = Some(now_stamp());
            row.clone()
        };
        self.publish(ChangeEvent::update(item.clone(), self.actor_id.clone()))
            .await;
        Ok(item)
    }

    async fn delete(&self, id: &str) -> Result<(), SyncError> {
        self.begin("delete", id).await?;
        let removed = {
            let mut db = self.db();
            let index = db
                .items
                .iter()
                .position(|i| i.id == id)
                .ok_or_else(|| SyncError::NotFound(id.to_string()))?;
            db.items.remove(index)
        };
        self.publish(ChangeEvent::delete(
            removed.project_id,
            removed.id,
            self.actor_id.clone(),
        ))
        .await;
        Ok(())
    }

    async fn get_state(&self, project_id: &str) -> Result<Option<CanvasState>, SyncError> {
        self.begin("get_state", project_id).await?;
        Ok(self.state(project_id))
    }

    async fn save_state(
        &self,
        project_id: &str,
        patch: &ViewportPatch,
    ) -> Result<CanvasState, SyncError> {
        self.begin("save_state", project_id).await?;
        let mut db = self.db();
        let state = db.states.entry(project_id.to_string()).or_default();
        patch.apply_to(state);
        Ok(state.clone())
    }
}

fn now_stamp() -> String {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use atelier_collab::{ChangeFeed, ChangeKind};

    #[tokio::test]
    async fn test_crud_roundtrip() {
        let api = MemoryItemApi::new();
        let created = api
            .create("p1", &NewItem { x: 5.0, ..NewItem::default() })
            .await
            .unwrap();
        assert_eq!(created.id, "item-1");
        assert!(created.created_at.is_some());

        let updated = api
            .update(&created.id, &ItemPatch::position(7.0, 8.0))
            .await
            .unwrap();
        assert_eq!((updated.x, updated.y), (7.0, 8.0));

        assert_eq!(api.list("p1").await.unwrap().len(), 1);
        assert!(api.list("p2").await.unwrap().is_empty());

        api.delete(&created.id).await.unwrap();
        assert_eq!(
            api.delete(&created.id).await,
            Err(SyncError::NotFound(created.id.clone()))
        );
        assert_eq!(api.request_count("delete"), 2);
    }

    #[tokio::test]
    async fn test_state_rows() {
        let api = MemoryItemApi::new();
        assert_eq!(api.get_state("p1").await.unwrap(), None);
        let saved = api
            .save_state(
                "p1",
                &ViewportPatch {
                    zoom: Some(2.0),
                    ..ViewportPatch::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(saved.zoom, 2.0);
        assert_eq!(api.get_state("p1").await.unwrap(), Some(saved));
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let api = MemoryItemApi::new();
        api.set_failure(Some(SyncError::Network("offline".into())));
        assert!(api.create("p1", &NewItem::default()).await.is_err());
        assert!(api.rows("p1").is_empty());
        api.set_failure(None);
        assert!(api.create("p1", &NewItem::default()).await.is_ok());
    }

    #[tokio::test]
    async fn test_writes_reach_change_feed_with_actor() {
        let hub = RealtimeHub::default();
        let api = MemoryItemApi::new().with_change_feed(hub.clone());
        let alice = api.for_actor("alice");
        let mut feed = hub.subscribe_changes("p1").await.unwrap();

        let item = alice.create("p1", &NewItem::default()).await.unwrap();
        let event = feed.recv().await.unwrap();
        assert_eq!(event.kind, ChangeKind::Insert);
        assert_eq!(event.actor_id.as_deref(), Some("alice"));
        assert_eq!(event.item_id(), Some(item.id.as_str()));

        // Shared database.
        assert_eq!(api.rows("p1").len(), 1);
        api.delete(&item.id).await.unwrap();
        let event = feed.recv().await.unwrap();
        assert_eq!(event.kind, ChangeKind::Delete);
        assert_eq!(event.actor_id, None);
    }
}
