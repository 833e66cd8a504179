//! Optimistic REST sync engine.
//!
//! Every mutating operation follows the same path:
//!
//! ```text
//!  apply to CanvasStore ──► Pending { snapshot } ──► ItemApi request
//!                                                     │
//!                               ┌── Ok ───────────────┤
//!                               ▼                     ▼ Err
//!                          commit (swap temp id)   rollback (exact snapshot)
//!                                                  + syncError
//! ```
//!
//! Two background tasks run beside it: the debounced viewport saver and the
//! change-feed applier. Neither retries; failures are only reported through
//! the store's sync status.
//!
//! [`LocalEdits`] records which ids have a request in flight and which ids
//! this session deleted. Remote state for those ids (change feed, shared
//! document) is not applied, so it can neither overwrite an optimistic edit
//! nor bring back a deleted item.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use atelier_collab::{ChangeEvent, ChangeFeed, ChangeKind, TransportError};
use atelier_core::{
    is_temporary_id, temporary_id, CanvasItem, CanvasState, ItemPatch, NewItem,
};
use futures_util::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::api::ItemApi;
use super::SyncError;
use crate::store::CanvasStore;

/// An optimistic mutation awaiting the authoritative store, carrying what
/// is needed to undo it.
enum Pending {
    Create { temp_id: String },
    Update { snapshot: CanvasItem },
    Delete { removed: Vec<(usize, CanvasItem)> },
}

impl Pending {
    fn rollback(self, store: &CanvasStore) {
        match self {
            Pending::Create { temp_id } => {
                store.delete_item(&temp_id);
            }
            Pending::Update { snapshot } => store.restore_item(snapshot),
            Pending::Delete { removed } => store.reinsert_items(removed),
        }
    }

    fn describe(&self) -> String {
        match self {
            Pending::Create { temp_id } => format!("create of {temp_id}"),
            Pending::Update { snapshot } => format!("update of {}", snapshot.id),
            Pending::Delete { removed } => {
                let ids: Vec<&str> = removed.iter().map(|(_, i)| i.id.as_str()).collect();
                format!("delete of {}", ids.join(", "))
            }
        }
    }
}

#[derive(Default)]
struct EditState {
    in_flight: HashMap<String, usize>,
    deleted: HashSet<String>,
}

/// Ids with a local request in flight, and ids deleted during this session.
#[derive(Clone, Default)]
pub struct LocalEdits {
    state: Arc<Mutex<EditState>>,
}

impl LocalEdits {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EditState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark `ids` as in flight until the returned guard is dropped.
    pub fn begin<I, S>(&self, ids: I) -> InFlight
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ids: Vec<String> = ids.into_iter().map(Into::into).collect();
        {
            let mut state = self.lock();
            for id in &ids {
                *state.in_flight.entry(id.clone()).or_insert(0) += 1;
            }
        }
        InFlight {
            edits: self.clone(),
            ids,
        }
    }

    pub fn is_in_flight(&self, id: &str) -> bool {
        self.lock().in_flight.contains_key(id)
    }

    pub fn mark_deleted(&self, id: impl Into<String>) {
        self.lock().deleted.insert(id.into());
    }

    pub fn is_deleted(&self, id: &str) -> bool {
        self.lock().deleted.contains(id)
    }

    /// Whether remote state for `id` must be ignored right now.
    pub fn shields(&self, id: &str) -> bool {
        let state = self.lock();
        state.in_flight.contains_key(id) || state.deleted.contains(id)
    }
}

/// Guard returned by [`LocalEdits::begin`].
pub struct InFlight {
    edits: LocalEdits,
    ids: Vec<String>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let mut state = self.edits.lock();
        for id in &self.ids {
            if let Some(count) = state.in_flight.get_mut(id) {
                *count -= 1;
                if *count == 0 {
                    state.in_flight.remove(id);
                }
            }
        }
    }
}

pub struct SyncEngine {
    api: Arc<dyn ItemApi>,
    store: CanvasStore,
    edits: LocalEdits,
    project_id: String,
    actor_id: String,
    /// Set once `load_canvas` succeeds; gates viewport saves.
    loaded: Arc<AtomicBool>,
    last_saved: Arc<Mutex<Option<CanvasState>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncEngine {
    pub fn new(
        api: Arc<dyn ItemApi>,
        store: CanvasStore,
        project_id: impl Into<String>,
        actor_id: impl Into<String>,
    ) -> Self {
        Self {
            api,
            store,
            edits: LocalEdits::new(),
            project_id: project_id.into(),
            actor_id: actor_id.into(),
            loaded: Arc::new(AtomicBool::new(false)),
            last_saved: Arc::new(Mutex::new(None)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn actor_id(&self) -> &str {
        &self.actor_id
    }

    pub fn store(&self) -> &CanvasStore {
        &self.store
    }

    pub fn local_edits(&self) -> &LocalEdits {
        &self.edits
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    fn track(&self, handle: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
    }

    /// Settle a pending mutation: report success, or roll back and report
    /// the error.
    fn settle<T>(&self, pending: Pending, result: Result<T, SyncError>) -> Result<T, SyncError> {
        match result {
            Ok(value) => {
                self.store.finish_sync(Ok(()));
                Ok(value)
            }
            Err(e) => {
                log::warn!("Rolling back {}: {e}", pending.describe());
                pending.rollback(&self.store);
                self.store.finish_sync(Err(e.to_string()));
                Err(e)
            }
        }
    }

    // ─── Load ─────────────────────────────────────────────────────────

    /// Fetch every item and the viewport row, replace the store's contents,
    /// and enable viewport saves.
    pub async fn load_canvas(&self) -> Result<(), SyncError> {
        self.store.set_loading(true);
        self.store.begin_sync();
        let result = tokio::try_join!(
            self.api.list(&self.project_id),
            self.api.get_state(&self.project_id)
        );
        self.store.set_loading(false);

        match result {
            Ok((items, state)) => {
                log::info!(
                    "Loaded {} items for project {}",
                    items.len(),
                    self.project_id
                );
                self.store.set_items(items);
                if let Some(state) = state {
                    self.store.load_canvas_state(&state);
                }
                *self
                    .last_saved
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(self.store.canvas_state());
                self.loaded.store(true, Ordering::Release);
                self.store.finish_sync(Ok(()));
                Ok(())
            }
            Err(e) => {
                log::warn!("Loading project {} failed: {e}", self.project_id);
                self.store.finish_sync(Err(e.to_string()));
                Err(e)
            }
        }
    }

    // ─── Optimistic mutations ─────────────────────────────────────────

    /// Insert under a temporary id right away, then swap in the server's
    /// item at the same list position. On failure the temporary item is
    /// removed.
    pub async fn create_item(&self, mut data: NewItem) -> Result<CanvasItem, SyncError> {
        if data.z_index.is_none() {
            data.z_index = Some(self.store.next_z_index());
        }
        if data.created_by.is_none() {
            data.created_by = Some(self.actor_id.clone());
        }

        let temp_id = temporary_id();
        self.store
            .add_item(CanvasItem::from_new(&temp_id, &self.project_id, &data));
        self.store.begin_sync();

        let pending = Pending::Create {
            temp_id: temp_id.clone(),
        };
        let result = self.api.create(&self.project_id, &data).await;
        let item = self.settle(pending, result)?;

        if !self.store.replace_item(&temp_id, item.clone()) {
            // Removed locally while the request was in flight.
            log::debug!("{temp_id} vanished before {} was confirmed", item.id);
            self.edits.mark_deleted(item.id.clone());
            if let Err(e) = self.api.delete(&item.id).await {
                log::warn!("Orphaned item {} could not be removed: {e}", item.id);
            }
        }
        Ok(item)
    }

    /// Patch optimistically; restore the exact pre-edit item on failure.
    pub async fn update_item(&self, id: &str, patch: ItemPatch) -> Result<(), SyncError> {
        if is_temporary_id(id) {
            return Err(SyncError::NotPersisted(id.to_string()));
        }
        let _in_flight = self.edits.begin([id]);
        let snapshot = self
            .store
            .update_item(id, &patch)
            .ok_or_else(|| SyncError::NotFound(id.to_string()))?;
        self.store.begin_sync();

        let result = self.api.update(id, &patch).await;
        self.settle(Pending::Update { snapshot }, result).map(drop)
    }

    /// Remove optimistically; put the item back at its former position on
    /// failure.
    pub async fn delete_item(&self, id: &str) -> Result<(), SyncError> {
        if is_temporary_id(id) {
            return Err(SyncError::NotPersisted(id.to_string()));
        }
        let _in_flight = self.edits.begin([id]);
        let removed = self.store.delete_items(&[id.to_string()]);
        if removed.is_empty() {
            return Err(SyncError::NotFound(id.to_string()));
        }
        self.store.begin_sync();

        let result = self.api.delete(id).await;
        if result.is_ok() {
            self.edits.mark_deleted(id);
        }
        self.settle(Pending::Delete { removed }, result)
    }

    /// Delete every selected item. Items whose request fails are restored;
    /// the first error is returned.
    pub async fn delete_selected(&self) -> Result<usize, SyncError> {
        let ids: Vec<String> = self
            .store
            .selection()
            .into_iter()
            .filter(|id| !is_temporary_id(id))
            .collect();
        let _in_flight = self.edits.begin(ids.iter().cloned());
        let removed = self.store.delete_items(&ids);
        if removed.is_empty() {
            return Ok(0);
        }

        let total = removed.len();
        self.store.begin_sync();
        let requests = removed.iter().map(|(_, item)| self.api.delete(&item.id));
        let results = join_all(requests).await;

        let mut first_error = None;
        let mut restore = Vec::new();
        for (entry, result) in removed.into_iter().zip(results) {
            match result {
                Ok(()) => self.edits.mark_deleted(entry.1.id.clone()),
                Err(e) => {
                    first_error.get_or_insert(e);
                    restore.push(entry);
                }
            }
        }
        let deleted = total - restore.len();
        let outcome = match first_error {
            Some(e) => Err(e),
            None => Ok(deleted),
        };
        self.settle(Pending::Delete { removed: restore }, outcome)
    }

    /// Move the selection and persist every moved item's position.
    pub async fn move_selected(&self, dx: f64, dy: f64) -> Result<(), SyncError> {
        let _in_flight = self.edits.begin(self.store.selection());
        let snapshots: Vec<CanvasItem> = self
            .store
            .selection()
            .iter()
            .filter_map(|id| self.store.item(id))
            .collect();
        let patches = self.store.move_selected(dx, dy);

        let persisted: Vec<(String, ItemPatch)> = patches
            .into_iter()
            .filter(|(id, _)| !is_temporary_id(id))
            .collect();
        self.store.begin_sync();
        let requests = persisted
            .iter()
            .map(|(id, patch)| self.api.update(id, patch));
        let results = join_all(requests).await;

        let mut first_error = None;
        for ((id, _), result) in persisted.iter().zip(results) {
            if let Err(e) = result {
                if let Some(snapshot) = snapshots.iter().find(|s| &s.id == id) {
                    log::warn!("Rolling back move of {id}: {e}");
                    self.store.restore_item(snapshot.clone());
                }
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => {
                self.store.finish_sync(Err(e.to_string()));
                Err(e)
            }
            None => {
                self.store.finish_sync(Ok(()));
                Ok(())
            }
        }
    }

    /// Raise the item above every other and persist its new zIndex.
    pub async fn bring_to_front(&self, id: &str) -> Result<(), SyncError> {
        self.reorder(id, CanvasStore::bring_to_front).await
    }

    /// Lower the item below every other and persist its new zIndex.
    pub async fn send_to_back(&self, id: &str) -> Result<(), SyncError> {
        self.reorder(id, CanvasStore::send_to_back).await
    }

    async fn reorder(
        &self,
        id: &str,
        op: fn(&CanvasStore, &str) -> Option<i64>,
    ) -> Result<(), SyncError> {
        if is_temporary_id(id) {
            return Err(SyncError::NotPersisted(id.to_string()));
        }
        let _in_flight = self.edits.begin([id]);
        let snapshot = self
            .store
            .item(id)
            .ok_or_else(|| SyncError::NotFound(id.to_string()))?;
        let z = op(&self.store, id).ok_or_else(|| SyncError::NotFound(id.to_string()))?;
        self.store.begin_sync();

        let result = self.api.update(id, &ItemPatch::z_index(z)).await;
        self.settle(Pending::Update { snapshot }, result).map(drop)
    }

    // ─── Viewport saves ───────────────────────────────────────────────

    /// Save the viewport after `debounce` of quiet following the last
    /// camera or settings change. Saves are skipped until the initial load
    /// completes, and when nothing differs from the last saved row.
    pub fn start_viewport_saver(&self, debounce: Duration) {
        let rx = self.store.subscribe_viewport();
        let handle = tokio::spawn(save_viewport_loop(
            rx,
            debounce,
            self.api.clone(),
            self.store.clone(),
            self.project_id.clone(),
            self.loaded.clone(),
            self.last_saved.clone(),
        ));
        self.track(handle);
    }

    // ─── Change feed ──────────────────────────────────────────────────

    /// Apply row changes made by other actors to the store.
    pub async fn start_change_feed(&self, feed: &dyn ChangeFeed) -> Result<(), TransportError> {
        let mut rx = feed.subscribe_changes(&self.project_id).await?;
        let store = self.store.clone();
        let edits = self.edits.clone();
        let project_id = self.project_id.clone();
        let actor_id = self.actor_id.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                apply_change(&store, &edits, &project_id, &actor_id, event);
            }
            log::debug!("Change feed for {project_id} closed");
        });
        self.track(handle);
        Ok(())
    }

    /// Stop the background tasks.
    pub fn shutdown(&self) {
        let tasks = std::mem::take(
            &mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for task in tasks {
            task.abort();
        }
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn save_viewport_loop(
    mut rx: watch::Receiver<CanvasState>,
    debounce: Duration,
    api: Arc<dyn ItemApi>,
    store: CanvasStore,
    project_id: String,
    loaded: Arc<AtomicBool>,
    last_saved: Arc<Mutex<Option<CanvasState>>>,
) {
    loop {
        if rx.changed().await.is_err() {
            return;
        }
        // Each further change restarts the quiet period.
        loop {
            match tokio::time::timeout(debounce, rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return,
                Err(_) => break,
            }
        }
        if !loaded.load(Ordering::Acquire) {
            continue;
        }

        let current = rx.borrow_and_update().clone();
        let patch = {
            let last = last_saved.lock().unwrap_or_else(PoisonError::into_inner);
            match last.as_ref() {
                Some(previous) => current.diff(previous),
                None => current.diff(&CanvasState::default()),
            }
        };
        if patch.is_empty() {
            log::trace!("Viewport of {project_id} unchanged, not saving");
            continue;
        }

        store.begin_sync();
        match api.save_state(&project_id, &patch).await {
            Ok(_) => {
                *last_saved.lock().unwrap_or_else(PoisonError::into_inner) = Some(current);
                store.finish_sync(Ok(()));
            }
            Err(e) => {
                log::warn!("Saving viewport of {project_id} failed: {e}");
                store.finish_sync(Err(e.to_string()));
            }
        }
    }
}

/// Apply one change-feed event. Returns whether the store changed.
///
/// Events from `local_actor` were already applied optimistically and are
/// skipped; INSERTs of ids already present are ignored. UPDATEs only touch
/// items the store holds, and ids shielded by `edits` are left alone.
pub fn apply_change(
    store: &CanvasStore,
    edits: &LocalEdits,
    project_id: &str,
    local_actor: &str,
    event: ChangeEvent,
) -> bool {
    if event.project_id != project_id {
        return false;
    }
    if event.actor_id.as_deref() == Some(local_actor) {
        log::debug!(
            "Ignoring own {:?} of {}",
            event.kind,
            event.item_id().unwrap_or("?")
        );
        return false;
    }

    match event.kind {
        ChangeKind::Insert => match event.record {
            Some(item) if !edits.is_deleted(&item.id) => store.add_item(item),
            _ => false,
        },
        ChangeKind::Update => match event.record {
            Some(item) if edits.shields(&item.id) => {
                log::debug!("Holding back remote update of {}", item.id);
                false
            }
            Some(item) => store.overwrite_item(item),
            None => false,
        },
        ChangeKind::Delete => match event.old_id {
            Some(id) => {
                let removed = store.delete_item(&id).is_some();
                edits.mark_deleted(id);
                removed
            }
            None => false,
        },
    }
}
