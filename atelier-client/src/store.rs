//! Client state store: the single source of truth consumed by rendering.
//!
//! `CanvasStore` is a cheap-to-clone handle over one session's state:
//! items (kept ordered by zIndex), camera, selection, interaction mode,
//! viewport size, canvas settings, sync status, presence and the
//! connection flag. Every mutation goes through a named operation that
//! runs as one critical section, then bumps a revision counter the render
//! layer can await.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use atelier_collab::PresenceRecord;
use atelier_core::{Bounds, Camera, CanvasItem, CanvasState, ItemPatch, Point, ViewportPatch};
use atelier_layout::{compute_snap, snap_to_grid, DragBox, SnapResult};
use tokio::sync::watch;

/// Active canvas tool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum InteractionMode {
    #[default]
    Select,
    Pan,
    Generate,
    Rectangle,
    Arrow,
    Text,
    Sticky,
    Measure,
}

/// Per-project canvas settings.
#[derive(Debug, Clone, PartialEq)]
pub struct CanvasSettings {
    pub grid_enabled: bool,
    pub grid_size: f64,
    pub snap_to_grid: bool,
    pub background_color: String,
}

impl Default for CanvasSettings {
    fn default() -> Self {
        let state = CanvasState::default();
        Self {
            grid_enabled: state.grid_enabled,
            grid_size: state.grid_size,
            snap_to_grid: state.snap_to_grid,
            background_color: state.background_color,
        }
    }
}

/// REST sync flags.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncStatus {
    pub is_loading: bool,
    pub is_syncing: bool,
    pub last_synced_at: Option<SystemTime>,
    pub sync_error: Option<String>,
}

/// Sync status as the UI renders it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    LocalOnly,
    Syncing,
    Synced,
    Error,
}

impl SyncStatus {
    pub fn phase(&self) -> SyncPhase {
        if self.sync_error.is_some() {
            SyncPhase::Error
        } else if self.is_loading || self.is_syncing {
            SyncPhase::Syncing
        } else if self.last_synced_at.is_some() {
            SyncPhase::Synced
        } else {
            SyncPhase::LocalOnly
        }
    }
}

#[derive(Debug, Default)]
struct StoreState {
    items: Vec<CanvasItem>,
    camera: Camera,
    selection: BTreeSet<String>,
    mode: InteractionMode,
    viewport_width: f64,
    viewport_height: f64,
    settings: CanvasSettings,
    sync: SyncStatus,
    /// REST requests currently in flight.
    in_flight: usize,
    presence: Vec<PresenceRecord>,
    connected: bool,
}

impl StoreState {
    fn sort(&mut self) {
        // Stable: equal zIndex keeps insertion order.
        self.items.sort_by_key(|item| item.z_index);
    }

    fn index_of(&self, id: &str) -> Option<usize> {
        self.items.iter().position(|item| item.id == id)
    }

    fn canvas_state(&self) -> CanvasState {
        CanvasState {
            zoom: self.camera.zoom,
            pan_x: self.camera.x,
            pan_y: self.camera.y,
            grid_enabled: self.settings.grid_enabled,
            grid_size: self.settings.grid_size,
            snap_to_grid: self.settings.snap_to_grid,
            background_color: self.settings.background_color.clone(),
        }
    }

    fn content_bounds(&self) -> Option<Bounds> {
        self.items
            .iter()
            .map(CanvasItem::bounds)
            .reduce(|acc, b| acc.union(&b))
    }

    fn remove_at(&mut self, index: usize) -> CanvasItem {
        let item = self.items.remove(index);
        self.selection.remove(&item.id);
        item
    }
}

fn lock(state: &Mutex<StoreState>) -> MutexGuard<'_, StoreState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared handle to one session's client state.
#[derive(Clone)]
pub struct CanvasStore {
    state: Arc<Mutex<StoreState>>,
    revision: Arc<watch::Sender<u64>>,
    viewport: Arc<watch::Sender<CanvasState>>,
}

impl Default for CanvasStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CanvasStore {
    pub fn new() -> Self {
        let state = StoreState::default();
        let (viewport, _) = watch::channel(state.canvas_state());
        let (revision, _) = watch::channel(0);
        Self {
            state: Arc::new(Mutex::new(state)),
            revision: Arc::new(revision),
            viewport: Arc::new(viewport),
        }
    }

    fn read<R>(&self, f: impl FnOnce(&StoreState) -> R) -> R {
        f(&lock(&self.state))
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut StoreState) -> R) -> R {
        let (result, canvas) = {
            let mut state = lock(&self.state);
            let result = f(&mut state);
            (result, state.canvas_state())
        };
        self.viewport.send_if_modified(|current| {
            if *current != canvas {
                *current = canvas;
                true
            } else {
                false
            }
        });
        self.revision.send_modify(|r| *r += 1);
        result
    }

    // ─── Change notification ──────────────────────────────────────────

    /// Revision counter, bumped after every mutation.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    pub fn revision(&self) -> u64 {
        *self.revision.borrow()
    }

    /// Persistable viewport state; only changes when camera or settings do.
    pub fn subscribe_viewport(&self) -> watch::Receiver<CanvasState> {
        self.viewport.subscribe()
    }

    // ─── Items ────────────────────────────────────────────────────────

    pub fn items(&self) -> Vec<CanvasItem> {
        self.read(|s| s.items.clone())
    }

    pub fn item(&self, id: &str) -> Option<CanvasItem> {
        self.read(|s| s.items.iter().find(|i| i.id == id).cloned())
    }

    pub fn item_ids(&self) -> Vec<String> {
        self.read(|s| s.items.iter().map(|i| i.id.clone()).collect())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.read(|s| s.index_of(id).is_some())
    }

    pub fn len(&self) -> usize {
        self.read(|s| s.items.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// zIndex that places a new item above everything present.
    pub fn next_z_index(&self) -> i64 {
        self.read(|s| s.items.iter().map(|i| i.z_index).max().map_or(0, |z| z + 1))
    }

    /// Replace all items (full reloads only).
    pub fn set_items(&self, items: Vec<CanvasItem>) {
        self.mutate(|s| {
            s.items = items;
            s.sort();
            let StoreState {
                items, selection, ..
            } = s;
            selection.retain(|id| items.iter().any(|i| &i.id == id));
        });
    }

    /// Insert a new item. Returns `false` if the id is already present.
    pub fn add_item(&self, item: CanvasItem) -> bool {
        self.mutate(|s| {
            if s.index_of(&item.id).is_some() {
                return false;
            }
            s.items.push(item);
            s.sort();
            true
        })
    }

    /// Apply a patch. Returns the pre-edit item, `None` if unknown.
    /// Re-sorts only when the zIndex actually changed.
    pub fn update_item(&self, id: &str, patch: &ItemPatch) -> Option<CanvasItem> {
        self.mutate(|s| {
            let index = s.index_of(id)?;
            let before = s.items[index].clone();
            s.items[index].apply_patch(patch);
            if s.items[index].z_index != before.z_index {
                s.sort();
            }
            Some(before)
        })
    }

    /// Swap the item `id` for `item` in place, keeping its list position.
    pub fn replace_item(&self, id: &str, item: CanvasItem) -> bool {
        self.mutate(|s| {
            let Some(index) = s.index_of(id) else {
                return false;
            };
            if item.id != id {
                // Another copy of the new id (e.g. from the change feed) yields.
                if let Some(dup) = s.index_of(&item.id) {
                    s.items.remove(dup);
                }
                if s.selection.remove(id) {
                    s.selection.insert(item.id.clone());
                }
            }
            let index = s.index_of(id).unwrap_or(index);
            s.items[index] = item;
            true
        })
    }

    /// Replace by id, or insert if absent.
    pub fn upsert_item(&self, item: CanvasItem) {
        self.mutate(|s| match s.index_of(&item.id) {
            Some(index) => {
                let z_changed = s.items[index].z_index != item.z_index;
                s.items[index] = item;
                if z_changed {
                    s.sort();
                }
            }
            None => {
                s.items.push(item);
                s.sort();
            }
        })
    }

    /// Overwrite an item already in the store. Unknown ids are ignored, so a
    /// late remote edit cannot bring back an item removed locally.
    pub fn overwrite_item(&self, item: CanvasItem) -> bool {
        self.mutate(|s| {
            let Some(index) = s.index_of(&item.id) else {
                return false;
            };
            let z_changed = s.items[index].z_index != item.z_index;
            s.items[index] = item;
            if z_changed {
                s.sort();
            }
            true
        })
    }

    /// Restore a pre-edit snapshot exactly.
    pub fn restore_item(&self, snapshot: CanvasItem) {
        self.upsert_item(snapshot);
    }

    /// Remove an item and prune it from the selection.
    /// Returns its former position and value.
    pub fn delete_item(&self, id: &str) -> Option<(usize, CanvasItem)> {
        self.mutate(|s| {
            let index = s.index_of(id)?;
            Some((index, s.remove_at(index)))
        })
    }

    /// Remove several items. The result is ordered by former position, so
    /// [`reinsert_items`](Self::reinsert_items) restores the exact order.
    pub fn delete_items(&self, ids: &[String]) -> Vec<(usize, CanvasItem)> {
        self.mutate(|s| {
            let mut indices: Vec<usize> = ids.iter().filter_map(|id| s.index_of(id)).collect();
            indices.sort_unstable();
            indices.dedup();
            let mut removed: Vec<(usize, CanvasItem)> = indices
                .into_iter()
                .rev()
                .map(|index| (index, s.remove_at(index)))
                .collect();
            removed.reverse();
            removed
        })
    }

    /// Put removed items back at their former positions.
    pub fn reinsert_items(&self, removed: Vec<(usize, CanvasItem)>) {
        self.mutate(|s| {
            for (index, item) in removed {
                if let Some(existing) = s.index_of(&item.id) {
                    s.items[existing] = item;
                } else {
                    let index = index.min(s.items.len());
                    s.items.insert(index, item);
                }
            }
        })
    }

    /// Give the item a zIndex one past the current maximum.
    /// Returns the new zIndex.
    pub fn bring_to_front(&self, id: &str) -> Option<i64> {
        self.mutate(|s| {
            let max = s.items.iter().map(|i| i.z_index).max()?;
            let index = s.index_of(id)?;
            s.items[index].z_index = max + 1;
            s.sort();
            Some(max + 1)
        })
    }

    /// Give the item a zIndex one below the current minimum.
    pub fn send_to_back(&self, id: &str) -> Option<i64> {
        self.mutate(|s| {
            let min = s.items.iter().map(|i| i.z_index).min()?;
            let index = s.index_of(id)?;
            s.items[index].z_index = min - 1;
            s.sort();
            Some(min - 1)
        })
    }

    // ─── Selection ────────────────────────────────────────────────────

    pub fn selection(&self) -> Vec<String> {
        self.read(|s| s.selection.iter().cloned().collect())
    }

    pub fn is_selected(&self, id: &str) -> bool {
        self.read(|s| s.selection.contains(id))
    }

    /// Replace the selection. Unknown ids are ignored.
    pub fn select<I, S>(&self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ids: Vec<String> = ids.into_iter().map(Into::into).collect();
        self.mutate(|s| {
            s.selection = ids
                .into_iter()
                .filter(|id| s.index_of(id).is_some())
                .collect();
        })
    }

    /// Flip one item's membership. Returns whether it is now selected.
    pub fn toggle_selection(&self, id: &str) -> bool {
        self.mutate(|s| {
            if s.selection.remove(id) {
                false
            } else if s.index_of(id).is_some() {
                s.selection.insert(id.to_string());
                true
            } else {
                false
            }
        })
    }

    pub fn select_all(&self) {
        self.mutate(|s| s.selection = s.items.iter().map(|i| i.id.clone()).collect())
    }

    pub fn clear_selection(&self) {
        self.mutate(|s| s.selection.clear())
    }

    /// Move every selected, unlocked item by `(dx, dy)` world units,
    /// snapping to the grid when enabled. Returns the applied patches.
    pub fn move_selected(&self, dx: f64, dy: f64) -> Vec<(String, ItemPatch)> {
        self.mutate(|s| {
            let grid = s.settings.snap_to_grid.then_some(s.settings.grid_size);
            let StoreState {
                items, selection, ..
            } = s;
            items
                .iter_mut()
                .filter(|item| selection.contains(&item.id) && !item.locked)
                .map(|item| {
                    let (mut x, mut y) = (item.x + dx, item.y + dy);
                    if let Some(size) = grid {
                        x = snap_to_grid(x, size);
                        y = snap_to_grid(y, size);
                    }
                    let patch = ItemPatch::position(x, y);
                    item.apply_patch(&patch);
                    (item.id.clone(), patch)
                })
                .collect()
        })
    }

    /// Remove every selected item.
    pub fn delete_selected(&self) -> Vec<(usize, CanvasItem)> {
        let ids = self.selection();
        self.delete_items(&ids)
    }

    /// Alignment guides and offset for dragging `id` to `(x, y)`.
    pub fn snap_drag(&self, id: &str, x: f64, y: f64, threshold_px: f64) -> SnapResult {
        self.read(|s| {
            let Some(item) = s.items.iter().find(|i| i.id == id) else {
                return SnapResult::default();
            };
            let mut dragged = DragBox::from_item(item);
            dragged.x = x;
            dragged.y = y;
            compute_snap(&dragged, &s.items, threshold_px, s.camera.zoom)
        })
    }

    // ─── Camera and viewport ──────────────────────────────────────────

    pub fn camera(&self) -> Camera {
        self.read(|s| s.camera)
    }

    /// Ignored unless zoom is positive and every field finite.
    pub fn set_camera(&self, camera: Camera) {
        if !(camera.x.is_finite() && camera.y.is_finite() && camera.zoom.is_finite())
            || camera.zoom <= 0.0
        {
            return;
        }
        self.mutate(|s| s.camera = camera)
    }

    /// Pan by screen pixels.
    pub fn pan_by(&self, dx: f64, dy: f64) {
        if !(dx.is_finite() && dy.is_finite()) {
            return;
        }
        self.mutate(|s| {
            s.camera.x += dx;
            s.camera.y += dy;
        })
    }

    /// Zoom to `new_zoom` keeping the world point under `cursor` fixed on screen.
    pub fn zoom_to_cursor(&self, cursor: Point, new_zoom: f64) -> bool {
        if !(new_zoom.is_finite() && new_zoom > 0.0) {
            return false;
        }
        self.mutate(|s| s.camera = s.camera.zoomed_at(cursor, new_zoom));
        true
    }

    /// Fit all items, plus `padding` world units, into the viewport without
    /// zooming in past 100%. Returns `false` when there is nothing to fit or
    /// no viewport size yet.
    pub fn fit_to_screen(&self, padding: f64) -> bool {
        self.mutate(|s| {
            let (vw, vh) = (s.viewport_width, s.viewport_height);
            if vw <= 0.0 || vh <= 0.0 {
                return false;
            }
            let Some(content) = s.content_bounds().map(|b| b.padded(padding)) else {
                return false;
            };
            let (cw, ch) = (content.width(), content.height());
            if cw <= 0.0 || ch <= 0.0 {
                return false;
            }
            let zoom = (vw / cw).min(vh / ch).min(1.0);
            let center = content.center();
            s.camera = Camera {
                x: vw / 2.0 - center.x * zoom,
                y: vh / 2.0 - center.y * zoom,
                zoom,
            };
            true
        })
    }

    pub fn viewport_size(&self) -> (f64, f64) {
        self.read(|s| (s.viewport_width, s.viewport_height))
    }

    pub fn set_viewport_size(&self, width: f64, height: f64) {
        self.mutate(|s| {
            s.viewport_width = width.max(0.0);
            s.viewport_height = height.max(0.0);
        })
    }

    pub fn mode(&self) -> InteractionMode {
        self.read(|s| s.mode)
    }

    pub fn set_mode(&self, mode: InteractionMode) {
        self.mutate(|s| s.mode = mode)
    }

    // ─── Settings ─────────────────────────────────────────────────────

    pub fn settings(&self) -> CanvasSettings {
        self.read(|s| s.settings.clone())
    }

    /// Camera and settings as one persistable row.
    pub fn canvas_state(&self) -> CanvasState {
        self.read(StoreState::canvas_state)
    }

    /// Apply a loaded or edited viewport row.
    pub fn apply_viewport(&self, patch: &ViewportPatch) {
        self.mutate(|s| {
            let mut state = s.canvas_state();
            patch.apply_to(&mut state);
            s.camera = state.camera();
            s.settings = CanvasSettings {
                grid_enabled: state.grid_enabled,
                grid_size: state.grid_size,
                snap_to_grid: state.snap_to_grid,
                background_color: state.background_color,
            };
        })
    }

    pub fn load_canvas_state(&self, state: &CanvasState) {
        self.apply_viewport(&state.diff(&self.canvas_state()));
    }

    // ─── Sync status ──────────────────────────────────────────────────

    pub fn sync_status(&self) -> SyncStatus {
        self.read(|s| s.sync.clone())
    }

    pub fn sync_phase(&self) -> SyncPhase {
        self.read(|s| s.sync.phase())
    }

    pub fn set_loading(&self, loading: bool) {
        self.mutate(|s| s.sync.is_loading = loading)
    }

    /// A REST request started.
    pub fn begin_sync(&self) {
        self.mutate(|s| {
            s.in_flight += 1;
            s.sync.is_syncing = true;
        })
    }

    /// A REST request finished with `outcome`.
    pub fn finish_sync(&self, outcome: Result<(), String>) {
        self.mutate(|s| {
            s.in_flight = s.in_flight.saturating_sub(1);
            s.sync.is_syncing = s.in_flight > 0;
            match outcome {
                Ok(()) => {
                    s.sync.last_synced_at = Some(SystemTime::now());
                    s.sync.sync_error = None;
                }
                Err(e) => s.sync.sync_error = Some(e),
            }
        })
    }

    pub fn set_sync_error(&self, error: Option<String>) {
        self.mutate(|s| s.sync.sync_error = error)
    }

    // ─── Presence and connection ──────────────────────────────────────

    pub fn presence(&self) -> Vec<PresenceRecord> {
        self.read(|s| s.presence.clone())
    }

    pub fn set_presence(&self, online: Vec<PresenceRecord>) {
        self.mutate(|s| s.presence = online)
    }

    /// Distinct actors behind the online connections, in join order.
    pub fn online_actors(&self) -> Vec<String> {
        self.read(|s| {
            let mut actors: Vec<String> = Vec::new();
            for record in &s.presence {
                if !actors.contains(&record.actor_id) {
                    actors.push(record.actor_id.clone());
                }
            }
            actors
        })
    }

    pub fn is_connected(&self) -> bool {
        self.read(|s| s.connected)
    }

    pub fn set_connected(&self, connected: bool) {
        self.mutate(|s| s.connected = connected)
    }
}
