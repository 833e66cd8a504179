//! Shared document schema over a Yrs document.
//!
//! A fixed three-slot root:
//!
//! ```text
//! items    : Array<Map>   one map per CanvasItem, field-level last-writer-wins
//! settings : Map          backgroundColor / gridEnabled / gridSize / snapToGrid
//! project  : Map          name, ...
//! ```
//!
//! The slots are never replaced wholesale; every mutation is in place
//! (push/remove on the array, key-set on the maps). Setting defaults are
//! applied on read and never written, so first-time peers do not race to
//! seed conflicting values.
//!
//! Every mutation carries an [`UpdateOrigin`]. Observers receive it back,
//! which is how transports avoid re-broadcasting updates they just applied.

use serde_json::{Map as JsonMap, Value};
use thiserror::Error;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Any, Array, ArrayRef, Doc, Map, MapPrelim, MapRef, Origin, Out, ReadTxn, StateVector,
    Subscription, Transact, Update,
};

use crate::{CanvasItem, ItemKind, ItemPatch, DEFAULT_BACKGROUND_COLOR, DEFAULT_GRID_SIZE};

pub const ITEMS: &str = "items";
pub const SETTINGS: &str = "settings";
pub const PROJECT: &str = "project";

pub const SETTING_BACKGROUND_COLOR: &str = "backgroundColor";
pub const SETTING_GRID_ENABLED: &str = "gridEnabled";
pub const SETTING_GRID_SIZE: &str = "gridSize";
pub const SETTING_SNAP_TO_GRID: &str = "snapToGrid";

pub const PROJECT_NAME: &str = "name";

const F_ID: &str = "id";
const F_PROJECT_ID: &str = "projectId";
const F_X: &str = "x";
const F_Y: &str = "y";
const F_WIDTH: &str = "width";
const F_HEIGHT: &str = "height";
const F_ROTATION: &str = "rotation";
const F_SCALE_X: &str = "scaleX";
const F_SCALE_Y: &str = "scaleY";
const F_OPACITY: &str = "opacity";
const F_Z_INDEX: &str = "zIndex";
const F_IMAGE_URL: &str = "imageUrl";
const F_VISIBLE: &str = "visible";
const F_LOCKED: &str = "locked";
const F_KIND: &str = "kind";
const F_METADATA: &str = "metadata";
const F_CREATED_BY: &str = "createdBy";
const F_CREATED_AT: &str = "createdAt";
const F_UPDATED_AT: &str = "updatedAt";

/// Errors raised by the shared document.
#[derive(Debug, Clone, Error)]
pub enum CollabError {
    #[error("invalid update: {0}")]
    InvalidUpdate(String),
    #[error("invalid state vector: {0}")]
    InvalidStateVector(String),
    #[error("document observer could not be registered")]
    ObserverUnavailable,
}

/// Who produced a document mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateOrigin {
    /// A local user edit.
    Local,
    /// An update received from a peer over the transport.
    Remote,
    /// An update replayed from the on-device mirror.
    Persistence,
}

impl UpdateOrigin {
    fn tag(self) -> &'static str {
        match self {
            UpdateOrigin::Local => "atelier:local",
            UpdateOrigin::Remote => "atelier:remote",
            UpdateOrigin::Persistence => "atelier:persistence",
        }
    }

    fn to_origin(self) -> Origin {
        Origin::from(self.tag())
    }

    /// Recover the tag from a transaction origin. Untagged transactions are local.
    fn from_origin(origin: Option<&Origin>) -> Self {
        match origin {
            Some(o) if *o == UpdateOrigin::Remote.to_origin() => UpdateOrigin::Remote,
            Some(o) if *o == UpdateOrigin::Persistence.to_origin() => UpdateOrigin::Persistence,
            _ => UpdateOrigin::Local,
        }
    }
}

/// Typed value for a `settings` key.
#[derive(Debug, Clone, PartialEq)]
pub enum SettingValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl From<SettingValue> for Any {
    fn from(value: SettingValue) -> Any {
        match value {
            SettingValue::Bool(b) => Any::Bool(b),
            SettingValue::Number(n) => Any::Number(n),
            SettingValue::Text(s) => Any::String(s.into()),
        }
    }
}

/// Settings as read from the document, defaults filled in for absent keys.
#[derive(Debug, Clone, PartialEq)]
pub struct DocSettings {
    pub background_color: String,
    pub grid_enabled: bool,
    pub grid_size: f64,
    pub snap_to_grid: bool,
}

/// The CRDT-backed canvas document shared by all peers in a room.
#[derive(Clone)]
pub struct SharedDocument {
    doc: Doc,
    items: ArrayRef,
    settings: MapRef,
    project: MapRef,
}

impl Default for SharedDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedDocument {
    pub fn new() -> Self {
        Self::from_doc(Doc::new())
    }

    /// Create with a fixed Yrs client id (deterministic tests, session restore).
    pub fn with_client_id(client_id: u64) -> Self {
        Self::from_doc(Doc::with_client_id(client_id))
    }

    fn from_doc(doc: Doc) -> Self {
        let items = doc.get_or_insert_array(ITEMS);
        let settings = doc.get_or_insert_map(SETTINGS);
        let project = doc.get_or_insert_map(PROJECT);
        Self {
            doc,
            items,
            settings,
            project,
        }
    }

    pub fn client_id(&self) -> u64 {
        self.doc.client_id()
    }

    // ─── Items ────────────────────────────────────────────────────────

    /// Append an item. The item becomes one nested map so that concurrent
    /// edits of different fields merge instead of overwriting each other.
    pub fn push_item(&self, item: &CanvasItem, origin: UpdateOrigin) {
        let mut txn = self.doc.transact_mut_with(origin.to_origin());
        let map = self.items.push_back(&mut txn, MapPrelim::default());
        for (key, value) in item_fields(item) {
            map.insert(&mut txn, key, value);
        }
    }

    /// Apply a partial edit to the item with `id`. Returns `false` if absent.
    pub fn update_item(&self, id: &str, patch: &ItemPatch, origin: UpdateOrigin) -> bool {
        let mut txn = self.doc.transact_mut_with(origin.to_origin());
        let Some((_, map)) = find_item(&txn, &self.items, id) else {
            return false;
        };

        let mut fields = patch_fields(patch);
        if let Some(extra) = &patch.metadata {
            let mut metadata = read_metadata(&txn, &map);
            for (key, value) in extra {
                metadata.insert(key.clone(), value.clone());
            }
            fields.push((F_METADATA, Any::String(Value::Object(metadata).to_string().into())));
        }
        for (key, value) in fields {
            map.insert(&mut txn, key, value);
        }
        true
    }

    /// Re-key an item (temporary id replaced by the authoritative one).
    pub fn rename_item(&self, from: &str, to: &str, origin: UpdateOrigin) -> bool {
        let mut txn = self.doc.transact_mut_with(origin.to_origin());
        match find_item(&txn, &self.items, from) {
            Some((_, map)) => {
                map.insert(&mut txn, F_ID, Any::String(to.into()));
                true
            }
            None => false,
        }
    }

    /// Remove the item with `id`. Returns `false` if absent.
    pub fn remove_item(&self, id: &str, origin: UpdateOrigin) -> bool {
        let mut txn = self.doc.transact_mut_with(origin.to_origin());
        match find_item(&txn, &self.items, id) {
            Some((index, _)) => {
                self.items.remove(&mut txn, index);
                true
            }
            None => false,
        }
    }

    pub fn item(&self, id: &str) -> Option<CanvasItem> {
        let txn = self.doc.transact();
        find_item(&txn, &self.items, id).and_then(|(_, map)| read_item(&txn, &map))
    }

    /// All items in sequence order. Entries that are not well-formed item
    /// maps (e.g. written by an incompatible peer) are skipped.
    pub fn items(&self) -> Vec<CanvasItem> {
        let txn = self.doc.transact();
        self.items
            .iter(&txn)
            .filter_map(|value| match value {
                Out::YMap(map) => read_item(&txn, &map),
                _ => None,
            })
            .collect()
    }

    pub fn item_count(&self) -> u32 {
        let txn = self.doc.transact();
        self.items.len(&txn)
    }

    // ─── Settings / project ───────────────────────────────────────────

    pub fn settings(&self) -> DocSettings {
        let txn = self.doc.transact();
        DocSettings {
            background_color: read_string(&txn, &self.settings, SETTING_BACKGROUND_COLOR)
                .unwrap_or_else(|| DEFAULT_BACKGROUND_COLOR.to_string()),
            grid_enabled: read_bool(&txn, &self.settings, SETTING_GRID_ENABLED).unwrap_or(true),
            grid_size: read_number(&txn, &self.settings, SETTING_GRID_SIZE)
                .unwrap_or(DEFAULT_GRID_SIZE),
            snap_to_grid: read_bool(&txn, &self.settings, SETTING_SNAP_TO_GRID).unwrap_or(false),
        }
    }

    pub fn set_setting(&self, key: &str, value: SettingValue, origin: UpdateOrigin) {
        let mut txn = self.doc.transact_mut_with(origin.to_origin());
        self.settings.insert(&mut txn, key, Any::from(value));
    }

    pub fn project_name(&self) -> Option<String> {
        let txn = self.doc.transact();
        read_string(&txn, &self.project, PROJECT_NAME)
    }

    pub fn set_project_name(&self, name: &str, origin: UpdateOrigin) {
        let mut txn = self.doc.transact_mut_with(origin.to_origin());
        self.project.insert(&mut txn, PROJECT_NAME, Any::String(name.into()));
    }

    // ─── Sync primitives ──────────────────────────────────────────────

    /// Encoded state vector ("what I have"), the sync-step-1 payload.
    pub fn state_vector(&self) -> Vec<u8> {
        self.current_state_vector().encode_v1()
    }

    pub fn current_state_vector(&self) -> StateVector {
        self.doc.transact().state_vector()
    }

    /// Full document state as a single update.
    pub fn encode_state_as_update(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Everything the holder of `remote_sv` is missing, the sync-step-2 payload.
    pub fn encode_diff(&self, remote_sv: &[u8]) -> Result<Vec<u8>, CollabError> {
        let sv = StateVector::decode_v1(remote_sv)
            .map_err(|e| CollabError::InvalidStateVector(e.to_string()))?;
        Ok(self.diff_since(&sv))
    }

    /// Everything a peer at `remote_sv` is missing.
    pub fn diff_since(&self, remote_sv: &StateVector) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(remote_sv)
    }

    /// Apply a remote or persisted update under the given origin.
    pub fn apply_update(&self, update: &[u8], origin: UpdateOrigin) -> Result<(), CollabError> {
        let update =
            Update::decode_v1(update).map_err(|e| CollabError::InvalidUpdate(e.to_string()))?;
        let mut txn = self.doc.transact_mut_with(origin.to_origin());
        txn.apply_update(update)
            .map_err(|e| CollabError::InvalidUpdate(e.to_string()))
    }

    /// Observe every committed update together with its origin.
    ///
    /// The callback runs while the document is still locked: it must not
    /// open a transaction on this document.
    pub fn observe_updates<F>(&self, f: F) -> Result<Subscription, CollabError>
    where
        F: Fn(UpdateOrigin, &[u8]) + Send + Sync + 'static,
    {
        self.doc
            .observe_update_v1(move |txn, event| {
                f(UpdateOrigin::from_origin(txn.origin()), &event.update);
            })
            .map_err(|_| CollabError::ObserverUnavailable)
    }
}

// ───────────────────────────────────────────────────────────────────
// Field encoding
// ───────────────────────────────────────────────────────────────────

fn item_fields(item: &CanvasItem) -> Vec<(&'static str, Any)> {
    let mut fields = vec![
        (F_ID, Any::String(item.id.as_str().into())),
        (F_PROJECT_ID, Any::String(item.project_id.as_str().into())),
        (F_X, Any::Number(item.x)),
        (F_Y, Any::Number(item.y)),
        (F_ROTATION, Any::Number(item.rotation)),
        (F_SCALE_X, Any::Number(item.scale_x)),
        (F_SCALE_Y, Any::Number(item.scale_y)),
        (F_OPACITY, Any::Number(item.opacity)),
        (F_Z_INDEX, Any::Number(item.z_index as f64)),
        (F_VISIBLE, Any::Bool(item.visible)),
        (F_LOCKED, Any::Bool(item.locked)),
        (F_KIND, Any::String(item.kind.as_str().into())),
        (
            F_METADATA,
            Any::String(Value::Object(item.metadata.clone()).to_string().into()),
        ),
    ];
    let optional = [
        (F_WIDTH, item.width.map(Any::Number)),
        (F_HEIGHT, item.height.map(Any::Number)),
        (F_IMAGE_URL, item.image_url.as_deref().map(|s| Any::String(s.into()))),
        (F_CREATED_BY, item.created_by.as_deref().map(|s| Any::String(s.into()))),
        (F_CREATED_AT, item.created_at.as_deref().map(|s| Any::String(s.into()))),
        (F_UPDATED_AT, item.updated_at.as_deref().map(|s| Any::String(s.into()))),
    ];
    fields.extend(
        optional
            .into_iter()
            .filter_map(|(key, value)| value.map(|v| (key, v))),
    );
    fields
}

fn patch_fields(patch: &ItemPatch) -> Vec<(&'static str, Any)> {
    let finite = |v: Option<f64>| v.filter(|n| n.is_finite()).map(Any::Number);
    let candidates = [
        (F_X, finite(patch.x)),
        (F_Y, finite(patch.y)),
        (F_WIDTH, finite(patch.width)),
        (F_HEIGHT, finite(patch.height)),
        (F_ROTATION, finite(patch.rotation)),
        (F_SCALE_X, finite(patch.scale_x)),
        (F_SCALE_Y, finite(patch.scale_y)),
        (F_OPACITY, finite(patch.opacity.map(|o| o.clamp(0.0, 1.0)))),
        (F_Z_INDEX, patch.z_index.map(|z| Any::Number(z as f64))),
        (F_IMAGE_URL, patch.image_url.as_deref().map(|s| Any::String(s.into()))),
        (F_VISIBLE, patch.visible.map(Any::Bool)),
        (F_LOCKED, patch.locked.map(Any::Bool)),
        (F_KIND, patch.kind.map(|k| Any::String(k.as_str().into()))),
    ];
    candidates
        .into_iter()
        .filter_map(|(key, value)| value.map(|v| (key, v)))
        .collect()
}

fn find_item<T: ReadTxn>(txn: &T, items: &ArrayRef, id: &str) -> Option<(u32, MapRef)> {
    items
        .iter(txn)
        .enumerate()
        .find_map(|(index, value)| match value {
            Out::YMap(map) if read_string(txn, &map, F_ID).as_deref() == Some(id) => {
                Some((index as u32, map))
            }
            _ => None,
        })
}

fn read_item<T: ReadTxn>(txn: &T, map: &MapRef) -> Option<CanvasItem> {
    let id = read_string(txn, map, F_ID)?;
    let number = |key: &str, fallback: f64| read_number(txn, map, key).unwrap_or(fallback);
    Some(CanvasItem {
        id,
        project_id: read_string(txn, map, F_PROJECT_ID).unwrap_or_default(),
        x: number(F_X, 0.0),
        y: number(F_Y, 0.0),
        width: read_number(txn, map, F_WIDTH),
        height: read_number(txn, map, F_HEIGHT),
        rotation: number(F_ROTATION, 0.0),
        scale_x: number(F_SCALE_X, 1.0),
        scale_y: number(F_SCALE_Y, 1.0),
        opacity: number(F_OPACITY, 1.0),
        z_index: number(F_Z_INDEX, 0.0) as i64,
        image_url: read_string(txn, map, F_IMAGE_URL),
        visible: read_bool(txn, map, F_VISIBLE).unwrap_or(true),
        locked: read_bool(txn, map, F_LOCKED).unwrap_or(false),
        kind: read_string(txn, map, F_KIND)
            .and_then(|k| ItemKind::parse(&k))
            .unwrap_or_default(),
        metadata: read_metadata(txn, map),
        created_by: read_string(txn, map, F_CREATED_BY),
        created_at: read_string(txn, map, F_CREATED_AT),
        updated_at: read_string(txn, map, F_UPDATED_AT),
    })
}

fn read_metadata<T: ReadTxn>(txn: &T, map: &MapRef) -> JsonMap<String, Value> {
    read_string(txn, map, F_METADATA)
        .and_then(|raw| serde_json::from_str::<JsonMap<String, Value>>(&raw).ok())
        .unwrap_or_default()
}

fn read_string<T: ReadTxn>(txn: &T, map: &MapRef, key: &str) -> Option<String> {
    match map.get(txn, key)? {
        Out::Any(Any::String(s)) => Some(s.to_string()),
        _ => None,
    }
}

fn read_number<T: ReadTxn>(txn: &T, map: &MapRef, key: &str) -> Option<f64> {
    match map.get(txn, key)? {
        Out::Any(Any::Number(n)) => Some(n),
        Out::Any(Any::BigInt(n)) => Some(n as f64),
        _ => None,
    }
}

fn read_bool<T: ReadTxn>(txn: &T, map: &MapRef, key: &str) -> Option<bool> {
    match map.get(txn, key)? {
        Out::Any(Any::Bool(b)) => Some(b),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NewItem;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn item(id: &str, x: f64, y: f64) -> CanvasItem {
        let mut it = CanvasItem::from_new(
            id,
            "project-1",
            &NewItem {
                kind: ItemKind::Sticky,
                x,
                y,
                width: Some(120.0),
                height: Some(80.0),
                ..NewItem::default()
            },
        );
        it.metadata.insert("text".into(), json!("hello"));
        it.created_by = Some("alice".into());
        it
    }

    fn sync(from: &SharedDocument, to: &SharedDocument) {
        let diff = from.encode_diff(&to.state_vector()).unwrap();
        to.apply_update(&diff, UpdateOrigin::Remote).unwrap();
    }

    #[test]
    fn test_push_and_read_back() {
        let doc = SharedDocument::new();
        let original = item("i1", 10.0, 20.0);
        doc.push_item(&original, UpdateOrigin::Local);

        assert_eq!(doc.item_count(), 1);
        assert_eq!(doc.item("i1"), Some(original.clone()));
        assert_eq!(doc.items(), vec![original]);
        assert!(doc.item("missing").is_none());
    }

    #[test]
    fn test_update_and_remove() {
        let doc = SharedDocument::new();
        doc.push_item(&item("a", 0.0, 0.0), UpdateOrigin::Local);
        doc.push_item(&item("b", 5.0, 5.0), UpdateOrigin::Local);

        assert!(doc.update_item("a", &ItemPatch::position(42.0, 7.0), UpdateOrigin::Local));
        let a = doc.item("a").unwrap();
        assert_eq!((a.x, a.y), (42.0, 7.0));
        assert_eq!(a.width, Some(120.0));

        assert!(doc.remove_item("a", UpdateOrigin::Local));
        assert!(!doc.remove_item("a", UpdateOrigin::Local));
        let ids: Vec<String> = doc.items().into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec!["b".to_string()]);
    }

    #[test]
    fn test_patch_metadata_merges() {
        let doc = SharedDocument::new();
        doc.push_item(&item("a", 0.0, 0.0), UpdateOrigin::Local);
        let mut extra = JsonMap::new();
        extra.insert("color".into(), json!("yellow"));
        doc.update_item(
            "a",
            &ItemPatch {
                metadata: Some(extra),
                ..ItemPatch::default()
            },
            UpdateOrigin::Local,
        );
        let a = doc.item("a").unwrap();
        assert_eq!(a.metadata.get("text"), Some(&json!("hello")));
        assert_eq!(a.metadata.get("color"), Some(&json!("yellow")));
    }

    #[test]
    fn test_rename_item() {
        let doc = SharedDocument::new();
        doc.push_item(&item("temp-1", 0.0, 0.0), UpdateOrigin::Local);
        assert!(doc.rename_item("temp-1", "srv-9", UpdateOrigin::Local));
        assert!(doc.item("temp-1").is_none());
        assert!(doc.item("srv-9").is_some());
    }

    #[test]
    fn test_settings_defaults_are_lazy() {
        let doc = SharedDocument::new();
        let settings = doc.settings();
        assert_eq!(settings.background_color, DEFAULT_BACKGROUND_COLOR);
        assert!(settings.grid_enabled);
        assert_eq!(settings.grid_size, DEFAULT_GRID_SIZE);

        // Reading defaults must not produce any update.
        assert_eq!(
            doc.encode_state_as_update(),
            SharedDocument::new().encode_state_as_update()
        );

        doc.set_setting(SETTING_GRID_SIZE, SettingValue::Number(40.0), UpdateOrigin::Local);
        doc.set_setting(SETTING_SNAP_TO_GRID, SettingValue::Bool(true), UpdateOrigin::Local);
        let settings = doc.settings();
        assert_eq!(settings.grid_size, 40.0);
        assert!(settings.snap_to_grid);
    }

    #[test]
    fn test_project_name() {
        let doc = SharedDocument::new();
        assert!(doc.project_name().is_none());
        doc.set_project_name("Loft renovation", UpdateOrigin::Local);
        assert_eq!(doc.project_name().as_deref(), Some("Loft renovation"));
    }

    #[test]
    fn test_field_level_merge_between_peers() {
        let a = SharedDocument::new();
        let b = SharedDocument::new();
        a.push_item(&item("i", 1.0, 2.0), UpdateOrigin::Local);
        sync(&a, &b);
        assert_eq!(b.item("i"), a.item("i"));

        // Concurrent edits of different fields both survive.
        a.update_item(
            "i",
            &ItemPatch {
                y: Some(99.0),
                ..ItemPatch::default()
            },
            UpdateOrigin::Local,
        );
        b.update_item(
            "i",
            &ItemPatch {
                x: Some(55.0),
                ..ItemPatch::default()
            },
            UpdateOrigin::Local,
        );
        sync(&a, &b);
        sync(&b, &a);

        let on_a = a.item("i").unwrap();
        let on_b = b.item("i").unwrap();
        assert_eq!(on_a, on_b);
        assert_eq!((on_a.x, on_a.y), (55.0, 99.0));
    }

    #[test]
    fn test_observer_reports_origin() {
        let doc = SharedDocument::new();
        let seen: Arc<Mutex<Vec<UpdateOrigin>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = doc
            .observe_updates(move |origin, update| {
                assert!(!update.is_empty());
                sink.lock().unwrap().push(origin);
            })
            .unwrap();

        doc.push_item(&item("x", 0.0, 0.0), UpdateOrigin::Local);

        let other = SharedDocument::new();
        other.push_item(&item("y", 0.0, 0.0), UpdateOrigin::Local);
        doc.apply_update(&other.encode_state_as_update(), UpdateOrigin::Remote)
            .unwrap();
        let stored = SharedDocument::new();
        stored.push_item(&item("z", 0.0, 0.0), UpdateOrigin::Local);
        doc.apply_update(&stored.encode_state_as_update(), UpdateOrigin::Persistence)
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                UpdateOrigin::Local,
                UpdateOrigin::Remote,
                UpdateOrigin::Persistence
            ]
        );
    }

    #[test]
    fn test_invalid_update_is_rejected() {
        let doc = SharedDocument::new();
        assert!(matches!(
            doc.apply_update(&[0xFF, 0xFE, 0xFD], UpdateOrigin::Remote),
            Err(CollabError::InvalidUpdate(_))
        ));
        assert!(matches!(
            doc.encode_diff(&[0xFF, 0xFF, 0xFF]),
            Err(CollabError::InvalidStateVector(_))
        ));
    }
}
