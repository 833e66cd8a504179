//! # atelier-core: canvas data model
//!
//! Plain data shared by every layer of the canvas sync stack:
//!
//! - [`CanvasItem`] / [`ItemPatch`] / [`NewItem`]: positioned objects and their edits
//! - [`CanvasState`] / [`ViewportPatch`]: the persisted per-project viewport
//! - [`Camera`], [`Point`], [`Bounds`]: screen/world geometry
//! - [`collab`]: the CRDT-backed shared document all peers mutate

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

pub mod collab;

/// Edge length used when neither an explicit size nor a natural content size is known.
pub const DEFAULT_ITEM_SIZE: f64 = 200.0;

/// Prefix of client-assigned ids that have not been persisted yet.
pub const TEMP_ID_PREFIX: &str = "temp-";

/// Metadata keys carrying the content's natural size (set by image loaders).
pub const META_NATURAL_WIDTH: &str = "naturalWidth";
pub const META_NATURAL_HEIGHT: &str = "naturalHeight";

/// Generate a temporary, client-side item id.
pub fn temporary_id() -> String {
    format!("{TEMP_ID_PREFIX}{}", Uuid::new_v4())
}

/// Whether `id` was produced by [`temporary_id`].
pub fn is_temporary_id(id: &str) -> bool {
    id.starts_with(TEMP_ID_PREFIX)
}

fn one() -> f64 {
    1.0
}

fn yes() -> bool {
    true
}

// ───────────────────────────────────────────────────────────────────
// Geometry
// ───────────────────────────────────────────────────────────────────

/// A point in either screen or world space.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Axis-aligned bounding box stored as min/max corners.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Bounds {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Bounds {
    /// Create from origin + size (design-tool convention).
    pub fn from_rect(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            min_x: x,
            min_y: y,
            max_x: x + width,
            max_y: y + height,
        }
    }

    /// Smallest box containing both `self` and `other`.
    pub fn union(&self, other: &Bounds) -> Bounds {
        Bounds {
            min_x: self.min_x.min(other.min_x),
            min_y: self.min_y.min(other.min_y),
            max_x: self.max_x.max(other.max_x),
            max_y: self.max_y.max(other.max_y),
        }
    }

    /// Grow every edge outward by `padding`.
    pub fn padded(&self, padding: f64) -> Bounds {
        Bounds {
            min_x: self.min_x - padding,
            min_y: self.min_y - padding,
            max_x: self.max_x + padding,
            max_y: self.max_y + padding,
        }
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    pub fn center(&self) -> Point {
        Point::new(
            (self.min_x + self.max_x) / 2.0,
            (self.min_y + self.max_y) / 2.0,
        )
    }
}

/// Camera state for pan/zoom on the infinite canvas.
///
/// `x` / `y` are the screen-space pan offset, `zoom` is a scale factor
/// (1.0 = no zoom): `screen = world * zoom + pan`.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq)]
pub struct Camera {
    pub x: f64,
    pub y: f64,
    pub zoom: f64,
}

impl Default for Camera {
    fn default() -> Self {
        Self { x: 0.0, y: 0.0, zoom: 1.0 }
    }
}

impl Camera {
    pub fn screen_to_world(&self, screen: Point) -> Point {
        Point::new((screen.x - self.x) / self.zoom, (screen.y - self.y) / self.zoom)
    }

    pub fn world_to_screen(&self, world: Point) -> Point {
        Point::new(world.x * self.zoom + self.x, world.y * self.zoom + self.y)
    }

    /// Camera after zooming to `new_zoom` around the screen point `cursor`.
    ///
    /// The world point under the cursor stays fixed on screen:
    /// `new_x = cursor_x - (cursor_x - x) * (new_zoom / zoom)`.
    pub fn zoomed_at(&self, cursor: Point, new_zoom: f64) -> Camera {
        let ratio = new_zoom / self.zoom;
        Camera {
            x: cursor.x - (cursor.x - self.x) * ratio,
            y: cursor.y - (cursor.y - self.y) * ratio,
            zoom: new_zoom,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Canvas items
// ───────────────────────────────────────────────────────────────────

/// What an item renders.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    #[default]
    Image,
    Text,
    Shape,
    Sticky,
    Arrow,
}

impl ItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::Image => "image",
            ItemKind::Text => "text",
            ItemKind::Shape => "shape",
            ItemKind::Sticky => "sticky",
            ItemKind::Arrow => "arrow",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "image" => Some(ItemKind::Image),
            "text" => Some(ItemKind::Text),
            "shape" => Some(ItemKind::Shape),
            "sticky" => Some(ItemKind::Sticky),
            "arrow" => Some(ItemKind::Arrow),
            _ => None,
        }
    }
}

/// A positioned visual object on the canvas.
///
/// `id` is assigned by the authoritative store (or is a temporary id until
/// the create request resolves). Render order is ascending `z_index`, ties
/// broken by insertion order.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CanvasItem {
    pub id: String,
    pub project_id: String,
    pub x: f64,
    pub y: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<f64>,
    #[serde(default)]
    pub rotation: f64,
    #[serde(default = "one")]
    pub scale_x: f64,
    #[serde(default = "one")]
    pub scale_y: f64,
    #[serde(default = "one")]
    pub opacity: f64,
    #[serde(default)]
    pub z_index: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default = "yes")]
    pub visible: bool,
    #[serde(default)]
    pub locked: bool,
    #[serde(default)]
    pub kind: ItemKind,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl CanvasItem {
    /// Build an item from creation data under the given id.
    pub fn from_new(id: impl Into<String>, project_id: impl Into<String>, data: &NewItem) -> Self {
        Self {
            id: id.into(),
            project_id: project_id.into(),
            x: finite_or(data.x, 0.0),
            y: finite_or(data.y, 0.0),
            width: data.width.filter(|w| w.is_finite()),
            height: data.height.filter(|h| h.is_finite()),
            rotation: data.rotation.unwrap_or(0.0),
            scale_x: 1.0,
            scale_y: 1.0,
            opacity: data.opacity.unwrap_or(1.0).clamp(0.0, 1.0),
            z_index: data.z_index.unwrap_or(0),
            image_url: data.image_url.clone(),
            visible: true,
            locked: false,
            kind: data.kind,
            metadata: data.metadata.clone(),
            created_by: data.created_by.clone(),
            created_at: None,
            updated_at: None,
        }
    }

    /// Resolved (width, height): explicit size, else the content's natural
    /// size from metadata, else [`DEFAULT_ITEM_SIZE`].
    pub fn size(&self) -> (f64, f64) {
        let natural = |key: &str| self.metadata.get(key).and_then(Value::as_f64);
        let width = self
            .width
            .or_else(|| natural(META_NATURAL_WIDTH))
            .unwrap_or(DEFAULT_ITEM_SIZE);
        let height = self
            .height
            .or_else(|| natural(META_NATURAL_HEIGHT))
            .unwrap_or(DEFAULT_ITEM_SIZE);
        (width, height)
    }

    pub fn bounds(&self) -> Bounds {
        let (width, height) = self.size();
        Bounds::from_rect(self.x, self.y, width, height)
    }

    /// Apply a partial edit. Non-finite geometry is ignored so position and
    /// size stay finite.
    pub fn apply_patch(&mut self, patch: &ItemPatch) {
        fn set_finite(slot: &mut f64, value: Option<f64>) {
            if let Some(v) = value.filter(|v| v.is_finite()) {
                *slot = v;
            }
        }

        set_finite(&mut self.x, patch.x);
        set_finite(&mut self.y, patch.y);
        set_finite(&mut self.rotation, patch.rotation);
        set_finite(&mut self.scale_x, patch.scale_x);
        set_finite(&mut self.scale_y, patch.scale_y);
        if let Some(w) = patch.width.filter(|w| w.is_finite()) {
            self.width = Some(w);
        }
        if let Some(h) = patch.height.filter(|h| h.is_finite()) {
            self.height = Some(h);
        }
        if let Some(opacity) = patch.opacity.filter(|o| o.is_finite()) {
            self.opacity = opacity.clamp(0.0, 1.0);
        }
        if let Some(z) = patch.z_index {
            self.z_index = z;
        }
        if let Some(url) = &patch.image_url {
            self.image_url = Some(url.clone());
        }
        if let Some(visible) = patch.visible {
            self.visible = visible;
        }
        if let Some(locked) = patch.locked {
            self.locked = locked;
        }
        if let Some(kind) = patch.kind {
            self.kind = kind;
        }
        if let Some(metadata) = &patch.metadata {
            for (key, value) in metadata {
                self.metadata.insert(key.clone(), value.clone());
            }
        }
    }
}

fn finite_or(value: f64, fallback: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        fallback
    }
}

/// Data for a new item, before the authoritative store assigns an id.
#[derive(Clone, Serialize, Deserialize, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NewItem {
    #[serde(default)]
    pub kind: ItemKind,
    pub x: f64,
    pub y: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opacity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z_index: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
}

/// Partial edit of a [`CanvasItem`]; `None` fields are left untouched.
#[derive(Clone, Serialize, Deserialize, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ItemPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_y: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opacity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z_index: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visible: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ItemKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl ItemPatch {
    /// Patch that moves an item to `(x, y)`.
    pub fn position(x: f64, y: f64) -> Self {
        Self {
            x: Some(x),
            y: Some(y),
            ..Self::default()
        }
    }

    /// Patch that only reassigns stacking order.
    pub fn z_index(z: i64) -> Self {
        Self {
            z_index: Some(z),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

// ───────────────────────────────────────────────────────────────────
// Viewport
// ───────────────────────────────────────────────────────────────────

pub const DEFAULT_BACKGROUND_COLOR: &str = "#f8f8f6";
pub const DEFAULT_GRID_SIZE: f64 = 20.0;

/// Persisted viewport state, one row per project.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CanvasState {
    pub zoom: f64,
    pub pan_x: f64,
    pub pan_y: f64,
    pub grid_enabled: bool,
    pub grid_size: f64,
    pub snap_to_grid: bool,
    pub background_color: String,
}

impl Default for CanvasState {
    fn default() -> Self {
        Self {
            zoom: 1.0,
            pan_x: 0.0,
            pan_y: 0.0,
            grid_enabled: true,
            grid_size: DEFAULT_GRID_SIZE,
            snap_to_grid: false,
            background_color: DEFAULT_BACKGROUND_COLOR.to_string(),
        }
    }
}

impl CanvasState {
    pub fn camera(&self) -> Camera {
        Camera {
            x: self.pan_x,
            y: self.pan_y,
            zoom: self.zoom,
        }
    }

    /// Fields of `self` that differ from `previous`, as a save patch.
    pub fn diff(&self, previous: &CanvasState) -> ViewportPatch {
        fn changed<T: PartialEq + Clone>(now: &T, before: &T) -> Option<T> {
            (now != before).then(|| now.clone())
        }
        ViewportPatch {
            zoom: changed(&self.zoom, &previous.zoom),
            pan_x: changed(&self.pan_x, &previous.pan_x),
            pan_y: changed(&self.pan_y, &previous.pan_y),
            grid_enabled: changed(&self.grid_enabled, &previous.grid_enabled),
            grid_size: changed(&self.grid_size, &previous.grid_size),
            snap_to_grid: changed(&self.snap_to_grid, &previous.snap_to_grid),
            background_color: changed(&self.background_color, &previous.background_color),
        }
    }
}

/// Partial viewport update for `saveState`.
#[derive(Clone, Serialize, Deserialize, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ViewportPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zoom: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pan_x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pan_y: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grid_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grid_size: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snap_to_grid: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background_color: Option<String>,
}

impl ViewportPatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Apply the present fields. Non-finite numbers and non-positive zoom or
    /// grid size are skipped.
    pub fn apply_to(&self, state: &mut CanvasState) {
        if let Some(zoom) = self.zoom.filter(|z| z.is_finite() && *z > 0.0) {
            state.zoom = zoom;
        }
        if let Some(x) = self.pan_x.filter(|x| x.is_finite()) {
            state.pan_x = x;
        }
        if let Some(y) = self.pan_y.filter(|y| y.is_finite()) {
            state.pan_y = y;
        }
        if let Some(enabled) = self.grid_enabled {
            state.grid_enabled = enabled;
        }
        if let Some(size) = self.grid_size.filter(|s| s.is_finite() && *s > 0.0) {
            state.grid_size = size;
        }
        if let Some(snap) = self.snap_to_grid {
            state.snap_to_grid = snap;
        }
        if let Some(color) = &self.background_color {
            state.background_color = color.clone();
        }
    }
}
