//! Alignment snapping and grid snapping for dragged canvas items.

pub mod snapping;

pub use snapping::{compute_snap, snap_to_grid, DragBox, Orientation, SnapGuide, SnapResult};
