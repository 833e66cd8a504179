//! Smart-guide snapping.
//!
//! The threshold is given in screen pixels and converted to world units
//! with the current zoom (`threshold_px / zoom`), so guides feel equally
//! "sticky" at every zoom level.
//!
//! # Resolution order
//!
//! Candidates are evaluated item by item in list order, and within one item
//! in a fixed order:
//!
//! * x-axis: left↔left, right↔right, center↔center, other.right→my.left,
//!   other.left→my.right
//! * y-axis: top↔top, bottom↔bottom, middle↔middle, other.bottom→my.top,
//!   other.top→my.bottom
//!
//! Each axis keeps the offset of the **last** matching condition. This is
//! order-dependent, not distance-ranked.

use atelier_core::{Bounds, CanvasItem};
use serde::{Deserialize, Serialize};

// ───────────────────────────────────────────────────────────────────
// Types
// ───────────────────────────────────────────────────────────────────

/// The item being dragged, at its current (unsnapped) position.
#[derive(Clone, Debug, PartialEq)]
pub struct DragBox {
    pub id: String,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl DragBox {
    pub fn from_item(item: &CanvasItem) -> Self {
        let (width, height) = item.size();
        Self {
            id: item.id.clone(),
            x: item.x,
            y: item.y,
            width,
            height,
        }
    }

    fn bounds(&self) -> Bounds {
        Bounds::from_rect(self.x, self.y, self.width, self.height)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Orientation {
    /// A line of constant x.
    Vertical,
    /// A line of constant y.
    Horizontal,
}

/// A guide line to render, in world coordinates.
///
/// `position` is the constant coordinate; `start..end` spans both boxes
/// along the other axis.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SnapGuide {
    pub orientation: Orientation,
    pub position: f64,
    pub start: f64,
    pub end: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapResult {
    pub guides: Vec<SnapGuide>,
    pub dx: f64,
    pub dy: f64,
}

impl SnapResult {
    pub fn snapped(&self) -> bool {
        !self.guides.is_empty()
    }
}

// ───────────────────────────────────────────────────────────────────
// Alignment snapping
// ───────────────────────────────────────────────────────────────────

/// Compute alignment guides and the offset to apply to `dragged`.
///
/// Items with the dragged id and hidden items are not snap targets.
/// A non-positive or non-finite zoom disables snapping.
pub fn compute_snap(
    dragged: &DragBox,
    items: &[CanvasItem],
    threshold_px: f64,
    zoom: f64,
) -> SnapResult {
    let mut result = SnapResult::default();
    if !(zoom.is_finite() && zoom > 0.0) {
        return result;
    }
    let threshold = threshold_px / zoom;
    let me = dragged.bounds();
    let my_center = me.center();

    for other in items.iter().filter(|i| i.id != dragged.id && i.visible) {
        let them = other.bounds();
        let their_center = them.center();

        let vspan = (me.min_y.min(them.min_y), me.max_y.max(them.max_y));
        let x_candidates = [
            (me.min_x, them.min_x),
            (me.max_x, them.max_x),
            (my_center.x, their_center.x),
            (me.min_x, them.max_x),
            (me.max_x, them.min_x),
        ];
        for (mine, target) in x_candidates {
            if (mine - target).abs() < threshold {
                result.dx = target - mine;
                result.guides.push(SnapGuide {
                    orientation: Orientation::Vertical,
                    position: target,
                    start: vspan.0,
                    end: vspan.1,
                });
            }
        }

        let hspan = (me.min_x.min(them.min_x), me.max_x.max(them.max_x));
        let y_candidates = [
            (me.min_y, them.min_y),
            (me.max_y, them.max_y),
            (my_center.y, their_center.y),
            (me.min_y, them.max_y),
            (me.max_y, them.min_y),
        ];
        for (mine, target) in y_candidates {
            if (mine - target).abs() < threshold {
                result.dy = target - mine;
                result.guides.push(SnapGuide {
                    orientation: Orientation::Horizontal,
                    position: target,
                    start: hspan.0,
                    end: hspan.1,
                });
            }
        }
    }

    result
}

// ───────────────────────────────────────────────────────────────────
// Grid snapping
// ───────────────────────────────────────────────────────────────────

/// Round `value` to the nearest multiple of `grid_size`.
/// A non-positive or non-finite grid leaves the value unchanged.
#[inline]
pub fn snap_to_grid(value: f64, grid_size: f64) -> f64 {
    if !(grid_size.is_finite() && grid_size > 0.0) {
        return value;
    }
    (value / grid_size).round() * grid_size
}

#[cfg(test)]
mod tests {
    use super::*;
    use atelier_core::NewItem;

    fn rect(id: &str, x: f64, y: f64, w: f64, h: f64) -> CanvasItem {
        CanvasItem::from_new(
            id,
            "p",
            &NewItem {
                x,
                y,
                width: Some(w),
                height: Some(h),
                ..NewItem::default()
            },
        )
    }

    fn drag(x: f64, y: f64, w: f64, h: f64) -> DragBox {
        DragBox {
            id: "dragged".into(),
            x,
            y,
            width: w,
            height: h,
        }
    }

    #[test]
    fn test_left_edges_within_threshold_snap() {
        let items = vec![rect("a", 100.0, 500.0, 50.0, 50.0)];
        let result = compute_snap(&drag(103.0, 0.0, 80.0, 40.0), &items, 5.0, 1.0);
        assert_eq!(result.dx, -3.0);
        assert_eq!(result.dy, 0.0);
        assert!(result.snapped());
        assert_eq!(result.guides[0].orientation, Orientation::Vertical);
        assert_eq!(result.guides[0].position, 100.0);
        assert_eq!((result.guides[0].start, result.guides[0].end), (0.0, 550.0));
    }

    #[test]
    fn test_gap_beyond_threshold_does_not_snap() {
        let items = vec![rect("a", 100.0, 500.0, 50.0, 50.0)];
        let result = compute_snap(&drag(110.0, 0.0, 80.0, 40.0), &items, 5.0, 1.0);
        assert!(!result.snapped());
        assert_eq!((result.dx, result.dy), (0.0, 0.0));
    }

    #[test]
    fn test_threshold_scales_with_zoom() {
        let items = vec![rect("a", 100.0, 500.0, 50.0, 50.0)];
        // 3 world units apart: 6px on screen at zoom 2, over a 5px threshold.
        let zoomed_in = compute_snap(&drag(103.0, 0.0, 80.0, 40.0), &items, 5.0, 2.0);
        assert!(!zoomed_in.snapped());
        // 3 world units at zoom 0.5 is 1.5px on screen.
        let zoomed_out = compute_snap(&drag(103.0, 0.0, 80.0, 40.0), &items, 5.0, 0.5);
        assert_eq!(zoomed_out.dx, -3.0);
    }

    #[test]
    fn test_threshold_is_strict() {
        let items = vec![rect("a", 100.0, 500.0, 50.0, 50.0)];
        let result = compute_snap(&drag(105.0, 0.0, 80.0, 40.0), &items, 5.0, 1.0);
        assert!(!result.snapped());
    }

    #[test]
    fn test_last_matching_condition_wins() {
        // left-left (4 away), right-right (exact) and center-center (2 away)
        // all match; center-center is evaluated last.
        let items = vec![rect("a", 0.0, 500.0, 100.0, 50.0)];
        let result = compute_snap(&drag(4.0, 0.0, 96.0, 40.0), &items, 5.0, 1.0);
        assert_eq!(result.dx, -2.0);
        assert_eq!(result.guides.len(), 3);

        // Across items, the later item wins even if farther away.
        let items = vec![
            rect("near", 201.0, 500.0, 10.0, 10.0),
            rect("far", 196.0, 800.0, 10.0, 10.0),
        ];
        let result = compute_snap(&drag(200.0, 0.0, 40.0, 40.0), &items, 5.0, 1.0);
        assert_eq!(result.dx, -4.0);
    }

    #[test]
    fn test_adjacent_edges_snap() {
        // Dragged left edge near the other's right edge.
        let items = vec![rect("a", 0.0, 0.0, 100.0, 100.0)];
        let result = compute_snap(&drag(102.0, 300.0, 50.0, 50.0), &items, 5.0, 1.0);
        assert_eq!(result.dx, -2.0);

        // Dragged bottom edge near the other's top edge.
        let result = compute_snap(&drag(400.0, -53.0, 50.0, 50.0), &items, 5.0, 1.0);
        assert_eq!(result.dy, 3.0);
        assert!(result
            .guides
            .iter()
            .all(|g| g.orientation == Orientation::Horizontal));
    }

    #[test]
    fn test_self_and_hidden_items_ignored() {
        let mut hidden = rect("hidden", 100.0, 0.0, 50.0, 50.0);
        hidden.visible = false;
        let items = vec![rect("dragged", 100.0, 0.0, 50.0, 50.0), hidden];
        let result = compute_snap(&drag(101.0, 0.0, 50.0, 50.0), &items, 5.0, 1.0);
        assert!(!result.snapped());
    }

    #[test]
    fn test_invalid_zoom_disables_snapping() {
        let items = vec![rect("a", 100.0, 0.0, 50.0, 50.0)];
        assert!(!compute_snap(&drag(101.0, 0.0, 50.0, 50.0), &items, 5.0, 0.0).snapped());
        assert!(!compute_snap(&drag(101.0, 0.0, 50.0, 50.0), &items, 5.0, f64::NAN).snapped());
    }

    #[test]
    fn test_snap_to_grid() {
        assert_eq!(snap_to_grid(27.0, 20.0), 20.0);
        assert_eq!(snap_to_grid(31.0, 20.0), 40.0);
        assert_eq!(snap_to_grid(-11.0, 20.0), -20.0);
        assert_eq!(snap_to_grid(13.0, 0.0), 13.0);
        assert_eq!(snap_to_grid(13.0, -5.0), 13.0);
    }
}
