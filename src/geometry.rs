//! Rectangle arithmetic shared by the extraction pipeline.
//!
//! Two coordinate spaces are in play: pass-1 boxes are normalized to the
//! thumbnail ([0,1] on both axes), pass-2 and everything downstream work in
//! full-resolution pixels.

use serde::{Deserialize, Serialize};

/// Axis-aligned box in full-resolution pixel space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl PixelBox {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    pub fn right(&self) -> u32 {
        self.x.saturating_add(self.width)
    }

    pub fn bottom(&self) -> u32 {
        self.y.saturating_add(self.height)
    }

    /// Intersection area with another box, zero when disjoint.
    pub fn intersection_area(&self, other: &PixelBox) -> u64 {
        let left = self.x.max(other.x);
        let top = self.y.max(other.y);
        let right = self.right().min(other.right());
        let bottom = self.bottom().min(other.bottom());
        if right <= left || bottom <= top {
            return 0;
        }
        u64::from(right - left) * u64::from(bottom - top)
    }

    /// Intersection-over-union in [0,1].
    pub fn iou(&self, other: &PixelBox) -> f64 {
        let inter = self.intersection_area(other);
        if inter == 0 {
            return 0.0;
        }
        let union = self.area() + other.area() - inter;
        inter as f64 / union as f64
    }

    /// Smallest box covering both inputs.
    pub fn union(&self, other: &PixelBox) -> PixelBox {
        let left = self.x.min(other.x);
        let top = self.y.min(other.y);
        let right = self.right().max(other.right());
        let bottom = self.bottom().max(other.bottom());
        PixelBox::new(left, top, right - left, bottom - top)
    }

    /// Translate by an offset, saturating at the frame origin is not needed
    /// because offsets always come from crops inside the frame.
    pub fn offset_by(&self, dx: u32, dy: u32) -> PixelBox {
        PixelBox::new(self.x + dx, self.y + dy, self.width, self.height)
    }

    /// Snap all four edges to a coarse grid. Canonical record ids hash
    /// the snapped box so near-identical detections collapse to one id;
    /// snapping the right/bottom edges (not the raw dimensions) keeps
    /// boxes with jittered origins in the same cell.
    pub fn snapped(&self, grid: u32) -> PixelBox {
        debug_assert!(grid > 0);
        let snap = |v: u32| (v / grid) * grid;
        let x = snap(self.x);
        let y = snap(self.y);
        let right = snap(self.right()).max(x + grid);
        let bottom = snap(self.bottom()).max(y + grid);
        PixelBox::new(x, y, right - x, bottom - y)
    }
}

/// Axis-aligned box normalized to [0,1] in thumbnail space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormalizedBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl NormalizedBox {
    /// Clamp to the unit square, discarding any out-of-range excess the
    /// model may have produced.
    pub fn clamped(&self) -> NormalizedBox {
        let x = self.x.clamp(0.0, 1.0);
        let y = self.y.clamp(0.0, 1.0);
        NormalizedBox {
            x,
            y,
            width: self.width.clamp(0.0, 1.0 - x),
            height: self.height.clamp(0.0, 1.0 - y),
        }
    }

    pub fn area(&self) -> f64 {
        self.width * self.height
    }

    /// Project onto a full-resolution frame of the given dimensions.
    pub fn to_pixels(&self, frame_width: u32, frame_height: u32) -> PixelBox {
        let b = self.clamped();
        let x = (b.x * f64::from(frame_width)).round() as u32;
        let y = (b.y * f64::from(frame_height)).round() as u32;
        let width = ((b.width * f64::from(frame_width)).round() as u32)
            .min(frame_width.saturating_sub(x))
            .max(1);
        let height = ((b.height * f64::from(frame_height)).round() as u32)
            .min(frame_height.saturating_sub(y))
            .max(1);
        PixelBox::new(x, y, width, height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iou_of_identical_boxes_is_one() {
        let b = PixelBox::new(10, 10, 100, 50);
        assert!((b.iou(&b) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        let a = PixelBox::new(0, 0, 10, 10);
        let b = PixelBox::new(100, 100, 10, 10);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn iou_of_half_overlap() {
        let a = PixelBox::new(0, 0, 100, 100);
        let b = PixelBox::new(50, 0, 100, 100);
        // intersection 5000, union 15000
        assert!((a.iou(&b) - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn union_covers_both() {
        let a = PixelBox::new(10, 10, 20, 20);
        let b = PixelBox::new(25, 5, 30, 10);
        let u = a.union(&b);
        assert_eq!(u, PixelBox::new(10, 5, 45, 25));
    }

    #[test]
    fn normalized_projects_and_clamps() {
        let n = NormalizedBox {
            x: 0.5,
            y: 0.5,
            width: 0.8,
            height: 0.25,
        };
        let p = n.to_pixels(1000, 800);
        assert_eq!(p.x, 500);
        assert_eq!(p.y, 400);
        // width clamped to the unit square before projection
        assert_eq!(p.width, 500);
        assert_eq!(p.height, 200);
    }

    #[test]
    fn snapping_collapses_jittered_boxes() {
        // Same grid cells for every edge, different raw dimensions.
        let a = PixelBox::new(101, 99, 401, 203);
        let b = PixelBox::new(103, 97, 398, 201);
        assert_eq!(a.snapped(8), b.snapped(8));
        assert_eq!(a.snapped(8), PixelBox::new(96, 96, 400, 200));
    }

    #[test]
    fn snapped_edges_are_grid_aligned() {
        let b = PixelBox::new(5, 5, 10, 10).snapped(8);
        assert_eq!(b, PixelBox::new(0, 0, 8, 8));

        let wide = PixelBox::new(0, 0, 17, 9).snapped(8);
        assert_eq!(wide, PixelBox::new(0, 0, 16, 8));
    }
}
