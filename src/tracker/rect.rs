/// Axis-aligned bounding box in pixel space.
///
/// Stored as top-left corner plus dimensions (TLWH). Detections usually
/// arrive as corner pairs (TLBR) and are converted with [`Rect::from_tlbr`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Rect {
    /// Top-left x coordinate
    pub x: f32,
    /// Top-left y coordinate
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Rect {
    #[inline]
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Create a Rect from corner coordinates `(x1, y1, x2, y2)`.
    #[inline]
    pub fn from_tlbr(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self {
            x: x1.min(x2),
            y: y1.min(y2),
            width: (x2 - x1).abs(),
            height: (y2 - y1).abs(),
        }
    }

    #[inline]
    pub fn to_tlbr(&self) -> [f32; 4] {
        [self.x, self.y, self.x + self.width, self.y + self.height]
    }

    #[inline]
    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    /// Midpoint of the bottom edge; where a standing person touches the floor.
    #[inline]
    pub fn bottom_center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height)
    }

    #[inline]
    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    /// Exponential moving average towards `target`:
    /// `alpha * target + (1 - alpha) * self`, per coordinate.
    pub fn blend(&self, target: &Rect, alpha: f32) -> Rect {
        let mix = |old: f32, new: f32| alpha * new + (1.0 - alpha) * old;
        Rect {
            x: mix(self.x, target.x),
            y: mix(self.y, target.y),
            width: mix(self.width, target.width),
            height: mix(self.height, target.height),
        }
    }

    /// Integer pixel window `(x, y, width, height)` clipped to an image of the
    /// given size. `None` when nothing of the box lies inside the image.
    pub fn pixel_window(&self, image_width: u32, image_height: u32) -> Option<(u32, u32, u32, u32)> {
        let x1 = self.x.max(0.0).floor() as u32;
        let y1 = self.y.max(0.0).floor() as u32;
        let x2 = ((self.x + self.width).max(0.0).ceil() as u32).min(image_width);
        let y2 = ((self.y + self.height).max(0.0).ceil() as u32).min(image_height);
        if x2 <= x1 || y2 <= y1 {
            return None;
        }
        Some((x1, y1, x2 - x1, y2 - y1))
    }

    /// Intersection over Union with another box.
    pub fn iou(&self, other: &Rect) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        let inter_area = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union_area = self.area() + other.area() - inter_area;

        if union_area > 0.0 {
            inter_area / union_area
        } else {
            0.0
        }
    }
}

use ndarray::Array2;

/// IoU matrix of shape (M, N) between `boxes_a` (rows) and `boxes_b` (columns).
pub fn iou_batch(boxes_a: &[Rect], boxes_b: &[Rect]) -> Array2<f32> {
    Array2::from_shape_fn((boxes_a.len(), boxes_b.len()), |(i, j)| {
        boxes_a[i].iou(&boxes_b[j])
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_tlbr_normalizes_corners() {
        let rect = Rect::from_tlbr(40.0, 60.0, 10.0, 20.0);
        assert_eq!(rect, Rect::new(10.0, 20.0, 30.0, 40.0));
        assert_eq!(rect.to_tlbr(), [10.0, 20.0, 40.0, 60.0]);
    }

    #[test]
    fn test_reference_points() {
        let rect = Rect::new(10.0, 20.0, 30.0, 40.0);
        assert_eq!(rect.center(), (25.0, 40.0));
        assert_eq!(rect.bottom_center(), (25.0, 60.0));
    }

    #[test]
    fn test_blend() {
        let old = Rect::new(0.0, 0.0, 10.0, 10.0);
        let new = Rect::new(10.0, 10.0, 20.0, 20.0);
        assert_eq!(old.blend(&new, 0.5), Rect::new(5.0, 5.0, 15.0, 15.0));
        assert_eq!(old.blend(&new, 1.0), new);
    }

    #[test]
    fn test_iou() {
        let a = Rect::new(0.0, 0.0, 10.0, 10.0);
        let b = Rect::new(5.0, 5.0, 10.0, 10.0);
        // 25 / (100 + 100 - 25)
        assert!((a.iou(&b) - 25.0 / 175.0).abs() < 1e-6);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
        assert_eq!(a.iou(&Rect::new(20.0, 20.0, 10.0, 10.0)), 0.0);
    }

    #[test]
    fn test_pixel_window_clips_to_image() {
        let rect = Rect::new(-5.0, 2.0, 20.0, 100.0);
        assert_eq!(rect.pixel_window(10, 50), Some((0, 2, 10, 48)));
        assert_eq!(Rect::new(60.0, 0.0, 5.0, 5.0).pixel_window(50, 50), None);
    }

    #[test]
    fn test_iou_batch_shape() {
        let a = [Rect::new(0.0, 0.0, 10.0, 10.0)];
        let b = [Rect::new(0.0, 0.0, 10.0, 10.0), Rect::new(50.0, 50.0, 1.0, 1.0)];
        let m = iou_batch(&a, &b);
        assert_eq!(m.dim(), (1, 2));
        assert!((m[[0, 0]] - 1.0).abs() < 1e-6);
        assert_eq!(m[[0, 1]], 0.0);
    }
}
