use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Axis-aligned bounding box in integer pixels.
///
/// Supports the formats the tracker moves between:
/// - TLWH: Top-Left X, Top-Left Y, Width, Height (the stored form)
/// - TLBR: Top-Left X, Top-Left Y, Bottom-Right X, Bottom-Right Y
/// - CXCYWH: Center X, Center Y, Width, Height (the Kalman measurement)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rect {
    /// Top-left x coordinate
    pub x: i32,
    /// Top-left y coordinate
    pub y: i32,
    /// Width of the bounding box
    pub width: i32,
    /// Height of the bounding box
    pub height: i32,
}

impl Rect {
    /// Create a new Rect from top-left coordinates and dimensions (TLWH format).
    #[inline]
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Create a Rect from TLBR format (top-left x, top-left y, bottom-right x, bottom-right y).
    #[inline]
    pub fn from_tlbr(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
        }
    }

    /// Create a Rect from a center point and size, rounding to whole pixels.
    ///
    /// Width and height are floored at one pixel so a diverging filter
    /// estimate never produces an empty box.
    pub fn from_center(cx: f64, cy: f64, width: f64, height: f64) -> Self {
        let width = width.max(1.0);
        let height = height.max(1.0);
        Self {
            x: (cx - width / 2.0).round() as i32,
            y: (cy - height / 2.0).round() as i32,
            width: width.round() as i32,
            height: height.round() as i32,
        }
    }

    /// Convert to the Kalman measurement vector `[cx, cy, w, h]`.
    #[inline]
    pub fn to_cxcywh(&self) -> [f64; 4] {
        let (cx, cy) = self.center();
        [cx, cy, self.width as f64, self.height as f64]
    }

    /// Get the center point of the bounding box.
    #[inline]
    pub fn center(&self) -> (f64, f64) {
        (
            self.x as f64 + self.width as f64 / 2.0,
            self.y as f64 + self.height as f64 / 2.0,
        )
    }

    /// Get the area of the bounding box.
    #[inline]
    pub fn area(&self) -> f64 {
        self.width as f64 * self.height as f64
    }

    /// Euclidean distance between the two centers.
    pub fn center_distance(&self, other: &Rect) -> f64 {
        let (ax, ay) = self.center();
        let (bx, by) = other.center();
        ((ax - bx).powi(2) + (ay - by).powi(2)).sqrt()
    }

    /// Calculate Intersection over Union (IoU) with another bounding box.
    pub fn iou(&self, other: &Rect) -> f64 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        let inter_width = (x2 - x1).max(0) as f64;
        let inter_height = (y2 - y1).max(0) as f64;
        let inter_area = inter_width * inter_height;

        let union_area = self.area() + other.area() - inter_area;

        if union_area > 0.0 {
            inter_area / union_area
        } else {
            0.0
        }
    }

    /// Whether the box has a positive area.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.width > 0 && self.height > 0
    }
}

/// Calculate IoU matrix between two sets of bounding boxes.
///
/// Returns a matrix of shape (M, N) where M is the length of `boxes_a`
/// and N is the length of `boxes_b`.
pub fn iou_batch(boxes_a: &[Rect], boxes_b: &[Rect]) -> Array2<f64> {
    let mut ious = Array2::zeros((boxes_a.len(), boxes_b.len()));
    for (i, a) in boxes_a.iter().enumerate() {
        for (j, b) in boxes_b.iter().enumerate() {
            ious[[i, j]] = a.iou(b);
        }
    }
    ious
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rect_conversions() {
        let rect = Rect::new(10, 20, 30, 40);
        let m = rect.to_cxcywh();
        assert_eq!(m, [25.0, 40.0, 30.0, 40.0]);
    }

    #[test]
    fn test_from_tlbr() {
        let rect = Rect::from_tlbr(10, 20, 40, 60);
        assert_eq!(rect, Rect::new(10, 20, 30, 40));
    }

    #[test]
    fn test_from_center_round_trips_measurement() {
        let rect = Rect::from_center(35.0, 70.0, 50.0, 100.0);
        assert_eq!(rect, Rect::new(10, 20, 50, 100));
    }

    #[test]
    fn test_from_center_floors_size() {
        let rect = Rect::from_center(5.0, 5.0, -3.0, 0.2);
        assert!(rect.is_valid());
    }

    #[test]
    fn test_iou() {
        let a = Rect::new(0, 0, 10, 10);
        let b = Rect::new(5, 5, 10, 10);

        // Intersection: 5x5 = 25
        // Union: 100 + 100 - 25 = 175
        let iou = a.iou(&b);
        assert!((iou - 25.0 / 175.0).abs() < 1e-9);
    }

    #[test]
    fn test_iou_no_overlap() {
        let a = Rect::new(0, 0, 10, 10);
        let b = Rect::new(20, 20, 10, 10);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn test_iou_same_box() {
        let a = Rect::new(0, 0, 10, 10);
        assert!((a.iou(&a) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_center_distance() {
        let a = Rect::new(0, 0, 10, 10);
        let b = Rect::new(3, 4, 10, 10);
        assert!((a.center_distance(&b) - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_iou_batch_shape() {
        let a = [Rect::new(0, 0, 10, 10), Rect::new(50, 50, 10, 10)];
        let b = [Rect::new(0, 0, 10, 10)];
        let ious = iou_batch(&a, &b);
        assert_eq!(ious.dim(), (2, 1));
        assert_eq!(ious[[1, 0]], 0.0);
    }
}
