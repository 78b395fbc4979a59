//! Builders turning raw detector output into tracker input.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::integration::detector::DetectedObject;
use crate::tracker::{Detection, Rect};

/// Builder for `DetectedObject` values from the box formats detectors emit.
#[derive(Debug, Clone, Default)]
pub struct DetectionBuilder {
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
    score: f32,
    class: String,
}

impl DetectionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set bounding box in TLBR format (x1, y1, x2, y2).
    pub fn tlbr(mut self, x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        self.x1 = x1;
        self.y1 = y1;
        self.x2 = x2;
        self.y2 = y2;
        self
    }

    /// Set bounding box in XYWH format (center_x, center_y, width, height).
    pub fn xywh(mut self, cx: f32, cy: f32, w: f32, h: f32) -> Self {
        self.x1 = cx - w / 2.0;
        self.y1 = cy - h / 2.0;
        self.x2 = cx + w / 2.0;
        self.y2 = cy + h / 2.0;
        self
    }

    /// Set bounding box in TLWH format (x, y, width, height).
    pub fn tlwh(mut self, x: f32, y: f32, w: f32, h: f32) -> Self {
        self.x1 = x;
        self.y1 = y;
        self.x2 = x + w;
        self.y2 = y + h;
        self
    }

    pub fn score(mut self, score: f32) -> Self {
        self.score = score;
        self
    }

    pub fn class(mut self, class: impl Into<String>) -> Self {
        self.class = class.into();
        self
    }

    /// Build the object, rounding the box to whole pixels.
    pub fn build(self) -> DetectedObject {
        DetectedObject {
            class: self.class,
            confidence: f64::from(self.score),
            bbox: Rect::from_tlbr(
                self.x1.round() as i32,
                self.y1.round() as i32,
                self.x2.round() as i32,
                self.y2.round() as i32,
            ),
        }
    }
}

/// Assign ids and stream/frame/time context to one frame of detector output.
pub fn stamp_detections(
    objects: Vec<DetectedObject>,
    stream_id: &str,
    frame_id: &str,
    timestamp: DateTime<Utc>,
) -> Vec<Detection> {
    objects
        .into_iter()
        .map(|obj| {
            Detection::new(
                Uuid::new_v4().to_string(),
                obj.class,
                obj.confidence,
                obj.bbox,
                timestamp,
            )
            .with_stream(stream_id)
            .with_frame(frame_id)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detection_builder() {
        let det = DetectionBuilder::new()
            .tlbr(10.0, 20.0, 50.0, 80.0)
            .score(0.95)
            .class("person")
            .build();

        assert!((det.confidence - 0.95).abs() < 1e-6);
        assert_eq!(det.bbox, Rect::new(10, 20, 40, 60));
        assert_eq!(det.class, "person");
    }

    #[test]
    fn test_box_formats_agree() {
        let a = DetectionBuilder::new().xywh(30.0, 50.0, 40.0, 60.0).build();
        let b = DetectionBuilder::new().tlwh(10.0, 20.0, 40.0, 60.0).build();
        assert_eq!(a.bbox, b.bbox);
    }

    #[test]
    fn test_stamp_assigns_unique_ids() {
        let now = Utc::now();
        let objects = vec![
            DetectionBuilder::new().tlwh(0.0, 0.0, 5.0, 5.0).class("a").score(0.5).build(),
            DetectionBuilder::new().tlwh(9.0, 9.0, 5.0, 5.0).class("b").score(0.5).build(),
        ];
        let dets = stamp_detections(objects, "cam", "f7", now);
        assert_eq!(dets.len(), 2);
        assert_ne!(dets[0].detection_id, dets[1].detection_id);
        assert!(dets.iter().all(|d| d.stream_id == "cam" && d.frame_id == "f7"));
        assert!(dets.iter().all(|d| d.timestamp == now));
    }
}
