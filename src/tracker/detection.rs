//! Detection input for the tracker and the zone engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::tracker::rect::Rect;

/// One object reported by the external detector for one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub detection_id: String,
    /// Class label, e.g. "person"
    pub class: String,
    /// Detection confidence score in [0, 1]
    pub confidence: f64,
    pub bbox: Rect,
    pub stream_id: String,
    pub frame_id: String,
    pub timestamp: DateTime<Utc>,
}

impl Detection {
    pub fn new(
        detection_id: impl Into<String>,
        class: impl Into<String>,
        confidence: f64,
        bbox: Rect,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            detection_id: detection_id.into(),
            class: class.into(),
            confidence,
            bbox,
            stream_id: String::new(),
            frame_id: String::new(),
            timestamp,
        }
    }

    pub fn with_stream(mut self, stream_id: impl Into<String>) -> Self {
        self.stream_id = stream_id.into();
        self
    }

    pub fn with_frame(mut self, frame_id: impl Into<String>) -> Self {
        self.frame_id = frame_id.into();
        self
    }

    #[inline]
    pub fn center(&self) -> (f64, f64) {
        self.bbox.center()
    }

    /// Reject detections that would corrupt tracker or zone state.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.confidence) || self.confidence.is_nan() {
            return Err(Error::validation(format!(
                "detection {} confidence {} outside [0, 1]",
                self.detection_id, self.confidence
            )));
        }
        if !self.bbox.is_valid() {
            return Err(Error::validation(format!(
                "detection {} has empty bounding box {:?}",
                self.detection_id, self.bbox
            )));
        }
        if self.class.is_empty() {
            return Err(Error::validation(format!(
                "detection {} has no class",
                self.detection_id
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detection(confidence: f64, bbox: Rect) -> Detection {
        Detection::new("d1", "person", confidence, bbox, Utc::now())
    }

    #[test]
    fn test_validate_accepts_bounds() {
        assert!(detection(0.0, Rect::new(0, 0, 1, 1)).validate().is_ok());
        assert!(detection(1.0, Rect::new(0, 0, 1, 1)).validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_confidence_out_of_range() {
        let err = detection(1.2, Rect::new(0, 0, 10, 10)).validate().unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(detection(f64::NAN, Rect::new(0, 0, 10, 10)).validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_box() {
        assert!(detection(0.5, Rect::new(0, 0, 0, 10)).validate().is_err());
    }
}
