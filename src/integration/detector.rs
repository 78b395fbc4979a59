//! The seam to the external object detector.

use serde::{Deserialize, Serialize};

use crate::tracker::Rect;

/// One object as reported by a detector, before it is stamped with stream,
/// frame and time information.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedObject {
    pub class: String,
    pub confidence: f64,
    pub bbox: Rect,
}

/// A model that turns one decoded frame into labelled boxes.
///
/// The pipeline owns its source and calls it once per frame, so
/// implementations may keep mutable scratch state between frames.
///
/// ```ignore
/// use streamtrack_rs::integration::{DetectedObject, DetectionSource};
/// use streamtrack_rs::Rect;
///
/// struct FixedBox;
///
/// impl DetectionSource for FixedBox {
///     type Error = std::io::Error;
///
///     fn detect(&mut self, _frame: &[u8], _width: u32, _height: u32) -> Result<Vec<DetectedObject>, Self::Error> {
///         Ok(vec![DetectedObject { class: "person".into(), confidence: 0.8, bbox: Rect::new(0, 0, 32, 64) }])
///     }
/// }
/// ```
pub trait DetectionSource {
    type Error: std::error::Error + Send + Sync + 'static;

    /// `frame` is whatever encoding the implementation expects; `width` and
    /// `height` describe the decoded image the boxes refer to.
    fn detect(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<DetectedObject>, Self::Error>;
}

impl<D: DetectionSource + ?Sized> DetectionSource for Box<D> {
    type Error = D::Error;

    fn detect(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<DetectedObject>, Self::Error> {
        (**self).detect(frame, width, height)
    }
}
