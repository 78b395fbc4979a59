//! Frames handed to the hub for per-quality encoding.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::streaming::quality::{QualityLevel, Resolution};

/// A frame as produced upstream, before any per-client encoding.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub frame_id: String,
    pub timestamp: DateTime<Utc>,
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
    pub process_time: Duration,
    pub has_overlays: bool,
}

/// JPEG bytes produced for one quality level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub jpeg_quality: u8,
}

/// Encodes a frame for a quality level. Video codecs live outside this
/// crate; implementations wrap whatever encoder the deployment provides.
pub trait FrameEncoder: Send + Sync {
    fn encode(&self, frame: &RawFrame, level: &QualityLevel) -> Result<EncodedFrame>;
}

/// Forwards frames whose `data` is already JPEG, reporting the size the
/// level would scale to.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughEncoder;

impl FrameEncoder for PassthroughEncoder {
    fn encode(&self, frame: &RawFrame, level: &QualityLevel) -> Result<EncodedFrame> {
        if frame.data.is_empty() {
            return Err(Error::encoding(format!("frame {} has no data", frame.frame_id)));
        }
        let (width, height) = fit_resolution(frame.width, frame.height, level.max_resolution);
        Ok(EncodedFrame {
            data: frame.data.clone(),
            width,
            height,
            jpeg_quality: level.jpeg_quality,
        })
    }
}

/// Largest size within `max` that keeps the aspect ratio. Never upscales.
pub fn fit_resolution(width: u32, height: u32, max: Resolution) -> (u32, u32) {
    if width == 0 || height == 0 || (width <= max.width && height <= max.height) {
        return (width, height);
    }
    let scale = f64::min(
        f64::from(max.width) / f64::from(width),
        f64::from(max.height) / f64::from(height),
    );
    let w = (f64::from(width) * scale).round().max(1.0) as u32;
    let h = (f64::from(height) * scale).round().max(1.0) as u32;
    (w.min(max.width), h.min(max.height))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fit_resolution() {
        let hd = Resolution::new(1280, 720);
        assert_eq!(fit_resolution(640, 480, hd), (640, 480));
        assert_eq!(fit_resolution(1920, 1080, hd), (1280, 720));
        assert_eq!(fit_resolution(1080, 1920, hd), (405, 720));
    }

    #[test]
    fn test_passthrough_rejects_empty() {
        let level = &QualityLevel::default_levels()[0];
        let mut frame = RawFrame {
            frame_id: "f".into(),
            timestamp: Utc::now(),
            width: 1920,
            height: 1080,
            data: vec![],
            process_time: Duration::ZERO,
            has_overlays: false,
        };
        assert!(PassthroughEncoder.encode(&frame, level).is_err());

        frame.data = vec![0xFF, 0xD8, 0xFF];
        let encoded = PassthroughEncoder.encode(&frame, level).unwrap();
        assert_eq!((encoded.width, encoded.height), (320, 180));
        assert_eq!(encoded.jpeg_quality, 30);
    }
}
