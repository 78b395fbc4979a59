//! Real-time video analytics: multi-object tracking, trajectory recording,
//! polygon zone rules and adaptive WebSocket fan-out.
//!
//! Data flows from an external detector through [`tracker::Tracker`] into the
//! [`zones::ZoneEngine`] and the [`streaming::Hub`]. The
//! [`integration::DetectionPipeline`] wires these together per frame.

pub mod config;
pub mod error;
pub mod integration;
pub mod metrics;
pub mod streaming;
pub mod tracker;
pub mod trajectory;
pub mod zones;

pub use error::{Error, Result};
pub use tracker::{Detection, Rect, Track, TrackState, Tracker, TrackerConfig};
