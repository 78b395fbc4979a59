//! Connecting an external detector to tracking, zones and streaming.
//!
//! The detector itself lives outside this crate; implement [`DetectionSource`]
//! to plug one in.

mod builder;
mod detector;
mod pipeline;
mod service;

pub use builder::{DetectionBuilder, stamp_detections};
pub use detector::{DetectedObject, DetectionSource};
pub use pipeline::{DetectionPipeline, PipelineOutput};
pub use service::{
    ServiceStats, StreamTrackingService, TrackingCallback, TrackingServiceConfig, TrackingUpdate,
};
