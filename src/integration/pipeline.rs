//! DetectionPipeline: detector, tracker, zones and streaming for one frame.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::integration::builder::stamp_detections;
use crate::integration::service::{StreamTrackingService, TrackingUpdate};
use crate::streaming::{DetectionStreamer, FrameSize};
use crate::tracker::Detection;
use crate::zones::{ZoneEngine, ZoneEvent};

use super::DetectionSource;

/// Everything one frame produced.
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub detections: Vec<Detection>,
    pub tracking: TrackingUpdate,
    pub zone_events: Vec<ZoneEvent>,
}

/// Runs a `DetectionSource` and routes its output through tracking, zone
/// evaluation and the streamer.
///
/// Zones see tracked objects keyed by track label, so presence follows the
/// track rather than the per-frame detection id. Streaming failures are
/// logged and never fail the frame.
pub struct DetectionPipeline<D: DetectionSource> {
    detector: D,
    service: Arc<StreamTrackingService>,
    zones: Option<Arc<ZoneEngine>>,
    streamer: Option<Arc<DetectionStreamer>>,
}

impl<D: DetectionSource> DetectionPipeline<D> {
    pub fn new(detector: D, service: Arc<StreamTrackingService>) -> Self {
        Self {
            detector,
            service,
            zones: None,
            streamer: None,
        }
    }

    pub fn with_zone_engine(mut self, zones: Arc<ZoneEngine>) -> Self {
        self.zones = Some(zones);
        self
    }

    pub fn with_streamer(mut self, streamer: Arc<DetectionStreamer>) -> Self {
        self.streamer = Some(streamer);
        self
    }

    /// Process a single frame.
    ///
    /// # Arguments
    /// * `input` - Raw image bytes handed to the detector
    /// * `width` - Image width in pixels
    /// * `height` - Image height in pixels
    pub async fn process_frame(
        &mut self,
        stream_id: &str,
        frame_id: &str,
        input: &[u8],
        width: u32,
        height: u32,
    ) -> Result<PipelineOutput> {
        self.process_frame_at(stream_id, frame_id, input, width, height, Utc::now())
            .await
    }

    /// Process a frame captured at `captured_at`. Tracking and zone rules
    /// both run on that instant.
    pub async fn process_frame_at(
        &mut self,
        stream_id: &str,
        frame_id: &str,
        input: &[u8],
        width: u32,
        height: u32,
        captured_at: DateTime<Utc>,
    ) -> Result<PipelineOutput> {
        let started = Instant::now();
        let objects = self
            .detector
            .detect(input, width, height)
            .map_err(|e| Error::detector(e.to_string()))?;
        let now = captured_at;
        let detections = stamp_detections(objects, stream_id, frame_id, now);
        let detect_time = started.elapsed();

        if let Some(streamer) = &self.streamer {
            if let Err(e) = streamer.stream_detection_results(
                stream_id,
                frame_id,
                &detections,
                detect_time,
                Some(FrameSize { width, height }),
            ) {
                warn!(stream_id, frame_id, error = %e, "failed to stream detections");
            }
        }

        let tracking = self
            .service
            .process_detections_at(stream_id, frame_id, &detections, now)?;

        if let Some(streamer) = &self.streamer {
            if let Err(e) = streamer.stream_tracking_update(&tracking) {
                warn!(stream_id, frame_id, error = %e, "failed to stream tracking update");
            }
        }

        let zone_events = match &self.zones {
            Some(zones) => self.evaluate_zones(zones, stream_id, &tracking).await?,
            None => Vec::new(),
        };

        debug!(
            stream_id,
            frame_id,
            detections = detections.len(),
            tracks = tracking.tracks.len(),
            zone_events = zone_events.len(),
            "frame processed"
        );
        Ok(PipelineOutput {
            detections,
            tracking,
            zone_events,
        })
    }

    async fn evaluate_zones(
        &self,
        zones: &ZoneEngine,
        stream_id: &str,
        tracking: &TrackingUpdate,
    ) -> Result<Vec<ZoneEvent>> {
        let mut events = Vec::new();
        for track in tracking.tracks.iter().filter(|t| t.time_since_update == 0) {
            let mut detection = track.last_detection.clone();
            detection.timestamp = tracking.timestamp;
            match zones
                .process_detection_at(stream_id, &track.label(), &detection, tracking.timestamp)
                .await
            {
                Ok(mut evs) => events.append(&mut evs),
                Err(e) if e.is_client_error() => {
                    warn!(stream_id, track_id = track.track_id, error = %e, "skipping track in zone evaluation");
                }
                Err(e) => return Err(e),
            }
        }
        if !events.is_empty() {
            zones.record_events(&events).await;
        }
        Ok(events)
    }

    pub fn detector(&self) -> &D {
        &self.detector
    }

    pub fn detector_mut(&mut self) -> &mut D {
        &mut self.detector
    }

    pub fn service(&self) -> &Arc<StreamTrackingService> {
        &self.service
    }
}
