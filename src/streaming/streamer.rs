//! Turns tracking output into wire messages and publishes them per stream.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::integration::TrackingUpdate;
use crate::streaming::broadcaster::{BroadcastOutcome, StreamBroadcaster};
use crate::streaming::frame::{FrameEncoder, RawFrame};
use crate::streaming::hub::Hub;
use crate::streaming::message::{
    DetectionPayload, FrameSize, ServerMessage, StreamedDetection, StreamedTrack, TrackingPayload,
    millis,
};
use crate::tracker::Detection;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionStreamerConfig {
    pub enable_detections: bool,
    pub enable_tracking: bool,
    pub include_trajectories: bool,
    pub include_predictions: bool,
    pub filter_low_confidence: bool,
    pub min_confidence: f64,
}

impl Default for DetectionStreamerConfig {
    fn default() -> Self {
        Self {
            enable_detections: true,
            enable_tracking: true,
            include_trajectories: true,
            include_predictions: false,
            filter_low_confidence: true,
            min_confidence: 0.3,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamerStats {
    pub detections_sent: u64,
    pub tracking_updates_sent: u64,
    pub frames_sent: u64,
    pub bytes_sent: u64,
    pub stream_errors: u64,
}

/// Publishes detection and tracking results to a stream's subscribers.
/// While stopped, every publish call is a silent no-op.
pub struct DetectionStreamer {
    config: RwLock<DetectionStreamerConfig>,
    broadcaster: Arc<dyn StreamBroadcaster>,
    running: AtomicBool,
    stats: Mutex<StreamerStats>,
}

impl DetectionStreamer {
    pub fn new(broadcaster: Arc<dyn StreamBroadcaster>, config: DetectionStreamerConfig) -> Self {
        Self {
            config: RwLock::new(config),
            broadcaster,
            running: AtomicBool::new(false),
            stats: Mutex::new(StreamerStats::default()),
        }
    }

    pub fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::already_running("detection streamer"));
        }
        let config = self.config.read();
        info!(
            detections_enabled = config.enable_detections,
            tracking_enabled = config.enable_tracking,
            "detection streamer started"
        );
        Ok(())
    }

    pub fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(Error::not_running("detection streamer"));
        }
        info!("detection streamer stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> DetectionStreamerConfig {
        self.config.read().clone()
    }

    pub fn update_config(&self, config: DetectionStreamerConfig) {
        info!(
            detections_enabled = config.enable_detections,
            tracking_enabled = config.enable_tracking,
            "detection streamer config updated"
        );
        *self.config.write() = config;
    }

    pub fn stream_detection_results(
        &self,
        stream_id: &str,
        frame_id: &str,
        detections: &[Detection],
        process_time: Duration,
        frame_size: Option<FrameSize>,
    ) -> Result<BroadcastOutcome> {
        let config = self.config();
        if !self.is_running() || !config.enable_detections {
            return Ok(BroadcastOutcome::default());
        }

        let detections: Vec<StreamedDetection> = detections
            .iter()
            .filter(|d| !config.filter_low_confidence || d.confidence >= config.min_confidence)
            .map(StreamedDetection::from)
            .collect();
        let count = detections.len();
        let message = ServerMessage::detection(DetectionPayload {
            stream_id: stream_id.to_string(),
            frame_id: frame_id.to_string(),
            timestamp: chrono::Utc::now(),
            detections,
            process_time: millis(process_time),
            frame_size,
        });

        let outcome = self.publish(stream_id, &message)?;
        self.stats.lock().detections_sent += count as u64;
        debug!(stream_id, frame_id, detections = count, recipients = outcome.delivered, "streamed detection results");
        Ok(outcome)
    }

    pub fn stream_tracking_update(&self, update: &TrackingUpdate) -> Result<BroadcastOutcome> {
        let config = self.config();
        if !self.is_running() || !config.enable_tracking {
            return Ok(BroadcastOutcome::default());
        }

        let convert = |tracks: &[crate::tracker::Track]| -> Vec<StreamedTrack> {
            tracks
                .iter()
                .map(|t| StreamedTrack::from_track(t, config.include_trajectories, config.include_predictions))
                .collect()
        };
        let message = ServerMessage::tracking(TrackingPayload {
            stream_id: update.stream_id.clone(),
            frame_id: update.frame_id.clone(),
            timestamp: update.timestamp,
            tracks: convert(&update.tracks),
            new_tracks: convert(&update.new_tracks),
            lost_tracks: convert(&update.lost_tracks),
            process_time: millis(update.process_time),
        });

        let outcome = self.publish(&update.stream_id, &message)?;
        self.stats.lock().tracking_updates_sent += 1;
        debug!(
            stream_id = %update.stream_id,
            tracks = update.tracks.len(),
            recipients = outcome.delivered,
            "streamed tracking update"
        );
        Ok(outcome)
    }

    /// Frames go straight through the hub, which encodes per quality level.
    pub fn stream_frame(
        &self,
        hub: &Hub,
        stream_id: &str,
        frame: &RawFrame,
        encoder: &dyn FrameEncoder,
    ) -> Result<BroadcastOutcome> {
        if !self.is_running() {
            return Ok(BroadcastOutcome::default());
        }
        match hub.broadcast_frame(stream_id, frame, encoder) {
            Ok(outcome) => {
                let mut stats = self.stats.lock();
                stats.frames_sent += outcome.delivered as u64;
                stats.bytes_sent += outcome.bytes;
                Ok(outcome)
            }
            Err(e) => {
                self.stats.lock().stream_errors += 1;
                warn!(stream_id, error = %e, "failed to stream frame");
                Err(e)
            }
        }
    }

    fn publish(&self, stream_id: &str, message: &ServerMessage) -> Result<BroadcastOutcome> {
        match self.broadcaster.broadcast_to_stream(stream_id, message) {
            Ok(outcome) => {
                self.stats.lock().bytes_sent += outcome.bytes;
                Ok(outcome)
            }
            Err(e) => {
                self.stats.lock().stream_errors += 1;
                warn!(stream_id, message_type = message.message_type(), error = %e, "failed to publish message");
                Err(e)
            }
        }
    }

    pub fn stats(&self) -> StreamerStats {
        self.stats.lock().clone()
    }
}
