//! Per-stream multi-object tracker.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::tracker::detection::Detection;
use crate::tracker::kalman_filter::{KalmanConfig, KalmanFilter};
use crate::tracker::matching::{self, AssignmentResult, AssociationConfig, Candidate};
use crate::tracker::track::{HistoryLimits, Track, TrajectoryPoint};
use crate::tracker::track_state::TrackState;

/// Tracks whose confidence decays below this are deleted.
const MIN_TRACK_CONFIDENCE: f64 = 0.1;

/// Configuration for the Tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Maximum updates a track may go without an associated detection.
    pub max_age: u32,
    /// Consecutive hits required to confirm a tentative track.
    pub min_hits: u32,
    pub association: AssociationConfig,
    /// Run a Kalman filter per track.
    pub enable_prediction: bool,
    /// Wall-clock inactivity after which a track is deleted.
    pub track_timeout: Duration,
    pub kalman: KalmanConfig,
    pub max_detection_history: usize,
    pub max_prediction_history: usize,
    pub max_trajectory_length: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_age: 30,
            min_hits: 3,
            association: AssociationConfig::default(),
            enable_prediction: true,
            track_timeout: Duration::from_secs(5),
            kalman: KalmanConfig::default(),
            max_detection_history: 30,
            max_prediction_history: 10,
            max_trajectory_length: 100,
        }
    }
}

impl TrackerConfig {
    fn limits(&self) -> HistoryLimits {
        HistoryLimits {
            detections: self.max_detection_history.max(1),
            predictions: self.max_prediction_history.max(1),
            trajectory: self.max_trajectory_length.max(1),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackerStats {
    pub active_tracks: usize,
    pub total_tracks: u64,
    pub confirmed_tracks: usize,
    pub deleted_tracks: u64,
    pub association_count: u64,
    pub prediction_count: u64,
    pub last_update: Option<DateTime<Utc>>,
}

/// Result of one update, used by callers that need more than the active set.
#[derive(Debug, Clone, Default)]
pub struct UpdateSummary {
    pub created: Vec<u64>,
    pub deleted: Vec<Track>,
}

pub struct Tracker {
    /// Live tracks in creation order (oldest first).
    tracks: Vec<Track>,
    next_track_id: u64,
    config: TrackerConfig,
    kalman_filter: Option<KalmanFilter>,
    stats: TrackerStats,
}

impl Default for Tracker {
    fn default() -> Self {
        Self::new(TrackerConfig::default())
    }
}

impl Tracker {
    pub fn new(config: TrackerConfig) -> Self {
        let kalman_filter = config
            .enable_prediction
            .then(|| KalmanFilter::new(config.kalman.clone()));
        Self {
            tracks: Vec::new(),
            next_track_id: 1,
            config,
            kalman_filter,
            stats: TrackerStats::default(),
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Feed one frame of detections and return every non-deleted track.
    pub fn update(&mut self, detections: &[Detection], frame_id: &str) -> Vec<Track> {
        self.update_at(detections, frame_id, Utc::now())
    }

    /// [`Tracker::update`] with an explicit clock.
    pub fn update_at(
        &mut self,
        detections: &[Detection],
        frame_id: &str,
        now: DateTime<Utc>,
    ) -> Vec<Track> {
        self.step(detections, frame_id, now);
        self.active_tracks()
    }

    /// Run predict, associate, update, birth, miss and cleanup in that order.
    pub fn step(
        &mut self,
        detections: &[Detection],
        frame_id: &str,
        now: DateTime<Utc>,
    ) -> UpdateSummary {
        let limits = self.config.limits();
        let kf = self.kalman_filter.as_ref();

        // Step 1: Predict
        for track in self.tracks.iter_mut() {
            if track.predict(kf, frame_id, now, limits) {
                self.stats.prediction_count += 1;
            }
        }

        // Step 2: Associate (rows ordered oldest first for tie-breaks)
        let track_candidates: Vec<Candidate<'_>> = self
            .tracks
            .iter()
            .map(|t| Candidate {
                bbox: t.predicted_bbox(),
                class: &t.class,
            })
            .collect();
        let det_candidates: Vec<Candidate<'_>> = detections
            .iter()
            .map(|d| Candidate {
                bbox: d.bbox,
                class: &d.class,
            })
            .collect();
        let costs =
            matching::cost_matrix(&track_candidates, &det_candidates, &self.config.association);
        let AssignmentResult {
            matches,
            unmatched_tracks,
            unmatched_detections,
        } = matching::linear_assignment(&costs);

        // Step 3: Update associated
        for &(itrack, idet) in &matches {
            let track = &mut self.tracks[itrack];
            let was_tentative = track.state == TrackState::Tentative;
            track.update(
                &detections[idet],
                frame_id,
                kf,
                now,
                self.config.min_hits,
                limits,
            );
            if was_tentative && track.is_confirmed() {
                debug!(track_id = track.track_id, "track confirmed");
            }
        }
        self.stats.association_count += matches.len() as u64;

        // Step 5: Miss (before birth so new tracks are not touched)
        for &itrack in &unmatched_tracks {
            self.tracks[itrack].mark_missed();
        }

        // Step 4: Birth
        let mut summary = UpdateSummary::default();
        for idet in unmatched_detections {
            let detection = &detections[idet];
            let track_id = self.next_track_id;
            self.next_track_id += 1;
            self.tracks
                .push(Track::new(track_id, detection, frame_id, kf, now));
            self.stats.total_tracks += 1;
            summary.created.push(track_id);
            debug!(track_id, class = %detection.class, confidence = detection.confidence, "track created");
        }

        // Step 6: Cleanup
        summary.deleted = self.cleanup(now);

        self.refresh_stats(now);

        debug!(
            frame_id,
            detections = detections.len(),
            associations = matches.len(),
            new_tracks = summary.created.len(),
            deleted_tracks = summary.deleted.len(),
            active_tracks = self.tracks.len(),
            "tracker update completed"
        );

        summary
    }

    fn cleanup(&mut self, now: DateTime<Utc>) -> Vec<Track> {
        let max_age = self.config.max_age;
        let timeout = chrono::Duration::from_std(self.config.track_timeout)
            .unwrap_or(chrono::Duration::MAX);

        let mut deleted = Vec::new();
        let mut kept = Vec::with_capacity(self.tracks.len());
        for mut track in self.tracks.drain(..) {
            let expired = track.time_since_update > max_age;
            let faded = track.confidence < MIN_TRACK_CONFIDENCE;
            let timed_out = now - track.last_seen > timeout;
            if expired || faded || timed_out {
                debug!(
                    track_id = track.track_id,
                    time_since_update = track.time_since_update,
                    confidence = track.confidence,
                    timed_out,
                    "track deleted"
                );
                track.mark_deleted();
                deleted.push(track);
            } else {
                kept.push(track);
            }
        }
        self.tracks = kept;
        self.stats.deleted_tracks += deleted.len() as u64;
        deleted
    }

    fn refresh_stats(&mut self, now: DateTime<Utc>) {
        self.stats.active_tracks = self.tracks.len();
        self.stats.confirmed_tracks = self.tracks.iter().filter(|t| t.is_confirmed()).count();
        self.stats.last_update = Some(now);
    }

    /// All non-deleted tracks, oldest first.
    pub fn active_tracks(&self) -> Vec<Track> {
        self.tracks
            .iter()
            .filter(|t| t.state != TrackState::Deleted)
            .cloned()
            .collect()
    }

    pub fn confirmed_tracks(&self) -> Vec<Track> {
        self.tracks
            .iter()
            .filter(|t| t.is_confirmed())
            .cloned()
            .collect()
    }

    pub fn get_track(&self, track_id: u64) -> Option<&Track> {
        self.tracks.iter().find(|t| t.track_id == track_id)
    }

    /// Copy of a track's trajectory.
    pub fn track_history(&self, track_id: u64) -> Option<Vec<TrajectoryPoint>> {
        self.get_track(track_id)
            .map(|t| t.trajectory.iter().cloned().collect())
    }

    pub fn stats(&self) -> TrackerStats {
        self.stats.clone()
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Drop every track. Id allocation keeps counting.
    pub fn clear(&mut self) {
        self.stats.deleted_tracks += self.tracks.len() as u64;
        self.tracks.clear();
        self.stats.active_tracks = 0;
        self.stats.confirmed_tracks = 0;
    }
}
