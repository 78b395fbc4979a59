//! Single object track for multi-object tracking.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tracker::detection::Detection;
use crate::tracker::kalman_filter::{KalmanFilter, KalmanState};
use crate::tracker::rect::Rect;
use crate::tracker::track_state::TrackState;

/// Object velocity in pixels per second.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Velocity {
    pub vx: f64,
    pub vy: f64,
}

impl Velocity {
    pub fn new(vx: f64, vy: f64) -> Self {
        Self { vx, vy }
    }

    #[inline]
    pub fn speed(&self) -> f64 {
        (self.vx * self.vx + self.vy * self.vy).sqrt()
    }
}

/// A point on a track's path, located at the bounding box center.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryPoint {
    pub x: f64,
    pub y: f64,
    pub timestamp: DateTime<Utc>,
    pub frame_id: String,
    pub velocity: Velocity,
}

impl TrajectoryPoint {
    pub fn distance_to(&self, other: &TrajectoryPoint) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

/// Filter output for one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub bbox: Rect,
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
    pub frame_id: String,
}

/// Bounded history sizes for a track.
#[derive(Debug, Clone, Copy)]
pub(crate) struct HistoryLimits {
    pub detections: usize,
    pub predictions: usize,
    pub trajectory: usize,
}

/// Single object track.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Track {
    /// Unique track identifier, monotonic per tracker
    pub track_id: u64,
    pub class: String,
    pub state: TrackState,
    /// Most recent associated detections, oldest first
    pub detections: VecDeque<Detection>,
    pub predictions: VecDeque<Prediction>,
    pub trajectory: VecDeque<TrajectoryPoint>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub last_detection: Detection,
    pub last_prediction: Option<Prediction>,
    /// Consecutive updates with an associated detection
    pub hit_streak: u32,
    /// Updates since the last associated detection
    pub time_since_update: u32,
    /// Updates since creation
    pub age: u32,
    pub confidence: f64,
    pub velocity: Velocity,
    /// Filter state; absent when prediction is disabled
    pub kalman: Option<KalmanState>,
}

impl Track {
    /// Create a new tentative track from an unassociated detection.
    pub(crate) fn new(
        track_id: u64,
        detection: &Detection,
        frame_id: &str,
        kalman_filter: Option<&KalmanFilter>,
        now: DateTime<Utc>,
    ) -> Self {
        let kalman = kalman_filter.map(|kf| kf.initiate(detection.bbox.to_cxcywh()));
        let (x, y) = detection.center();

        let mut trajectory = VecDeque::new();
        trajectory.push_back(TrajectoryPoint {
            x,
            y,
            timestamp: detection.timestamp,
            frame_id: frame_id.to_string(),
            velocity: Velocity::default(),
        });

        Self {
            track_id,
            class: detection.class.clone(),
            state: TrackState::Tentative,
            detections: VecDeque::from([detection.clone()]),
            predictions: VecDeque::new(),
            trajectory,
            first_seen: now,
            last_seen: now,
            last_detection: detection.clone(),
            last_prediction: None,
            hit_streak: 1,
            time_since_update: 0,
            age: 1,
            confidence: detection.confidence,
            velocity: Velocity::default(),
            kalman,
        }
    }

    /// Wire identifier, e.g. `track_7`.
    pub fn label(&self) -> String {
        format!("track_{}", self.track_id)
    }

    /// Last associated bounding box.
    #[inline]
    pub fn bbox(&self) -> Rect {
        self.last_detection.bbox
    }

    /// Where the track is expected to be this frame.
    pub fn predicted_bbox(&self) -> Rect {
        match &self.last_prediction {
            Some(prediction) if self.time_since_update > 0 => prediction.bbox,
            _ => self.bbox(),
        }
    }

    #[inline]
    pub fn is_confirmed(&self) -> bool {
        self.state.is_confirmed()
    }

    /// Advance the filter one step and age the track.
    pub(crate) fn predict(
        &mut self,
        kalman_filter: Option<&KalmanFilter>,
        frame_id: &str,
        now: DateTime<Utc>,
        limits: HistoryLimits,
    ) -> bool {
        let mut predicted = false;
        if let (Some(kf), Some(state)) = (kalman_filter, self.kalman.as_ref()) {
            let next = kf.predict(state);
            let [cx, cy, w, h] = next.measurement();
            let prediction = Prediction {
                bbox: Rect::from_center(cx, cy, w, h),
                confidence: self.confidence * 0.9,
                timestamp: now,
                frame_id: frame_id.to_string(),
            };
            self.kalman = Some(next);
            push_bounded(&mut self.predictions, prediction.clone(), limits.predictions);
            self.last_prediction = Some(prediction);
            predicted = true;
        }

        self.age += 1;
        self.time_since_update += 1;
        predicted
    }

    /// Apply an associated detection.
    pub(crate) fn update(
        &mut self,
        detection: &Detection,
        frame_id: &str,
        kalman_filter: Option<&KalmanFilter>,
        now: DateTime<Utc>,
        min_hits: u32,
        limits: HistoryLimits,
    ) {
        if let (Some(kf), Some(state)) = (kalman_filter, self.kalman.as_ref()) {
            self.kalman = Some(kf.update(state, detection.bbox.to_cxcywh()));
        }

        // Velocity from real elapsed time between detections, not frame count.
        if let Some(previous) = self.detections.back() {
            let dt = (detection.timestamp - previous.timestamp)
                .num_microseconds()
                .map(|us| us as f64 / 1e6)
                .unwrap_or(0.0);
            if dt > 0.0 {
                let (x1, y1) = previous.center();
                let (x2, y2) = detection.center();
                self.velocity = Velocity::new((x2 - x1) / dt, (y2 - y1) / dt);
            }
        }

        self.last_detection = detection.clone();
        self.last_seen = now;
        self.time_since_update = 0;
        self.hit_streak += 1;
        self.confidence = detection.confidence;

        push_bounded(&mut self.detections, detection.clone(), limits.detections);

        let (x, y) = detection.center();
        let is_ordered = self
            .trajectory
            .back()
            .is_none_or(|last| last.timestamp <= detection.timestamp);
        if is_ordered {
            push_bounded(
                &mut self.trajectory,
                TrajectoryPoint {
                    x,
                    y,
                    timestamp: detection.timestamp,
                    frame_id: frame_id.to_string(),
                    velocity: self.velocity,
                },
                limits.trajectory,
            );
        }

        if self.state == TrackState::Tentative && self.hit_streak >= min_hits {
            self.state = TrackState::Confirmed;
        }
    }

    /// Record a frame with no associated detection.
    pub(crate) fn mark_missed(&mut self) {
        self.hit_streak = 0;
        self.confidence *= 0.8;
    }

    pub(crate) fn mark_deleted(&mut self) {
        self.state = TrackState::Deleted;
    }
}

fn push_bounded<T>(buf: &mut VecDeque<T>, item: T, cap: usize) {
    buf.push_back(item);
    while buf.len() > cap {
        buf.pop_front();
    }
}
