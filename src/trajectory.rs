//! Per-track centroid history with smoothing, derived motion statistics and
//! short-horizon extrapolation.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::tracker::{Rect, TrajectoryPoint, Velocity};

/// Mean speed (px/s) below which a trajectory counts as stationary.
const STATIONARY_SPEED: f64 = 1.0;
/// Heading change (radians) that marks a turning point.
const TURN_THRESHOLD: f64 = std::f64::consts::FRAC_PI_4;
/// Points used to estimate velocity for extrapolation.
const PREDICTION_BASIS: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrajectoryConfig {
    pub max_length: usize,
    /// Points arriving sooner than this after the last stored point are dropped.
    pub sampling_interval: Duration,
    pub smoothing_window: usize,
    pub enable_prediction: bool,
    pub prediction_horizon: Duration,
    pub prediction_steps: usize,
    /// Points required before prediction and analysis run.
    pub min_length: usize,
}

impl Default for TrajectoryConfig {
    fn default() -> Self {
        Self {
            max_length: 1000,
            sampling_interval: Duration::from_millis(100),
            smoothing_window: 5,
            enable_prediction: true,
            prediction_horizon: Duration::from_secs(2),
            prediction_steps: 10,
            min_length: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrajectoryData {
    pub track_id: u64,
    pub points: VecDeque<TrajectoryPoint>,
    pub smoothed: Vec<TrajectoryPoint>,
    pub predictions: Vec<TrajectoryPoint>,
    pub total_distance: f64,
    pub average_velocity: Velocity,
    pub max_velocity: Velocity,
    /// Radians, from the first to the last stored point.
    pub direction: f64,
    pub is_stationary: bool,
    pub last_updated: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl TrajectoryData {
    fn new(track_id: u64, now: DateTime<Utc>) -> Self {
        Self {
            track_id,
            points: VecDeque::new(),
            smoothed: Vec::new(),
            predictions: Vec::new(),
            total_distance: 0.0,
            average_velocity: Velocity::default(),
            max_velocity: Velocity::default(),
            direction: 0.0,
            is_stationary: false,
            last_updated: now,
            created_at: now,
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn max_speed(&self) -> f64 {
        self.max_velocity.speed()
    }

    fn recompute_motion(&mut self) {
        if self.points.len() < 2 {
            return;
        }

        let mut total_distance = 0.0;
        let mut sum = Velocity::default();
        let mut samples = 0usize;
        let mut max_velocity = Velocity::default();

        for (prev, curr) in self.points.iter().zip(self.points.iter().skip(1)) {
            total_distance += prev.distance_to(curr);
            let dt = seconds_between(prev.timestamp, curr.timestamp);
            if dt > 0.0 {
                let v = Velocity::new((curr.x - prev.x) / dt, (curr.y - prev.y) / dt);
                sum.vx += v.vx;
                sum.vy += v.vy;
                samples += 1;
                if v.speed() > max_velocity.speed() {
                    max_velocity = v;
                }
            }
        }

        self.total_distance = total_distance;
        if samples > 0 {
            self.average_velocity = Velocity::new(sum.vx / samples as f64, sum.vy / samples as f64);
            self.max_velocity = max_velocity;
            self.is_stationary = self.average_velocity.speed() < STATIONARY_SPEED;
        }

        if let (Some(first), Some(last)) = (self.points.front(), self.points.back()) {
            self.direction = (last.y - first.y).atan2(last.x - first.x);
        }
    }

    fn smooth(&mut self, window: usize) {
        if window == 0 || self.points.len() < window {
            self.smoothed.clear();
            return;
        }

        let half = window / 2;
        let n = self.points.len();
        self.smoothed = (0..n)
            .map(|i| {
                let start = i.saturating_sub(half);
                let end = (i + half + 1).min(n);
                let (mut sx, mut sy) = (0.0, 0.0);
                for p in self.points.range(start..end) {
                    sx += p.x;
                    sy += p.y;
                }
                let count = (end - start) as f64;
                let src = &self.points[i];
                TrajectoryPoint {
                    x: sx / count,
                    y: sy / count,
                    timestamp: src.timestamp,
                    frame_id: src.frame_id.clone(),
                    velocity: src.velocity,
                }
            })
            .collect();
    }

    fn predict(&mut self, horizon: Duration, steps: usize) {
        self.predictions.clear();
        let n = self.points.len();
        if n < 2 || steps == 0 {
            return;
        }

        let basis = PREDICTION_BASIS.min(n);
        let (mut vx, mut vy, mut count) = (0.0, 0.0, 0usize);
        for i in (n - basis)..(n - 1) {
            let curr = &self.points[i];
            let next = &self.points[i + 1];
            let dt = seconds_between(curr.timestamp, next.timestamp);
            if dt > 0.0 {
                vx += (next.x - curr.x) / dt;
                vy += (next.y - curr.y) / dt;
                count += 1;
            }
        }
        if count == 0 {
            return;
        }
        vx /= count as f64;
        vy /= count as f64;

        let Some(last) = self.points.back() else {
            return;
        };
        let step_us = horizon.as_micros() as i64 / steps as i64;
        self.predictions = (1..=steps)
            .map(|i| {
                let offset_us = step_us * i as i64;
                let dt = offset_us as f64 / 1e6;
                TrajectoryPoint {
                    x: last.x + vx * dt,
                    y: last.y + vy * dt,
                    timestamp: last.timestamp + chrono::Duration::microseconds(offset_us),
                    frame_id: format!("pred_{i}"),
                    velocity: Velocity::new(vx, vy),
                }
            })
            .collect();
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrajectoryAnalysis {
    pub track_id: u64,
    pub total_distance: f64,
    pub average_speed: f64,
    pub max_speed: f64,
    pub direction: f64,
    pub is_stationary: bool,
    pub stationary_time: Duration,
    pub moving_time: Duration,
    pub turning_points: Vec<TrajectoryPoint>,
    pub predictions: Vec<TrajectoryPoint>,
    /// Smallest box containing every stored point.
    pub bounding_box: Rect,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrajectoryStats {
    pub active_trajectories: usize,
    pub total_trajectories: u64,
    pub total_points: u64,
    pub average_length: f64,
    pub longest_trajectory: usize,
    pub last_update: Option<DateTime<Utc>>,
}

/// Records trajectories for the tracks of one stream.
pub struct TrajectoryRecorder {
    trajectories: HashMap<u64, TrajectoryData>,
    config: TrajectoryConfig,
    stats: TrajectoryStats,
}

impl Default for TrajectoryRecorder {
    fn default() -> Self {
        Self::new(TrajectoryConfig::default())
    }
}

impl TrajectoryRecorder {
    pub fn new(config: TrajectoryConfig) -> Self {
        Self {
            trajectories: HashMap::new(),
            config,
            stats: TrajectoryStats::default(),
        }
    }

    /// Append a point for a track. Returns false when the point was dropped
    /// by the sampling interval or arrived out of order.
    pub fn record_point(&mut self, track_id: u64, point: TrajectoryPoint) -> bool {
        let now = Utc::now();
        let config = &self.config;
        let trajectory = self.trajectories.entry(track_id).or_insert_with(|| {
            self.stats.total_trajectories += 1;
            TrajectoryData::new(track_id, now)
        });

        if let Some(last) = trajectory.points.back() {
            let min_gap = chrono::Duration::from_std(config.sampling_interval)
                .unwrap_or(chrono::Duration::zero());
            if point.timestamp < last.timestamp || point.timestamp - last.timestamp < min_gap {
                return false;
            }
        }

        trajectory.points.push_back(point);
        while trajectory.points.len() > config.max_length.max(1) {
            trajectory.points.pop_front();
        }
        trajectory.last_updated = now;

        trajectory.recompute_motion();
        trajectory.smooth(config.smoothing_window);
        if config.enable_prediction && trajectory.points.len() >= config.min_length {
            trajectory.predict(config.prediction_horizon, config.prediction_steps);
        }

        self.stats.total_points += 1;
        self.stats.last_update = Some(now);
        true
    }

    /// Copy of a track's trajectory.
    pub fn trajectory(&self, track_id: u64) -> Option<TrajectoryData> {
        self.trajectories.get(&track_id).cloned()
    }

    pub fn analyze(&self, track_id: u64) -> Result<TrajectoryAnalysis> {
        let trajectory = self
            .trajectories
            .get(&track_id)
            .ok_or_else(|| Error::not_found(format!("trajectory for track {track_id}")))?;

        if trajectory.points.len() < self.config.min_length.max(1) {
            return Err(Error::validation(format!(
                "trajectory for track {track_id} has {} points, need {}",
                trajectory.points.len(),
                self.config.min_length
            )));
        }

        let (stationary_time, moving_time) = split_motion_time(&trajectory.points);
        let (start_time, end_time) = match (trajectory.points.front(), trajectory.points.back()) {
            (Some(first), Some(last)) => (first.timestamp, last.timestamp),
            _ => (trajectory.created_at, trajectory.last_updated),
        };

        Ok(TrajectoryAnalysis {
            track_id,
            total_distance: trajectory.total_distance,
            average_speed: trajectory.average_velocity.speed(),
            max_speed: trajectory.max_speed(),
            direction: trajectory.direction,
            is_stationary: trajectory.is_stationary,
            stationary_time,
            moving_time,
            turning_points: turning_points(&trajectory.points),
            predictions: trajectory.predictions.clone(),
            bounding_box: bounding_box(&trajectory.points),
            start_time,
            end_time,
        })
    }

    pub fn remove(&mut self, track_id: u64) -> bool {
        let removed = self.trajectories.remove(&track_id).is_some();
        if removed {
            debug!(track_id, "trajectory removed");
        }
        removed
    }

    pub fn active_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.trajectories.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn stats(&self) -> TrajectoryStats {
        let mut stats = self.stats.clone();
        stats.active_trajectories = self.trajectories.len();
        let lengths = self.trajectories.values().map(TrajectoryData::len);
        stats.longest_trajectory = lengths.clone().max().unwrap_or(0);
        stats.average_length = if self.trajectories.is_empty() {
            0.0
        } else {
            lengths.sum::<usize>() as f64 / self.trajectories.len() as f64
        };
        stats
    }

    pub fn clear(&mut self) {
        self.trajectories.clear();
    }
}

fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from)
        .num_microseconds()
        .map(|us| us as f64 / 1e6)
        .unwrap_or(0.0)
}

fn split_motion_time(points: &VecDeque<TrajectoryPoint>) -> (Duration, Duration) {
    let mut stationary = 0.0;
    let mut moving = 0.0;
    for (prev, curr) in points.iter().zip(points.iter().skip(1)) {
        let dt = seconds_between(prev.timestamp, curr.timestamp);
        if dt <= 0.0 {
            continue;
        }
        if prev.distance_to(curr) / dt < STATIONARY_SPEED {
            stationary += dt;
        } else {
            moving += dt;
        }
    }
    (
        Duration::from_secs_f64(stationary),
        Duration::from_secs_f64(moving),
    )
}

fn turning_points(points: &VecDeque<TrajectoryPoint>) -> Vec<TrajectoryPoint> {
    let mut turns = Vec::new();
    for i in 1..points.len().saturating_sub(1) {
        let (a, b, c) = (&points[i - 1], &points[i], &points[i + 1]);
        if a.distance_to(b) == 0.0 || b.distance_to(c) == 0.0 {
            continue;
        }
        let incoming = (b.y - a.y).atan2(b.x - a.x);
        let outgoing = (c.y - b.y).atan2(c.x - b.x);
        let mut delta = (outgoing - incoming).abs();
        if delta > std::f64::consts::PI {
            delta = 2.0 * std::f64::consts::PI - delta;
        }
        if delta > TURN_THRESHOLD {
            turns.push(b.clone());
        }
    }
    turns
}

fn bounding_box(points: &VecDeque<TrajectoryPoint>) -> Rect {
    let mut iter = points.iter();
    let Some(first) = iter.next() else {
        return Rect::default();
    };
    let (mut min_x, mut min_y, mut max_x, mut max_y) = (first.x, first.y, first.x, first.y);
    for p in iter {
        min_x = min_x.min(p.x);
        min_y = min_y.min(p.y);
        max_x = max_x.max(p.x);
        max_y = max_y.max(p.y);
    }
    Rect::from_tlbr(
        min_x.floor() as i32,
        min_y.floor() as i32,
        max_x.ceil() as i32,
        max_y.ceil() as i32,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(x: f64, y: f64, t: DateTime<Utc>) -> TrajectoryPoint {
        TrajectoryPoint {
            x,
            y,
            timestamp: t,
            frame_id: String::new(),
            velocity: Velocity::default(),
        }
    }

    fn at(base: DateTime<Utc>, millis: i64) -> DateTime<Utc> {
        base + chrono::Duration::milliseconds(millis)
    }

    #[test]
    fn test_sampling_interval_drops_close_points() {
        let t0 = Utc::now();
        let mut recorder = TrajectoryRecorder::default();
        assert!(recorder.record_point(1, point(0.0, 0.0, t0)));
        assert!(!recorder.record_point(1, point(1.0, 0.0, at(t0, 50))));
        assert!(recorder.record_point(1, point(1.0, 0.0, at(t0, 100))));
        assert!(!recorder.record_point(1, point(2.0, 0.0, at(t0, 0))));
        assert_eq!(recorder.trajectory(1).map(|t| t.len()), Some(2));
    }

    #[test]
    fn test_motion_statistics() {
        let t0 = Utc::now();
        let mut recorder = TrajectoryRecorder::default();
        for i in 0..4 {
            recorder.record_point(7, point(i as f64 * 10.0, 0.0, at(t0, i * 1000)));
        }
        let data = recorder.trajectory(7).unwrap();
        assert!((data.total_distance - 30.0).abs() < 1e-9);
        assert!((data.average_velocity.vx - 10.0).abs() < 1e-9);
        assert!(data.direction.abs() < 1e-9);
        assert!(!data.is_stationary);
    }

    #[test]
    fn test_stationary_flag() {
        let t0 = Utc::now();
        let mut recorder = TrajectoryRecorder::default();
        recorder.record_point(1, point(5.0, 5.0, t0));
        recorder.record_point(1, point(5.5, 5.0, at(t0, 1000)));
        assert!(recorder.trajectory(1).unwrap().is_stationary);
    }

    #[test]
    fn test_smoothing_needs_full_window() {
        let t0 = Utc::now();
        let mut recorder = TrajectoryRecorder::default();
        for i in 0..4 {
            recorder.record_point(1, point(i as f64, 0.0, at(t0, i * 200)));
        }
        assert!(recorder.trajectory(1).unwrap().smoothed.is_empty());

        recorder.record_point(1, point(10.0, 0.0, at(t0, 1000)));
        let data = recorder.trajectory(1).unwrap();
        assert_eq!(data.smoothed.len(), 5);
        // Center point averages the full window: (0+1+2+3+10)/5
        assert!((data.smoothed[2].x - 3.2).abs() < 1e-9);
        assert_eq!(data.smoothed[2].timestamp, data.points[2].timestamp);
    }

    #[test]
    fn test_prediction_extrapolates_recent_velocity() {
        let t0 = Utc::now();
        let mut recorder = TrajectoryRecorder::default();
        for i in 0..3 {
            recorder.record_point(1, point(i as f64 * 2.0, 0.0, at(t0, i * 1000)));
        }
        let data = recorder.trajectory(1).unwrap();
        assert_eq!(data.predictions.len(), 10);
        let last = data.predictions.last().unwrap();
        // 2 px/s for 2 s from x=4
        assert!((last.x - 8.0).abs() < 1e-6);
        assert_eq!(last.timestamp, at(t0, 4000));
    }

    #[test]
    fn test_max_length_evicts_oldest() {
        let t0 = Utc::now();
        let mut recorder = TrajectoryRecorder::new(TrajectoryConfig {
            max_length: 3,
            ..Default::default()
        });
        for i in 0..5 {
            recorder.record_point(1, point(i as f64, 0.0, at(t0, i * 200)));
        }
        let data = recorder.trajectory(1).unwrap();
        assert_eq!(data.len(), 3);
        assert_eq!(data.points[0].x, 2.0);
    }

    #[test]
    fn test_analyze_reports_turns_and_box() {
        let t0 = Utc::now();
        let mut recorder = TrajectoryRecorder::default();
        recorder.record_point(1, point(0.0, 0.0, t0));
        recorder.record_point(1, point(10.0, 0.0, at(t0, 1000)));
        recorder.record_point(1, point(10.0, 10.0, at(t0, 2000)));

        let analysis = recorder.analyze(1).unwrap();
        assert_eq!(analysis.turning_points.len(), 1);
        assert_eq!(analysis.turning_points[0].x, 10.0);
        assert_eq!(analysis.bounding_box, Rect::new(0, 0, 10, 10));
        assert_eq!(analysis.moving_time, Duration::from_secs(2));
    }

    #[test]
    fn test_analyze_errors() {
        let t0 = Utc::now();
        let mut recorder = TrajectoryRecorder::default();
        assert!(matches!(recorder.analyze(9), Err(Error::NotFound(_))));
        recorder.record_point(9, point(0.0, 0.0, t0));
        assert!(matches!(recorder.analyze(9), Err(Error::Validation(_))));
    }

    #[test]
    fn test_remove_and_stats() {
        let t0 = Utc::now();
        let mut recorder = TrajectoryRecorder::default();
        recorder.record_point(1, point(0.0, 0.0, t0));
        recorder.record_point(2, point(0.0, 0.0, t0));
        recorder.record_point(2, point(1.0, 0.0, at(t0, 500)));
        assert_eq!(recorder.active_ids(), vec![1, 2]);

        let stats = recorder.stats();
        assert_eq!(stats.total_trajectories, 2);
        assert_eq!(stats.longest_trajectory, 2);
        assert!((stats.average_length - 1.5).abs() < 1e-9);

        assert!(recorder.remove(1));
        assert!(!recorder.remove(1));
        assert_eq!(recorder.active_ids(), vec![2]);
    }
}
