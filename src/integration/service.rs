//! Multi-stream supervisor owning one tracker and trajectory recorder per stream.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::metrics;
use crate::tracker::{Detection, Track, Tracker, TrackerConfig};
use crate::trajectory::{TrajectoryConfig, TrajectoryData, TrajectoryRecorder};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingServiceConfig {
    pub tracker: TrackerConfig,
    pub trajectory: TrajectoryConfig,
    pub enable_trajectories: bool,
    pub max_streams: usize,
}

impl Default for TrackingServiceConfig {
    fn default() -> Self {
        Self {
            tracker: TrackerConfig::default(),
            trajectory: TrajectoryConfig::default(),
            enable_trajectories: true,
            max_streams: 10,
        }
    }
}

/// Result of one `process_detections` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingUpdate {
    pub stream_id: String,
    pub frame_id: String,
    pub timestamp: DateTime<Utc>,
    /// Every non-deleted track after the update
    pub tracks: Vec<Track>,
    /// Tracks born this frame
    pub new_tracks: Vec<Track>,
    /// Tracks deleted this frame
    pub lost_tracks: Vec<Track>,
    pub process_time: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceStats {
    pub active_streams: usize,
    pub active_tracks: usize,
    pub total_detections: u64,
    pub processed_frames: u64,
    pub average_tracks_per_frame: f64,
    pub last_update: Option<DateTime<Utc>>,
}

/// Receives every tracking update. Invoked off the caller's task, one update
/// at a time and in the order the updates were produced.
pub type TrackingCallback = Arc<dyn Fn(TrackingUpdate) + Send + Sync>;

type SharedCallback = Arc<RwLock<Option<TrackingCallback>>>;

/// Queue feeding the single callback task.
struct Dispatcher {
    tx: mpsc::UnboundedSender<TrackingUpdate>,
    task: JoinHandle<()>,
}

impl Dispatcher {
    fn spawn(handle: &tokio::runtime::Handle, callback: SharedCallback) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<TrackingUpdate>();
        let task = handle.spawn(async move {
            while let Some(update) = rx.recv().await {
                let current = callback.read().clone();
                if let Some(callback) = current {
                    callback(update);
                }
            }
            debug!("tracking callback queue drained");
        });
        Self { tx, task }
    }
}

/// Per-stream state. The tracker lock serializes updates and gives readers a
/// consistent snapshot.
struct StreamTracker {
    tracker: RwLock<Tracker>,
    trajectories: RwLock<TrajectoryRecorder>,
    started_at: DateTime<Utc>,
}

pub struct StreamTrackingService {
    config: TrackingServiceConfig,
    streams: RwLock<HashMap<String, Arc<StreamTracker>>>,
    running: AtomicBool,
    callback: SharedCallback,
    dispatcher: Mutex<Option<Dispatcher>>,
    draining: Mutex<Option<JoinHandle<()>>>,
    stats: Mutex<ServiceStats>,
    total_tracks_seen: AtomicU64,
}

impl StreamTrackingService {
    pub fn new(config: TrackingServiceConfig) -> Self {
        Self {
            config,
            streams: RwLock::new(HashMap::new()),
            running: AtomicBool::new(false),
            callback: Arc::new(RwLock::new(None)),
            dispatcher: Mutex::new(None),
            draining: Mutex::new(None),
            stats: Mutex::new(ServiceStats::default()),
            total_tracks_seen: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &TrackingServiceConfig {
        &self.config
    }

    pub fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::already_running("tracking service"));
        }
        // Without a runtime the callback runs inline on the caller.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            *self.dispatcher.lock() = Some(Dispatcher::spawn(&handle, Arc::clone(&self.callback)));
        }
        info!(max_streams = self.config.max_streams, "tracking service started");
        Ok(())
    }

    /// Stop the service and release every stream.
    ///
    /// Updates already queued for the callback are still delivered; await
    /// [`drained`](Self::drained) to wait for them.
    pub fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(Error::not_running("tracking service"));
        }
        if let Some(dispatcher) = self.dispatcher.lock().take() {
            drop(dispatcher.tx);
            *self.draining.lock() = Some(dispatcher.task);
        }
        let streams: Vec<(String, Arc<StreamTracker>)> = self.streams.write().drain().collect();
        for (stream_id, stream) in &streams {
            stream.tracker.write().clear();
            stream.trajectories.write().clear();
            debug!(stream_id = %stream_id, "stream released");
        }
        metrics::set_active_streams(0);
        info!(released_streams = streams.len(), "tracking service stopped");
        Ok(())
    }

    /// Resolves once every update queued before [`stop`](Self::stop) has
    /// reached the callback.
    pub async fn drained(&self) {
        let task = self.draining.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "tracking callback task failed");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn set_tracking_callback(&self, callback: TrackingCallback) {
        *self.callback.write() = Some(callback);
    }

    pub fn start_stream(&self, stream_id: &str) -> Result<()> {
        if !self.is_running() {
            return Err(Error::not_running("tracking service"));
        }
        if stream_id.is_empty() {
            return Err(Error::validation("stream_id is required"));
        }

        let mut streams = self.streams.write();
        if streams.contains_key(stream_id) {
            return Err(Error::already_running(format!("stream {stream_id}")));
        }
        if streams.len() >= self.config.max_streams {
            return Err(Error::limit_exceeded(format!(
                "maximum number of streams ({}) reached",
                self.config.max_streams
            )));
        }
        streams.insert(
            stream_id.to_string(),
            Arc::new(StreamTracker {
                tracker: RwLock::new(Tracker::new(self.config.tracker.clone())),
                trajectories: RwLock::new(TrajectoryRecorder::new(self.config.trajectory.clone())),
                started_at: Utc::now(),
            }),
        );
        let active = streams.len();
        drop(streams);

        metrics::set_active_streams(active);
        info!(stream_id = %stream_id, active_streams = active, "stream tracking started");
        Ok(())
    }

    /// Release a stream's tracker and recorder. Unknown streams are ignored.
    pub fn stop_stream(&self, stream_id: &str) -> Result<()> {
        let (removed, active) = {
            let mut streams = self.streams.write();
            (streams.remove(stream_id), streams.len())
        };
        if let Some(stream) = removed {
            let tracks = stream.tracker.read().len();
            stream.tracker.write().clear();
            stream.trajectories.write().clear();
            metrics::set_active_streams(active);
            info!(
                stream_id = %stream_id,
                released_tracks = tracks,
                uptime_secs = (Utc::now() - stream.started_at).num_seconds(),
                "stream tracking stopped"
            );
        }
        Ok(())
    }

    pub fn process_detections(
        &self,
        stream_id: &str,
        frame_id: &str,
        detections: &[Detection],
    ) -> Result<TrackingUpdate> {
        self.process_detections_at(stream_id, frame_id, detections, Utc::now())
    }

    /// Run one tracker step for a stream at an explicit instant.
    pub fn process_detections_at(
        &self,
        stream_id: &str,
        frame_id: &str,
        detections: &[Detection],
        now: DateTime<Utc>,
    ) -> Result<TrackingUpdate> {
        let started = Instant::now();
        let stream = self.stream(stream_id)?;
        for detection in detections {
            detection.validate()?;
        }

        let (tracks, new_tracks, lost_tracks) = {
            let mut tracker = stream.tracker.write();
            let summary = tracker.step(detections, frame_id, now);
            let tracks = tracker.active_tracks();
            let new_tracks: Vec<Track> = tracks
                .iter()
                .filter(|t| summary.created.contains(&t.track_id))
                .cloned()
                .collect();

            if self.config.enable_trajectories {
                let mut recorder = stream.trajectories.write();
                for track in tracks.iter().filter(|t| t.time_since_update == 0) {
                    if let Some(point) = track.trajectory.back() {
                        recorder.record_point(track.track_id, point.clone());
                    }
                }
                for lost in &summary.deleted {
                    recorder.remove(lost.track_id);
                }
            }
            (tracks, new_tracks, summary.deleted)
        };

        let process_time = started.elapsed();
        self.record_stats(detections.len(), tracks.len(), now);
        metrics::record_tracks_created(new_tracks.len());
        metrics::record_tracks_deleted(lost_tracks.len());
        metrics::record_frame_processed(stream_id, process_time.as_secs_f64());

        let update = TrackingUpdate {
            stream_id: stream_id.to_string(),
            frame_id: frame_id.to_string(),
            timestamp: now,
            tracks,
            new_tracks,
            lost_tracks,
            process_time,
        };
        debug!(
            stream_id = %stream_id,
            frame_id = %frame_id,
            tracks = update.tracks.len(),
            new_tracks = update.new_tracks.len(),
            lost_tracks = update.lost_tracks.len(),
            "frame tracked"
        );

        self.notify(&update);
        Ok(update)
    }

    fn notify(&self, update: &TrackingUpdate) {
        let Some(callback) = self.callback.read().clone() else {
            return;
        };
        let update = update.clone();
        let pending = match self.dispatcher.lock().as_ref() {
            Some(dispatcher) => dispatcher.tx.send(update).err().map(|e| e.0),
            None => Some(update),
        };
        if let Some(update) = pending {
            callback(update);
        }
    }

    fn record_stats(&self, detections: usize, tracks: usize, now: DateTime<Utc>) {
        let seen = self
            .total_tracks_seen
            .fetch_add(tracks as u64, Ordering::Relaxed)
            + tracks as u64;
        let mut stats = self.stats.lock();
        stats.total_detections += detections as u64;
        stats.processed_frames += 1;
        stats.average_tracks_per_frame = seen as f64 / stats.processed_frames as f64;
        stats.last_update = Some(now);
    }

    fn stream(&self, stream_id: &str) -> Result<Arc<StreamTracker>> {
        self.streams
            .read()
            .get(stream_id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("stream {stream_id}")))
    }

    /// Every non-deleted track of a stream.
    pub fn stream_tracks(&self, stream_id: &str) -> Result<Vec<Track>> {
        Ok(self.stream(stream_id)?.tracker.read().active_tracks())
    }

    pub fn stream_trajectory(&self, stream_id: &str, track_id: u64) -> Result<TrajectoryData> {
        self.stream(stream_id)?
            .trajectories
            .read()
            .trajectory(track_id)
            .ok_or_else(|| {
                Error::not_found(format!("trajectory for track {track_id} in stream {stream_id}"))
            })
    }

    /// Sorted ids of the active streams.
    pub fn active_streams(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.streams.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn stats(&self) -> ServiceStats {
        let streams: Vec<Arc<StreamTracker>> = self.streams.read().values().cloned().collect();
        let mut stats = self.stats.lock().clone();
        stats.active_streams = streams.len();
        stats.active_tracks = streams.iter().map(|s| s.tracker.read().len()).sum();
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::Rect;
    use std::sync::atomic::AtomicUsize;

    fn running_service(max_streams: usize) -> StreamTrackingService {
        let service = StreamTrackingService::new(TrackingServiceConfig {
            max_streams,
            ..Default::default()
        });
        service.start().unwrap();
        service
    }

    fn det(x: i32, t: DateTime<Utc>) -> Detection {
        Detection::new("d", "person", 0.9, Rect::new(x, 0, 50, 100), t)
    }

    #[test]
    fn test_lifecycle_errors() {
        let service = StreamTrackingService::new(TrackingServiceConfig::default());
        assert!(matches!(service.start_stream("a"), Err(Error::NotRunning(_))));
        assert!(matches!(service.stop(), Err(Error::NotRunning(_))));
        service.start().unwrap();
        assert!(matches!(service.start(), Err(Error::AlreadyRunning(_))));
        service.stop().unwrap();
    }

    #[test]
    fn test_stream_limit_and_duplicates() {
        let service = running_service(2);
        service.start_stream("a").unwrap();
        assert!(matches!(service.start_stream("a"), Err(Error::AlreadyRunning(_))));
        service.start_stream("b").unwrap();
        assert!(matches!(service.start_stream("c"), Err(Error::LimitExceeded(_))));
        service.stop_stream("a").unwrap();
        service.start_stream("c").unwrap();
        assert_eq!(service.active_streams(), vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn test_unknown_stream_not_found() {
        let service = running_service(2);
        assert!(matches!(
            service.process_detections("nope", "f", &[]),
            Err(Error::NotFound(_))
        ));
        assert!(service.stop_stream("nope").is_ok());
    }

    #[test]
    fn test_invalid_detection_rejected_before_tracking() {
        let service = running_service(2);
        service.start_stream("a").unwrap();
        let mut bad = det(0, Utc::now());
        bad.confidence = -0.1;
        assert!(matches!(
            service.process_detections("a", "f", &[bad]),
            Err(Error::Validation(_))
        ));
        assert!(service.stream_tracks("a").unwrap().is_empty());
    }

    #[test]
    fn test_update_reports_new_and_lost_tracks() {
        let service = StreamTrackingService::new(TrackingServiceConfig {
            tracker: TrackerConfig {
                max_age: 1,
                ..Default::default()
            },
            ..Default::default()
        });
        service.start().unwrap();
        service.start_stream("a").unwrap();

        let t0 = Utc::now();
        let first = service.process_detections_at("a", "f1", &[det(0, t0)], t0).unwrap();
        assert_eq!(first.new_tracks.len(), 1);
        assert!(first.lost_tracks.is_empty());
        let id = first.new_tracks[0].track_id;
        assert!(service.stream_trajectory("a", id).is_ok());

        let t1 = t0 + chrono::Duration::seconds(1);
        service.process_detections_at("a", "f2", &[], t1).unwrap();
        let t2 = t0 + chrono::Duration::seconds(2);
        let gone = service.process_detections_at("a", "f3", &[], t2).unwrap();
        assert_eq!(gone.lost_tracks.len(), 1);
        assert!(gone.tracks.is_empty());
        assert!(service.stream_trajectory("a", id).is_err());

        let stats = service.stats();
        assert_eq!(stats.processed_frames, 3);
        assert_eq!(stats.total_detections, 1);
        assert_eq!(stats.active_streams, 1);
    }

    #[test]
    fn test_callback_runs_inline_without_runtime() {
        let service = running_service(1);
        service.start_stream("a").unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        service.set_tracking_callback(Arc::new(move |update: TrackingUpdate| {
            assert_eq!(update.stream_id, "a");
            seen.fetch_add(1, Ordering::SeqCst);
        }));
        service.process_detections("a", "f1", &[det(0, Utc::now())]).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_callback_spawned_on_runtime() {
        let service = running_service(1);
        service.start_stream("a").unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        service.set_tracking_callback(Arc::new(move |update: TrackingUpdate| {
            let _ = tx.send(update.frame_id);
        }));
        service.process_detections("a", "f9", &[]).unwrap();
        assert_eq!(rx.recv().await.as_deref(), Some("f9"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_callbacks_arrive_in_frame_order() {
        let service = running_service(1);
        service.start_stream("a").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        service.set_tracking_callback(Arc::new(move |update: TrackingUpdate| {
            let n: usize = update.frame_id.parse().unwrap();
            if n % 2 == 0 {
                std::thread::sleep(Duration::from_millis(2));
            }
            sink.lock().push(n);
        }));

        for n in 0..50 {
            service
                .process_detections("a", &n.to_string(), &[det(n as i32, Utc::now())])
                .unwrap();
        }
        service.stop().unwrap();
        service.drained().await;

        assert_eq!(*seen.lock(), (0..50).collect::<Vec<usize>>());
    }
}
