use chrono::{DateTime, Duration, TimeZone, Utc};
use streamtrack_rs::integration::{StreamTrackingService, TrackingServiceConfig};
use streamtrack_rs::tracker::AssociationConfig;
use streamtrack_rs::{Detection, Error, Rect, TrackState, Tracker, TrackerConfig};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

fn person(id: &str, x: i32, y: i32, ts: DateTime<Utc>) -> Detection {
    Detection::new(id, "person", 0.9, Rect::new(x, y, 50, 100), ts)
}

fn scenario_config(max_age: u32) -> TrackerConfig {
    TrackerConfig {
        min_hits: 2,
        max_age,
        association: AssociationConfig {
            iou_threshold: 0.3,
            ..AssociationConfig::default()
        },
        ..TrackerConfig::default()
    }
}

#[test]
fn test_identity_across_frames() {
    let mut tracker = Tracker::new(scenario_config(30));
    let boxes = [(10, 20), (15, 25), (20, 30)];

    let mut ids = Vec::new();
    let mut states = Vec::new();
    for (i, (x, y)) in boxes.iter().enumerate() {
        let ts = t0() + Duration::seconds(i as i64);
        let tracks = tracker.update_at(&[person(&format!("d{i}"), *x, *y, ts)], &format!("f{i}"), ts);
        assert_eq!(tracks.len(), 1, "frame {i}");
        ids.push(tracks[0].track_id);
        states.push(tracks[0].state);
    }

    assert!(ids.iter().all(|id| *id == ids[0]));
    assert_eq!(
        states,
        vec![TrackState::Tentative, TrackState::Confirmed, TrackState::Confirmed]
    );

    let track = tracker.get_track(ids[0]).unwrap();
    assert!((track.velocity.vx - 5.0).abs() < 1e-6);
    assert!((track.velocity.vy - 5.0).abs() < 1e-6);
    assert_eq!(track.trajectory.len(), 3);
    assert_eq!(tracker.track_history(ids[0]).unwrap().len(), 3);
}

#[test]
fn test_separate_objects_get_separate_ids() {
    let mut tracker = Tracker::new(TrackerConfig::default());
    let ts = t0();
    let tracks = tracker.update_at(
        &[person("a", 0, 0, ts), person("b", 400, 300, ts)],
        "f0",
        ts,
    );
    assert_eq!(tracks.len(), 2);
    assert_ne!(tracks[0].track_id, tracks[1].track_id);

    let ts = ts + Duration::milliseconds(100);
    let tracks = tracker.update_at(
        &[person("b", 402, 301, ts), person("a", 2, 1, ts)],
        "f1",
        ts,
    );
    assert_eq!(tracks.len(), 2);
    // no births on the second frame
    assert_eq!(tracker.stats().total_tracks, 2);
}

#[test]
fn test_deletion_after_disappearance() {
    let service = StreamTrackingService::new(TrackingServiceConfig {
        tracker: scenario_config(2),
        ..TrackingServiceConfig::default()
    });
    service.start().unwrap();
    service.start_stream("cam").unwrap();

    let boxes = [(10, 20), (15, 25), (20, 30)];
    for (i, (x, y)) in boxes.iter().enumerate() {
        let ts = t0() + Duration::seconds(i as i64);
        service
            .process_detections_at("cam", &format!("f{i}"), &[person("d", *x, *y, ts)], ts)
            .unwrap();
    }
    assert_eq!(service.stream_tracks("cam").unwrap().len(), 1);

    let mut deleted_at = None;
    for empty in 1..=5 {
        let ts = t0() + Duration::seconds(2 + empty);
        let update = service
            .process_detections_at("cam", &format!("e{empty}"), &[], ts)
            .unwrap();
        if !update.lost_tracks.is_empty() {
            assert_eq!(update.lost_tracks[0].state, TrackState::Deleted);
            deleted_at.get_or_insert(empty);
        }
    }
    assert_eq!(deleted_at, Some(3));
    assert!(service.stream_tracks("cam").unwrap().is_empty());
}

#[test]
fn test_empty_update_ages_tracks() {
    let mut tracker = Tracker::new(TrackerConfig::default());
    let ts = t0();
    tracker.update_at(&[person("d", 10, 10, ts)], "f0", ts);

    let tracks = tracker.update_at(&[], "f1", ts + Duration::milliseconds(33));
    assert_eq!(tracks.len(), 1);
    assert_eq!(tracks[0].time_since_update, 1);
    assert_eq!(tracks[0].hit_streak, 0);
}

#[test]
fn test_service_lifecycle_round_trip() {
    let service = StreamTrackingService::new(TrackingServiceConfig::default());
    service.start().unwrap();
    assert!(matches!(service.start(), Err(Error::AlreadyRunning(_))));

    service.start_stream("cam").unwrap();
    service.stop().unwrap();
    assert!(!service.is_running());
    assert!(service.active_streams().is_empty());

    service.start().unwrap();
    service.start_stream("cam").unwrap();
    let ts = t0();
    let update = service
        .process_detections_at("cam", "f0", &[person("d", 0, 0, ts)], ts)
        .unwrap();
    assert_eq!(update.new_tracks.len(), 1);
}
