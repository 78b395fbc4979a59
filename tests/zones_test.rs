use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use streamtrack_rs::zones::{
    InMemoryZoneRepository, Point, Polygon, Zone, ZoneEngine, ZoneEngineConfig, ZoneEvent,
    ZoneEventType, ZoneRules, ZoneType,
};
use streamtrack_rs::{Detection, Rect};

fn engine() -> ZoneEngine {
    ZoneEngine::new(
        Arc::new(InMemoryZoneRepository::new()),
        ZoneEngineConfig::default(),
    )
}

fn at_secs(s: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap() + chrono::Duration::seconds(s)
}

fn centered(class: &str, cx: i32, cy: i32, ts: DateTime<Utc>) -> Detection {
    Detection::new("det", class, 0.9, Rect::new(cx - 2, cy - 2, 4, 4), ts)
}

fn kinds(events: &[ZoneEvent]) -> Vec<ZoneEventType> {
    events.iter().map(|e| e.event_type).collect()
}

async fn square(engine: &ZoneEngine, rules: ZoneRules) -> Zone {
    let polygon = Polygon::new(
        [(0.0, 0.0), (10.0, 0.0), (10.0, 10.0), (0.0, 10.0)]
            .into_iter()
            .map(|(x, y)| Point::new(x, y))
            .collect(),
    )
    .unwrap();
    engine
        .create_zone(Zone::new("cam", "square", ZoneType::Alert, polygon).with_rules(rules))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_entry_loitering_exit() {
    let engine = engine();
    square(
        &engine,
        ZoneRules {
            alert_on_entry: true,
            alert_on_loitering: true,
            alert_on_exit: true,
            min_dwell: Duration::from_secs(2),
            ..ZoneRules::default()
        },
    )
    .await;

    let mut timeline = Vec::new();
    for (s, (cx, cy)) in [(0, (5, 5)), (3, (5, 5)), (4, (50, 50))] {
        let ts = at_secs(s);
        let events = engine
            .process_tracked_at("cam", "track_1", &centered("person", cx, cy, ts), ts)
            .unwrap();
        timeline.extend(events.into_iter().map(|e| (s, e)));
    }

    let observed: Vec<(i64, ZoneEventType)> =
        timeline.iter().map(|(s, e)| (*s, e.event_type)).collect();
    assert_eq!(
        observed,
        vec![
            (0, ZoneEventType::Entry),
            (3, ZoneEventType::Loitering),
            (4, ZoneEventType::Exit),
        ]
    );
    assert_eq!(timeline[2].1.dwell, Duration::from_secs(4));
    assert_eq!(timeline[2].1.object_id, "track_1");
}

#[tokio::test]
async fn test_crowding_reports_occupancy() {
    let engine = engine();
    square(
        &engine,
        ZoneRules {
            alert_on_entry: true,
            alert_on_crowding: true,
            max_objects: 2,
            ..ZoneRules::default()
        },
    )
    .await;

    let mut per_second = Vec::new();
    for (s, object) in ["a", "b", "c"].into_iter().enumerate() {
        let ts = at_secs(s as i64);
        let events = engine
            .process_tracked_at("cam", object, &centered("person", 5, 5, ts), ts)
            .unwrap();
        per_second.push(events);
    }

    assert_eq!(kinds(&per_second[0]), vec![ZoneEventType::Entry]);
    assert_eq!(kinds(&per_second[1]), vec![ZoneEventType::Entry]);
    assert_eq!(
        kinds(&per_second[2]),
        vec![ZoneEventType::Entry, ZoneEventType::Crowding]
    );
    let crowding = &per_second[2][1];
    assert_eq!(crowding.metadata["current_occupancy"], serde_json::json!(3));
    assert_eq!(crowding.metadata["max_objects"], serde_json::json!(2));
    assert_eq!(engine.occupancy(&crowding.zone_id).len(), 3);
}

#[tokio::test]
async fn test_max_objects_zero_crowds_on_first_entry() {
    let engine = engine();
    square(
        &engine,
        ZoneRules {
            alert_on_crowding: true,
            max_objects: 0,
            ..ZoneRules::default()
        },
    )
    .await;
    let ts = at_secs(0);
    let events = engine
        .process_tracked_at("cam", "a", &centered("person", 5, 5, ts), ts)
        .unwrap();
    assert_eq!(kinds(&events), vec![ZoneEventType::Crowding]);
}

#[tokio::test]
async fn test_unlimited_zone_never_crowds() {
    let engine = engine();
    square(
        &engine,
        ZoneRules {
            alert_on_crowding: true,
            ..ZoneRules::default()
        },
    )
    .await;
    for (s, object) in ["a", "b", "c", "d", "e"].into_iter().enumerate() {
        let ts = at_secs(s as i64);
        let events = engine
            .process_tracked_at("cam", object, &centered("person", 5, 5, ts), ts)
            .unwrap();
        assert!(events.is_empty());
    }
}

#[tokio::test]
async fn test_class_filter() {
    let engine = engine();
    square(
        &engine,
        ZoneRules {
            alert_on_entry: true,
            classes: vec!["car".to_string()],
            ..ZoneRules::default()
        },
    )
    .await;
    let ts = at_secs(0);
    let ignored = engine
        .process_tracked_at("cam", "p", &centered("person", 5, 5, ts), ts)
        .unwrap();
    assert!(ignored.is_empty());
    let entered = engine
        .process_tracked_at("cam", "c", &centered("car", 5, 5, ts), ts)
        .unwrap();
    assert_eq!(kinds(&entered), vec![ZoneEventType::Entry]);
}

#[tokio::test]
async fn test_other_stream_is_untouched() {
    let engine = engine();
    square(
        &engine,
        ZoneRules {
            alert_on_entry: true,
            ..ZoneRules::default()
        },
    )
    .await;
    let ts = at_secs(0);
    let events = engine
        .process_tracked_at("other", "a", &centered("person", 5, 5, ts), ts)
        .unwrap();
    assert!(events.is_empty());
}
