//! Zone rule evaluation and per-object presence tracking.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::metrics;
use crate::tracker::{Detection, Rect};
use crate::zones::analytics::{ReportData, ReportType, TimeRange, ZoneAnalytics, ZoneReport};
use crate::zones::polygon::Point;
use crate::zones::repository::ZoneRepository;
use crate::zones::statistics::ZoneStatistics;
use crate::zones::zone::{Zone, ZoneEvent, ZoneEventType, ZoneType};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneEngineConfig {
    /// Presences unseen for longer than this are collected.
    pub stale_threshold: Duration,
    pub gc_interval: Duration,
    /// Movement below this many pixels since entry counts as stationary.
    pub stationary_tolerance: f64,
    pub dwell_ema_alpha: f64,
    pub enable_realtime_processing: bool,
}

impl Default for ZoneEngineConfig {
    fn default() -> Self {
        Self {
            stale_threshold: Duration::from_secs(30),
            gc_interval: Duration::from_secs(10),
            stationary_tolerance: 5.0,
            dwell_ema_alpha: 0.1,
            enable_realtime_processing: true,
        }
    }
}

impl ZoneEngineConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.dwell_ema_alpha > 0.0 && self.dwell_ema_alpha <= 1.0) {
            return Err(Error::validation("dwell_ema_alpha must be in (0, 1]"));
        }
        if self.stationary_tolerance < 0.0 {
            return Err(Error::validation("stationary_tolerance must be non-negative"));
        }
        if self.gc_interval.is_zero() {
            return Err(Error::validation("gc_interval must be positive"));
        }
        Ok(())
    }
}

/// An object currently inside a zone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectPresence {
    pub object_id: String,
    pub zone_id: String,
    pub entry_time: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub position: Point,
    pub entry_position: Point,
    pub bbox: Rect,
    pub class: String,
    pub confidence: f64,
    #[serde(with = "crate::zones::zone::duration_secs")]
    pub dwell: Duration,
    pub loitering_fired: bool,
    pub violation_fired: bool,
}

impl ObjectPresence {
    fn is_stationary(&self, tolerance: f64) -> bool {
        self.position.distance_to(&self.entry_position) < tolerance
    }
}

/// Evaluates detections against the zones of each stream.
///
/// Lock order is zones, then occupancy, then statistics. Evaluation never
/// holds a lock across an await; the repository is only touched from the
/// async entry points.
pub struct ZoneEngine {
    config: ZoneEngineConfig,
    repository: Arc<dyn ZoneRepository>,
    zones: RwLock<HashMap<String, Arc<Zone>>>,
    loaded_streams: RwLock<HashSet<String>>,
    /// zone_id -> object_id -> presence
    occupancy: Mutex<HashMap<String, HashMap<String, ObjectPresence>>>,
    statistics: Mutex<HashMap<String, ZoneStatistics>>,
}

/// What a single detection did to one zone's presence set.
enum Transition {
    Entered,
    Stayed,
    Exited(ObjectPresence),
    None,
}

impl ZoneEngine {
    pub fn new(repository: Arc<dyn ZoneRepository>, config: ZoneEngineConfig) -> Self {
        Self {
            config,
            repository,
            zones: RwLock::new(HashMap::new()),
            loaded_streams: RwLock::new(HashSet::new()),
            occupancy: Mutex::new(HashMap::new()),
            statistics: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ZoneEngineConfig {
        &self.config
    }

    // ----------------------------------------------------------------- CRUD

    pub async fn create_zone(&self, mut zone: Zone) -> Result<Zone> {
        zone.validate()?;
        if zone.zone_id.is_empty() {
            zone.zone_id = Uuid::new_v4().to_string();
        }
        let now = Utc::now();
        zone.created_at = now;
        zone.updated_at = now;

        self.repository.create_zone(&zone).await?;
        let stats = ZoneStatistics::new(&zone.zone_id, &zone.stream_id);
        if let Err(e) = self.repository.update_zone_statistics(&stats).await {
            warn!(zone_id = %zone.zone_id, error = %e, "failed to persist initial zone statistics");
        }

        self.cache_zone(zone.clone());
        self.statistics.lock().insert(zone.zone_id.clone(), stats);
        info!(zone_id = %zone.zone_id, stream_id = %zone.stream_id, name = %zone.name, "zone created");
        Ok(zone)
    }

    pub async fn get_zone(&self, zone_id: &str) -> Result<Zone> {
        if let Some(zone) = self.zones.read().get(zone_id) {
            return Ok(zone.as_ref().clone());
        }
        let zone = self.repository.get_zone(zone_id).await?;
        self.cache_zone(zone.clone());
        Ok(zone)
    }

    /// Zones attached to a stream, loaded from the repository on first use.
    pub async fn zones_for_stream(&self, stream_id: &str) -> Result<Vec<Zone>> {
        self.ensure_stream_loaded(stream_id).await?;
        Ok(self
            .cached_zones(stream_id)
            .into_iter()
            .map(|z| z.as_ref().clone())
            .collect())
    }

    /// Replaces the zone definition. Current presences are kept.
    pub async fn update_zone(&self, mut zone: Zone) -> Result<Zone> {
        zone.validate()?;
        zone.updated_at = Utc::now();
        self.repository.update_zone(&zone).await?;
        self.cache_zone(zone.clone());
        info!(zone_id = %zone.zone_id, "zone updated");
        Ok(zone)
    }

    pub async fn delete_zone(&self, zone_id: &str) -> Result<()> {
        self.repository.delete_zone(zone_id).await?;
        self.zones.write().remove(zone_id);
        self.occupancy.lock().remove(zone_id);
        self.statistics.lock().remove(zone_id);
        info!(zone_id = %zone_id, "zone deleted");
        Ok(())
    }

    pub async fn list_zones(&self, limit: usize, offset: usize) -> Result<Vec<Zone>> {
        self.repository.list_zones(limit, offset).await
    }

    fn cache_zone(&self, zone: Zone) {
        self.zones.write().insert(zone.zone_id.clone(), Arc::new(zone));
    }

    async fn ensure_stream_loaded(&self, stream_id: &str) -> Result<()> {
        if self.loaded_streams.read().contains(stream_id) {
            return Ok(());
        }
        let zones = self.repository.zones_by_stream(stream_id).await?;
        {
            let mut cache = self.zones.write();
            for zone in zones {
                cache
                    .entry(zone.zone_id.clone())
                    .or_insert_with(|| Arc::new(zone));
            }
        }
        self.loaded_streams.write().insert(stream_id.to_string());
        debug!(stream_id = %stream_id, "zone cache warmed");
        Ok(())
    }

    /// Snapshot of the cached zones for a stream in creation order.
    fn cached_zones(&self, stream_id: &str) -> Vec<Arc<Zone>> {
        let mut zones: Vec<Arc<Zone>> = self
            .zones
            .read()
            .values()
            .filter(|z| z.stream_id == stream_id)
            .cloned()
            .collect();
        zones.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.zone_id.cmp(&b.zone_id))
        });
        zones
    }

    // ----------------------------------------------------------- Evaluation

    /// Evaluate a detection keyed by its own detection id.
    pub async fn process_detection(
        &self,
        stream_id: &str,
        detection: &Detection,
    ) -> Result<Vec<ZoneEvent>> {
        self.process_tracked(stream_id, &detection.detection_id, detection)
            .await
    }

    /// Evaluate a detection for an object with a stable identity, e.g. a track label.
    pub async fn process_tracked(
        &self,
        stream_id: &str,
        object_id: &str,
        detection: &Detection,
    ) -> Result<Vec<ZoneEvent>> {
        self.process_detection_at(stream_id, object_id, detection, Utc::now())
            .await
    }

    /// Like [`process_tracked`](Self::process_tracked), judged at the
    /// frame's own instant so replayed or late frames keep their timing.
    pub async fn process_detection_at(
        &self,
        stream_id: &str,
        object_id: &str,
        detection: &Detection,
        now: DateTime<Utc>,
    ) -> Result<Vec<ZoneEvent>> {
        self.ensure_stream_loaded(stream_id).await?;
        self.process_tracked_at(stream_id, object_id, detection, now)
    }

    /// Batch form of [`process_detection`](Self::process_detection). Failing
    /// detections are logged and skipped.
    pub async fn check_zone_violations(
        &self,
        stream_id: &str,
        detections: &[Detection],
    ) -> Result<Vec<ZoneEvent>> {
        self.ensure_stream_loaded(stream_id).await?;
        let now = Utc::now();
        let mut events = Vec::new();
        for detection in detections {
            match self.process_tracked_at(stream_id, &detection.detection_id, detection, now) {
                Ok(mut evs) => events.append(&mut evs),
                Err(e) => warn!(
                    stream_id = %stream_id,
                    detection_id = %detection.detection_id,
                    error = %e,
                    "skipping detection in zone evaluation"
                ),
            }
        }
        Ok(events)
    }

    /// Evaluate against cached zones at an explicit instant.
    pub fn process_tracked_at(
        &self,
        stream_id: &str,
        object_id: &str,
        detection: &Detection,
        now: DateTime<Utc>,
    ) -> Result<Vec<ZoneEvent>> {
        detection.validate()?;
        if !self.config.enable_realtime_processing {
            return Ok(Vec::new());
        }

        let zones = self.cached_zones(stream_id);
        if zones.is_empty() {
            return Ok(Vec::new());
        }

        let (cx, cy) = detection.center();
        let center = Point::new(cx, cy);
        let local = now.with_timezone(&Local).naive_local();

        let mut events = Vec::new();
        let mut occupancy = self.occupancy.lock();
        let mut statistics = self.statistics.lock();

        for zone in zones {
            if !zone.is_active {
                continue;
            }
            let in_zone = zone.polygon.contains(center);
            match zone.zone_type {
                ZoneType::Include if !in_zone => continue,
                ZoneType::Exclude if in_zone => continue,
                _ => {}
            }
            if !zone.rules.matches_class(&detection.class) {
                continue;
            }
            if detection.confidence < zone.rules.min_confidence {
                continue;
            }
            if !zone.rules.is_active_at(local) {
                continue;
            }

            let presences = occupancy.entry(zone.zone_id.clone()).or_default();
            let stats = statistics
                .entry(zone.zone_id.clone())
                .or_insert_with(|| ZoneStatistics::new(&zone.zone_id, &zone.stream_id));
            let ctx = EventContext {
                zone: &zone,
                object_id,
                detection,
                center,
                now,
            };
            self.evaluate_zone(&ctx, in_zone, presences, stats, &mut events);
        }
        drop(statistics);
        drop(occupancy);

        for event in &events {
            metrics::record_zone_event(event.event_type.as_str());
        }
        if !events.is_empty() {
            debug!(
                stream_id = %stream_id,
                object_id = %object_id,
                events = events.len(),
                "zone events produced"
            );
        }
        Ok(events)
    }

    fn evaluate_zone(
        &self,
        ctx: &EventContext<'_>,
        in_zone: bool,
        presences: &mut HashMap<String, ObjectPresence>,
        stats: &mut ZoneStatistics,
        events: &mut Vec<ZoneEvent>,
    ) {
        let rules = &ctx.zone.rules;
        let was_present = presences.contains_key(ctx.object_id);
        let transition = match (was_present, in_zone) {
            (false, false) => Transition::None,
            (false, true) => {
                presences.insert(
                    ctx.object_id.to_string(),
                    ObjectPresence {
                        object_id: ctx.object_id.to_string(),
                        zone_id: ctx.zone.zone_id.clone(),
                        entry_time: ctx.now,
                        last_seen: ctx.now,
                        position: ctx.center,
                        entry_position: ctx.center,
                        bbox: ctx.detection.bbox,
                        class: ctx.detection.class.clone(),
                        confidence: ctx.detection.confidence,
                        dwell: Duration::ZERO,
                        loitering_fired: false,
                        violation_fired: false,
                    },
                );
                Transition::Entered
            }
            (true, true) => {
                let Some(presence) = presences.get_mut(ctx.object_id) else {
                    return;
                };
                presence.last_seen = ctx.now;
                presence.position = ctx.center;
                presence.bbox = ctx.detection.bbox;
                presence.confidence = ctx.detection.confidence;
                presence.dwell = elapsed(presence.entry_time, ctx.now);

                let stationary = rules.ignore_stationary
                    && presence.is_stationary(self.config.stationary_tolerance);

                if rules.alert_on_loitering
                    && !rules.min_dwell.is_zero()
                    && presence.dwell >= rules.min_dwell
                    && !presence.loitering_fired
                    && !stationary
                {
                    presence.loitering_fired = true;
                    events.push(ctx.event(ZoneEventType::Loitering, presence.dwell));
                }

                if !rules.max_dwell.is_zero()
                    && presence.dwell >= rules.max_dwell
                    && !presence.violation_fired
                    && !stationary
                {
                    presence.violation_fired = true;
                    events.push(ctx.event(ZoneEventType::Violation, presence.dwell).with_metadata(
                        [
                            ("violation_type", serde_json::json!("max_dwell_exceeded")),
                            (
                                "max_dwell",
                                serde_json::json!(rules.max_dwell.as_secs_f64()),
                            ),
                        ],
                    ));
                }
                Transition::Stayed
            }
            (true, false) => match presences.remove(ctx.object_id) {
                Some(presence) => Transition::Exited(presence),
                None => Transition::None,
            },
        };

        match transition {
            Transition::None => return,
            Transition::Entered => {
                if rules.alert_on_entry {
                    events.push(ctx.event(ZoneEventType::Entry, Duration::ZERO));
                }
                if ctx.zone.zone_type == ZoneType::Count && rules.count_direction.counts_entries()
                {
                    events.push(
                        ctx.event(ZoneEventType::Count, Duration::ZERO)
                            .with_metadata([("direction", serde_json::json!("in"))]),
                    );
                }
                stats.record_entry(&ctx.detection.class, presences.len(), ctx.now);
            }
            Transition::Stayed => stats.set_occupancy(presences.len(), ctx.now),
            Transition::Exited(presence) => {
                let dwell = elapsed(presence.entry_time, ctx.now);
                if rules.alert_on_exit {
                    events.push(ctx.event(ZoneEventType::Exit, dwell));
                }
                if ctx.zone.zone_type == ZoneType::Count && rules.count_direction.counts_exits() {
                    events.push(
                        ctx.event(ZoneEventType::Count, dwell)
                            .with_metadata([("direction", serde_json::json!("out"))]),
                    );
                }
                if ctx.zone.zone_type == ZoneType::Monitor {
                    events.push(ctx.event(ZoneEventType::DwellTime, dwell));
                }
                stats.record_exit(
                    dwell,
                    presences.len(),
                    self.config.dwell_ema_alpha,
                    ctx.now,
                );
            }
        }

        let crowded = rules
            .crowding_limit()
            .is_some_and(|limit| !presences.is_empty() && presences.len() > limit);
        if rules.alert_on_crowding && crowded {
            events.push(ctx.event(ZoneEventType::Crowding, Duration::ZERO).with_metadata([
                ("current_occupancy", serde_json::json!(presences.len())),
                ("max_objects", serde_json::json!(rules.max_objects)),
            ]));
        }
    }

    /// Persist events; failures are logged and dropped.
    pub async fn record_events(&self, events: &[ZoneEvent]) {
        for event in events {
            if let Err(e) = self.repository.create_zone_event(event).await {
                error!(
                    zone_id = %event.zone_id,
                    event_type = event.event_type.as_str(),
                    error = %e,
                    "failed to store zone event"
                );
            }
        }
    }

    // ------------------------------------------------------------------- GC

    /// Remove presences not seen within the stale threshold, emitting a
    /// synthetic exit for each.
    pub fn collect_stale_at(&self, now: DateTime<Utc>) -> Vec<ZoneEvent> {
        let zones: HashMap<String, Arc<Zone>> = self.zones.read().clone();
        let mut occupancy = self.occupancy.lock();
        let mut statistics = self.statistics.lock();
        let mut events = Vec::new();

        for (zone_id, presences) in occupancy.iter_mut() {
            let stale: Vec<String> = presences
                .values()
                .filter(|p| elapsed(p.last_seen, now) > self.config.stale_threshold)
                .map(|p| p.object_id.clone())
                .collect();
            if stale.is_empty() {
                continue;
            }
            let Some(zone) = zones.get(zone_id) else {
                continue;
            };
            for object_id in stale {
                let Some(presence) = presences.remove(&object_id) else {
                    continue;
                };
                let dwell = elapsed(presence.entry_time, now);
                events.push(
                    ZoneEvent {
                        event_id: Uuid::new_v4(),
                        zone_id: zone_id.clone(),
                        stream_id: zone.stream_id.clone(),
                        event_type: ZoneEventType::Exit,
                        object_id: presence.object_id.clone(),
                        class: presence.class.clone(),
                        confidence: presence.confidence,
                        position: presence.position,
                        bbox: presence.bbox,
                        dwell,
                        metadata: BTreeMap::new(),
                        timestamp: now,
                    }
                    .with_metadata([("reason", serde_json::json!("stale"))]),
                );
                if let Some(stats) = statistics.get_mut(zone_id) {
                    stats.record_exit(dwell, presences.len(), self.config.dwell_ema_alpha, now);
                }
                debug!(zone_id = %zone_id, object_id = %object_id, "removed stale presence");
            }
        }
        for event in &events {
            metrics::record_zone_event(event.event_type.as_str());
        }
        events
    }

    /// Periodic stale-presence collection until `shutdown` turns true.
    pub async fn run_garbage_collector(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.gc_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval = ?self.config.gc_interval, "zone garbage collector started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let events = self.collect_stale_at(Utc::now());
                    if !events.is_empty() {
                        info!(removed = events.len(), "collected stale zone presences");
                        self.record_events(&events).await;
                    }
                    self.persist_statistics().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("zone garbage collector stopped");
    }

    async fn persist_statistics(&self) {
        let snapshot: Vec<ZoneStatistics> = self.statistics.lock().values().cloned().collect();
        for stats in snapshot {
            if let Err(e) = self.repository.update_zone_statistics(&stats).await {
                warn!(zone_id = %stats.zone_id, error = %e, "failed to persist zone statistics");
            }
        }
    }

    // ------------------------------------------------------------ Queries

    pub fn occupancy(&self, zone_id: &str) -> Vec<ObjectPresence> {
        let mut presences: Vec<ObjectPresence> = self
            .occupancy
            .lock()
            .get(zone_id)
            .map(|p| p.values().cloned().collect())
            .unwrap_or_default();
        presences.sort_by(|a, b| a.entry_time.cmp(&b.entry_time));
        presences
    }

    pub async fn zone_statistics(&self, zone_id: &str) -> Result<ZoneStatistics> {
        if let Some(stats) = self.statistics.lock().get(zone_id) {
            return Ok(stats.clone());
        }
        self.repository.zone_statistics(zone_id).await
    }

    pub async fn zone_analytics(&self, zone_id: &str, range: TimeRange) -> Result<ZoneAnalytics> {
        let events = self
            .repository
            .zone_events_in_range(zone_id, range.start, range.end)
            .await?;
        Ok(ZoneAnalytics::from_events(zone_id, range, &events))
    }

    pub async fn generate_report(
        &self,
        zone_id: &str,
        report_type: ReportType,
        range: TimeRange,
    ) -> Result<ZoneReport> {
        let analytics = self.zone_analytics(zone_id, range).await?;
        Ok(ZoneReport {
            report_id: Uuid::new_v4(),
            zone_id: zone_id.to_string(),
            report_type,
            time_range: range,
            generated_at: Utc::now(),
            data: ReportData::from_analytics(report_type, &analytics),
        })
    }
}

struct EventContext<'a> {
    zone: &'a Zone,
    object_id: &'a str,
    detection: &'a Detection,
    center: Point,
    now: DateTime<Utc>,
}

impl EventContext<'_> {
    fn event(&self, event_type: ZoneEventType, dwell: Duration) -> ZoneEvent {
        ZoneEvent {
            event_id: Uuid::new_v4(),
            zone_id: self.zone.zone_id.clone(),
            stream_id: self.zone.stream_id.clone(),
            event_type,
            object_id: self.object_id.to_string(),
            class: self.detection.class.clone(),
            confidence: self.detection.confidence,
            position: self.center,
            bbox: self.detection.bbox,
            dwell,
            metadata: BTreeMap::new(),
            timestamp: self.now,
        }
    }
}

impl ZoneEvent {
    fn with_metadata<const N: usize>(
        mut self,
        entries: [(&str, serde_json::Value); N],
    ) -> Self {
        for (key, value) in entries {
            self.metadata.insert(key.to_string(), value);
        }
        self
    }
}

/// Non-negative elapsed time between two instants.
fn elapsed(from: DateTime<Utc>, to: DateTime<Utc>) -> Duration {
    (to - from).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zones::polygon::Polygon;
    use crate::zones::repository::InMemoryZoneRepository;
    use crate::zones::zone::{CountDirection, ZoneRules};
    use chrono::Duration as ChronoDuration;

    fn engine() -> ZoneEngine {
        ZoneEngine::new(
            Arc::new(InMemoryZoneRepository::new()),
            ZoneEngineConfig::default(),
        )
    }

    fn square_zone(zone_type: ZoneType, rules: ZoneRules) -> Zone {
        Zone::new(
            "cam",
            "square",
            zone_type,
            Polygon::rectangle(0.0, 0.0, 10.0, 10.0).unwrap(),
        )
        .with_rules(rules)
    }

    fn at(cx: i32, cy: i32, t: DateTime<Utc>) -> Detection {
        Detection::new("d", "person", 0.9, Rect::new(cx - 2, cy - 2, 4, 4), t)
    }

    fn kinds(events: &[ZoneEvent]) -> Vec<ZoneEventType> {
        events.iter().map(|e| e.event_type).collect()
    }

    #[tokio::test]
    async fn test_loitering_fires_once_per_presence() {
        let engine = engine();
        engine
            .create_zone(square_zone(
                ZoneType::Alert,
                ZoneRules {
                    alert_on_loitering: true,
                    min_dwell: Duration::from_secs(2),
                    ..Default::default()
                },
            ))
            .await
            .unwrap();
        let t0 = Utc::now();
        for s in 0..6 {
            let t = t0 + ChronoDuration::seconds(s);
            let events = engine.process_tracked_at("cam", "o1", &at(5, 5, t), t).unwrap();
            let expected = if s == 2 { vec![ZoneEventType::Loitering] } else { vec![] };
            assert_eq!(kinds(&events), expected, "at t={s}");
        }
    }

    #[tokio::test]
    async fn test_violation_carries_metadata() {
        let engine = engine();
        engine
            .create_zone(square_zone(
                ZoneType::Restricted,
                ZoneRules {
                    max_dwell: Duration::from_secs(3),
                    ..Default::default()
                },
            ))
            .await
            .unwrap();
        let t0 = Utc::now();
        engine.process_tracked_at("cam", "o1", &at(5, 5, t0), t0).unwrap();
        let t = t0 + ChronoDuration::seconds(3);
        let events = engine.process_tracked_at("cam", "o1", &at(6, 6, t), t).unwrap();
        assert_eq!(kinds(&events), vec![ZoneEventType::Violation]);
        assert_eq!(events[0].metadata["max_dwell"], serde_json::json!(3.0));
        assert_eq!(events[0].dwell, Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_ignore_stationary_suppresses_loitering() {
        let engine = engine();
        engine
            .create_zone(square_zone(
                ZoneType::Alert,
                ZoneRules {
                    alert_on_loitering: true,
                    min_dwell: Duration::from_secs(1),
                    ignore_stationary: true,
                    ..Default::default()
                },
            ))
            .await
            .unwrap();
        let t0 = Utc::now();
        engine.process_tracked_at("cam", "o1", &at(2, 2, t0), t0).unwrap();
        let t1 = t0 + ChronoDuration::seconds(2);
        assert!(engine.process_tracked_at("cam", "o1", &at(3, 2, t1), t1).unwrap().is_empty());
        let t2 = t0 + ChronoDuration::seconds(3);
        let events = engine.process_tracked_at("cam", "o1", &at(8, 8, t2), t2).unwrap();
        assert_eq!(kinds(&events), vec![ZoneEventType::Loitering]);
    }

    #[tokio::test]
    async fn test_include_zone_ignores_outside_detections() {
        let engine = engine();
        engine
            .create_zone(square_zone(
                ZoneType::Include,
                ZoneRules {
                    alert_on_entry: true,
                    alert_on_exit: true,
                    ..Default::default()
                },
            ))
            .await
            .unwrap();
        let t0 = Utc::now();
        let events = engine.process_tracked_at("cam", "o1", &at(5, 5, t0), t0).unwrap();
        assert_eq!(kinds(&events), vec![ZoneEventType::Entry]);
        let events = engine
            .process_tracked_at("cam", "o1", &at(50, 50, t0), t0)
            .unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_count_and_monitor_events() {
        let engine = engine();
        let count = engine
            .create_zone(square_zone(
                ZoneType::Count,
                ZoneRules {
                    count_direction: CountDirection::Out,
                    ..Default::default()
                },
            ))
            .await
            .unwrap();
        engine
            .create_zone(square_zone(ZoneType::Monitor, ZoneRules::default()))
            .await
            .unwrap();
        let t0 = Utc::now();
        assert!(engine.process_tracked_at("cam", "o1", &at(5, 5, t0), t0).unwrap().is_empty());
        let t1 = t0 + ChronoDuration::seconds(4);
        let events = engine.process_tracked_at("cam", "o1", &at(40, 40, t1), t1).unwrap();
        let mut got = kinds(&events);
        got.sort_by_key(|k| k.as_str());
        assert_eq!(got, vec![ZoneEventType::Count, ZoneEventType::DwellTime]);
        let count_event = events.iter().find(|e| e.zone_id == count.zone_id).unwrap();
        assert_eq!(count_event.metadata["direction"], "out");
        assert!(events.iter().all(|e| e.dwell == Duration::from_secs(4)));
    }

    #[tokio::test]
    async fn test_class_and_confidence_filters() {
        let engine = engine();
        engine
            .create_zone(square_zone(
                ZoneType::Alert,
                ZoneRules {
                    classes: vec!["car".into()],
                    min_confidence: 0.5,
                    alert_on_entry: true,
                    ..Default::default()
                },
            ))
            .await
            .unwrap();
        let t = Utc::now();
        assert!(engine.process_tracked_at("cam", "p", &at(5, 5, t), t).unwrap().is_empty());
        let mut weak_car = at(5, 5, t);
        weak_car.class = "car".into();
        weak_car.confidence = 0.4;
        assert!(engine.process_tracked_at("cam", "c", &weak_car, t).unwrap().is_empty());
        weak_car.confidence = 0.6;
        assert_eq!(
            kinds(&engine.process_tracked_at("cam", "c", &weak_car, t).unwrap()),
            vec![ZoneEventType::Entry]
        );
    }

    #[tokio::test]
    async fn test_invalid_detection_rejected() {
        let engine = engine();
        let mut det = at(5, 5, Utc::now());
        det.confidence = 1.5;
        assert!(matches!(
            engine.process_tracked_at("cam", "o", &det, Utc::now()),
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_stale_presences_collected() {
        let engine = engine();
        let zone = engine
            .create_zone(square_zone(ZoneType::Alert, ZoneRules::default()))
            .await
            .unwrap();
        let t0 = Utc::now();
        engine.process_tracked_at("cam", "o1", &at(5, 5, t0), t0).unwrap();
        assert!(engine.collect_stale_at(t0 + ChronoDuration::seconds(30)).is_empty());

        let later = t0 + ChronoDuration::seconds(31);
        let events = engine.collect_stale_at(later);
        assert_eq!(kinds(&events), vec![ZoneEventType::Exit]);
        assert_eq!(events[0].metadata["reason"], "stale");
        assert_eq!(events[0].dwell, Duration::from_secs(31));
        assert!(engine.occupancy(&zone.zone_id).is_empty());

        let stats = engine.zone_statistics(&zone.zone_id).await.unwrap();
        assert_eq!(stats.total_entries, 1);
        assert_eq!(stats.total_exits, 1);
        assert_eq!(stats.current_occupancy, 0);
    }

    #[tokio::test]
    async fn test_delete_zone_drops_state() {
        let engine = engine();
        let zone = engine
            .create_zone(square_zone(ZoneType::Alert, ZoneRules::default()))
            .await
            .unwrap();
        let t = Utc::now();
        engine.process_tracked_at("cam", "o1", &at(5, 5, t), t).unwrap();
        engine.delete_zone(&zone.zone_id).await.unwrap();
        assert!(engine.occupancy(&zone.zone_id).is_empty());
        assert!(engine.get_zone(&zone.zone_id).await.is_err());
        assert!(engine.zones_for_stream("cam").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_zone_rejects_bad_rules() {
        let engine = engine();
        let zone = square_zone(
            ZoneType::Alert,
            ZoneRules {
                min_confidence: -0.5,
                ..Default::default()
            },
        );
        assert!(matches!(
            engine.create_zone(zone).await,
            Err(Error::Validation(_))
        ));
    }
}
