//! Analytics and reports computed from persisted zone events.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::zones::zone::{ZoneEvent, ZoneEventType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// Inclusive on both ends.
    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        t >= self.start && t <= self.end
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneAnalytics {
    pub zone_id: String,
    pub time_range: TimeRange,
    pub total_detections: u64,
    pub unique_objects: u64,
    pub average_occupancy: f64,
    pub peak_occupancy: usize,
    pub peak_occupancy_time: Option<DateTime<Utc>>,
    pub object_class_breakdown: BTreeMap<String, u64>,
    pub hourly_distribution: BTreeMap<u32, u64>,
    pub dwell_time_distribution: BTreeMap<String, u64>,
    pub violation_count: u64,
    pub alert_count: u64,
    /// Zero when no exits were recorded.
    pub entry_exit_ratio: f64,
}

impl ZoneAnalytics {
    pub fn from_events(zone_id: &str, time_range: TimeRange, events: &[ZoneEvent]) -> Self {
        let mut analytics = Self {
            zone_id: zone_id.to_string(),
            time_range,
            total_detections: 0,
            unique_objects: 0,
            average_occupancy: 0.0,
            peak_occupancy: 0,
            peak_occupancy_time: None,
            object_class_breakdown: BTreeMap::new(),
            hourly_distribution: BTreeMap::new(),
            dwell_time_distribution: BTreeMap::new(),
            violation_count: 0,
            alert_count: 0,
            entry_exit_ratio: 0.0,
        };

        let mut ordered: Vec<&ZoneEvent> = events.iter().collect();
        ordered.sort_by_key(|e| e.timestamp);

        let mut unique = HashSet::new();
        let (mut entries, mut exits) = (0u64, 0u64);
        let mut occupancy = 0usize;
        let (mut occupancy_sum, mut occupancy_samples) = (0u64, 0u64);

        for event in ordered {
            analytics.total_detections += 1;
            unique.insert(event.object_id.as_str());
            *analytics
                .object_class_breakdown
                .entry(event.class.clone())
                .or_default() += 1;
            *analytics
                .hourly_distribution
                .entry(event.timestamp.hour())
                .or_default() += 1;

            match event.event_type {
                ZoneEventType::Violation => analytics.violation_count += 1,
                ZoneEventType::Entry | ZoneEventType::Exit | ZoneEventType::Loitering => {
                    analytics.alert_count += 1
                }
                _ => {}
            }

            if !event.dwell.is_zero() {
                *analytics
                    .dwell_time_distribution
                    .entry(dwell_bucket(event.dwell).to_string())
                    .or_default() += 1;
            }

            match event.event_type {
                ZoneEventType::Entry => {
                    entries += 1;
                    occupancy += 1;
                }
                ZoneEventType::Exit => {
                    exits += 1;
                    occupancy = occupancy.saturating_sub(1);
                }
                _ => continue,
            }
            occupancy_sum += occupancy as u64;
            occupancy_samples += 1;
            if occupancy > analytics.peak_occupancy {
                analytics.peak_occupancy = occupancy;
                analytics.peak_occupancy_time = Some(event.timestamp);
            }
        }

        analytics.unique_objects = unique.len() as u64;
        if occupancy_samples > 0 {
            analytics.average_occupancy = occupancy_sum as f64 / occupancy_samples as f64;
        }
        if exits > 0 {
            analytics.entry_exit_ratio = entries as f64 / exits as f64;
        }
        analytics
    }
}

/// Histogram bucket label for a dwell duration.
pub fn dwell_bucket(dwell: Duration) -> &'static str {
    match dwell.as_secs() / 60 {
        0 => "< 1 min",
        1..=4 => "1-5 min",
        5..=14 => "5-15 min",
        15..=29 => "15-30 min",
        30..=59 => "30-60 min",
        _ => "> 1 hour",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportType {
    Occupancy,
    Traffic,
    Violations,
    DwellTime,
    Summary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportData {
    Occupancy {
        average_occupancy: f64,
        peak_occupancy: usize,
        peak_occupancy_time: Option<DateTime<Utc>>,
        hourly_distribution: BTreeMap<u32, u64>,
    },
    Traffic {
        total_detections: u64,
        unique_objects: u64,
        object_class_breakdown: BTreeMap<String, u64>,
        entry_exit_ratio: f64,
    },
    Violations {
        violation_count: u64,
        alert_count: u64,
    },
    DwellTime {
        dwell_time_distribution: BTreeMap<String, u64>,
    },
    Summary {
        total_detections: u64,
        unique_objects: u64,
        average_occupancy: f64,
        peak_occupancy: usize,
        violation_count: u64,
        alert_count: u64,
        object_class_breakdown: BTreeMap<String, u64>,
        entry_exit_ratio: f64,
    },
}

impl ReportData {
    pub fn from_analytics(report_type: ReportType, a: &ZoneAnalytics) -> Self {
        match report_type {
            ReportType::Occupancy => ReportData::Occupancy {
                average_occupancy: a.average_occupancy,
                peak_occupancy: a.peak_occupancy,
                peak_occupancy_time: a.peak_occupancy_time,
                hourly_distribution: a.hourly_distribution.clone(),
            },
            ReportType::Traffic => ReportData::Traffic {
                total_detections: a.total_detections,
                unique_objects: a.unique_objects,
                object_class_breakdown: a.object_class_breakdown.clone(),
                entry_exit_ratio: a.entry_exit_ratio,
            },
            ReportType::Violations => ReportData::Violations {
                violation_count: a.violation_count,
                alert_count: a.alert_count,
            },
            ReportType::DwellTime => ReportData::DwellTime {
                dwell_time_distribution: a.dwell_time_distribution.clone(),
            },
            ReportType::Summary => ReportData::Summary {
                total_detections: a.total_detections,
                unique_objects: a.unique_objects,
                average_occupancy: a.average_occupancy,
                peak_occupancy: a.peak_occupancy,
                violation_count: a.violation_count,
                alert_count: a.alert_count,
                object_class_breakdown: a.object_class_breakdown.clone(),
                entry_exit_ratio: a.entry_exit_ratio,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneReport {
    pub report_id: Uuid,
    pub zone_id: String,
    pub report_type: ReportType,
    pub time_range: TimeRange,
    pub generated_at: DateTime<Utc>,
    pub data: ReportData,
}
