//! Zone definitions, rules and the events zones produce.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Datelike, NaiveDateTime, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::tracker::Rect;
use crate::zones::polygon::{Point, Polygon};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoneType {
    /// Only detections inside are evaluated.
    Include,
    /// Only detections outside are evaluated.
    Exclude,
    Alert,
    /// Emits count events per the rules' count direction.
    Count,
    Restricted,
    /// Emits a dwell-time event on exit.
    Monitor,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CountDirection {
    /// Count entries.
    In,
    /// Count exits.
    Out,
    #[default]
    Both,
}

impl CountDirection {
    pub fn counts_entries(&self) -> bool {
        matches!(self, CountDirection::In | CountDirection::Both)
    }

    pub fn counts_exits(&self) -> bool {
        matches!(self, CountDirection::Out | CountDirection::Both)
    }
}

/// A daily window in local time. `end < start` wraps past midnight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRestriction {
    #[serde(with = "hhmm")]
    pub start: NaiveTime,
    #[serde(with = "hhmm")]
    pub end: NaiveTime,
    /// Days the window opens on; empty means every day.
    #[serde(default)]
    pub weekdays: Vec<Weekday>,
}

impl TimeRestriction {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self {
            start,
            end,
            weekdays: Vec::new(),
        }
    }

    pub fn on(mut self, weekdays: impl IntoIterator<Item = Weekday>) -> Self {
        self.weekdays = weekdays.into_iter().collect();
        self
    }

    fn opens_on(&self, day: Weekday) -> bool {
        self.weekdays.is_empty() || self.weekdays.contains(&day)
    }

    /// Whether `local` falls inside the window. For a wrapping window the
    /// after-midnight part belongs to the previous day's opening.
    pub fn contains(&self, local: NaiveDateTime) -> bool {
        let t = local.time();
        let day = local.weekday();
        if self.start == self.end {
            return self.opens_on(day);
        }
        if self.start < self.end {
            return self.opens_on(day) && t >= self.start && t < self.end;
        }
        if t >= self.start {
            self.opens_on(day)
        } else if t < self.end {
            self.opens_on(day.pred())
        } else {
            false
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneRules {
    /// Class whitelist; empty matches every class.
    #[serde(default)]
    pub classes: Vec<String>,
    #[serde(default)]
    pub min_confidence: f64,
    /// -1 disables crowding.
    pub max_objects: i64,
    #[serde(with = "duration_secs")]
    pub min_dwell: Duration,
    /// Zero disables violations.
    #[serde(with = "duration_secs")]
    pub max_dwell: Duration,
    #[serde(default)]
    pub alert_on_entry: bool,
    #[serde(default)]
    pub alert_on_exit: bool,
    #[serde(default)]
    pub alert_on_loitering: bool,
    #[serde(default)]
    pub alert_on_crowding: bool,
    #[serde(default)]
    pub count_direction: CountDirection,
    /// Suppress loitering and violations for objects that have not moved.
    #[serde(default)]
    pub ignore_stationary: bool,
    #[serde(default)]
    pub time_restrictions: Vec<TimeRestriction>,
}

impl Default for ZoneRules {
    fn default() -> Self {
        Self {
            classes: Vec::new(),
            min_confidence: 0.0,
            max_objects: -1,
            min_dwell: Duration::ZERO,
            max_dwell: Duration::ZERO,
            alert_on_entry: false,
            alert_on_exit: false,
            alert_on_loitering: false,
            alert_on_crowding: false,
            count_direction: CountDirection::default(),
            ignore_stationary: false,
            time_restrictions: Vec::new(),
        }
    }
}

impl ZoneRules {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(Error::validation(format!(
                "min_confidence {} outside [0, 1]",
                self.min_confidence
            )));
        }
        if self.max_objects < -1 {
            return Err(Error::validation(format!(
                "max_objects {} must be -1 or non-negative",
                self.max_objects
            )));
        }
        if !self.max_dwell.is_zero() && self.min_dwell > self.max_dwell {
            return Err(Error::validation(format!(
                "min_dwell {:?} exceeds max_dwell {:?}",
                self.min_dwell, self.max_dwell
            )));
        }
        Ok(())
    }

    pub fn matches_class(&self, class: &str) -> bool {
        self.classes.is_empty() || self.classes.iter().any(|c| c == class)
    }

    /// True when the zone has no windows or `local` falls inside one.
    pub fn is_active_at(&self, local: NaiveDateTime) -> bool {
        self.time_restrictions.is_empty()
            || self.time_restrictions.iter().any(|w| w.contains(local))
    }

    pub fn crowding_limit(&self) -> Option<usize> {
        usize::try_from(self.max_objects).ok()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    /// Assigned on creation when empty.
    #[serde(default)]
    pub zone_id: String,
    pub stream_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type")]
    pub zone_type: ZoneType,
    pub polygon: Polygon,
    #[serde(default)]
    pub rules: ZoneRules,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Zone {
    pub fn new(
        stream_id: impl Into<String>,
        name: impl Into<String>,
        zone_type: ZoneType,
        polygon: Polygon,
    ) -> Self {
        let now = Utc::now();
        Self {
            zone_id: String::new(),
            stream_id: stream_id.into(),
            name: name.into(),
            description: String::new(),
            zone_type,
            polygon,
            rules: ZoneRules::default(),
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_id(mut self, zone_id: impl Into<String>) -> Self {
        self.zone_id = zone_id.into();
        self
    }

    pub fn with_rules(mut self, rules: ZoneRules) -> Self {
        self.rules = rules;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.stream_id.is_empty() {
            return Err(Error::validation("zone stream_id is required"));
        }
        if self.name.is_empty() {
            return Err(Error::validation("zone name is required"));
        }
        self.rules.validate()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoneEventType {
    Entry,
    Exit,
    Loitering,
    Crowding,
    Violation,
    Count,
    DwellTime,
}

impl ZoneEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ZoneEventType::Entry => "entry",
            ZoneEventType::Exit => "exit",
            ZoneEventType::Loitering => "loitering",
            ZoneEventType::Crowding => "crowding",
            ZoneEventType::Violation => "violation",
            ZoneEventType::Count => "count",
            ZoneEventType::DwellTime => "dwell_time",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneEvent {
    pub event_id: Uuid,
    pub zone_id: String,
    pub stream_id: String,
    pub event_type: ZoneEventType,
    pub object_id: String,
    pub class: String,
    pub confidence: f64,
    pub position: Point,
    pub bbox: Rect,
    #[serde(with = "duration_secs")]
    pub dwell: Duration,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

/// `NaiveTime` as `"HH:MM"`.
mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%H:%M";

    pub fn serialize<S: Serializer>(time: &NaiveTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&time.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(d)?;
        NaiveTime::parse_from_str(&raw, FORMAT).map_err(serde::de::Error::custom)
    }
}

/// `Duration` as fractional seconds; negative values are rejected.
pub(crate) mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn local(date: (i32, u32, u32), h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(date.0, date.1, date.2)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_daytime_window() {
        let w = TimeRestriction::new(hm(9, 0), hm(17, 0));
        assert!(w.contains(local((2024, 3, 4), 9, 0)));
        assert!(w.contains(local((2024, 3, 4), 16, 59)));
        assert!(!w.contains(local((2024, 3, 4), 17, 0)));
        assert!(!w.contains(local((2024, 3, 4), 8, 59)));
    }

    #[test]
    fn test_window_wraps_midnight() {
        // 2024-03-04 is a Monday.
        let w = TimeRestriction::new(hm(22, 0), hm(6, 0)).on([Weekday::Mon]);
        assert!(w.contains(local((2024, 3, 4), 23, 0)));
        // Tuesday 02:00 belongs to Monday night's window.
        assert!(w.contains(local((2024, 3, 5), 2, 0)));
        assert!(!w.contains(local((2024, 3, 5), 23, 0)));
        assert!(!w.contains(local((2024, 3, 4), 12, 0)));
    }

    #[test]
    fn test_weekday_filter() {
        let w = TimeRestriction::new(hm(0, 0), hm(23, 59)).on([Weekday::Sat, Weekday::Sun]);
        assert!(!w.contains(local((2024, 3, 4), 12, 0)));
        assert!(w.contains(local((2024, 3, 9), 12, 0)));
    }

    #[test]
    fn test_rules_validation() {
        assert!(ZoneRules::default().validate().is_ok());
        let bad_conf = ZoneRules {
            min_confidence: 1.5,
            ..Default::default()
        };
        assert!(bad_conf.validate().is_err());
        let bad_dwell = ZoneRules {
            min_dwell: Duration::from_secs(10),
            max_dwell: Duration::from_secs(5),
            ..Default::default()
        };
        assert!(bad_dwell.validate().is_err());
        let bad_max = ZoneRules {
            max_objects: -2,
            ..Default::default()
        };
        assert!(bad_max.validate().is_err());
    }

    #[test]
    fn test_negative_dwell_rejected_on_decode() {
        let json = r#"{"max_objects":-1,"min_dwell":-2.0,"max_dwell":0.0}"#;
        assert!(serde_json::from_str::<ZoneRules>(json).is_err());
    }

    #[test]
    fn test_empty_classes_match_all() {
        let rules = ZoneRules::default();
        assert!(rules.matches_class("person"));
        let rules = ZoneRules {
            classes: vec!["car".into()],
            ..Default::default()
        };
        assert!(!rules.matches_class("person"));
        assert!(rules.matches_class("car"));
    }

    #[test]
    fn test_crowding_limit() {
        assert_eq!(ZoneRules::default().crowding_limit(), None);
        let rules = ZoneRules {
            max_objects: 0,
            ..Default::default()
        };
        assert_eq!(rules.crowding_limit(), Some(0));
    }

    #[test]
    fn test_zone_json_shape() {
        let zone = Zone::new(
            "cam-1",
            "door",
            ZoneType::Alert,
            Polygon::rectangle(0.0, 0.0, 10.0, 10.0).unwrap(),
        )
        .with_id("z1");
        let json = serde_json::to_value(&zone).unwrap();
        assert_eq!(json["type"], "alert");
        assert_eq!(json["polygon"].as_array().map(|a| a.len()), Some(4));
        let back: Zone = serde_json::from_value(json).unwrap();
        assert_eq!(back, zone);
    }
}
