//! Running per-zone statistics.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::zones::zone::duration_secs;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneStatistics {
    pub zone_id: String,
    pub stream_id: String,
    pub total_entries: u64,
    pub total_exits: u64,
    pub current_occupancy: usize,
    pub max_occupancy: usize,
    /// Entries per class.
    pub class_counts: BTreeMap<String, u64>,
    /// Entries per UTC hour of day.
    pub hourly_counts: BTreeMap<u32, u64>,
    /// Entries per UTC day, keyed `YYYY-MM-DD`.
    pub daily_counts: BTreeMap<String, u64>,
    /// Exponential moving average over completed presences.
    #[serde(with = "duration_secs")]
    pub average_dwell: Duration,
    pub last_activity: Option<DateTime<Utc>>,
}

impl ZoneStatistics {
    pub fn new(zone_id: impl Into<String>, stream_id: impl Into<String>) -> Self {
        Self {
            zone_id: zone_id.into(),
            stream_id: stream_id.into(),
            total_entries: 0,
            total_exits: 0,
            current_occupancy: 0,
            max_occupancy: 0,
            class_counts: BTreeMap::new(),
            hourly_counts: BTreeMap::new(),
            daily_counts: BTreeMap::new(),
            average_dwell: Duration::ZERO,
            last_activity: None,
        }
    }

    pub(crate) fn record_entry(&mut self, class: &str, occupancy: usize, now: DateTime<Utc>) {
        self.total_entries += 1;
        *self.class_counts.entry(class.to_string()).or_default() += 1;
        *self.hourly_counts.entry(now.hour()).or_default() += 1;
        *self
            .daily_counts
            .entry(now.format("%Y-%m-%d").to_string())
            .or_default() += 1;
        self.set_occupancy(occupancy, now);
    }

    pub(crate) fn record_exit(
        &mut self,
        dwell: Duration,
        occupancy: usize,
        alpha: f64,
        now: DateTime<Utc>,
    ) {
        self.total_exits += 1;
        self.average_dwell = if self.total_exits == 1 {
            dwell
        } else {
            let ema = alpha * dwell.as_secs_f64() + (1.0 - alpha) * self.average_dwell.as_secs_f64();
            Duration::from_secs_f64(ema.max(0.0))
        };
        self.set_occupancy(occupancy, now);
    }

    pub(crate) fn set_occupancy(&mut self, occupancy: usize, now: DateTime<Utc>) {
        self.current_occupancy = occupancy;
        self.max_occupancy = self.max_occupancy.max(occupancy);
        self.last_activity = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_entries_bucket_by_class_hour_and_day() {
        let mut stats = ZoneStatistics::new("z", "s");
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 13, 30, 0).unwrap();
        stats.record_entry("person", 1, t);
        stats.record_entry("car", 2, t);
        stats.record_entry("person", 3, t);
        assert_eq!(stats.total_entries, 3);
        assert_eq!(stats.class_counts["person"], 2);
        assert_eq!(stats.hourly_counts[&13], 3);
        assert_eq!(stats.daily_counts["2024-05-01"], 3);
        assert_eq!(stats.max_occupancy, 3);
    }

    #[test]
    fn test_dwell_ema_seeded_by_first_exit() {
        let mut stats = ZoneStatistics::new("z", "s");
        let t = Utc::now();
        stats.record_exit(Duration::from_secs(10), 0, 0.1, t);
        assert_eq!(stats.average_dwell, Duration::from_secs(10));
        stats.record_exit(Duration::from_secs(20), 0, 0.1, t);
        assert!((stats.average_dwell.as_secs_f64() - 11.0).abs() < 1e-6);
        assert_eq!(stats.current_occupancy, 0);
        assert_eq!(stats.last_activity, Some(t));
    }
}
