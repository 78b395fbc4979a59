//! Polygon zones: rule evaluation, presence tracking, statistics and reports.

mod analytics;
mod engine;
mod polygon;
mod repository;
mod statistics;
mod zone;

pub use analytics::{ReportData, ReportType, TimeRange, ZoneAnalytics, ZoneReport, dwell_bucket};
pub use engine::{ObjectPresence, ZoneEngine, ZoneEngineConfig};
pub use polygon::{Point, Polygon};
pub use repository::{InMemoryZoneRepository, ZoneRepository};
pub use statistics::ZoneStatistics;
pub(crate) use zone::duration_secs;
pub use zone::{
    CountDirection, TimeRestriction, Zone, ZoneEvent, ZoneEventType, ZoneRules, ZoneType,
};
