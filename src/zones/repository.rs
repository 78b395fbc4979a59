//! Storage seam for zones, zone events and statistics.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::zones::statistics::ZoneStatistics;
use crate::zones::zone::{Zone, ZoneEvent};

/// Persistence for the zone engine. Implementations own the on-disk encoding.
#[async_trait]
pub trait ZoneRepository: Send + Sync {
    async fn create_zone(&self, zone: &Zone) -> Result<()>;
    async fn get_zone(&self, zone_id: &str) -> Result<Zone>;
    async fn zones_by_stream(&self, stream_id: &str) -> Result<Vec<Zone>>;
    async fn update_zone(&self, zone: &Zone) -> Result<()>;
    async fn delete_zone(&self, zone_id: &str) -> Result<()>;
    async fn list_zones(&self, limit: usize, offset: usize) -> Result<Vec<Zone>>;

    async fn create_zone_event(&self, event: &ZoneEvent) -> Result<()>;
    /// Most recent first.
    async fn zone_events(&self, zone_id: &str, limit: usize) -> Result<Vec<ZoneEvent>>;
    async fn zone_events_in_range(
        &self,
        zone_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ZoneEvent>>;

    async fn zone_statistics(&self, zone_id: &str) -> Result<ZoneStatistics>;
    async fn update_zone_statistics(&self, stats: &ZoneStatistics) -> Result<()>;
}

/// Process-local repository, used by the server binary and tests.
#[derive(Debug, Default)]
pub struct InMemoryZoneRepository {
    zones: RwLock<HashMap<String, Zone>>,
    events: RwLock<Vec<ZoneEvent>>,
    statistics: RwLock<HashMap<String, ZoneStatistics>>,
}

impl InMemoryZoneRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn event_count(&self) -> usize {
        self.events.read().len()
    }
}

#[async_trait]
impl ZoneRepository for InMemoryZoneRepository {
    async fn create_zone(&self, zone: &Zone) -> Result<()> {
        let mut zones = self.zones.write();
        if zones.contains_key(&zone.zone_id) {
            return Err(Error::repository(format!(
                "zone {} already exists",
                zone.zone_id
            )));
        }
        zones.insert(zone.zone_id.clone(), zone.clone());
        Ok(())
    }

    async fn get_zone(&self, zone_id: &str) -> Result<Zone> {
        self.zones
            .read()
            .get(zone_id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("zone {zone_id}")))
    }

    async fn zones_by_stream(&self, stream_id: &str) -> Result<Vec<Zone>> {
        let mut zones: Vec<Zone> = self
            .zones
            .read()
            .values()
            .filter(|z| z.stream_id == stream_id)
            .cloned()
            .collect();
        zones.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.zone_id.cmp(&b.zone_id)));
        Ok(zones)
    }

    async fn update_zone(&self, zone: &Zone) -> Result<()> {
        let mut zones = self.zones.write();
        match zones.get_mut(&zone.zone_id) {
            Some(slot) => {
                *slot = zone.clone();
                Ok(())
            }
            None => Err(Error::not_found(format!("zone {}", zone.zone_id))),
        }
    }

    async fn delete_zone(&self, zone_id: &str) -> Result<()> {
        self.zones
            .write()
            .remove(zone_id)
            .map(|_| ())
            .ok_or_else(|| Error::not_found(format!("zone {zone_id}")))?;
        self.statistics.write().remove(zone_id);
        Ok(())
    }

    async fn list_zones(&self, limit: usize, offset: usize) -> Result<Vec<Zone>> {
        let mut zones: Vec<Zone> = self.zones.read().values().cloned().collect();
        zones.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.zone_id.cmp(&b.zone_id)));
        Ok(zones.into_iter().skip(offset).take(limit).collect())
    }

    async fn create_zone_event(&self, event: &ZoneEvent) -> Result<()> {
        self.events.write().push(event.clone());
        Ok(())
    }

    async fn zone_events(&self, zone_id: &str, limit: usize) -> Result<Vec<ZoneEvent>> {
        Ok(self
            .events
            .read()
            .iter()
            .rev()
            .filter(|e| e.zone_id == zone_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn zone_events_in_range(
        &self,
        zone_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ZoneEvent>> {
        Ok(self
            .events
            .read()
            .iter()
            .filter(|e| e.zone_id == zone_id && e.timestamp >= start && e.timestamp <= end)
            .cloned()
            .collect())
    }

    async fn zone_statistics(&self, zone_id: &str) -> Result<ZoneStatistics> {
        self.statistics
            .read()
            .get(zone_id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("statistics for zone {zone_id}")))
    }

    async fn update_zone_statistics(&self, stats: &ZoneStatistics) -> Result<()> {
        self.statistics
            .write()
            .insert(stats.zone_id.clone(), stats.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zones::polygon::Polygon;
    use crate::zones::zone::ZoneType;

    fn zone(id: &str, stream: &str) -> Zone {
        Zone::new(
            stream,
            id,
            ZoneType::Alert,
            Polygon::rectangle(0.0, 0.0, 10.0, 10.0).unwrap(),
        )
        .with_id(id)
    }

    #[tokio::test]
    async fn test_zone_crud() {
        let repo = InMemoryZoneRepository::new();
        repo.create_zone(&zone("a", "s1")).await.unwrap();
        repo.create_zone(&zone("b", "s2")).await.unwrap();
        assert!(repo.create_zone(&zone("a", "s1")).await.is_err());

        assert_eq!(repo.zones_by_stream("s1").await.unwrap().len(), 1);
        let mut updated = zone("a", "s1");
        updated.name = "renamed".into();
        repo.update_zone(&updated).await.unwrap();
        assert_eq!(repo.get_zone("a").await.unwrap().name, "renamed");

        repo.delete_zone("a").await.unwrap();
        assert!(matches!(repo.get_zone("a").await, Err(Error::NotFound(_))));
        assert!(repo.delete_zone("a").await.is_err());
    }

    #[tokio::test]
    async fn test_list_zones_paginates() {
        let repo = InMemoryZoneRepository::new();
        for i in 0..5 {
            repo.create_zone(&zone(&format!("z{i}"), "s")).await.unwrap();
        }
        assert_eq!(repo.list_zones(2, 0).await.unwrap().len(), 2);
        assert_eq!(repo.list_zones(10, 4).await.unwrap().len(), 1);
        assert!(repo.list_zones(10, 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_statistics_not_found() {
        let repo = InMemoryZoneRepository::new();
        assert!(matches!(
            repo.zone_statistics("nope").await,
            Err(Error::NotFound(_))
        ));
        repo.update_zone_statistics(&ZoneStatistics::new("z", "s"))
            .await
            .unwrap();
        assert_eq!(repo.zone_statistics("z").await.unwrap().zone_id, "z");
    }
}
