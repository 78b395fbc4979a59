//! Process configuration assembled from `STREAMTRACK_*` environment variables.

use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::integration::TrackingServiceConfig;
use crate::streaming::{DetectionStreamerConfig, HubConfig, NetworkMonitorConfig, QualityConfig};
use crate::zones::ZoneEngineConfig;

/// Listener settings for the binary.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// How long shutdown waits for background tasks.
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub tracking: TrackingServiceConfig,
    pub zones: ZoneEngineConfig,
    pub hub: HubConfig,
    pub streamer: DetectionStreamerConfig,
    pub quality: QualityConfig,
    pub network: NetworkMonitorConfig,
    /// Probe the network in the background.
    pub enable_network_monitor: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            tracking: TrackingServiceConfig::default(),
            zones: ZoneEngineConfig::default(),
            hub: HubConfig::default(),
            streamer: DetectionStreamerConfig::default(),
            quality: QualityConfig::default(),
            network: NetworkMonitorConfig::default(),
            enable_network_monitor: true,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source. Unset variables keep their
    /// defaults; set but unparsable ones are an error.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Lookup(lookup);
        let mut config = Config::default();

        if let Some(host) = env.string("STREAMTRACK_HOST") {
            config.server.host = host;
        }
        env.parse("STREAMTRACK_PORT", &mut config.server.port)?;
        env.secs("STREAMTRACK_SHUTDOWN_GRACE_SECS", &mut config.server.shutdown_grace)?;

        let tracking = &mut config.tracking;
        env.parse("STREAMTRACK_MAX_STREAMS", &mut tracking.max_streams)?;
        env.parse("STREAMTRACK_ENABLE_TRAJECTORIES", &mut tracking.enable_trajectories)?;
        env.parse("STREAMTRACK_TRACKER_MAX_AGE", &mut tracking.tracker.max_age)?;
        env.parse("STREAMTRACK_TRACKER_MIN_HITS", &mut tracking.tracker.min_hits)?;
        env.parse("STREAMTRACK_TRACKER_IOU_THRESHOLD", &mut tracking.tracker.association.iou_threshold)?;
        env.parse("STREAMTRACK_TRACKER_MAX_DISTANCE", &mut tracking.tracker.association.max_distance)?;
        env.secs("STREAMTRACK_TRACKER_TIMEOUT_SECS", &mut tracking.tracker.track_timeout)?;

        env.secs("STREAMTRACK_ZONE_STALE_SECS", &mut config.zones.stale_threshold)?;
        env.secs("STREAMTRACK_ZONE_GC_SECS", &mut config.zones.gc_interval)?;

        let hub = &mut config.hub;
        env.parse("STREAMTRACK_MAX_CONNECTIONS", &mut hub.max_connections)?;
        env.parse("STREAMTRACK_SEND_QUEUE_SIZE", &mut hub.send_queue_size)?;
        env.secs("STREAMTRACK_PING_PERIOD_SECS", &mut hub.ping_period)?;
        env.secs("STREAMTRACK_PONG_TIMEOUT_SECS", &mut hub.pong_timeout)?;
        env.secs("STREAMTRACK_WRITE_TIMEOUT_SECS", &mut hub.write_timeout)?;
        env.parse("STREAMTRACK_MAX_MESSAGE_SIZE", &mut hub.max_message_size)?;

        env.parse("STREAMTRACK_STREAM_MIN_CONFIDENCE", &mut config.streamer.min_confidence)?;

        let quality = &mut config.quality;
        env.parse("STREAMTRACK_QUALITY_ADAPTATION", &mut quality.enable_adaptation)?;
        env.parse("STREAMTRACK_QUALITY_DEFAULT_LEVEL", &mut quality.default_level)?;
        env.parse("STREAMTRACK_QUALITY_SENSITIVITY", &mut quality.sensitivity)?;
        env.secs("STREAMTRACK_QUALITY_STABILITY_SECS", &mut quality.min_stability_period)?;
        env.secs("STREAMTRACK_QUALITY_INTERVAL_SECS", &mut quality.monitoring_interval)?;
        env.parse("STREAMTRACK_QUALITY_PREDICTIVE", &mut quality.enable_predictive_scaling)?;

        env.parse("STREAMTRACK_NETWORK_MONITOR", &mut config.enable_network_monitor)?;
        if let Some(targets) = env.string("STREAMTRACK_PROBE_TARGETS") {
            config.network.targets = targets
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect();
        }
        env.secs("STREAMTRACK_PROBE_INTERVAL_SECS", &mut config.network.probe_interval)?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tracking.max_streams == 0 {
            return Err(Error::validation("max_streams must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.streamer.min_confidence) {
            return Err(Error::validation("stream min_confidence must be in [0, 1]"));
        }
        self.zones.validate()?;
        self.hub.validate()?;
        self.quality.validate()?;
        if self.enable_network_monitor {
            self.network.validate()?;
        }
        Ok(())
    }
}

struct Lookup<F>(F);

impl<F: Fn(&str) -> Option<String>> Lookup<F> {
    fn string(&self, key: &str) -> Option<String> {
        (self.0)(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
    }

    fn parse<T: FromStr>(&self, key: &str, slot: &mut T) -> Result<()>
    where
        T::Err: std::fmt::Display,
    {
        if let Some(raw) = self.string(key) {
            *slot = raw
                .parse()
                .map_err(|e| Error::validation(format!("{key}={raw}: {e}")))?;
        }
        Ok(())
    }

    fn secs(&self, key: &str, slot: &mut Duration) -> Result<()> {
        if let Some(raw) = self.string(key) {
            let secs: f64 = raw
                .parse()
                .map_err(|e| Error::validation(format!("{key}={raw}: {e}")))?;
            *slot = Duration::try_from_secs_f64(secs)
                .map_err(|e| Error::validation(format!("{key}={raw}: {e}")))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults_without_variables() {
        let config = from_pairs(&[]).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.tracking.max_streams, 10);
        assert_eq!(config.hub.send_queue_size, 256);
        assert_eq!(config.quality.default_level, 2);
        assert!(config.enable_network_monitor);
    }

    #[test]
    fn test_overrides() {
        let config = from_pairs(&[
            ("STREAMTRACK_PORT", "9000"),
            ("STREAMTRACK_MAX_CONNECTIONS", "5"),
            ("STREAMTRACK_PING_PERIOD_SECS", "1.5"),
            ("STREAMTRACK_TRACKER_IOU_THRESHOLD", "0.5"),
            ("STREAMTRACK_PROBE_TARGETS", "127.0.0.1:80, ,10.0.0.1:53"),
            ("STREAMTRACK_NETWORK_MONITOR", "false"),
        ])
        .unwrap();
        assert_eq!(config.server.bind_address(), "0.0.0.0:9000");
        assert_eq!(config.hub.max_connections, 5);
        assert_eq!(config.hub.ping_period, Duration::from_millis(1500));
        assert!((config.tracking.tracker.association.iou_threshold - 0.5).abs() < 1e-9);
        assert_eq!(config.network.targets, vec!["127.0.0.1:80", "10.0.0.1:53"]);
        assert!(!config.enable_network_monitor);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(from_pairs(&[("STREAMTRACK_PORT", "eighty")]).is_err());
        assert!(from_pairs(&[("STREAMTRACK_QUALITY_SENSITIVITY", "1.5")]).is_err());
        assert!(from_pairs(&[("STREAMTRACK_PONG_TIMEOUT_SECS", "-1")]).is_err());
        assert!(from_pairs(&[("STREAMTRACK_QUALITY_DEFAULT_LEVEL", "9")]).is_err());
    }
}
