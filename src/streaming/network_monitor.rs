//! Background network probing.
//!
//! Opens short-lived TCP connections to a fixed set of well-known targets and
//! turns the connect times into a latency, loss and coarse bandwidth sample.
//! The quality controller falls back to this sample for clients that stop
//! reporting their own metrics.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::zones::duration_secs;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkMonitorConfig {
    /// `host:port` pairs to connect to.
    pub targets: Vec<String>,
    #[serde(with = "duration_secs")]
    pub probe_interval: Duration,
    #[serde(with = "duration_secs")]
    pub probe_timeout: Duration,
}

impl Default for NetworkMonitorConfig {
    fn default() -> Self {
        Self {
            targets: vec![
                "8.8.8.8:53".to_string(),
                "1.1.1.1:53".to_string(),
                "208.67.222.222:53".to_string(),
            ],
            probe_interval: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(2),
        }
    }
}

impl NetworkMonitorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.targets.is_empty() {
            return Err(Error::validation("network monitor needs at least one target"));
        }
        if self.probe_interval.is_zero() || self.probe_timeout.is_zero() {
            return Err(Error::validation("probe interval and timeout must be positive"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSample {
    /// Mean connect time of the successful probes.
    #[serde(with = "duration_secs")]
    pub latency: Duration,
    /// Percentage of probes that failed or timed out.
    pub packet_loss: f64,
    /// Standard deviation of the successful connect times.
    #[serde(with = "duration_secs")]
    pub jitter: Duration,
    /// Bits per second, estimated from latency.
    pub estimated_bandwidth: u64,
    pub measured_at: DateTime<Utc>,
    pub attempts: usize,
    pub successes: usize,
}

impl NetworkSample {
    /// Summarize one probe round. With no successes the latency is reported
    /// as `timeout`.
    pub fn from_probes(
        latencies: &[Duration],
        attempts: usize,
        timeout: Duration,
        measured_at: DateTime<Utc>,
    ) -> Self {
        let successes = latencies.len();
        let packet_loss = if attempts == 0 {
            0.0
        } else {
            (attempts - successes) as f64 / attempts as f64 * 100.0
        };

        let (latency, jitter) = if successes == 0 {
            (timeout, Duration::ZERO)
        } else {
            let nanos: Vec<f64> = latencies.iter().map(|d| d.as_nanos() as f64).collect();
            let mean = nanos.iter().sum::<f64>() / successes as f64;
            let variance = nanos.iter().map(|n| (n - mean).powi(2)).sum::<f64>() / successes as f64;
            (
                Duration::from_nanos(mean.round() as u64),
                Duration::from_nanos(variance.sqrt().round() as u64),
            )
        };

        Self {
            latency,
            packet_loss,
            jitter,
            estimated_bandwidth: estimate_bandwidth(latency),
            measured_at,
            attempts,
            successes,
        }
    }
}

/// Coarse bandwidth guess from round-trip latency. Only used when no real
/// bandwidth signal is available.
pub fn estimate_bandwidth(latency: Duration) -> u64 {
    match latency.as_millis() {
        0..20 => 10_000_000,
        20..50 => 8_000_000,
        50..100 => 4_000_000,
        100..200 => 1_500_000,
        _ => 500_000,
    }
}

pub struct NetworkMonitor {
    config: NetworkMonitorConfig,
    latest: RwLock<Option<NetworkSample>>,
}

impl NetworkMonitor {
    pub fn new(config: NetworkMonitorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            latest: RwLock::new(None),
        })
    }

    pub fn config(&self) -> &NetworkMonitorConfig {
        &self.config
    }

    /// Most recent completed probe round.
    pub fn latest(&self) -> Option<NetworkSample> {
        self.latest.read().clone()
    }

    /// Probe every target concurrently and store the result.
    pub async fn probe_once(&self) -> NetworkSample {
        let timeout = self.config.probe_timeout;
        let probes = self.config.targets.iter().map(|target| async move {
            let started = Instant::now();
            match tokio::time::timeout(timeout, TcpStream::connect(target.as_str())).await {
                Ok(Ok(_stream)) => Some(started.elapsed()),
                Ok(Err(e)) => {
                    debug!(target = %target, error = %e, "network probe failed");
                    None
                }
                Err(_) => {
                    debug!(target = %target, "network probe timed out");
                    None
                }
            }
        });
        let latencies: Vec<Duration> = join_all(probes).await.into_iter().flatten().collect();

        let sample =
            NetworkSample::from_probes(&latencies, self.config.targets.len(), timeout, Utc::now());
        if sample.successes == 0 {
            warn!(targets = sample.attempts, "all network probes failed");
        }
        debug!(
            latency_ms = sample.latency.as_millis() as u64,
            packet_loss = sample.packet_loss,
            estimated_bandwidth = sample.estimated_bandwidth,
            "network probe round complete"
        );
        *self.latest.write() = Some(sample.clone());
        sample
    }

    /// Probe on every interval tick until `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.probe_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval = ?self.config.probe_interval, targets = self.config.targets.len(), "network monitor started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.probe_once().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("network monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bandwidth_estimate_bands() {
        assert_eq!(estimate_bandwidth(Duration::from_millis(5)), 10_000_000);
        assert_eq!(estimate_bandwidth(Duration::from_millis(20)), 8_000_000);
        assert_eq!(estimate_bandwidth(Duration::from_millis(99)), 4_000_000);
        assert_eq!(estimate_bandwidth(Duration::from_millis(150)), 1_500_000);
        assert_eq!(estimate_bandwidth(Duration::from_millis(200)), 500_000);
    }

    #[test]
    fn test_sample_from_probes() {
        let now = Utc::now();
        let sample = NetworkSample::from_probes(
            &[Duration::from_millis(10), Duration::from_millis(30)],
            4,
            Duration::from_secs(2),
            now,
        );
        assert_eq!(sample.successes, 2);
        assert!((sample.packet_loss - 50.0).abs() < 1e-9);
        assert_eq!(sample.latency.as_millis(), 20);
        assert_eq!(sample.jitter.as_millis(), 10);
        assert_eq!(sample.estimated_bandwidth, 8_000_000);
    }

    #[test]
    fn test_all_probes_failed() {
        let sample = NetworkSample::from_probes(&[], 3, Duration::from_secs(2), Utc::now());
        assert!((sample.packet_loss - 100.0).abs() < 1e-9);
        assert_eq!(sample.latency, Duration::from_secs(2));
        assert_eq!(sample.estimated_bandwidth, 500_000);
    }

    #[test]
    fn test_config_validation() {
        assert!(NetworkMonitorConfig::default().validate().is_ok());
        let empty = NetworkMonitorConfig {
            targets: vec![],
            ..NetworkMonitorConfig::default()
        };
        assert!(NetworkMonitor::new(empty).is_err());
    }

    #[tokio::test]
    async fn test_probe_local_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let monitor = NetworkMonitor::new(NetworkMonitorConfig {
            targets: vec![addr],
            ..NetworkMonitorConfig::default()
        })
        .unwrap();
        assert!(monitor.latest().is_none());
        let sample = monitor.probe_once().await;
        assert_eq!(sample.successes, 1);
        assert_eq!(monitor.latest(), Some(sample));
    }
}
