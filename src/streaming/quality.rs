//! Per-client adaptive quality selection.
//!
//! Every registered client carries a profile with its recent network
//! samples. On each monitoring tick the controller derives an optimal level
//! from the smoothed bandwidth (stepped down one level on high latency or
//! loss) and moves the client towards it, at most once per stability period.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::metrics;
use crate::streaming::network_monitor::{NetworkMonitor, NetworkSample};
use crate::zones::duration_secs;

const HIGH_LATENCY: Duration = Duration::from_millis(200);
const HIGH_PACKET_LOSS: f64 = 5.0;
const LATENCY_EMA_ALPHA: f64 = 0.1;
const MAX_QUALITY_HISTORY: usize = 100;
const STABILITY_WINDOW_SECS: i64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// Encoding parameters applied to a client's outbound frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityLevel {
    pub level: usize,
    pub name: String,
    pub max_frame_rate: u32,
    pub jpeg_quality: u8,
    pub max_resolution: Resolution,
    /// Bits per second.
    pub max_bitrate: u64,
    /// Smoothed bandwidth (bits per second) required to select this level.
    pub min_bandwidth: u64,
    #[serde(default)]
    pub description: String,
}

impl QualityLevel {
    #[allow(clippy::too_many_arguments)]
    fn preset(
        level: usize,
        name: &str,
        max_frame_rate: u32,
        jpeg_quality: u8,
        max_resolution: Resolution,
        max_bitrate: u64,
        min_bandwidth: u64,
        description: &str,
    ) -> Self {
        Self {
            level,
            name: name.to_string(),
            max_frame_rate,
            jpeg_quality,
            max_resolution,
            max_bitrate,
            min_bandwidth,
            description: description.to_string(),
        }
    }

    /// The five stock levels, Low through Ultra.
    pub fn default_levels() -> Vec<QualityLevel> {
        vec![
            Self::preset(0, "Low", 5, 30, Resolution::new(320, 240), 100_000, 150_000, "Low quality for poor connections"),
            Self::preset(1, "Medium-Low", 10, 50, Resolution::new(480, 360), 300_000, 450_000, "Medium-low quality for limited bandwidth"),
            Self::preset(2, "Medium", 15, 70, Resolution::new(640, 480), 800_000, 1_200_000, "Medium quality for average connections"),
            Self::preset(3, "High", 25, 85, Resolution::new(1280, 720), 2_000_000, 3_000_000, "High quality for good connections"),
            Self::preset(4, "Ultra", 30, 95, Resolution::new(1920, 1080), 5_000_000, 7_500_000, "Ultra quality for excellent connections"),
        ]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityConfig {
    pub enable_adaptation: bool,
    #[serde(with = "duration_secs")]
    pub monitoring_interval: Duration,
    pub levels: Vec<QualityLevel>,
    pub default_level: usize,
    /// Fraction of the distance to the optimal level applied per adaptation, in (0, 1].
    pub sensitivity: f64,
    #[serde(with = "duration_secs")]
    pub min_stability_period: Duration,
    pub bandwidth_smoothing_window: usize,
    pub latency_smoothing_window: usize,
    /// Clamp the smoothed bandwidth to its one-step linear projection.
    pub enable_predictive_scaling: bool,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            enable_adaptation: true,
            monitoring_interval: Duration::from_secs(2),
            levels: QualityLevel::default_levels(),
            default_level: 2,
            sensitivity: 0.7,
            min_stability_period: Duration::from_secs(5),
            bandwidth_smoothing_window: 5,
            latency_smoothing_window: 5,
            enable_predictive_scaling: false,
        }
    }
}

impl QualityConfig {
    pub fn validate(&self) -> Result<()> {
        if self.levels.is_empty() {
            return Err(Error::validation("at least one quality level is required"));
        }
        for (i, level) in self.levels.iter().enumerate() {
            if level.level != i {
                return Err(Error::validation(format!(
                    "quality level at position {i} has index {}",
                    level.level
                )));
            }
        }
        for pair in self.levels.windows(2) {
            let (lo, hi) = (&pair[0], &pair[1]);
            let monotone = lo.max_frame_rate <= hi.max_frame_rate
                && lo.jpeg_quality <= hi.jpeg_quality
                && lo.max_resolution.width <= hi.max_resolution.width
                && lo.max_resolution.height <= hi.max_resolution.height
                && lo.max_bitrate <= hi.max_bitrate
                && lo.min_bandwidth <= hi.min_bandwidth;
            if !monotone {
                return Err(Error::validation(format!(
                    "quality level {} must not exceed level {} in any parameter",
                    lo.level, hi.level
                )));
            }
        }
        if self.default_level >= self.levels.len() {
            return Err(Error::validation(format!(
                "default_level {} is out of range",
                self.default_level
            )));
        }
        if !(self.sensitivity > 0.0 && self.sensitivity <= 1.0) {
            return Err(Error::validation("sensitivity must be in (0, 1]"));
        }
        if self.bandwidth_smoothing_window == 0 || self.latency_smoothing_window == 0 {
            return Err(Error::validation("smoothing windows must be at least 1"));
        }
        if self.monitoring_interval.is_zero() {
            return Err(Error::validation("monitoring_interval must be positive"));
        }
        Ok(())
    }

    fn max_level(&self) -> usize {
        self.levels.len() - 1
    }
}

/// One network observation for a client. Missing fields keep their previous value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSample {
    /// Bits per second.
    pub bandwidth: Option<u64>,
    pub latency: Option<Duration>,
    /// Percent, 0 to 100.
    pub packet_loss: Option<f64>,
    pub jitter: Option<Duration>,
}

impl MetricsSample {
    pub fn bandwidth(bits_per_sec: u64) -> Self {
        Self {
            bandwidth: Some(bits_per_sec),
            ..Self::default()
        }
    }

    pub fn latency(rtt: Duration) -> Self {
        Self {
            latency: Some(rtt),
            ..Self::default()
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn with_packet_loss(mut self, percent: f64) -> Self {
        self.packet_loss = Some(percent);
        self
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = Some(jitter);
        self
    }
}

impl From<&NetworkSample> for MetricsSample {
    fn from(sample: &NetworkSample) -> Self {
        Self {
            bandwidth: Some(sample.estimated_bandwidth),
            latency: Some(sample.latency),
            packet_loss: Some(sample.packet_loss),
            jitter: Some(sample.jitter),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkMetrics {
    pub bandwidth: u64,
    #[serde(with = "duration_secs")]
    pub latency: Duration,
    /// EMA of latency samples; reported, not used for selection.
    #[serde(with = "duration_secs")]
    pub smoothed_latency: Duration,
    pub packet_loss: f64,
    #[serde(with = "duration_secs")]
    pub jitter: Duration,
    pub connection_quality: f64,
    pub last_updated: DateTime<Utc>,
    pub bandwidth_history: VecDeque<u64>,
    #[serde(skip)]
    pub latency_history: VecDeque<Duration>,
}

impl NetworkMetrics {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            bandwidth: 0,
            latency: Duration::ZERO,
            smoothed_latency: Duration::ZERO,
            packet_loss: 0.0,
            jitter: Duration::ZERO,
            connection_quality: 0.5,
            last_updated: now,
            bandwidth_history: VecDeque::new(),
            latency_history: VecDeque::new(),
        }
    }

    /// Linearly weighted mean of the bandwidth history: the oldest sample
    /// weighs 0 and the newest the most.
    pub fn smoothed_bandwidth(&self) -> u64 {
        let n = self.bandwidth_history.len();
        if n < 2 {
            return self.bandwidth_history.back().copied().unwrap_or(self.bandwidth);
        }
        let (sum, weight) = self
            .bandwidth_history
            .iter()
            .enumerate()
            .fold((0.0, 0.0), |(sum, weight), (i, &bw)| {
                (sum + bw as f64 * i as f64, weight + i as f64)
            });
        (sum / weight) as u64
    }

    /// One-step linear extrapolation of the bandwidth history.
    fn projected_bandwidth(&self) -> Option<u64> {
        let n = self.bandwidth_history.len();
        let first = *self.bandwidth_history.front()? as f64;
        let last = *self.bandwidth_history.back()? as f64;
        if n < 2 {
            return None;
        }
        let slope = (last - first) / (n - 1) as f64;
        Some((last + slope).max(0.0) as u64)
    }
}

/// Telemetry score in [0, 1] from bandwidth, latency, loss and jitter.
pub fn connection_quality(metrics: &NetworkMetrics) -> f64 {
    let bandwidth = (metrics.bandwidth as f64 / 5_000_000.0).min(1.0);
    let latency = (1.0 - metrics.latency.as_secs_f64() * 1000.0 / 500.0).max(0.0);
    let loss = (1.0 - metrics.packet_loss / 10.0).max(0.0);
    let jitter = (1.0 - metrics.jitter.as_secs_f64() * 1000.0 / 100.0).max(0.0);
    (bandwidth * 0.4 + latency * 0.3 + loss * 0.2 + jitter * 0.1).clamp(0.0, 1.0)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityChange {
    pub timestamp: DateTime<Utc>,
    pub from_level: usize,
    pub to_level: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientQualityProfile {
    pub client_id: String,
    pub current_level: usize,
    pub target_level: usize,
    pub metrics: NetworkMetrics,
    pub history: VecDeque<QualityChange>,
    pub last_adaptation: DateTime<Utc>,
    pub adaptation_count: u64,
    pub stability_score: f64,
}

impl ClientQualityProfile {
    fn new(client_id: &str, level: usize, now: DateTime<Utc>) -> Self {
        Self {
            client_id: client_id.to_string(),
            current_level: level,
            target_level: level,
            metrics: NetworkMetrics::new(now),
            history: VecDeque::new(),
            last_adaptation: now,
            adaptation_count: 0,
            stability_score: 1.0,
        }
    }

    fn apply_sample(&mut self, sample: &MetricsSample, config: &QualityConfig, now: DateTime<Utc>) {
        let m = &mut self.metrics;
        if let Some(bw) = sample.bandwidth {
            m.bandwidth = bw;
            m.bandwidth_history.push_back(bw);
            while m.bandwidth_history.len() > config.bandwidth_smoothing_window {
                m.bandwidth_history.pop_front();
            }
        }
        if let Some(latency) = sample.latency {
            m.smoothed_latency = if m.latency_history.is_empty() {
                latency
            } else {
                let ema = m.smoothed_latency.as_nanos() as f64 * (1.0 - LATENCY_EMA_ALPHA)
                    + latency.as_nanos() as f64 * LATENCY_EMA_ALPHA;
                Duration::from_nanos(ema.round() as u64)
            };
            m.latency = latency;
            m.latency_history.push_back(latency);
            while m.latency_history.len() > config.latency_smoothing_window {
                m.latency_history.pop_front();
            }
        }
        if let Some(loss) = sample.packet_loss {
            m.packet_loss = loss.clamp(0.0, 100.0);
        }
        if let Some(jitter) = sample.jitter {
            m.jitter = jitter;
        }
        m.last_updated = now;
        m.connection_quality = connection_quality(m);
    }

    fn record_change(&mut self, to_level: usize, reason: &str, now: DateTime<Utc>) -> QualityChange {
        let change = QualityChange {
            timestamp: now,
            from_level: self.current_level,
            to_level,
            reason: reason.to_string(),
        };
        self.current_level = to_level;
        self.target_level = to_level;
        self.last_adaptation = now;
        self.adaptation_count += 1;
        self.history.push_back(change.clone());
        while self.history.len() > MAX_QUALITY_HISTORY {
            self.history.pop_front();
        }
        let cutoff = now - chrono::Duration::seconds(STABILITY_WINDOW_SECS);
        let recent = self.history.iter().filter(|c| c.timestamp > cutoff).count();
        self.stability_score = (1.0 - recent as f64 / 10.0).max(0.0);
        change
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityStats {
    pub total_adaptations: u64,
    pub upgrades: u64,
    pub downgrades: u64,
    pub clients_monitored: usize,
    pub average_quality_level: f64,
    /// Adaptations per minute since the controller was created.
    pub adaptation_rate: f64,
    pub started_at: DateTime<Utc>,
    pub last_adaptation: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct Counters {
    total: u64,
    upgrades: u64,
    downgrades: u64,
    last_adaptation: Option<DateTime<Utc>>,
}

/// Adaptive quality controller.
///
/// The client map has its own lock; each profile is locked independently so
/// adapting one client never blocks metric updates for another.
pub struct QualityController {
    config: QualityConfig,
    clients: RwLock<HashMap<String, Arc<Mutex<ClientQualityProfile>>>>,
    counters: Mutex<Counters>,
    monitor: Option<Arc<NetworkMonitor>>,
    running: AtomicBool,
    stop_tx: watch::Sender<bool>,
    started_at: DateTime<Utc>,
}

impl QualityController {
    pub fn new(config: QualityConfig) -> Result<Self> {
        config.validate()?;
        let (stop_tx, _) = watch::channel(false);
        Ok(Self {
            config,
            clients: RwLock::new(HashMap::new()),
            counters: Mutex::new(Counters {
                total: 0,
                upgrades: 0,
                downgrades: 0,
                last_adaptation: None,
            }),
            monitor: None,
            running: AtomicBool::new(false),
            stop_tx,
            started_at: Utc::now(),
        })
    }

    /// Use the monitor's probes for clients that stopped reporting.
    pub fn with_network_monitor(mut self, monitor: Arc<NetworkMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn config(&self) -> &QualityConfig {
        &self.config
    }

    pub fn register_client(&self, client_id: &str) {
        self.register_client_at(client_id, Utc::now());
    }

    /// Registering an already known client is a no-op.
    pub fn register_client_at(&self, client_id: &str, now: DateTime<Utc>) {
        let mut clients = self.clients.write();
        if clients.contains_key(client_id) {
            return;
        }
        let profile = ClientQualityProfile::new(client_id, self.config.default_level, now);
        clients.insert(client_id.to_string(), Arc::new(Mutex::new(profile)));
        info!(client_id, initial_level = self.config.default_level, "client registered for quality adaptation");
    }

    pub fn unregister_client(&self, client_id: &str) {
        if self.clients.write().remove(client_id).is_some() {
            info!(client_id, "client unregistered from quality adaptation");
        }
    }

    fn profile(&self, client_id: &str) -> Option<Arc<Mutex<ClientQualityProfile>>> {
        self.clients.read().get(client_id).cloned()
    }

    pub fn update_network_metrics(&self, client_id: &str, sample: &MetricsSample) -> bool {
        self.update_network_metrics_at(client_id, sample, Utc::now())
    }

    /// Returns false for unknown clients.
    pub fn update_network_metrics_at(
        &self,
        client_id: &str,
        sample: &MetricsSample,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(profile) = self.profile(client_id) else {
            return false;
        };
        let mut profile = profile.lock();
        profile.apply_sample(sample, &self.config, now);
        debug!(
            client_id,
            bandwidth = profile.metrics.bandwidth,
            latency_ms = profile.metrics.latency.as_millis() as u64,
            quality_score = profile.metrics.connection_quality,
            "network metrics updated"
        );
        true
    }

    /// Feed a measured round trip in as a latency sample.
    pub fn record_rtt(&self, client_id: &str, rtt: Duration) -> bool {
        self.update_network_metrics(client_id, &MetricsSample::latency(rtt))
    }

    /// The level the metrics call for, before sensitivity and stability rules.
    pub fn calculate_optimal_level(&self, metrics: &NetworkMetrics) -> usize {
        let mut bandwidth = metrics.smoothed_bandwidth();
        if self.config.enable_predictive_scaling {
            if let Some(projected) = metrics.projected_bandwidth() {
                bandwidth = bandwidth.min(projected);
            }
        }
        let Some(best) = self
            .config
            .levels
            .iter()
            .rposition(|level| level.min_bandwidth <= bandwidth)
        else {
            return 0;
        };
        let degraded = metrics.latency >= HIGH_LATENCY || metrics.packet_loss >= HIGH_PACKET_LOSS;
        if degraded { best.saturating_sub(1) } else { best }
    }

    /// Move one client towards its optimal level. Returns the change made, if any.
    pub fn adapt_client_at(&self, client_id: &str, now: DateTime<Utc>) -> Option<QualityChange> {
        let profile = self.profile(client_id)?;
        let mut profile = profile.lock();

        let since = (now - profile.last_adaptation).to_std().unwrap_or(Duration::ZERO);
        if since < self.config.min_stability_period {
            return None;
        }

        let optimal = self.calculate_optimal_level(&profile.metrics);
        let current = profile.current_level;
        if optimal == current {
            return None;
        }

        let diff = optimal as i64 - current as i64;
        let mut step = (diff as f64 * self.config.sensitivity).round() as i64;
        if step == 0 {
            step = diff.signum();
        }
        let next = (current as i64 + step).clamp(0, self.config.max_level() as i64) as usize;
        if next == current {
            return None;
        }

        let change = profile.record_change(next, "network_adaptation", now);
        drop(profile);

        self.count_change(&change);
        info!(
            client_id,
            from_level = change.from_level,
            to_level = change.to_level,
            reason = %change.reason,
            quality_name = %self.config.levels[next].name,
            "quality level adapted"
        );
        Some(change)
    }

    /// One monitoring pass over every client.
    pub fn adapt_all_at(&self, now: DateTime<Utc>) -> Vec<(String, QualityChange)> {
        if let Some(sample) = self.monitor.as_ref().and_then(|m| m.latest()) {
            self.apply_monitor_sample(&sample, now);
        }
        let ids: Vec<String> = self.clients.read().keys().cloned().collect();
        ids.into_iter()
            .filter_map(|id| self.adapt_client_at(&id, now).map(|change| (id, change)))
            .collect()
    }

    /// Apply a probe sample to clients whose own metrics are older than two
    /// monitoring intervals. Each sample is applied at most once per client.
    pub fn apply_monitor_sample(&self, sample: &NetworkSample, now: DateTime<Utc>) -> usize {
        let stale_after = chrono::Duration::from_std(self.config.monitoring_interval * 2)
            .unwrap_or(chrono::Duration::MAX);
        let metrics_sample = MetricsSample::from(sample);
        let profiles: Vec<_> = self.clients.read().values().cloned().collect();
        let mut applied = 0;
        for profile in profiles {
            let mut profile = profile.lock();
            let last = profile.metrics.last_updated;
            if now - last > stale_after && sample.measured_at > last {
                profile.apply_sample(&metrics_sample, &self.config, sample.measured_at);
                applied += 1;
            }
        }
        if applied > 0 {
            debug!(clients = applied, "applied network monitor sample to stale clients");
        }
        applied
    }

    fn count_change(&self, change: &QualityChange) {
        let upgrade = change.to_level > change.from_level;
        let mut counters = self.counters.lock();
        counters.total += 1;
        if upgrade {
            counters.upgrades += 1;
        } else {
            counters.downgrades += 1;
        }
        counters.last_adaptation = Some(change.timestamp);
        metrics::record_quality_adaptation(upgrade);
    }

    /// Parameters of the client's current level, or the default level for unknown clients.
    pub fn optimal_quality(&self, client_id: &str) -> QualityLevel {
        let level = self
            .current_level(client_id)
            .filter(|&l| l < self.config.levels.len())
            .unwrap_or(self.config.default_level);
        self.config.levels[level].clone()
    }

    pub fn current_level(&self, client_id: &str) -> Option<usize> {
        self.profile(client_id).map(|p| p.lock().current_level)
    }

    /// Snapshot of a client's profile.
    pub fn client_profile(&self, client_id: &str) -> Option<ClientQualityProfile> {
        self.profile(client_id).map(|p| p.lock().clone())
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    pub fn stats(&self) -> QualityStats {
        let levels: Vec<usize> = self
            .clients
            .read()
            .values()
            .map(|p| p.lock().current_level)
            .collect();
        let average = if levels.is_empty() {
            0.0
        } else {
            levels.iter().sum::<usize>() as f64 / levels.len() as f64
        };

        let counters = self.counters.lock();
        let minutes = (Utc::now() - self.started_at).num_milliseconds() as f64 / 60_000.0;
        QualityStats {
            total_adaptations: counters.total,
            upgrades: counters.upgrades,
            downgrades: counters.downgrades,
            clients_monitored: levels.len(),
            average_quality_level: average,
            adaptation_rate: if minutes > 0.0 { counters.total as f64 / minutes } else { 0.0 },
            started_at: self.started_at,
            last_adaptation: counters.last_adaptation,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawn the monitoring loop. It exits on `stop()` or when `shutdown` flips to true.
    pub fn start(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<JoinHandle<()>> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::already_running("quality controller"));
        }
        self.stop_tx.send_replace(false);
        let mut stop = self.stop_tx.subscribe();
        let controller = Arc::clone(self);

        info!(interval = ?self.config.monitoring_interval, "quality controller started");
        Ok(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(controller.config.monitoring_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if controller.config.enable_adaptation {
                            controller.adapt_all_at(Utc::now());
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = stop.changed() => break,
                }
            }
            controller.running.store(false, Ordering::SeqCst);
            info!("quality controller stopped");
        }))
    }

    pub fn stop(&self) -> Result<()> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(Error::not_running("quality controller"));
        }
        self.stop_tx.send_replace(true);
        Ok(())
    }
}
