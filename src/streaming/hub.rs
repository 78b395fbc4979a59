//! Fan-out hub: owns every client session and routes messages to them.
//!
//! Messages are serialized once per broadcast and the shared buffer is
//! enqueued on each recipient's bounded queue. A session whose queue is full
//! is closed on the spot so producers never wait on a slow reader.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::extract::ws::Utf8Bytes;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::metrics;
use crate::streaming::broadcaster::{BroadcastOutcome, StreamBroadcaster};
use crate::streaming::frame::{FrameEncoder, RawFrame};
use crate::streaming::message::{ClientMessage, FramePayload, ServerMessage, millis};
use crate::streaming::quality::{QualityConfig, QualityController, QualityLevel};
use crate::streaming::session::{ClientSession, EnqueueError, SessionMetadata};
use crate::zones::duration_secs;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    pub max_connections: usize,
    /// Capacity of each session's outbound queue, in messages.
    pub send_queue_size: usize,
    #[serde(with = "duration_secs")]
    pub ping_period: Duration,
    #[serde(with = "duration_secs")]
    pub pong_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub write_timeout: Duration,
    /// Largest inbound client frame accepted, in bytes.
    pub max_message_size: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_connections: 1000,
            send_queue_size: 256,
            ping_period: Duration::from_secs(54),
            pong_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
            max_message_size: 4096,
        }
    }
}

impl HubConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(Error::validation("max_connections must be at least 1"));
        }
        if self.send_queue_size == 0 {
            return Err(Error::validation("send_queue_size must be at least 1"));
        }
        if self.ping_period.is_zero() || self.pong_timeout.is_zero() || self.write_timeout.is_zero() {
            return Err(Error::validation("hub timeouts must be positive"));
        }
        if self.max_message_size == 0 {
            return Err(Error::validation("max_message_size must be positive"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubStats {
    pub total_connections: u64,
    pub active_connections: usize,
    pub messages_sent: u64,
    pub bytes_sent: u64,
    pub evictions: u64,
    pub broadcast_errors: u64,
}

/// What one keep-alive pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeepaliveOutcome {
    pub pinged: usize,
    pub timed_out: usize,
}

#[derive(Debug, Default)]
struct Counters {
    total_connections: AtomicU64,
    messages_sent: AtomicU64,
    bytes_sent: AtomicU64,
    evictions: AtomicU64,
    broadcast_errors: AtomicU64,
}

pub struct Hub {
    config: HubConfig,
    sessions: RwLock<HashMap<String, Arc<ClientSession>>>,
    quality: Option<Arc<QualityController>>,
    fallback_level: QualityLevel,
    counters: Counters,
}

impl Hub {
    pub fn new(config: HubConfig) -> Result<Self> {
        config.validate()?;
        let defaults = QualityConfig::default();
        let fallback_level = defaults.levels[defaults.default_level].clone();
        Ok(Self {
            config,
            sessions: RwLock::new(HashMap::new()),
            quality: None,
            fallback_level,
            counters: Counters::default(),
        })
    }

    /// Register sessions with `quality` and encode frames per client level.
    pub fn with_quality_controller(mut self, quality: Arc<QualityController>) -> Self {
        let config = quality.config();
        self.fallback_level = config.levels[config.default_level].clone();
        self.quality = Some(quality);
        self
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn quality_controller(&self) -> Option<&Arc<QualityController>> {
        self.quality.as_ref()
    }

    /// Admit a new client. Returns the session and the receiving half of its
    /// queue, which the connection's writer drains.
    pub fn register(
        &self,
        metadata: SessionMetadata,
    ) -> Result<(Arc<ClientSession>, mpsc::Receiver<Utf8Bytes>)> {
        let (tx, rx) = mpsc::channel(self.config.send_queue_size);
        let client_id = Uuid::new_v4().to_string();
        let session = Arc::new(ClientSession::new(client_id.clone(), metadata, tx));

        {
            let mut sessions = self.sessions.write();
            if sessions.len() >= self.config.max_connections {
                warn!(max = self.config.max_connections, "rejecting client: too many connections");
                return Err(Error::limit_exceeded("too many connections"));
            }
            sessions.insert(client_id.clone(), Arc::clone(&session));
        }

        if let Some(quality) = &self.quality {
            quality.register_client(&client_id);
        }
        self.counters.total_connections.fetch_add(1, Ordering::Relaxed);
        metrics::record_ws_connection(true);
        info!(
            client_id = %client_id,
            remote_addr = ?session.metadata().remote_addr,
            "client connected"
        );
        Ok((session, rx))
    }

    /// Remove and close a session. Returns false if it was already gone.
    pub fn unregister(&self, client_id: &str) -> bool {
        let Some(session) = self.sessions.write().remove(client_id) else {
            return false;
        };
        session.close();
        if let Some(quality) = &self.quality {
            quality.unregister_client(client_id);
        }
        metrics::record_ws_connection(false);
        info!(
            client_id,
            messages_sent = session.messages_sent(),
            bytes_sent = session.bytes_sent(),
            "client disconnected"
        );
        true
    }

    /// Close a session the server gave up on.
    pub fn evict(&self, client_id: &str, reason: &'static str) -> bool {
        if !self.unregister(client_id) {
            return false;
        }
        self.counters.evictions.fetch_add(1, Ordering::Relaxed);
        metrics::record_session_evicted(reason);
        warn!(client_id, reason, "client session evicted");
        true
    }

    pub fn session(&self, client_id: &str) -> Option<Arc<ClientSession>> {
        self.sessions.read().get(client_id).cloned()
    }

    pub fn client_count(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn client_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn snapshot(&self) -> Vec<Arc<ClientSession>> {
        self.sessions.read().values().cloned().collect()
    }

    fn subscribers(&self, stream_id: &str) -> Vec<Arc<ClientSession>> {
        self.sessions
            .read()
            .values()
            .filter(|s| s.is_subscribed(stream_id))
            .cloned()
            .collect()
    }

    /// Handle one inbound text frame. Protocol errors are answered with an
    /// `error` message; the session stays open.
    pub fn handle_client_message(&self, client_id: &str, text: &str) -> Result<()> {
        let session = self
            .session(client_id)
            .ok_or_else(|| Error::not_found(format!("client {client_id}")))?;
        let now = Utc::now();
        session.touch(now);

        let message = match ClientMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                debug!(client_id, error = %e, "invalid client message");
                self.send_to(&session, &ServerMessage::error(e.to_string()));
                return Ok(());
            }
        };

        match message {
            ClientMessage::Subscribe { stream_id } => {
                session.subscribe(&stream_id);
                debug!(client_id, stream_id = %stream_id, "client subscribed");
                let reply = ServerMessage::status(
                    Some(stream_id.clone()),
                    "subscribed",
                    format!("Subscribed to stream {stream_id}"),
                );
                self.send_to(&session, &reply);
            }
            ClientMessage::Unsubscribe { stream_id } => {
                session.unsubscribe(&stream_id);
                debug!(client_id, stream_id = %stream_id, "client unsubscribed");
                let reply = ServerMessage::status(
                    Some(stream_id.clone()),
                    "unsubscribed",
                    format!("Unsubscribed from stream {stream_id}"),
                );
                self.send_to(&session, &reply);
            }
            ClientMessage::Pong => {
                let rtt = session.record_pong(now);
                if let (Some(rtt), Some(quality)) = (rtt, &self.quality) {
                    quality.record_rtt(client_id, rtt);
                }
            }
        }
        Ok(())
    }

    pub fn send_error(&self, client_id: &str, error: impl Into<String>) -> bool {
        match self.session(client_id) {
            Some(session) => self.send_to(&session, &ServerMessage::error(error)),
            None => false,
        }
    }

    fn send_to(&self, session: &Arc<ClientSession>, message: &ServerMessage) -> bool {
        let text = match message.to_json() {
            Ok(text) => Utf8Bytes::from(text),
            Err(e) => {
                warn!(error = %e, "failed to serialize message");
                self.counters.broadcast_errors.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        };
        let outcome = self.deliver(std::slice::from_ref(session), &text, message.message_type());
        outcome.delivered == 1
    }

    fn deliver(
        &self,
        targets: &[Arc<ClientSession>],
        text: &Utf8Bytes,
        message_type: &'static str,
    ) -> BroadcastOutcome {
        let len = text.as_str().len() as u64;
        let mut outcome = BroadcastOutcome::default();
        for session in targets {
            match session.try_enqueue(text.clone()) {
                Ok(()) => {
                    outcome.delivered += 1;
                    outcome.bytes += len;
                    self.counters.messages_sent.fetch_add(1, Ordering::Relaxed);
                    self.counters.bytes_sent.fetch_add(len, Ordering::Relaxed);
                }
                Err(EnqueueError::Full) => {
                    if self.evict(session.client_id(), "slow_consumer") {
                        outcome.evicted += 1;
                    }
                }
                Err(EnqueueError::Closed) => {
                    self.counters.broadcast_errors.fetch_add(1, Ordering::Relaxed);
                    self.unregister(session.client_id());
                }
            }
        }
        metrics::record_ws_message_sent(message_type, outcome.delivered);
        outcome
    }

    /// Enqueue to every session.
    pub fn broadcast(&self, message: &ServerMessage) -> Result<BroadcastOutcome> {
        let text = Utf8Bytes::from(message.to_json()?);
        Ok(self.deliver(&self.snapshot(), &text, message.message_type()))
    }

    /// Enqueue to the sessions subscribed to `stream_id` at call time.
    pub fn broadcast_to_stream(
        &self,
        stream_id: &str,
        message: &ServerMessage,
    ) -> Result<BroadcastOutcome> {
        let targets = self.subscribers(stream_id);
        if targets.is_empty() {
            return Ok(BroadcastOutcome::default());
        }
        let text = Utf8Bytes::from(message.to_json()?);
        Ok(self.deliver(&targets, &text, message.message_type()))
    }

    fn level_for(&self, client_id: &str) -> QualityLevel {
        match &self.quality {
            Some(quality) => quality.optimal_quality(client_id),
            None => self.fallback_level.clone(),
        }
    }

    pub fn broadcast_frame(
        &self,
        stream_id: &str,
        frame: &RawFrame,
        encoder: &dyn FrameEncoder,
    ) -> Result<BroadcastOutcome> {
        self.broadcast_frame_at(stream_id, frame, encoder, Utc::now())
    }

    /// Encode once per quality level among the stream's subscribers and
    /// deliver to the sessions whose frame-rate budget allows a frame at `now`.
    pub fn broadcast_frame_at(
        &self,
        stream_id: &str,
        frame: &RawFrame,
        encoder: &dyn FrameEncoder,
        now: DateTime<Utc>,
    ) -> Result<BroadcastOutcome> {
        let mut groups: BTreeMap<usize, (QualityLevel, Vec<Arc<ClientSession>>)> = BTreeMap::new();
        for session in self.subscribers(stream_id) {
            let level = self.level_for(session.client_id());
            groups
                .entry(level.level)
                .or_insert_with(|| (level, Vec::new()))
                .1
                .push(session);
        }

        let mut outcome = BroadcastOutcome::default();
        for (_, (level, sessions)) in groups {
            let due: Vec<Arc<ClientSession>> = sessions
                .into_iter()
                .filter(|s| s.frame_due(now, level.max_frame_rate))
                .collect();
            if due.is_empty() {
                continue;
            }

            let encoded = match encoder.encode(frame, &level) {
                Ok(encoded) => encoded,
                Err(e) => {
                    warn!(stream_id, level = level.level, error = %e, "frame encoding failed");
                    self.counters.broadcast_errors.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };
            let message = ServerMessage::frame(FramePayload {
                stream_id: stream_id.to_string(),
                frame_id: frame.frame_id.clone(),
                timestamp: frame.timestamp,
                image_data: BASE64.encode(&encoded.data),
                image_format: "jpeg".to_string(),
                width: encoded.width,
                height: encoded.height,
                quality: encoded.jpeg_quality,
                size: encoded.data.len(),
                process_time: millis(frame.process_time),
                has_overlays: frame.has_overlays,
            });
            let text = Utf8Bytes::from(message.to_json()?);
            for session in &due {
                session.mark_frame(now);
            }
            outcome = outcome.merge(self.deliver(&due, &text, message.message_type()));
        }
        Ok(outcome)
    }

    /// Ping every live session and evict those whose last pong is older
    /// than `pong_timeout`.
    pub fn keepalive_tick_at(&self, now: DateTime<Utc>) -> KeepaliveOutcome {
        let timeout = chrono::Duration::from_std(self.config.pong_timeout)
            .unwrap_or(chrono::Duration::MAX);
        let ping = match ServerMessage::ping().to_json() {
            Ok(text) => Utf8Bytes::from(text),
            Err(e) => {
                warn!(error = %e, "failed to serialize ping");
                return KeepaliveOutcome::default();
            }
        };

        let mut outcome = KeepaliveOutcome::default();
        let mut alive = Vec::new();
        for session in self.snapshot() {
            if now - session.last_pong() > timeout {
                if self.evict(session.client_id(), "pong_timeout") {
                    outcome.timed_out += 1;
                }
            } else {
                session.mark_ping(now);
                alive.push(session);
            }
        }
        outcome.pinged = self.deliver(&alive, &ping, "ping").delivered;
        outcome
    }

    pub async fn run_keepalive(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.ping_period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let outcome = self.keepalive_tick_at(Utc::now());
                    debug!(pinged = outcome.pinged, timed_out = outcome.timed_out, "keep-alive pass");
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("keep-alive loop stopped");
    }

    /// Close every session.
    pub fn shutdown(&self) {
        let ids: Vec<String> = self.sessions.read().keys().cloned().collect();
        for id in &ids {
            self.unregister(id);
        }
        info!(closed = ids.len(), "hub shut down");
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            total_connections: self.counters.total_connections.load(Ordering::Relaxed),
            active_connections: self.client_count(),
            messages_sent: self.counters.messages_sent.load(Ordering::Relaxed),
            bytes_sent: self.counters.bytes_sent.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            broadcast_errors: self.counters.broadcast_errors.load(Ordering::Relaxed),
        }
    }
}

impl StreamBroadcaster for Hub {
    fn broadcast_to_stream(&self, stream_id: &str, message: &ServerMessage) -> Result<BroadcastOutcome> {
        Hub::broadcast_to_stream(self, stream_id, message)
    }
}
