//! One connected client: bounded send queue, subscriptions and liveness.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::extract::ws::Utf8Bytes;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub remote_addr: Option<String>,
    pub user_agent: Option<String>,
    pub connected_at: DateTime<Utc>,
}

impl Default for SessionMetadata {
    fn default() -> Self {
        Self {
            remote_addr: None,
            user_agent: None,
            connected_at: Utc::now(),
        }
    }
}

/// Why an enqueue did not happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueError {
    /// The queue is at capacity; the client is not keeping up.
    Full,
    /// The receiving half is gone.
    Closed,
}

#[derive(Debug)]
struct Liveness {
    last_activity: DateTime<Utc>,
    last_pong: DateTime<Utc>,
    last_ping: Option<DateTime<Utc>>,
    last_frame: Option<DateTime<Utc>>,
}

/// Hub-owned state for one client. Other components refer to a session by
/// its `client_id` only.
#[derive(Debug)]
pub struct ClientSession {
    client_id: String,
    metadata: SessionMetadata,
    sender: mpsc::Sender<Utf8Bytes>,
    subscriptions: RwLock<HashSet<String>>,
    liveness: Mutex<Liveness>,
    closed: watch::Sender<bool>,
    messages_sent: AtomicU64,
    bytes_sent: AtomicU64,
}

impl ClientSession {
    pub(crate) fn new(
        client_id: String,
        metadata: SessionMetadata,
        sender: mpsc::Sender<Utf8Bytes>,
    ) -> Self {
        let now = metadata.connected_at;
        let (closed, _) = watch::channel(false);
        Self {
            client_id,
            metadata,
            sender,
            subscriptions: RwLock::new(HashSet::new()),
            liveness: Mutex::new(Liveness {
                last_activity: now,
                last_pong: now,
                last_ping: None,
                last_frame: None,
            }),
            closed,
            messages_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn metadata(&self) -> &SessionMetadata {
        &self.metadata
    }

    /// Returns true when the subscription is new.
    pub fn subscribe(&self, stream_id: &str) -> bool {
        self.subscriptions.write().insert(stream_id.to_string())
    }

    pub fn unsubscribe(&self, stream_id: &str) -> bool {
        self.subscriptions.write().remove(stream_id)
    }

    pub fn is_subscribed(&self, stream_id: &str) -> bool {
        self.subscriptions.read().contains(stream_id)
    }

    /// Sorted copy of the subscription set.
    pub fn subscriptions(&self) -> Vec<String> {
        let mut subs: Vec<String> = self.subscriptions.read().iter().cloned().collect();
        subs.sort();
        subs
    }

    /// Non-blocking enqueue of a serialized message.
    pub fn try_enqueue(&self, text: Utf8Bytes) -> Result<(), EnqueueError> {
        if self.is_closed() {
            return Err(EnqueueError::Closed);
        }
        let len = text.as_str().len() as u64;
        match self.sender.try_send(text) {
            Ok(()) => {
                self.messages_sent.fetch_add(1, Ordering::Relaxed);
                self.bytes_sent.fetch_add(len, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(EnqueueError::Full),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(EnqueueError::Closed),
        }
    }

    /// Signal the connection tasks to shut down. Idempotent.
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    /// Resolves once the session is closed, immediately if it already is.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn touch(&self, now: DateTime<Utc>) {
        self.liveness.lock().last_activity = now;
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.liveness.lock().last_activity
    }

    pub fn last_pong(&self) -> DateTime<Utc> {
        self.liveness.lock().last_pong
    }

    pub(crate) fn mark_ping(&self, now: DateTime<Utc>) {
        self.liveness.lock().last_ping = Some(now);
    }

    /// Record a pong and return the round trip since the last ping, if any.
    pub fn record_pong(&self, now: DateTime<Utc>) -> Option<Duration> {
        let mut live = self.liveness.lock();
        live.last_pong = now;
        live.last_activity = now;
        live.last_ping
            .take()
            .and_then(|sent| (now - sent).to_std().ok())
    }

    /// Frame-rate gate: true when at least `1 / max_fps` has passed since
    /// the last frame recorded with [`mark_frame`](Self::mark_frame).
    pub(crate) fn frame_due(&self, now: DateTime<Utc>, max_fps: u32) -> bool {
        let live = self.liveness.lock();
        match (max_fps > 0, live.last_frame) {
            (true, Some(last)) => {
                now - last >= chrono::Duration::microseconds(1_000_000 / i64::from(max_fps))
            }
            _ => true,
        }
    }

    pub(crate) fn mark_frame(&self, now: DateTime<Utc>) {
        self.liveness.lock().last_frame = Some(now);
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }
}
