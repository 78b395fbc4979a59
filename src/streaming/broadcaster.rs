//! The narrow capability producers use to publish to a stream's subscribers.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::streaming::message::ServerMessage;

/// Result of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastOutcome {
    /// Sessions the message was enqueued for.
    pub delivered: usize,
    /// Sessions closed because their queue was full.
    pub evicted: usize,
    /// Encoded bytes enqueued, summed over delivered sessions.
    pub bytes: u64,
}

impl BroadcastOutcome {
    pub fn merge(self, other: BroadcastOutcome) -> Self {
        Self {
            delivered: self.delivered + other.delivered,
            evicted: self.evicted + other.evicted,
            bytes: self.bytes + other.bytes,
        }
    }
}

/// Publish to whoever subscribes to a stream. Never blocks on slow consumers.
pub trait StreamBroadcaster: Send + Sync {
    fn broadcast_to_stream(&self, stream_id: &str, message: &ServerMessage) -> Result<BroadcastOutcome>;
}
