//! Metrics emitted through the `metrics` facade.
//!
//! Nothing here installs a recorder; without one every call is a no-op.

use metrics::{counter, gauge, histogram};

/// Metric names as constants for consistency.
pub mod names {
    // Tracking
    pub const TRACKS_CREATED_TOTAL: &str = "streamtrack_tracks_created_total";
    pub const TRACKS_DELETED_TOTAL: &str = "streamtrack_tracks_deleted_total";
    pub const FRAMES_PROCESSED_TOTAL: &str = "streamtrack_frames_processed_total";
    pub const TRACKING_PROCESS_SECONDS: &str = "streamtrack_tracking_process_seconds";
    pub const ACTIVE_STREAMS: &str = "streamtrack_active_streams";

    // Zones
    pub const ZONE_EVENTS_TOTAL: &str = "streamtrack_zone_events_total";

    // WebSocket
    pub const WS_CONNECTIONS_TOTAL: &str = "streamtrack_ws_connections_total";
    pub const WS_CONNECTIONS_ACTIVE: &str = "streamtrack_ws_connections_active";
    pub const WS_MESSAGES_SENT: &str = "streamtrack_ws_messages_sent_total";
    pub const SESSIONS_EVICTED_TOTAL: &str = "streamtrack_sessions_evicted_total";

    // Quality
    pub const QUALITY_ADAPTATIONS_TOTAL: &str = "streamtrack_quality_adaptations_total";
}

pub fn record_tracks_created(count: usize) {
    if count > 0 {
        counter!(names::TRACKS_CREATED_TOTAL).increment(count as u64);
    }
}

pub fn record_tracks_deleted(count: usize) {
    if count > 0 {
        counter!(names::TRACKS_DELETED_TOTAL).increment(count as u64);
    }
}

/// Record one processed frame and how long tracking took.
pub fn record_frame_processed(stream_id: &str, duration_secs: f64) {
    let labels = [("stream_id", stream_id.to_string())];
    counter!(names::FRAMES_PROCESSED_TOTAL, &labels).increment(1);
    histogram!(names::TRACKING_PROCESS_SECONDS, &labels).record(duration_secs);
}

pub fn set_active_streams(count: usize) {
    gauge!(names::ACTIVE_STREAMS).set(count as f64);
}

pub fn record_zone_event(event_type: &str) {
    counter!(names::ZONE_EVENTS_TOTAL, "type" => event_type.to_string()).increment(1);
}

/// Record a WebSocket connection opening or closing.
pub fn record_ws_connection(connected: bool) {
    if connected {
        counter!(names::WS_CONNECTIONS_TOTAL).increment(1);
        gauge!(names::WS_CONNECTIONS_ACTIVE).increment(1.0);
    } else {
        gauge!(names::WS_CONNECTIONS_ACTIVE).decrement(1.0);
    }
}

pub fn record_ws_message_sent(message_type: &'static str, recipients: usize) {
    if recipients > 0 {
        counter!(names::WS_MESSAGES_SENT, "type" => message_type).increment(recipients as u64);
    }
}

/// Record a session closed by the server (slow consumer, pong timeout, write timeout).
pub fn record_session_evicted(reason: &'static str) {
    counter!(names::SESSIONS_EVICTED_TOTAL, "reason" => reason).increment(1);
}

pub fn record_quality_adaptation(upgrade: bool) {
    let direction = if upgrade { "up" } else { "down" };
    counter!(names::QUALITY_ADAPTATIONS_TOTAL, "direction" => direction).increment(1);
}
