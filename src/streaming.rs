//! Real-time fan-out of tracking results to WebSocket clients, with
//! per-client adaptive quality.

mod broadcaster;
mod frame;
mod hub;
mod message;
mod network_monitor;
mod quality;
mod session;
mod streamer;
pub mod ws;

pub use broadcaster::{BroadcastOutcome, StreamBroadcaster};
pub use frame::{EncodedFrame, FrameEncoder, PassthroughEncoder, RawFrame, fit_resolution};
pub use hub::{Hub, HubConfig, HubStats, KeepaliveOutcome};
pub use message::{
    ClientMessage, DetectionPayload, ErrorPayload, FramePayload, FrameSize, Payload, PingPayload,
    ServerMessage, StatusPayload, StreamedDetection, StreamedPoint, StreamedTrack, TrackingPayload,
    millis,
};
pub use network_monitor::{NetworkMonitor, NetworkMonitorConfig, NetworkSample, estimate_bandwidth};
pub use quality::{
    ClientQualityProfile, MetricsSample, NetworkMetrics, QualityChange, QualityConfig,
    QualityController, QualityLevel, QualityStats, Resolution, connection_quality,
};
pub use session::{ClientSession, EnqueueError, SessionMetadata};
pub use streamer::{DetectionStreamer, DetectionStreamerConfig, StreamerStats};
