//! Wire messages exchanged with WebSocket clients.
//!
//! Every frame is a JSON object `{type, stream_id?, timestamp, data}`. The
//! `data` shape is determined by `type`, modelled here as [`Payload`].

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::ser::SerializeStruct;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};
use crate::tracker::{Detection, Rect, Track, TrackState, Velocity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameSize {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamedDetection {
    pub id: String,
    pub class: String,
    pub confidence: f64,
    pub bounding_box: Rect,
    pub timestamp: DateTime<Utc>,
}

impl From<&Detection> for StreamedDetection {
    fn from(d: &Detection) -> Self {
        Self {
            id: d.detection_id.clone(),
            class: d.class.clone(),
            confidence: d.confidence,
            bounding_box: d.bbox,
            timestamp: d.timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamedPoint {
    pub x: f64,
    pub y: f64,
    pub timestamp: DateTime<Utc>,
    pub velocity: Velocity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamedTrack {
    /// `track_<n>`
    pub id: String,
    pub class: String,
    pub state: TrackState,
    pub confidence: f64,
    pub bounding_box: Rect,
    pub velocity: Velocity,
    pub age: u32,
    pub hit_streak: u32,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trajectory: Option<Vec<StreamedPoint>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predictions: Option<Vec<StreamedPoint>>,
}

impl StreamedTrack {
    pub fn from_track(track: &Track, include_trajectory: bool, include_predictions: bool) -> Self {
        let trajectory = (include_trajectory && !track.trajectory.is_empty()).then(|| {
            track
                .trajectory
                .iter()
                .map(|p| StreamedPoint {
                    x: p.x,
                    y: p.y,
                    timestamp: p.timestamp,
                    velocity: p.velocity,
                })
                .collect()
        });
        let predictions = (include_predictions && !track.predictions.is_empty()).then(|| {
            track
                .predictions
                .iter()
                .map(|p| {
                    let (x, y) = p.bbox.center();
                    StreamedPoint {
                        x,
                        y,
                        timestamp: p.timestamp,
                        velocity: track.velocity,
                    }
                })
                .collect()
        });

        Self {
            id: track.label(),
            class: track.class.clone(),
            state: track.state,
            confidence: track.confidence,
            bounding_box: track.bbox(),
            velocity: track.velocity,
            age: track.age,
            hit_streak: track.hit_streak,
            first_seen: track.first_seen,
            last_seen: track.last_seen,
            trajectory,
            predictions,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionPayload {
    pub stream_id: String,
    pub frame_id: String,
    pub timestamp: DateTime<Utc>,
    pub detections: Vec<StreamedDetection>,
    /// Milliseconds
    pub process_time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_size: Option<FrameSize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingPayload {
    pub stream_id: String,
    pub frame_id: String,
    pub timestamp: DateTime<Utc>,
    pub tracks: Vec<StreamedTrack>,
    pub new_tracks: Vec<StreamedTrack>,
    pub lost_tracks: Vec<StreamedTrack>,
    /// Milliseconds
    pub process_time: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FramePayload {
    pub stream_id: String,
    pub frame_id: String,
    pub timestamp: DateTime<Utc>,
    /// Base64 encoded image
    pub image_data: String,
    pub image_format: String,
    pub width: u32,
    pub height: u32,
    pub quality: u8,
    /// Encoded image size in bytes, before base64
    pub size: usize,
    pub process_time: f64,
    pub has_overlays: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusPayload {
    pub status: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingPayload {}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Detection(DetectionPayload),
    Tracking(TrackingPayload),
    Frame(FramePayload),
    Status(StatusPayload),
    Error(ErrorPayload),
    Ping(PingPayload),
}

impl Payload {
    pub fn message_type(&self) -> &'static str {
        match self {
            Payload::Detection(_) => "detection",
            Payload::Tracking(_) => "tracking",
            Payload::Frame(_) => "frame",
            Payload::Status(_) => "status",
            Payload::Error(_) => "error",
            Payload::Ping(_) => "ping",
        }
    }
}

/// A server to client message.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerMessage {
    pub stream_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub payload: Payload,
}

impl ServerMessage {
    pub fn new(stream_id: Option<String>, payload: Payload) -> Self {
        Self {
            stream_id,
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn detection(payload: DetectionPayload) -> Self {
        Self::new(Some(payload.stream_id.clone()), Payload::Detection(payload))
    }

    pub fn tracking(payload: TrackingPayload) -> Self {
        Self::new(Some(payload.stream_id.clone()), Payload::Tracking(payload))
    }

    pub fn frame(payload: FramePayload) -> Self {
        Self::new(Some(payload.stream_id.clone()), Payload::Frame(payload))
    }

    pub fn status(
        stream_id: Option<String>,
        status: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(
            stream_id,
            Payload::Status(StatusPayload {
                status: status.into(),
                message: message.into(),
            }),
        )
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self::new(
            None,
            Payload::Error(ErrorPayload {
                error: error.into(),
            }),
        )
    }

    pub fn ping() -> Self {
        Self::new(None, Payload::Ping(PingPayload::default()))
    }

    pub fn message_type(&self) -> &'static str {
        self.payload.message_type()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl Serialize for ServerMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let len = if self.stream_id.is_some() { 4 } else { 3 };
        let mut s = serializer.serialize_struct("ServerMessage", len)?;
        s.serialize_field("type", self.message_type())?;
        if let Some(stream_id) = &self.stream_id {
            s.serialize_field("stream_id", stream_id)?;
        } else {
            s.skip_field("stream_id")?;
        }
        s.serialize_field("timestamp", &self.timestamp)?;
        match &self.payload {
            Payload::Detection(p) => s.serialize_field("data", p)?,
            Payload::Tracking(p) => s.serialize_field("data", p)?,
            Payload::Frame(p) => s.serialize_field("data", p)?,
            Payload::Status(p) => s.serialize_field("data", p)?,
            Payload::Error(p) => s.serialize_field("data", p)?,
            Payload::Ping(p) => s.serialize_field("data", p)?,
        }
        s.end()
    }
}

#[derive(Deserialize)]
struct RawMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    stream_id: Option<String>,
    timestamp: DateTime<Utc>,
    #[serde(default)]
    data: serde_json::Value,
}

impl<'de> Deserialize<'de> for ServerMessage {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = RawMessage::deserialize(deserializer)?;
        let data = if raw.data.is_null() {
            serde_json::Value::Object(serde_json::Map::new())
        } else {
            raw.data
        };
        let payload = match raw.kind.as_str() {
            "detection" => serde_json::from_value(data).map(Payload::Detection),
            "tracking" => serde_json::from_value(data).map(Payload::Tracking),
            "frame" => serde_json::from_value(data).map(Payload::Frame),
            "status" => serde_json::from_value(data).map(Payload::Status),
            "error" => serde_json::from_value(data).map(Payload::Error),
            "ping" => serde_json::from_value(data).map(Payload::Ping),
            other => return Err(D::Error::custom(format!("unknown message type: {other}"))),
        }
        .map_err(D::Error::custom)?;
        Ok(ServerMessage {
            stream_id: raw.stream_id,
            timestamp: raw.timestamp,
            payload,
        })
    }
}

/// A client to server message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    Subscribe { stream_id: String },
    Unsubscribe { stream_id: String },
    Pong,
}

#[derive(Deserialize)]
struct RawClientMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    stream_id: Option<String>,
}

impl ClientMessage {
    /// Parse a text frame. Malformed JSON, unknown types and missing stream
    /// ids are validation errors.
    pub fn parse(text: &str) -> Result<Self> {
        let raw: RawClientMessage = serde_json::from_str(text)
            .map_err(|e| Error::validation(format!("invalid message format: {e}")))?;
        let stream_id = || {
            raw.stream_id
                .clone()
                .filter(|s| !s.is_empty())
                .ok_or_else(|| Error::validation(format!("{} requires stream_id", raw.kind)))
        };
        match raw.kind.as_str() {
            "subscribe" => Ok(ClientMessage::Subscribe {
                stream_id: stream_id()?,
            }),
            "unsubscribe" => Ok(ClientMessage::Unsubscribe {
                stream_id: stream_id()?,
            }),
            "pong" => Ok(ClientMessage::Pong),
            other => Err(Error::validation(format!("unknown message type: {other}"))),
        }
    }

    pub fn to_json(&self) -> String {
        match self {
            ClientMessage::Subscribe { stream_id } => {
                serde_json::json!({"type": "subscribe", "stream_id": stream_id}).to_string()
            }
            ClientMessage::Unsubscribe { stream_id } => {
                serde_json::json!({"type": "unsubscribe", "stream_id": stream_id}).to_string()
            }
            ClientMessage::Pong => serde_json::json!({"type": "pong"}).to_string(),
        }
    }
}

/// Wire representation of a processing duration.
pub fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_shape() {
        let msg = ServerMessage::status(Some("cam".into()), "subscribed", "Subscribed to stream cam");
        let json: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "status");
        assert_eq!(json["stream_id"], "cam");
        assert_eq!(json["data"]["status"], "subscribed");
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn test_ping_omits_stream_id() {
        let json: serde_json::Value =
            serde_json::from_str(&ServerMessage::ping().to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "ping");
        assert!(json.get("stream_id").is_none());
        assert_eq!(json["data"], serde_json::json!({}));
    }

    #[test]
    fn test_tracking_message_decodes() {
        let msg = ServerMessage::tracking(TrackingPayload {
            stream_id: "cam".into(),
            frame_id: "f1".into(),
            timestamp: Utc::now(),
            tracks: vec![],
            new_tracks: vec![],
            lost_tracks: vec![],
            process_time: 1.5,
        });
        let back: ServerMessage = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_unknown_server_type_rejected() {
        let raw = r#"{"type":"bogus","timestamp":"2024-01-01T00:00:00Z","data":{}}"#;
        assert!(serde_json::from_str::<ServerMessage>(raw).is_err());
    }

    #[test]
    fn test_client_parse() {
        assert_eq!(
            ClientMessage::parse(r#"{"type":"subscribe","stream_id":"cam"}"#).unwrap(),
            ClientMessage::Subscribe {
                stream_id: "cam".into()
            }
        );
        assert_eq!(
            ClientMessage::parse(r#"{"type":"pong"}"#).unwrap(),
            ClientMessage::Pong
        );
        assert!(ClientMessage::parse(r#"{"type":"subscribe"}"#).is_err());
        assert!(ClientMessage::parse(r#"{"type":"dance"}"#).is_err());
        assert!(ClientMessage::parse("not json").is_err());
    }

    #[test]
    fn test_client_round_trip() {
        let msg = ClientMessage::Unsubscribe {
            stream_id: "cam".into(),
        };
        assert_eq!(ClientMessage::parse(&msg.to_json()).unwrap(), msg);
    }
}
