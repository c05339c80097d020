//! Wire message model shared by session management, Babbler and the tracker.
//!
//! Inbound payloads are decoded into [`ReceiverMessage`] by their `type`
//! discriminator. Anything the controller does not consume decodes as
//! [`ReceiverMessage::Unknown`] instead of failing.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{BabblingError, BabblingResult};

/// Namespace carrying receiver-wide status (running applications).
pub const RECEIVER_NAMESPACE: &str = "urn:x-cast:com.google.cast.receiver";

/// Default media namespace.
pub const MEDIA_NAMESPACE: &str = "urn:x-cast:com.google.cast.media";

// ─────────────────────────────────────────────────────────────────────────────
// Receiver status
// ─────────────────────────────────────────────────────────────────────────────

/// A running receiver-side application as reported by the receiver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationInfo {
    pub app_id: String,
    /// Per-launch session id.
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub transport_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub display_name: String,
}

/// Receiver-wide status snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiverStatus {
    #[serde(default)]
    pub applications: Vec<ApplicationInfo>,
}

impl ReceiverStatus {
    /// Returns the running instance of `app_id`, if any.
    pub fn application(&self, app_id: &str) -> Option<&ApplicationInfo> {
        self.applications.iter().find(|app| app.app_id == app_id)
    }

    pub fn is_running(&self, app_id: &str) -> bool {
        self.application(app_id).is_some()
    }
}

/// Body of a `RECEIVER_STATUS` message.
///
/// Receivers nest the application list under `status`; some relays flatten
/// it onto the message itself. Both shapes are accepted.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ReceiverStatusBody {
    #[serde(default)]
    status: Option<ReceiverStatus>,
    #[serde(default)]
    applications: Vec<ApplicationInfo>,
}

impl ReceiverStatusBody {
    pub fn into_status(self) -> ReceiverStatus {
        match self.status {
            Some(status) => status,
            None => ReceiverStatus {
                applications: self.applications,
            },
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Media status
// ─────────────────────────────────────────────────────────────────────────────

/// Receiver-native playback states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlayerState {
    Buffering,
    Idle,
    Loading,
    Paused,
    Playing,
}

/// One record of a `MEDIA_STATUS` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaStatusEntry {
    pub media_session_id: i64,
    /// Reported position in seconds.
    #[serde(default)]
    pub current_time: f64,
    pub player_state: PlayerState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_reason: Option<String>,
}

/// Inbound messages consumed by the controller.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReceiverMessage {
    MediaStatus {
        #[serde(default)]
        status: Vec<MediaStatusEntry>,
    },
    ReceiverStatus(ReceiverStatusBody),
    Close,
    #[serde(rename_all = "camelCase")]
    LoadFailed {
        #[serde(default)]
        detailed_error_code: Option<i64>,
    },
    #[serde(other)]
    Unknown,
}

impl ReceiverMessage {
    /// Decodes a channel payload.
    ///
    /// Fails with [`BabblingError::Protocol`] only when a known message type
    /// carries fields of the wrong shape.
    pub fn parse(data: &Value) -> BabblingResult<Self> {
        if !data.get("type").is_some_and(Value::is_string) {
            return Err(BabblingError::Protocol(
                "message has no type discriminator".to_string(),
            ));
        }
        Ok(Self::deserialize(data)?)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Outbound
// ─────────────────────────────────────────────────────────────────────────────

/// How the receiver should treat the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamType {
    #[default]
    Buffered,
    Live,
    None,
}

/// The `media` object of a LOAD instruction.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaInformation {
    pub content_id: String,
    pub content_type: String,
    pub stream_type: StreamType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// A LOAD instruction.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename = "LOAD", rename_all = "camelCase")]
pub struct LoadRequest {
    pub request_id: u64,
    pub session_id: String,
    pub media: MediaInformation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_data: Option<Value>,
    /// Start position in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_time: Option<f64>,
    pub autoplay: bool,
}

/// Monotonic `requestId` allocator.
#[derive(Debug)]
pub struct RequestIds(AtomicU64);

impl RequestIds {
    pub fn new() -> Self {
        Self(AtomicU64::new(1))
    }

    pub fn next_id(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for RequestIds {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_media_status_records() {
        let msg = ReceiverMessage::parse(&json!({
            "type": "MEDIA_STATUS",
            "status": [{"mediaSessionId": 3, "currentTime": 12.5, "playerState": "PLAYING"}]
        }))
        .unwrap();

        let ReceiverMessage::MediaStatus { status } = msg else {
            panic!("expected MEDIA_STATUS, got {:?}", msg);
        };
        assert_eq!(status[0].media_session_id, 3);
        assert_eq!(status[0].player_state, PlayerState::Playing);
        assert!((status[0].current_time - 12.5).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_media_status_parses_with_no_records() {
        let empty = ReceiverMessage::parse(&json!({"type": "MEDIA_STATUS", "status": []})).unwrap();
        assert!(matches!(empty, ReceiverMessage::MediaStatus { status } if status.is_empty()));
    }

    #[test]
    fn receiver_status_accepts_nested_and_flat_shapes() {
        for payload in [
            json!({"type": "RECEIVER_STATUS", "status": {"applications": [{"appId": "233637DE"}]}}),
            json!({"type": "RECEIVER_STATUS", "applications": [{"appId": "233637DE"}]}),
        ] {
            let ReceiverMessage::ReceiverStatus(body) = ReceiverMessage::parse(&payload).unwrap()
            else {
                panic!("expected RECEIVER_STATUS");
            };
            assert!(body.into_status().is_running("233637DE"));
        }
    }

    #[test]
    fn load_failed_carries_code_and_unknown_types_pass() {
        let failed =
            ReceiverMessage::parse(&json!({"type": "LOAD_FAILED", "detailedErrorCode": 104}))
                .unwrap();
        assert_eq!(
            failed,
            ReceiverMessage::LoadFailed {
                detailed_error_code: Some(104)
            }
        );

        let other = ReceiverMessage::parse(&json!({"type": "PONG"})).unwrap();
        assert_eq!(other, ReceiverMessage::Unknown);
    }

    #[test]
    fn missing_type_is_a_protocol_error() {
        let err = ReceiverMessage::parse(&json!({"status": []})).unwrap_err();
        assert!(matches!(err, BabblingError::Protocol(_)));
    }

    #[test]
    fn load_request_wire_shape() {
        let load = LoadRequest {
            request_id: 7,
            session_id: "abc".into(),
            media: MediaInformation {
                content_id: "ep42".into(),
                content_type: "video/mp4".into(),
                stream_type: StreamType::Buffered,
                metadata: None,
            },
            custom_data: Some(json!({"capabilities": 7})),
            current_time: None,
            autoplay: true,
        };

        let value = serde_json::to_value(&load).unwrap();
        assert_eq!(value["type"], "LOAD");
        assert_eq!(value["requestId"], 7);
        assert_eq!(value["sessionId"], "abc");
        assert_eq!(value["media"]["contentId"], "ep42");
        assert_eq!(value["media"]["streamType"], "BUFFERED");
        assert_eq!(value["customData"]["capabilities"], 7);
        assert!(value.get("currentTime").is_none());
    }

    #[test]
    fn request_ids_increase() {
        let ids = RequestIds::new();
        let first = ids.next_id();
        assert!(ids.next_id() > first);
    }
}
