//! Babbler request and response envelopes.
//!
//! Requests carry a `requestId`; the matching response echoes it back as
//! `responseTo`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::queue::{QueueEntry, QueueMode};
use crate::error::{BabblingError, BabblingResult};

/// Content resolved on demand for an `INFO` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayableInfo {
    pub content_id: String,
    /// Resolved playback URL.
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    /// Decryption and license parameters for the receiver.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_data: Option<Value>,
}

/// A request issued by the receiver application.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BabblerRequest {
    #[serde(rename_all = "camelCase")]
    Info { request_id: u64, content_id: String },
    #[serde(rename_all = "camelCase")]
    License {
        request_id: u64,
        /// Base64-encoded license challenge.
        base64: String,
        url: String,
    },
    #[serde(rename_all = "camelCase")]
    Queue {
        request_id: u64,
        content_id: String,
        mode: QueueMode,
    },
    /// Anything else seen on the namespace.
    #[serde(other)]
    Other,
}

impl BabblerRequest {
    pub fn parse(data: &Value) -> BabblingResult<Self> {
        if !data.get("type").is_some_and(Value::is_string) {
            return Err(BabblingError::Protocol(
                "babbler message has no type".to_string(),
            ));
        }
        Ok(Self::deserialize(data)?)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Info { .. } => "INFO",
            Self::License { .. } => "LICENSE",
            Self::Queue { .. } => "QUEUE",
            Self::Other => "OTHER",
        }
    }
}

/// A reply sent by the controller.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BabblerResponse {
    #[serde(rename_all = "camelCase")]
    InfoResponse {
        response_to: u64,
        #[serde(flatten)]
        info: PlayableInfo,
    },
    #[serde(rename_all = "camelCase")]
    LicenseResponse { response_to: u64, base64: String },
    #[serde(rename_all = "camelCase")]
    QueueResponse {
        response_to: u64,
        mode: QueueMode,
        items: Vec<QueueEntry>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_each_request_type() {
        let info = BabblerRequest::parse(&json!({"type": "INFO", "requestId": 1, "contentId": "ep1"}));
        assert_eq!(
            info.unwrap(),
            BabblerRequest::Info {
                request_id: 1,
                content_id: "ep1".into()
            }
        );

        let queue = BabblerRequest::parse(
            &json!({"type": "QUEUE", "requestId": 2, "contentId": "ep1", "mode": "before"}),
        );
        assert!(matches!(
            queue.unwrap(),
            BabblerRequest::Queue { mode: QueueMode::Before, .. }
        ));

        let other = BabblerRequest::parse(&json!({"type": "MEDIA_STATUS"})).unwrap();
        assert_eq!(other, BabblerRequest::Other);
    }

    #[test]
    fn malformed_request_is_protocol_error() {
        let err = BabblerRequest::parse(&json!({"type": "INFO", "requestId": "x"})).unwrap_err();
        assert!(matches!(err, BabblingError::Protocol(_)));
    }

    #[test]
    fn info_response_flattens_info() {
        let response = BabblerResponse::InfoResponse {
            response_to: 9,
            info: PlayableInfo {
                content_id: "ep1".into(),
                url: "https://cdn/ep1.mpd".into(),
                content_type: None,
                custom_data: Some(json!({"licenseUrl": "https://lic"})),
            },
        };

        let value = serde_json::to_value(response).unwrap();
        assert_eq!(value["type"], "INFO_RESPONSE");
        assert_eq!(value["responseTo"], 9);
        assert_eq!(value["url"], "https://cdn/ep1.mpd");
        assert_eq!(value["customData"]["licenseUrl"], "https://lic");
    }
}
