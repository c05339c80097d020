//! Plain-data messages crossing the controller/daemon process boundary.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A deferred method call on a cast app.
///
/// Serialized as `{"method": ..., "args": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "args", rename_all = "camelCase")]
pub enum RpcCall {
    /// Load a content id, optionally from a start position in seconds.
    #[serde(rename_all = "camelCase")]
    LoadMedia {
        content_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        start_time: Option<f64>,
    },
    /// Play whatever `url` points at.
    PlayUrl { url: String },
    /// Continue a series from its resume point.
    #[serde(rename_all = "camelCase")]
    ResumeSeries { series_id: String },
}

impl RpcCall {
    pub fn method(&self) -> &'static str {
        match self {
            Self::LoadMedia { .. } => "loadMedia",
            Self::PlayUrl { .. } => "playUrl",
            Self::ResumeSeries { .. } => "resumeSeries",
        }
    }
}

/// Everything a daemon needs to rebuild an app, sent as one JSON line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonRequest {
    /// Device to connect to; `None` takes the first that answers.
    #[serde(default)]
    pub device_name: Option<String>,
    /// Registry name of the app to construct.
    pub app_name: String,
    #[serde(default)]
    pub app_options: Value,
    /// Call to run once the app is ready.
    #[serde(default)]
    pub rpc: Option<RpcCall>,
}

/// Line written back by the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DaemonReply {
    Ready,
    Error { message: String },
}
