//! Queue items and their wire formatting.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::capabilities::Capabilities;

/// Direction of a queue request relative to the current item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueMode {
    Before,
    After,
}

/// A schedulable unit of playable content.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub series_title: Option<String>,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub license_url: Option<String>,
    /// Resume position in seconds.
    #[serde(default)]
    pub resume_position: Option<f64>,
}

impl QueueItem {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            ..Self::default()
        }
    }
}

/// Returns up to `size` items adjacent to `content_id`, in list order.
///
/// `After` yields the items following it, `Before` the items preceding it.
/// An unknown `content_id` yields nothing.
pub fn slice_adjacent<'a>(
    items: &'a [QueueItem],
    content_id: &str,
    mode: QueueMode,
    size: usize,
) -> &'a [QueueItem] {
    let Some(index) = items.iter().position(|item| item.id == content_id) else {
        return &[];
    };

    match mode {
        QueueMode::After => {
            let start = index + 1;
            let end = start.saturating_add(size).min(items.len());
            &items[start..end]
        }
        QueueMode::Before => &items[index.saturating_sub(size)..index],
    }
}

/// One entry of a `QUEUE_RESPONSE`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub content_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<f64>,
    pub custom_data: Value,
    pub metadata: Value,
}

impl QueueEntry {
    pub fn from_item(item: &QueueItem, capabilities: Capabilities) -> Self {
        let mut custom = Map::new();
        if let Some(url) = &item.license_url {
            custom.insert("license".into(), Value::String(url.clone()));
        }
        if !capabilities.is_empty() {
            custom.insert("capabilities".into(), capabilities.bits().into());
        }

        let mut metadata = Map::new();
        metadata.insert("metadataType".into(), 0.into());
        metadata.insert("title".into(), Value::String(item.title.clone()));
        if let Some(series) = &item.series_title {
            metadata.insert("seriesTitle".into(), Value::String(series.clone()));
        }
        metadata.insert(
            "images".into(),
            item.images
                .iter()
                .map(|url| serde_json::json!({ "url": url }))
                .collect(),
        );

        Self {
            content_id: item.id.clone(),
            start_time: item.resume_position,
            custom_data: Value::Object(custom),
            metadata: Value::Object(metadata),
        }
    }
}
