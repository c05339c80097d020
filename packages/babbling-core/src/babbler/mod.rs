//! Babbler: request/response on top of a fire-and-forget channel.
//!
//! The receiver application pulls data from the controller on demand:
//! - `INFO` resolves a [`PlayableInfo`] for a content id
//! - `LICENSE` exchanges a base64 license challenge
//! - `QUEUE` lists items adjacent to a content id
//!
//! Each request is handled on its own task. Handler failures are logged and
//! never stop the dispatch loop; the receiver may simply ask again.

mod capabilities;
mod messages;
mod queue;

pub use capabilities::Capabilities;
pub use messages::{BabblerRequest, BabblerResponse, PlayableInfo};
pub use queue::{slice_adjacent, QueueEntry, QueueItem, QueueMode};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::device::{Channel, DEFAULT_RESPONSE_TIMEOUT};
use crate::error::{BabblingError, BabblingResult};
use crate::protocol::{
    LoadRequest, MediaInformation, MediaStatusEntry, ReceiverMessage, RequestIds, StreamType,
};
use crate::runtime::TaskSpawner;
use crate::transport::{InboundMessage, MessageStream};

/// Default Babbler namespace.
pub const BABBLER_NAMESPACE: &str = "urn:x-cast:com.github.dhleong.babbler";

/// Default number of items in a queue response.
pub const DEFAULT_QUEUE_SIZE: usize = 5;

// ─────────────────────────────────────────────────────────────────────────────
// Content provider seam
// ─────────────────────────────────────────────────────────────────────────────

/// Content-provider collaborator answering Babbler requests.
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Resolves a content id to something the receiver can load.
    ///
    /// Fails with [`BabblingError::UnsupportedEntity`] when the id is known
    /// but is not a playable leaf.
    async fn resolve_info(&self, content_id: &str) -> BabblingResult<PlayableInfo>;

    /// Exchanges a license challenge with the provider's license server.
    async fn fetch_license(&self, url: &str, challenge: &[u8]) -> BabblingResult<Vec<u8>> {
        let _ = challenge;
        Err(BabblingError::Provider(format!(
            "license exchange not supported for {}",
            url
        )))
    }

    /// Lists up to `size` items before or after `content_id`, in play order.
    async fn queue_around(
        &self,
        content_id: &str,
        mode: QueueMode,
        size: usize,
    ) -> BabblingResult<Vec<QueueItem>>;

    /// Where to continue watching a series.
    async fn resume_point(&self, series_id: &str) -> BabblingResult<ResumePoint> {
        Err(BabblingError::UnsupportedEntity(series_id.to_string()))
    }

    /// Records the offset, in seconds, playback stopped at.
    async fn report_progress(&self, content_id: &str, offset: f64) -> BabblingResult<()> {
        log::debug!("[Babbler] {} stopped at {:.1}s", content_id, offset);
        Ok(())
    }
}

/// Next content to play for a series, and where to start it.
#[derive(Debug, Clone, PartialEq)]
pub struct ResumePoint {
    pub content_id: String,
    /// Start position in seconds.
    pub start_time: Option<f64>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Options
// ─────────────────────────────────────────────────────────────────────────────

/// Session-wide Babbler behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct BabblerOptions {
    /// Answer `LICENSE` requests in-process.
    pub handle_license: bool,
    /// Items per queue response.
    pub queue_size: usize,
    /// Wait window for the post-LOAD status.
    pub response_timeout: Duration,
    /// Request types declared in the LOAD instruction.
    pub capabilities: Capabilities,
}

impl Default for BabblerOptions {
    fn default() -> Self {
        Self {
            handle_license: false,
            queue_size: DEFAULT_QUEUE_SIZE,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            capabilities: Capabilities::all(),
        }
    }
}

/// What to load.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadOptions {
    pub content_id: String,
    pub content_type: String,
    pub stream_type: StreamType,
    /// Start position in seconds.
    pub start_time: Option<f64>,
    pub metadata: Option<Value>,
    /// Extra custom data; capabilities are merged in.
    pub custom_data: Option<Value>,
    pub autoplay: bool,
}

impl LoadOptions {
    pub fn new(content_id: impl Into<String>) -> Self {
        Self {
            content_id: content_id.into(),
            content_type: "video/mp4".to_string(),
            stream_type: StreamType::Buffered,
            start_time: None,
            metadata: None,
            custom_data: None,
            autoplay: true,
        }
    }

    pub fn start_time(mut self, seconds: Option<f64>) -> Self {
        self.start_time = seconds;
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Session
// ─────────────────────────────────────────────────────────────────────────────

/// A Babbler session over a media channel and a Babbler channel.
#[derive(Clone)]
pub struct BabblerSession {
    media: Channel,
    babbler: Channel,
    source: Arc<dyn MediaSource>,
    options: BabblerOptions,
    ids: Arc<RequestIds>,
}

impl BabblerSession {
    /// # Arguments
    /// * `media` - Channel LOAD is sent on and MEDIA_STATUS arrives on
    /// * `babbler` - Channel carrying INFO/LICENSE/QUEUE requests
    /// * `source` - Provider answering those requests
    /// * `options` - License handling, queue size and timeouts
    pub fn new(
        media: Channel,
        babbler: Channel,
        source: Arc<dyn MediaSource>,
        options: BabblerOptions,
    ) -> Self {
        Self {
            media,
            babbler,
            source,
            options,
            ids: Arc::new(RequestIds::new()),
        }
    }

    pub fn options(&self) -> &BabblerOptions {
        &self.options
    }

    /// Messages on the media channel, for the playback tracker.
    pub fn media_messages(&self) -> MessageStream {
        self.media.messages()
    }

    /// Sends LOAD and waits for the first populated MEDIA_STATUS.
    ///
    /// An empty MEDIA_STATUS does not satisfy the wait. LOAD_FAILED fails
    /// with [`BabblingError::LoadFailed`].
    pub async fn load(&self, load: LoadOptions) -> BabblingResult<MediaStatusEntry> {
        let mut custom_data = match load.custom_data {
            Some(Value::Object(map)) => Value::Object(map),
            Some(other) => json!({ "data": other }),
            None => json!({}),
        };
        custom_data["capabilities"] = self.options.capabilities.bits().into();

        let request = LoadRequest {
            request_id: self.ids.next_id(),
            session_id: self.media.session_id().to_string(),
            media: MediaInformation {
                content_id: load.content_id.clone(),
                content_type: load.content_type,
                stream_type: load.stream_type,
                metadata: load.metadata,
            },
            custom_data: Some(custom_data),
            current_time: load.start_time,
            autoplay: load.autoplay,
        };

        log::info!("[Babbler] Loading {}", load.content_id);
        let status = self
            .media
            .send_and_wait(
                serde_json::to_value(&request)?,
                self.options.response_timeout,
                load_outcome,
            )
            .await?;
        log::info!(
            "[Babbler] Loaded {} (media session {})",
            load.content_id,
            status.media_session_id
        );
        Ok(status)
    }

    /// Starts the request loop on `spawner`.
    ///
    /// The subscription is taken before this returns. The loop ends when the
    /// channel ends or the returned token is cancelled.
    pub fn spawn_dispatch<S>(&self, spawner: S) -> CancellationToken
    where
        S: TaskSpawner + Clone + 'static,
    {
        let cancel = CancellationToken::new();
        let messages = self.babbler.messages();
        let session = self.clone();
        let loop_cancel = cancel.clone();
        spawner
            .clone()
            .spawn(async move { session.dispatch(messages, spawner, loop_cancel).await });
        cancel
    }

    async fn dispatch<S>(self, mut messages: MessageStream, spawner: S, cancel: CancellationToken)
    where
        S: TaskSpawner + 'static,
    {
        log::debug!("[Babbler] Dispatch started on {}", self.babbler.namespace());
        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => break,
                message = messages.next() => message,
            };
            let Some(message) = message else {
                break;
            };

            let session = self.clone();
            spawner.spawn(async move { session.handle_message(message).await });
        }
        log::debug!("[Babbler] Dispatch stopped on {}", self.babbler.namespace());
    }

    async fn handle_message(&self, message: InboundMessage) {
        let request = match BabblerRequest::parse(&message.data) {
            Ok(BabblerRequest::Other) => return,
            Ok(request) => request,
            Err(e) => {
                log::warn!("[Babbler] Ignoring malformed message: {}", e);
                return;
            }
        };

        let kind = request.kind();
        match self.respond(request).await {
            Ok(Some(response)) => {
                if let Err(e) = self.babbler.send_message(&response).await {
                    log::warn!("[Babbler] Failed to send {} response: {}", kind, e);
                }
            }
            Ok(None) => {}
            Err(e) => log::warn!("[Babbler] {} handler failed: {}", kind, e),
        }
    }

    /// Produces the reply for one request, or `None` when it is not serviced.
    pub async fn respond(&self, request: BabblerRequest) -> BabblingResult<Option<BabblerResponse>> {
        match request {
            BabblerRequest::Info {
                request_id,
                content_id,
            } => {
                log::debug!("[Babbler] INFO {}", content_id);
                let info = self.source.resolve_info(&content_id).await?;
                Ok(Some(BabblerResponse::InfoResponse {
                    response_to: request_id,
                    info,
                }))
            }

            BabblerRequest::License {
                request_id,
                base64,
                url,
            } => {
                if !self.options.handle_license {
                    log::debug!("[Babbler] Ignoring LICENSE request {}", request_id);
                    return Ok(None);
                }
                let challenge = STANDARD.decode(base64.as_bytes())?;
                let license = self.source.fetch_license(&url, &challenge).await?;
                Ok(Some(BabblerResponse::LicenseResponse {
                    response_to: request_id,
                    base64: STANDARD.encode(license),
                }))
            }

            BabblerRequest::Queue {
                request_id,
                content_id,
                mode,
            } => {
                if !self.options.capabilities.allows_queue(mode) {
                    log::debug!(
                        "[Babbler] Ignoring undeclared QUEUE {:?} {}",
                        mode,
                        request_id
                    );
                    return Ok(None);
                }
                log::debug!("[Babbler] QUEUE {:?} {}", mode, content_id);
                let items = self
                    .source
                    .queue_around(&content_id, mode, self.options.queue_size)
                    .await?;
                let items = items
                    .iter()
                    .take(self.options.queue_size)
                    .map(|item| QueueEntry::from_item(item, self.options.capabilities))
                    .collect();
                Ok(Some(BabblerResponse::QueueResponse {
                    response_to: request_id,
                    mode,
                    items,
                }))
            }

            BabblerRequest::Other => Ok(None),
        }
    }
}

fn load_outcome(message: &InboundMessage) -> Option<BabblingResult<MediaStatusEntry>> {
    match ReceiverMessage::parse(&message.data) {
        Ok(ReceiverMessage::MediaStatus { status }) => status.into_iter().next().map(Ok),
        Ok(ReceiverMessage::LoadFailed {
            detailed_error_code,
        }) => Some(Err(BabblingError::LoadFailed {
            code: detailed_error_code.unwrap_or_default(),
        })),
        _ => None,
    }
}
