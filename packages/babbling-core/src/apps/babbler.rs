//! A cast app speaking the Babbler protocol for a [`MediaSource`].

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{AppCapabilities, AppContext, AppDescriptor, CastApp};
use crate::babbler::{BabblerOptions, BabblerSession, LoadOptions, MediaSource, BABBLER_NAMESPACE};
use crate::daemon::RpcCall;
use crate::device::CastDevice;
use crate::error::{BabblingError, BabblingResult};
use crate::protocol::{MediaStatusEntry, MEDIA_NAMESPACE};
use crate::runtime::TokioSpawner;
use crate::tracker::{PlaybackTracker, TrackedMedia, TrackerHost};

/// Options accepted in [`AppContext::options`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BabblerAppOptions {
    /// Answer LICENSE requests in-process.
    pub handle_license: bool,
    /// Overrides the Babbler namespace.
    pub namespace: Option<String>,
}

/// Babbler-speaking app bound to one device.
pub struct BabblerApp {
    inner: Arc<Inner>,
}

struct Inner {
    app_id: String,
    namespace: String,
    device: Arc<CastDevice>,
    source: Arc<dyn MediaSource>,
    options: BabblerOptions,
    session: AsyncMutex<Option<(BabblerSession, CancellationToken)>>,
    media: Mutex<Option<TrackedMedia>>,
    /// Status that confirmed the last LOAD, and when it arrived.
    loaded: Mutex<Option<(MediaStatusEntry, Instant)>>,
}

impl BabblerApp {
    /// # Arguments
    /// * `app_id` - Receiver application id of the Babbler receiver
    /// * `source` - Provider answering INFO/LICENSE/QUEUE
    /// * `context` - Device, options and config from the registry
    pub fn new(
        app_id: impl Into<String>,
        source: Arc<dyn MediaSource>,
        context: AppContext,
    ) -> BabblingResult<Self> {
        let app_options: BabblerAppOptions = if context.options.is_null() {
            BabblerAppOptions::default()
        } else {
            serde_json::from_value(context.options).map_err(|e| {
                BabblingError::Configuration(format!("invalid babbler options: {}", e))
            })?
        };

        Ok(Self {
            inner: Arc::new(Inner {
                app_id: app_id.into(),
                namespace: app_options
                    .namespace
                    .unwrap_or_else(|| BABBLER_NAMESPACE.to_string()),
                device: context.device,
                source,
                options: BabblerOptions {
                    handle_license: app_options.handle_license,
                    queue_size: context.config.queue_size,
                    response_timeout: context.config.response_timeout(),
                    ..BabblerOptions::default()
                },
                session: AsyncMutex::new(None),
                media: Mutex::new(None),
                loaded: Mutex::new(None),
            }),
        })
    }

    /// Registry entry constructing a `BabblerApp` for `source`.
    pub fn descriptor(
        name: impl Into<String>,
        app_id: impl Into<String>,
        source: Arc<dyn MediaSource>,
    ) -> AppDescriptor {
        let app_id = app_id.into();
        let constructor_app_id = app_id.clone();
        AppDescriptor::new(
            name,
            app_id,
            AppCapabilities { daemon: true },
            move |context| {
                let app = BabblerApp::new(constructor_app_id.clone(), source.clone(), context)?;
                Ok(Arc::new(app) as Arc<dyn CastApp>)
            },
        )
    }

    /// Media currently loaded, if any.
    pub fn current_media(&self) -> Option<TrackedMedia> {
        self.inner.current_media()
    }
}

impl Inner {
    /// Opens the app and both channels once, starting request dispatch.
    async fn session(&self) -> BabblingResult<BabblerSession> {
        let mut slot = self.session.lock().await;
        if let Some((session, _)) = slot.as_ref() {
            return Ok(session.clone());
        }

        let app = self.device.open_app(&self.app_id).await?;
        let media = app.join_or_run_channel(MEDIA_NAMESPACE).await?;
        let babbler = app.join_or_run_channel(&self.namespace).await?;
        let session = BabblerSession::new(media, babbler, self.source.clone(), self.options.clone());
        let dispatch = session.spawn_dispatch(TokioSpawner::current());
        *slot = Some((session.clone(), dispatch));
        Ok(session)
    }

    async fn load(&self, content_id: String, start_time: Option<f64>) -> BabblingResult<()> {
        let session = self.session().await?;
        self.set_current_media(Some(TrackedMedia::new(content_id.clone())));
        *self.loaded.lock() = None;
        let status = session
            .load(LoadOptions::new(content_id).start_time(start_time))
            .await?;
        *self.loaded.lock() = Some((status, Instant::now()));
        Ok(())
    }

    async fn stop_dispatch(&self) {
        if let Some((_, dispatch)) = self.session.lock().await.take() {
            dispatch.cancel();
        }
    }
}

#[async_trait]
impl TrackerHost for Inner {
    fn current_media(&self) -> Option<TrackedMedia> {
        self.media.lock().clone()
    }

    fn set_current_media(&self, media: Option<TrackedMedia>) {
        *self.media.lock() = media;
    }

    async fn on_player_paused(&self, media: &TrackedMedia, offset: f64) {
        if let Err(e) = self.source.report_progress(&media.content_id, offset).await {
            log::warn!(
                "[Babbler] Failed to record progress for {}: {}",
                media.content_id,
                e
            );
        }
    }

    async fn disconnect(&self) {
        self.stop_dispatch().await;
        self.device.close().await;
    }
}

#[async_trait]
impl CastApp for BabblerApp {
    fn app_id(&self) -> &str {
        &self.inner.app_id
    }

    async fn invoke(&self, call: RpcCall) -> BabblingResult<()> {
        log::info!("[Babbler] Invoking {} on {}", call.method(), self.inner.app_id);
        match call {
            RpcCall::LoadMedia {
                content_id,
                start_time,
            } => self.inner.load(content_id, start_time).await,
            RpcCall::PlayUrl { url } => self.inner.load(url, None).await,
            RpcCall::ResumeSeries { series_id } => {
                let point = self.inner.source.resume_point(&series_id).await?;
                self.inner.load(point.content_id, point.start_time).await
            }
        }
    }

    async fn run_daemon(&self) -> BabblingResult<()> {
        let session = self.inner.session().await?;
        let app = self.inner.device.open_app(&self.inner.app_id).await?;

        let mut tracker = PlaybackTracker::new(self.inner.clone(), self.inner.app_id.clone());
        let loaded = self.inner.loaded.lock().take();
        if let Some((status, received_at)) = loaded {
            tracker = tracker.seeded(status, received_at);
        }
        let state = tracker
            .run(session.media_messages(), app.receiver_messages())
            .await;
        if !state.is_closed() {
            log::info!("[Babbler] Status streams ended for {}", self.inner.app_id);
            self.inner.stop_dispatch().await;
        }
        Ok(())
    }

    async fn shutdown(&self) {
        self.inner.stop_dispatch().await;
    }
}
