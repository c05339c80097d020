//! Player orchestration.
//!
//! The [`Player`] resolves a URL or a title to a playable action through its
//! content handlers, then runs that action on every configured device
//! concurrently. One device failing never cancels another.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use futures::stream::{self, BoxStream, StreamExt};
use serde::Serialize;
use url::Url;

use crate::apps::{AppContext, AppDescriptor, AppRegistry};
use crate::config::Config;
use crate::daemon::{self, DaemonLauncher, DaemonRequest, RpcCall, DEFAULT_ACK_TIMEOUT};
use crate::device::{CastDevice, DeviceSelector};
use crate::error::{BabblingError, BabblingResult};
use crate::merge::{merge, Merge};
use crate::transport::Transport;

// ─────────────────────────────────────────────────────────────────────────────
// Content handlers
// ─────────────────────────────────────────────────────────────────────────────

/// A title search hit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResult {
    /// Name of the handler that produced it.
    pub handler: String,
    pub title: String,
    pub url: Option<String>,
    /// Action that plays this result.
    pub playable: RpcCall,
}

/// Maps URLs and titles of one content service onto playable actions.
#[async_trait]
pub trait ContentHandler: Send + Sync {
    fn name(&self) -> &str;

    /// Registry name of the app that plays this handler's content.
    fn app_name(&self) -> &str;

    fn owns_url(&self, url: &Url) -> bool;

    async fn create_playable(&self, url: &Url) -> BabblingResult<RpcCall>;

    fn supports_title_search(&self) -> bool {
        false
    }

    /// Lazily searches by title.
    fn query_by_title(&self, title: &str) -> BoxStream<'static, BabblingResult<QueryResult>> {
        let _ = title;
        stream::empty().boxed()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Player
// ─────────────────────────────────────────────────────────────────────────────

/// How to run a playable action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlayerOptions {
    /// Keep device connections open afterwards.
    pub keep_alive: bool,
    /// Hand the session to a detached daemon instead of running it here.
    pub daemon: bool,
}

impl From<&Config> for PlayerOptions {
    /// Configured defaults. Daemon hand-off is always opt-in per play.
    fn from(config: &Config) -> Self {
        Self {
            keep_alive: config.keep_alive,
            daemon: false,
        }
    }
}

/// Result of playing on a single device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DevicePlayResult {
    /// Device name, or its selector when it never connected.
    pub device: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Resolves content through handlers and plays it on every device.
pub struct Player {
    registry: Arc<AppRegistry>,
    handlers: Vec<Arc<dyn ContentHandler>>,
    devices: Vec<Arc<CastDevice>>,
    config: Config,
    launcher: Option<Arc<dyn DaemonLauncher>>,
}

impl Player {
    /// Creates a player with one device per configured device name.
    ///
    /// # Arguments
    /// * `registry` - Apps handlers may name
    /// * `transport` - Transport devices are discovered on
    /// * `config` - Target devices, timeouts and handler options
    pub fn new(registry: Arc<AppRegistry>, transport: Arc<dyn Transport>, config: Config) -> Self {
        let timeouts = config.session_timeouts();
        let devices = config
            .selectors()
            .into_iter()
            .map(|selector| Arc::new(CastDevice::new(transport.clone(), selector, timeouts)))
            .collect();

        Self {
            registry,
            handlers: Vec::new(),
            devices,
            config,
            launcher: None,
        }
    }

    /// Adds a handler; handlers are tried in the order they were added.
    pub fn with_handler(mut self, handler: Arc<dyn ContentHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn DaemonLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn devices(&self) -> &[Arc<CastDevice>] {
        &self.devices
    }

    /// Options taken from the configuration this player was built with.
    pub fn default_options(&self) -> PlayerOptions {
        PlayerOptions::from(&self.config)
    }

    /// Picks the first handler owning `url` and builds its playable.
    ///
    /// Fails with [`BabblingError::NoHandler`] when none claims it.
    pub async fn resolve_by_url(
        &self,
        url: &str,
    ) -> BabblingResult<(Arc<dyn ContentHandler>, RpcCall)> {
        let parsed = Url::parse(url)
            .map_err(|e| BabblingError::NoHandler(format!("{} ({})", url, e)))?;

        let handler = self
            .handlers
            .iter()
            .find(|handler| handler.owns_url(&parsed))
            .cloned()
            .ok_or_else(|| BabblingError::NoHandler(url.to_string()))?;

        log::debug!("[Player] {} handles {}", handler.name(), url);
        let playable = handler.create_playable(&parsed).await?;
        Ok((handler, playable))
    }

    /// Fans `title` out to every handler that searches, merged by arrival.
    pub fn resolve_by_title(&self, title: &str) -> Merge<BabblingResult<QueryResult>> {
        merge(
            self.handlers
                .iter()
                .filter(|handler| handler.supports_title_search())
                .map(|handler| handler.query_by_title(title))
                .collect::<Vec<_>>(),
        )
    }

    /// Runs `playable` for `handler` on every device concurrently.
    ///
    /// Fails only when the handler's app is not registered; per-device
    /// failures are reported in the results.
    pub async fn play_on_each_device(
        &self,
        handler: &dyn ContentHandler,
        playable: RpcCall,
        options: PlayerOptions,
    ) -> BabblingResult<Vec<DevicePlayResult>> {
        let descriptor = self.registry.get(handler.app_name()).ok_or_else(|| {
            BabblingError::Configuration(format!(
                "handler {} names unknown app {}",
                handler.name(),
                handler.app_name()
            ))
        })?;

        log::info!(
            "[Player] Playing {} via {} on {} device(s)",
            playable.method(),
            descriptor.name,
            self.devices.len()
        );

        let plays = self.devices.iter().map(|device| {
            let playable = playable.clone();
            async move {
                let outcome = self
                    .play_on_device(device, descriptor, handler, playable, options)
                    .await;
                let name = match device.info().await {
                    Some(info) => info.name,
                    None => device.selector().to_string(),
                };
                if !options.keep_alive {
                    device.close().await;
                }
                match outcome {
                    Ok(()) => DevicePlayResult {
                        device: name,
                        success: true,
                        error: None,
                    },
                    Err(e) => {
                        log::warn!("[Player] {} failed: {}", name, e);
                        DevicePlayResult {
                            device: name,
                            success: false,
                            error: Some(e.to_string()),
                        }
                    }
                }
            }
        });

        Ok(join_all(plays).await)
    }

    async fn play_on_device(
        &self,
        device: &Arc<CastDevice>,
        descriptor: &AppDescriptor,
        handler: &dyn ContentHandler,
        playable: RpcCall,
        options: PlayerOptions,
    ) -> BabblingResult<()> {
        let app_options = self.config.handler_options(handler.name());

        if options.daemon {
            return self
                .delegate(device, descriptor, app_options, playable)
                .await;
        }

        device.open_app(&descriptor.app_id).await?;
        let app = descriptor.construct(AppContext {
            device: device.clone(),
            options: app_options,
            config: self.config.clone(),
        })?;
        let result = app.invoke(playable).await;
        if !options.keep_alive {
            app.shutdown().await;
        }
        result
    }

    async fn delegate(
        &self,
        device: &Arc<CastDevice>,
        descriptor: &AppDescriptor,
        app_options: serde_json::Value,
        playable: RpcCall,
    ) -> BabblingResult<()> {
        if !descriptor.capabilities.daemon {
            return Err(BabblingError::Daemon(format!(
                "{} cannot run as a daemon",
                descriptor.name
            )));
        }
        let launcher = self
            .launcher
            .as_ref()
            .ok_or_else(|| BabblingError::Daemon("no daemon launcher configured".to_string()))?;

        let device_name = match device.selector() {
            DeviceSelector::Named(name) => Some(name.clone()),
            DeviceSelector::Any => None,
        };
        let request = DaemonRequest {
            device_name,
            app_name: descriptor.name.clone(),
            app_options,
            rpc: Some(playable),
        };
        daemon::spawn(launcher.as_ref(), &request, DEFAULT_ACK_TIMEOUT).await?;
        Ok(())
    }

    /// Resolves `url` and plays it on every device.
    pub async fn play_url(
        &self,
        url: &str,
        options: PlayerOptions,
    ) -> BabblingResult<Vec<DevicePlayResult>> {
        let (handler, playable) = self.resolve_by_url(url).await?;
        self.play_on_each_device(handler.as_ref(), playable, options)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryTransport;

    struct Host {
        name: &'static str,
        host: &'static str,
        titles: Vec<&'static str>,
    }

    #[async_trait]
    impl ContentHandler for Host {
        fn name(&self) -> &str {
            self.name
        }

        fn app_name(&self) -> &str {
            "babbler"
        }

        fn owns_url(&self, url: &Url) -> bool {
            url.host_str() == Some(self.host)
        }

        async fn create_playable(&self, url: &Url) -> BabblingResult<RpcCall> {
            Ok(RpcCall::PlayUrl {
                url: format!("{}:{}", self.name, url.path()),
            })
        }

        fn supports_title_search(&self) -> bool {
            !self.titles.is_empty()
        }

        fn query_by_title(&self, title: &str) -> BoxStream<'static, BabblingResult<QueryResult>> {
            let handler = self.name.to_string();
            let hits: Vec<_> = self
                .titles
                .iter()
                .filter(|candidate| candidate.contains(title))
                .map(|candidate| {
                    Ok(QueryResult {
                        handler: handler.clone(),
                        title: candidate.to_string(),
                        url: None,
                        playable: RpcCall::LoadMedia {
                            content_id: candidate.to_string(),
                            start_time: None,
                        },
                    })
                })
                .collect();
            stream::iter(hits).boxed()
        }
    }

    fn player(handlers: Vec<Host>) -> Player {
        let mut player = Player::new(
            Arc::new(AppRegistry::new()),
            Arc::new(MemoryTransport::new(Vec::new())),
            Config::default(),
        );
        for handler in handlers {
            player = player.with_handler(Arc::new(handler));
        }
        player
    }

    #[tokio::test]
    async fn first_owning_handler_wins() {
        let player = player(vec![
            Host {
                name: "a",
                host: "a.example",
                titles: vec![],
            },
            Host {
                name: "b",
                host: "a.example",
                titles: vec![],
            },
        ]);

        let (handler, playable) = player.resolve_by_url("https://a.example/watch/1").await.unwrap();
        assert_eq!(handler.name(), "a");
        assert_eq!(
            playable,
            RpcCall::PlayUrl {
                url: "a:/watch/1".into()
            }
        );
    }

    #[tokio::test]
    async fn unowned_or_invalid_url_has_no_handler() {
        let player = player(vec![Host {
            name: "a",
            host: "a.example",
            titles: vec![],
        }]);

        for url in ["https://other.example/", "not a url"] {
            let err = player.resolve_by_url(url).await.err().unwrap();
            assert!(matches!(err, BabblingError::NoHandler(_)), "{}", url);
        }
    }

    #[tokio::test]
    async fn title_search_merges_searching_handlers_only() {
        let player = player(vec![
            Host {
                name: "a",
                host: "a.example",
                titles: vec!["The Expanse", "Expanse Recap"],
            },
            Host {
                name: "quiet",
                host: "q.example",
                titles: vec![],
            },
            Host {
                name: "b",
                host: "b.example",
                titles: vec!["The Expanse (4K)"],
            },
        ]);

        let results: Vec<QueryResult> = player
            .resolve_by_title("Expanse")
            .map(|r| r.unwrap())
            .collect()
            .await;

        assert_eq!(results.len(), 3);
        assert!(results.iter().any(|r| r.handler == "b"));
        assert!(results.iter().all(|r| r.handler != "quiet"));
    }

    #[tokio::test]
    async fn unregistered_app_is_a_configuration_error() {
        let player = player(vec![]);
        let handler = Host {
            name: "a",
            host: "a.example",
            titles: vec![],
        };
        let err = player
            .play_on_each_device(
                &handler,
                RpcCall::PlayUrl { url: "x".into() },
                PlayerOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BabblingError::Configuration(_)));
    }
}
