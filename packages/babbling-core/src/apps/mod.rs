//! Cast apps and the registry they are constructed from.
//!
//! The registry is built once at process start and passed explicitly to the
//! player and to the daemon child, which looks apps up by name.

mod babbler;

pub use babbler::{BabblerApp, BabblerAppOptions};

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::config::Config;
use crate::daemon::RpcCall;
use crate::device::CastDevice;
use crate::error::{BabblingError, BabblingResult};

/// A controller-side app driving one receiver application.
#[async_trait]
pub trait CastApp: Send + Sync {
    /// Receiver application id.
    fn app_id(&self) -> &str;

    /// Runs a playable action against the app.
    async fn invoke(&self, call: RpcCall) -> BabblingResult<()>;

    /// Services the session until it ends. Only meaningful in a daemon.
    async fn run_daemon(&self) -> BabblingResult<()> {
        Err(BabblingError::Daemon(format!(
            "{} cannot run as a daemon",
            self.app_id()
        )))
    }

    /// Stops background work started by [`invoke`](Self::invoke).
    async fn shutdown(&self) {}
}

/// What a constructor receives.
#[derive(Clone)]
pub struct AppContext {
    /// Device the app runs on; may not be connected yet.
    pub device: Arc<CastDevice>,
    /// App-specific options.
    pub options: Value,
    pub config: Config,
}

/// Constructs an app for a context.
pub type AppConstructor =
    Arc<dyn Fn(AppContext) -> BabblingResult<Arc<dyn CastApp>> + Send + Sync>;

/// What an app supports beyond plain playback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct AppCapabilities {
    /// Can hand its session to a daemon.
    pub daemon: bool,
}

/// Registry entry: name, receiver app id, capabilities and constructor.
#[derive(Clone)]
pub struct AppDescriptor {
    pub name: String,
    pub app_id: String,
    pub capabilities: AppCapabilities,
    constructor: AppConstructor,
}

impl AppDescriptor {
    pub fn new<F>(
        name: impl Into<String>,
        app_id: impl Into<String>,
        capabilities: AppCapabilities,
        constructor: F,
    ) -> Self
    where
        F: Fn(AppContext) -> BabblingResult<Arc<dyn CastApp>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            app_id: app_id.into(),
            capabilities,
            constructor: Arc::new(constructor),
        }
    }

    pub fn construct(&self, context: AppContext) -> BabblingResult<Arc<dyn CastApp>> {
        (self.constructor)(context)
    }
}

impl fmt::Debug for AppDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppDescriptor")
            .field("name", &self.name)
            .field("app_id", &self.app_id)
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

/// Apps by name, in registration order.
#[derive(Debug, Clone, Default)]
pub struct AppRegistry {
    apps: Vec<AppDescriptor>,
}

impl AppRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an app. Names must be unique.
    pub fn register(&mut self, descriptor: AppDescriptor) -> BabblingResult<()> {
        if self.get(&descriptor.name).is_some() {
            return Err(BabblingError::Configuration(format!(
                "app {} registered twice",
                descriptor.name
            )));
        }
        log::debug!(
            "[Player] Registered app {} ({})",
            descriptor.name,
            descriptor.app_id
        );
        self.apps.push(descriptor);
        Ok(())
    }

    pub fn with(mut self, descriptor: AppDescriptor) -> BabblingResult<Self> {
        self.register(descriptor)?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<&AppDescriptor> {
        self.apps.iter().find(|app| app.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &AppDescriptor> {
        self.apps.iter()
    }

    pub fn len(&self) -> usize {
        self.apps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
    }
}
