//! Device discovery and session management.
//!
//! [`CastDevice`] owns at most one connection to a receiver and caches the
//! applications opened on it. [`ReceiverApp`] caches one [`Channel`] per
//! namespace for the life of that connection.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use futures::future;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;

use crate::error::{BabblingError, BabblingResult};
use crate::protocol::{ApplicationInfo, ReceiverMessage, ReceiverStatus};
use crate::transport::{
    ChannelLink, ConnectionState, DeviceInfo, DeviceLink, InboundMessage, MessageStream,
    Transport, TransportError,
};

/// Default time to wait for a matching device to answer discovery.
pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(15);

/// Default time to wait for the receiver to report a launched app.
pub const DEFAULT_LAUNCH_TIMEOUT: Duration = Duration::from_secs(15);

/// Default wait window for a correlated response or status.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

// ─────────────────────────────────────────────────────────────────────────────
// Selection & Options
// ─────────────────────────────────────────────────────────────────────────────

/// Which discovered device to keep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceSelector {
    /// The first device that answers.
    Any,
    /// The device whose name equals this one.
    Named(String),
}

impl DeviceSelector {
    pub fn matches(&self, info: &DeviceInfo) -> bool {
        match self {
            Self::Any => true,
            Self::Named(name) => info.name == *name,
        }
    }
}

impl From<Option<&str>> for DeviceSelector {
    fn from(name: Option<&str>) -> Self {
        match name {
            Some(name) if !name.is_empty() => Self::Named(name.to_string()),
            _ => Self::Any,
        }
    }
}

impl fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("any device"),
            Self::Named(name) => write!(f, "device \"{}\"", name),
        }
    }
}

/// Wait windows used by session management.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimeouts {
    pub discovery: Duration,
    pub launch: Duration,
    pub response: Duration,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            discovery: DEFAULT_DISCOVERY_TIMEOUT,
            launch: DEFAULT_LAUNCH_TIMEOUT,
            response: DEFAULT_RESPONSE_TIMEOUT,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Device
// ─────────────────────────────────────────────────────────────────────────────

/// A receiver selected by discovery, connected lazily.
pub struct CastDevice {
    transport: Arc<dyn Transport>,
    selector: DeviceSelector,
    timeouts: SessionTimeouts,
    link: AsyncMutex<Option<Arc<dyn DeviceLink>>>,
    apps: AsyncMutex<HashMap<String, Arc<ReceiverApp>>>,
    state: Mutex<ConnectionState>,
}

impl CastDevice {
    /// Creates an unconnected device handle.
    ///
    /// # Arguments
    /// * `transport` - Transport used for discovery and connection
    /// * `selector` - Which discovered device to keep
    /// * `timeouts` - Discovery, launch and response wait windows
    pub fn new(
        transport: Arc<dyn Transport>,
        selector: DeviceSelector,
        timeouts: SessionTimeouts,
    ) -> Self {
        Self {
            transport,
            selector,
            timeouts,
            link: AsyncMutex::new(None),
            apps: AsyncMutex::new(HashMap::new()),
            state: Mutex::new(ConnectionState::Disconnected),
        }
    }

    pub fn selector(&self) -> &DeviceSelector {
        &self.selector
    }

    pub fn timeouts(&self) -> SessionTimeouts {
        self.timeouts
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Discovery info of the connected device, if any.
    pub async fn info(&self) -> Option<DeviceInfo> {
        self.link.lock().await.as_ref().map(|link| link.info().clone())
    }

    /// Connects to the first device matching the selector.
    ///
    /// Idempotent: returns the cached link while connected. Fails with
    /// [`BabblingError::NotFound`] when discovery yields no match in time.
    pub async fn connect(&self) -> BabblingResult<Arc<dyn DeviceLink>> {
        let mut link = self.link.lock().await;
        if let Some(link) = link.as_ref() {
            return Ok(link.clone());
        }

        *self.state.lock() = ConnectionState::Connecting;
        match self.discover_and_connect().await {
            Ok(device) => {
                log::info!(
                    "[Session] Connected to {} ({})",
                    device.info().name,
                    device.info().address
                );
                *link = Some(device.clone());
                *self.state.lock() = ConnectionState::Connected;
                Ok(device)
            }
            Err(e) => {
                *self.state.lock() = ConnectionState::Disconnected;
                Err(e)
            }
        }
    }

    async fn discover_and_connect(&self) -> BabblingResult<Arc<dyn DeviceLink>> {
        let found = tokio::time::timeout(self.timeouts.discovery, self.find_match()).await;
        let device = match found {
            Ok(result) => result?,
            Err(_) => {
                return Err(BabblingError::NotFound(format!(
                    "no {} answered within {:?}",
                    self.selector, self.timeouts.discovery
                )))
            }
        };
        device.connect().await?;
        Ok(device)
    }

    /// Scans discovery until the selector matches.
    ///
    /// Non-matching candidates are disconnected as they appear. Dropping the
    /// stream on return ends the discovery session.
    async fn find_match(&self) -> BabblingResult<Arc<dyn DeviceLink>> {
        let mut candidates = self.transport.discover();
        while let Some(candidate) = candidates.next().await {
            let candidate = match candidate {
                Ok(candidate) => candidate,
                Err(e) => {
                    log::warn!("[Session] Discovery error: {}", e);
                    continue;
                }
            };
            if self.selector.matches(candidate.info()) {
                return Ok(candidate);
            }
            log::debug!("[Session] Skipping {}", candidate.info().name);
            candidate.disconnect().await;
        }
        Err(BabblingError::NotFound(format!(
            "discovery ended without finding {}",
            self.selector
        )))
    }

    /// One-shot receiver status query.
    pub async fn request_status(&self) -> BabblingResult<ReceiverStatus> {
        let link = self.connect().await?;
        Ok(link.receiver_status().await?)
    }

    /// Receiver-namespace messages from now on.
    pub async fn receiver_messages(&self) -> BabblingResult<MessageStream> {
        Ok(self.connect().await?.receiver_messages())
    }

    /// Opens `app_id`, joining a running instance or launching a new one.
    ///
    /// Cached for the life of the connection. Fails with
    /// [`BabblingError::NotFound`] if the receiver does not report the app
    /// as running within the launch timeout.
    pub async fn open_app(&self, app_id: &str) -> BabblingResult<Arc<ReceiverApp>> {
        let link = self.connect().await?;
        let mut apps = self.apps.lock().await;
        if let Some(app) = apps.get(app_id) {
            return Ok(app.clone());
        }

        let info = self.launch_or_join(&link, app_id).await?;
        log::info!(
            "[Session] {} running with session {}",
            info.app_id,
            info.session_id
        );
        let app = Arc::new(ReceiverApp::new(link, info, self.timeouts.response));
        apps.insert(app_id.to_string(), app.clone());
        Ok(app)
    }

    async fn launch_or_join(
        &self,
        link: &Arc<dyn DeviceLink>,
        app_id: &str,
    ) -> BabblingResult<ApplicationInfo> {
        let status = link.receiver_status().await?;
        if let Some(running) = status.application(app_id) {
            log::debug!("[Session] Joining running {}", app_id);
            return Ok(running.clone());
        }

        // Subscribe first so the launch broadcast cannot be missed.
        let messages = link.receiver_messages();
        log::info!("[Session] Launching {}", app_id);
        link.launch(app_id).await?;

        let launched = messages.filter_map(|msg| {
            future::ready(match ReceiverMessage::parse(&msg.data) {
                Ok(ReceiverMessage::ReceiverStatus(body)) => {
                    body.into_status().application(app_id).cloned()
                }
                _ => None,
            })
        });
        let mut launched = pin!(launched);

        match tokio::time::timeout(self.timeouts.launch, launched.next()).await {
            Ok(Some(info)) => Ok(info),
            Ok(None) | Err(_) => Err(BabblingError::NotFound(format!(
                "{} was not reported as launched within {:?}",
                app_id, self.timeouts.launch
            ))),
        }
    }

    /// Disconnects and drops every cached application and channel.
    pub async fn close(&self) {
        let link = self.link.lock().await.take();
        self.apps.lock().await.clear();
        if let Some(link) = link {
            log::info!("[Session] Disconnecting from {}", link.info().name);
            link.disconnect().await;
        }
        *self.state.lock() = ConnectionState::Disconnected;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Application
// ─────────────────────────────────────────────────────────────────────────────

/// A running receiver-side application on a connected device.
pub struct ReceiverApp {
    link: Arc<dyn DeviceLink>,
    info: ApplicationInfo,
    response_timeout: Duration,
    channels: AsyncMutex<HashMap<String, Channel>>,
}

impl ReceiverApp {
    pub fn new(link: Arc<dyn DeviceLink>, info: ApplicationInfo, response_timeout: Duration) -> Self {
        Self {
            link,
            info,
            response_timeout,
            channels: AsyncMutex::new(HashMap::new()),
        }
    }

    pub fn app_id(&self) -> &str {
        &self.info.app_id
    }

    /// Per-launch session id.
    pub fn session_id(&self) -> &str {
        &self.info.session_id
    }

    pub fn info(&self) -> &ApplicationInfo {
        &self.info
    }

    pub fn device(&self) -> &DeviceInfo {
        self.link.info()
    }

    /// Receiver-namespace messages from now on.
    pub fn receiver_messages(&self) -> MessageStream {
        self.link.receiver_messages()
    }

    /// Returns the channel for `namespace`, joining or running a session.
    ///
    /// A cached channel is returned as is. Otherwise one join is attempted;
    /// only a [`TransportError::NoSession`] falls through to exactly one run.
    /// Calls are serialized, so concurrent callers share one session.
    pub async fn join_or_run_channel(&self, namespace: &str) -> BabblingResult<Channel> {
        let mut channels = self.channels.lock().await;
        if let Some(channel) = channels.get(namespace) {
            return Ok(channel.clone());
        }

        let link = match self.link.join(&self.info, namespace).await {
            Ok(link) => link,
            Err(TransportError::NoSession(_)) => {
                log::debug!("[Session] No session on {}, running one", namespace);
                self.link.run(&self.info, namespace).await.map_err(|e| {
                    BabblingError::SessionUnavailable(format!("{}: run failed: {}", namespace, e))
                })?
            }
            Err(e) => {
                return Err(BabblingError::SessionUnavailable(format!(
                    "{}: join failed: {}",
                    namespace, e
                )))
            }
        };

        let session_id = link.session_id().map(str::to_string).ok_or_else(|| {
            BabblingError::SessionUnavailable(format!("{}: no session id", namespace))
        })?;
        let channel = Channel::new(link, session_id, self.response_timeout);
        channels.insert(namespace.to_string(), channel.clone());
        Ok(channel)
    }

    /// Drops the cached channel for `namespace`. Returns whether one existed.
    pub async fn forget_channel(&self, namespace: &str) -> bool {
        self.channels.lock().await.remove(namespace).is_some()
    }

    /// Runs `operation` on the `namespace` channel, re-establishing the
    /// session once if it reports [`BabblingError::SessionExpired`].
    ///
    /// # Arguments
    /// * `namespace` - Channel namespace the operation talks to
    /// * `operation` - Closure performing one attempt on a channel
    pub async fn with_session_retry<T, F, Fut>(
        &self,
        namespace: &str,
        mut operation: F,
    ) -> BabblingResult<T>
    where
        F: FnMut(Channel) -> Fut,
        Fut: Future<Output = BabblingResult<T>>,
    {
        let channel = self.join_or_run_channel(namespace).await?;
        match operation(channel).await {
            Err(BabblingError::SessionExpired(reason)) => {
                log::warn!(
                    "[Session] Session on {} expired ({}), re-establishing",
                    namespace,
                    reason
                );
                self.forget_channel(namespace).await;
                let channel = self.join_or_run_channel(namespace).await?;
                operation(channel).await
            }
            other => other,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Channel
// ─────────────────────────────────────────────────────────────────────────────

/// A joined namespace channel with a valid session id.
#[derive(Clone)]
pub struct Channel {
    link: Arc<dyn ChannelLink>,
    session_id: String,
    response_timeout: Duration,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("namespace", &self.link.namespace())
            .field("session_id", &self.session_id)
            .finish()
    }
}

impl Channel {
    pub fn new(link: Arc<dyn ChannelLink>, session_id: String, response_timeout: Duration) -> Self {
        Self {
            link,
            session_id,
            response_timeout,
        }
    }

    pub fn namespace(&self) -> &str {
        self.link.namespace()
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Default wait window for responses on this channel.
    pub fn response_timeout(&self) -> Duration {
        self.response_timeout
    }

    pub async fn send(&self, payload: Value) -> BabblingResult<()> {
        Ok(self.link.send(payload).await?)
    }

    pub async fn send_message<T: Serialize>(&self, message: &T) -> BabblingResult<()> {
        self.send(serde_json::to_value(message)?).await
    }

    /// Inbound messages from now on, in receipt order.
    pub fn messages(&self) -> MessageStream {
        self.link.subscribe()
    }

    /// Waits for the first message from now on that `accept` maps to a result.
    ///
    /// Fails with [`BabblingError::Timeout`] after `timeout`.
    pub async fn wait_for<T, F>(&self, timeout: Duration, accept: F) -> BabblingResult<T>
    where
        F: FnMut(&InboundMessage) -> Option<BabblingResult<T>>,
    {
        first_match(self.messages(), timeout, accept).await
    }

    /// Sends `payload`, then waits like [`wait_for`](Self::wait_for).
    ///
    /// The subscription is taken before sending, so a reply delivered
    /// during the send is still observed.
    pub async fn send_and_wait<T, F>(
        &self,
        payload: Value,
        timeout: Duration,
        accept: F,
    ) -> BabblingResult<T>
    where
        F: FnMut(&InboundMessage) -> Option<BabblingResult<T>>,
    {
        let messages = self.messages();
        self.send(payload).await?;
        first_match(messages, timeout, accept).await
    }
}

async fn first_match<T, F>(
    messages: MessageStream,
    timeout: Duration,
    mut accept: F,
) -> BabblingResult<T>
where
    F: FnMut(&InboundMessage) -> Option<BabblingResult<T>>,
{
    let matches = messages.filter_map(|msg| future::ready(accept(&msg)));
    let mut matches = pin!(matches);

    match tokio::time::timeout(timeout, matches.next()).await {
        Ok(Some(result)) => result,
        Ok(None) => Err(BabblingError::Transport(
            "channel closed while waiting for a response".to_string(),
        )),
        Err(_) => Err(BabblingError::Timeout(format!(
            "no matching message within {:?}",
            timeout
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::{MemoryDevice, MemoryTransport};
    use serde_json::json;

    const APP: &str = "233637DE";
    const NS: &str = "urn:x-cast:com.google.youtube.mdx";

    fn device_for(devices: Vec<Arc<MemoryDevice>>, selector: DeviceSelector) -> CastDevice {
        CastDevice::new(
            Arc::new(MemoryTransport::new(devices)),
            selector,
            SessionTimeouts::default(),
        )
    }

    #[tokio::test]
    async fn unmatched_candidates_are_disconnected() {
        let kitchen = MemoryDevice::new("Kitchen");
        let den = MemoryDevice::new("Den");
        let device = device_for(
            vec![kitchen.clone(), den.clone()],
            DeviceSelector::Named("Den".into()),
        );

        device.connect().await.unwrap();

        assert_eq!(kitchen.disconnect_count(), 1);
        assert_eq!(kitchen.connect_count(), 0);
        assert_eq!(den.connection_state(), ConnectionState::Connected);
        assert_eq!(device.connection_state(), ConnectionState::Connected);
        assert_eq!(device.info().await.unwrap().name, "Den");
    }

    #[tokio::test]
    async fn request_status_reports_running_apps() {
        let den = MemoryDevice::new("Den").with_running_app(APP);
        let device = device_for(vec![den.clone()], DeviceSelector::Any);

        let status = device.request_status().await.unwrap();

        assert!(status.is_running(APP));
        assert!(!status.is_running("CC1AD845"));
        assert_eq!(den.connect_count(), 1);
        assert!(den.launches().is_empty());
    }

    #[tokio::test]
    async fn missing_device_is_not_found() {
        let device = device_for(
            vec![MemoryDevice::new("Kitchen")],
            DeviceSelector::Named("Attic".into()),
        );

        let err = device.connect().await.err().unwrap();
        assert!(matches!(err, BabblingError::NotFound(_)));
        assert_eq!(device.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_discovery_times_out_as_not_found() {
        let transport = MemoryTransport::new(vec![MemoryDevice::new("Den")])
            .with_announce_interval(Duration::from_secs(60));
        let device = CastDevice::new(
            Arc::new(transport),
            DeviceSelector::Any,
            SessionTimeouts::default(),
        );

        let err = device.connect().await.err().unwrap();
        assert!(matches!(err, BabblingError::NotFound(_)));
    }

    #[tokio::test]
    async fn open_app_launches_once_and_caches() {
        let tv = MemoryDevice::new("tv");
        let device = device_for(vec![tv.clone()], DeviceSelector::Any);

        let first = device.open_app(APP).await.unwrap();
        let second = device.open_app(APP).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(tv.launches(), vec![APP.to_string()]);
    }

    #[tokio::test]
    async fn open_app_joins_running_instance_without_launch() {
        let tv = MemoryDevice::new("tv").with_running_app(APP);
        let device = device_for(vec![tv.clone()], DeviceSelector::Any);

        let app = device.open_app(APP).await.unwrap();

        assert_eq!(app.app_id(), APP);
        assert!(tv.launches().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn app_never_reported_is_not_found() {
        let tv = MemoryDevice::unresponsive("tv");
        let device = device_for(vec![tv], DeviceSelector::Any);

        let err = device.open_app(APP).await.err().unwrap();
        assert!(matches!(err, BabblingError::NotFound(_)));
    }

    #[tokio::test]
    async fn join_or_run_attempts_each_branch_once() {
        let tv = MemoryDevice::new("tv");
        let device = device_for(vec![tv.clone()], DeviceSelector::Any);
        let app = device.open_app(APP).await.unwrap();

        let first = app.join_or_run_channel(NS).await.unwrap();
        assert_eq!((tv.join_attempts(), tv.run_attempts()), (1, 1));

        let second = app.join_or_run_channel(NS).await.unwrap();
        assert_eq!(first.session_id(), second.session_id());
        assert_eq!((tv.join_attempts(), tv.run_attempts()), (1, 1));
    }

    #[tokio::test]
    async fn session_retry_reestablishes_once() {
        let tv = MemoryDevice::new("tv");
        let device = device_for(vec![tv.clone()], DeviceSelector::Any);
        let app = device.open_app(APP).await.unwrap();
        let original = app.join_or_run_channel(NS).await.unwrap();
        tv.expire_session(NS);

        let attempts = Arc::new(Mutex::new(Vec::new()));
        let seen = attempts.clone();
        let session = app
            .with_session_retry(NS, move |channel| {
                let seen = seen.clone();
                async move {
                    let mut seen = seen.lock();
                    seen.push(channel.session_id().to_string());
                    if seen.len() == 1 {
                        Err(BabblingError::SessionExpired("HTTP 410".into()))
                    } else {
                        Ok(channel.session_id().to_string())
                    }
                }
            })
            .await
            .unwrap();

        let attempts = attempts.lock();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0], original.session_id());
        assert_ne!(session, original.session_id());
    }

    #[tokio::test]
    async fn session_retry_gives_up_after_second_expiry() {
        let tv = MemoryDevice::new("tv");
        let device = device_for(vec![tv], DeviceSelector::Any);
        let app = device.open_app(APP).await.unwrap();

        let result: BabblingResult<()> = app
            .with_session_retry(NS, |_| async {
                Err(BabblingError::SessionExpired("HTTP 410".into()))
            })
            .await;
        assert!(matches!(result, Err(BabblingError::SessionExpired(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_times_out_without_match() {
        let tv = MemoryDevice::new("tv");
        let device = device_for(vec![tv.clone()], DeviceSelector::Any);
        let app = device.open_app(APP).await.unwrap();
        let channel = app.join_or_run_channel(NS).await.unwrap();

        let waiter = tokio::spawn({
            let channel = channel.clone();
            async move {
                channel
                    .wait_for(Duration::from_secs(5), |msg| {
                        (msg.message_type() == Some("DONE")).then(|| Ok(()))
                    })
                    .await
            }
        });
        tokio::task::yield_now().await;
        tv.channel(NS).unwrap().push(json!({"type": "NOISE"}));

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, BabblingError::Timeout(_)));
    }

    #[tokio::test]
    async fn close_disconnects_and_clears_cache() {
        let tv = MemoryDevice::new("tv");
        let device = device_for(vec![tv.clone()], DeviceSelector::Any);
        device.open_app(APP).await.unwrap();

        device.close().await;

        assert_eq!(tv.disconnect_count(), 1);
        assert_eq!(device.connection_state(), ConnectionState::Disconnected);
        assert!(device.info().await.is_none());
    }
}
