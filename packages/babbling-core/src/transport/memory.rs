//! In-process simulated receiver.
//!
//! [`MemoryTransport`] implements the transport seam without a network. Each
//! [`MemoryDevice`] keeps a list of running applications and a session per
//! namespace, answers launches with a `RECEIVER_STATUS` broadcast, and
//! records what the controller sent so tests can assert on it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use super::{
    ChannelLink, ConnectionState, DeviceInfo, DeviceLink, InboundMessage, MessageStream,
    Transport, TransportError, TransportResult,
};
use crate::protocol::{ApplicationInfo, ReceiverStatus};

/// Buffered messages per subscriber before old ones are dropped.
const CHANNEL_CAPACITY: usize = 64;

/// Produces replies for each payload a channel sends.
pub type Responder = Arc<dyn Fn(&Value) -> Vec<Value> + Send + Sync>;

fn broadcast_stream(rx: broadcast::Receiver<InboundMessage>) -> MessageStream {
    BroadcastStream::new(rx)
        .filter_map(|item| async move { item.ok() })
        .boxed()
}

// ─────────────────────────────────────────────────────────────────────────────
// Transport
// ─────────────────────────────────────────────────────────────────────────────

/// Discovery over a fixed set of simulated devices.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    devices: Vec<Arc<MemoryDevice>>,
    announce_interval: Duration,
}

impl MemoryTransport {
    pub fn new(devices: Vec<Arc<MemoryDevice>>) -> Self {
        Self {
            devices,
            announce_interval: Duration::ZERO,
        }
    }

    /// Delays each device announcement by `interval`.
    pub fn with_announce_interval(mut self, interval: Duration) -> Self {
        self.announce_interval = interval;
        self
    }
}

impl Transport for MemoryTransport {
    fn discover(&self) -> BoxStream<'static, TransportResult<Arc<dyn DeviceLink>>> {
        let devices = self.devices.clone();
        let interval = self.announce_interval;

        async_stream::stream! {
            for device in devices {
                if !interval.is_zero() {
                    tokio::time::sleep(interval).await;
                }
                yield Ok(device as Arc<dyn DeviceLink>);
            }
        }
        .boxed()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Device
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct DeviceState {
    connection: ConnectionState,
    applications: Vec<ApplicationInfo>,
    sessions: HashMap<String, Arc<MemoryChannel>>,
    launches: Vec<String>,
    connects: usize,
    disconnects: usize,
    joins: usize,
    runs: usize,
}

/// A simulated receiver device.
pub struct MemoryDevice {
    info: DeviceInfo,
    state: Mutex<DeviceState>,
    receiver_tx: broadcast::Sender<InboundMessage>,
    ignore_launch: bool,
    responder: Mutex<Option<Responder>>,
}

impl MemoryDevice {
    pub fn new(name: &str) -> Arc<Self> {
        Self::build(name, false)
    }

    /// A device that accepts launch requests but never reports the app running.
    pub fn unresponsive(name: &str) -> Arc<Self> {
        Self::build(name, true)
    }

    fn build(name: &str, ignore_launch: bool) -> Arc<Self> {
        let (receiver_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Arc::new(Self {
            info: DeviceInfo {
                name: name.to_string(),
                address: "127.0.0.1:8009".to_string(),
                id: uuid::Uuid::new_v4().to_string(),
            },
            state: Mutex::new(DeviceState::default()),
            receiver_tx,
            ignore_launch,
            responder: Mutex::new(None),
        })
    }

    /// Marks `app_id` as already running before the controller connects.
    pub fn with_running_app(self: Arc<Self>, app_id: &str) -> Arc<Self> {
        self.state.lock().applications.push(new_application(app_id));
        self
    }

    /// Installs a responder on every channel created from now on.
    pub fn set_channel_responder<F>(&self, responder: F)
    where
        F: Fn(&Value) -> Vec<Value> + Send + Sync + 'static,
    {
        *self.responder.lock() = Some(Arc::new(responder));
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state.lock().connection
    }

    pub fn connect_count(&self) -> usize {
        self.state.lock().connects
    }

    pub fn disconnect_count(&self) -> usize {
        self.state.lock().disconnects
    }

    pub fn join_attempts(&self) -> usize {
        self.state.lock().joins
    }

    pub fn run_attempts(&self) -> usize {
        self.state.lock().runs
    }

    pub fn launches(&self) -> Vec<String> {
        self.state.lock().launches.clone()
    }

    pub fn channel(&self, namespace: &str) -> Option<Arc<MemoryChannel>> {
        self.state.lock().sessions.get(namespace).cloned()
    }

    /// Drops the session on `namespace`, as if the receiver had expired it.
    pub fn expire_session(&self, namespace: &str) {
        self.state.lock().sessions.remove(namespace);
    }

    /// Stops `app_id` and broadcasts the new receiver status.
    pub fn stop_app(&self, app_id: &str) {
        let status = {
            let mut state = self.state.lock();
            state.applications.retain(|app| app.app_id != app_id);
            receiver_status_message(&state.applications)
        };
        self.push_receiver_message(status);
    }

    /// Delivers `data` on the receiver namespace.
    pub fn push_receiver_message(&self, data: Value) {
        let _ = self.receiver_tx.send(InboundMessage::new(data));
    }
}

fn new_application(app_id: &str) -> ApplicationInfo {
    ApplicationInfo {
        app_id: app_id.to_string(),
        session_id: uuid::Uuid::new_v4().to_string(),
        transport_id: format!("web-{}", uuid::Uuid::new_v4().simple()),
        display_name: String::new(),
    }
}

fn receiver_status_message(applications: &[ApplicationInfo]) -> Value {
    json!({
        "type": "RECEIVER_STATUS",
        "status": { "applications": applications },
    })
}

#[async_trait]
impl DeviceLink for MemoryDevice {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    async fn connect(&self) -> TransportResult<()> {
        let mut state = self.state.lock();
        state.connects += 1;
        state.connection = ConnectionState::Connected;
        Ok(())
    }

    async fn disconnect(&self) {
        let mut state = self.state.lock();
        state.disconnects += 1;
        state.connection = ConnectionState::Disconnected;
    }

    async fn receiver_status(&self) -> TransportResult<ReceiverStatus> {
        let state = self.state.lock();
        if state.connection != ConnectionState::Connected {
            return Err(TransportError::Disconnected);
        }
        Ok(ReceiverStatus {
            applications: state.applications.clone(),
        })
    }

    async fn launch(&self, app_id: &str) -> TransportResult<()> {
        let status = {
            let mut state = self.state.lock();
            if state.connection != ConnectionState::Connected {
                return Err(TransportError::Disconnected);
            }
            state.launches.push(app_id.to_string());
            if self.ignore_launch {
                return Ok(());
            }
            state.applications.retain(|app| app.app_id != app_id);
            state.applications.push(new_application(app_id));
            state.sessions.clear();
            receiver_status_message(&state.applications)
        };
        self.push_receiver_message(status);
        Ok(())
    }

    fn receiver_messages(&self) -> MessageStream {
        broadcast_stream(self.receiver_tx.subscribe())
    }

    async fn join(
        &self,
        _app: &ApplicationInfo,
        namespace: &str,
    ) -> TransportResult<Arc<dyn ChannelLink>> {
        let mut state = self.state.lock();
        state.joins += 1;
        match state.sessions.get(namespace) {
            Some(channel) => Ok(channel.clone() as Arc<dyn ChannelLink>),
            None => Err(TransportError::NoSession(namespace.to_string())),
        }
    }

    async fn run(
        &self,
        app: &ApplicationInfo,
        namespace: &str,
    ) -> TransportResult<Arc<dyn ChannelLink>> {
        let responder = self.responder.lock().clone();
        let mut state = self.state.lock();
        state.runs += 1;
        if !state.applications.iter().any(|a| a.app_id == app.app_id) {
            return Err(TransportError::Rejected(format!(
                "{} is not running",
                app.app_id
            )));
        }

        let channel = Arc::new(MemoryChannel::new(namespace, Some(uuid::Uuid::new_v4().to_string())));
        if let Some(responder) = responder {
            *channel.responder.lock() = Some(responder);
        }
        state
            .sessions
            .insert(namespace.to_string(), channel.clone());
        Ok(channel)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Channel
// ─────────────────────────────────────────────────────────────────────────────

/// A simulated namespace channel.
pub struct MemoryChannel {
    namespace: String,
    session_id: Option<String>,
    sent: Mutex<Vec<Value>>,
    inbound: broadcast::Sender<InboundMessage>,
    responder: Mutex<Option<Responder>>,
}

impl MemoryChannel {
    pub fn new(namespace: &str, session_id: Option<String>) -> Self {
        let (inbound, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            namespace: namespace.to_string(),
            session_id,
            sent: Mutex::new(Vec::new()),
            inbound,
            responder: Mutex::new(None),
        }
    }

    /// Replies to every subsequent send with the values `responder` returns.
    pub fn set_responder<F>(&self, responder: F)
    where
        F: Fn(&Value) -> Vec<Value> + Send + Sync + 'static,
    {
        *self.responder.lock() = Some(Arc::new(responder));
    }

    /// Delivers `data` to every current subscriber.
    pub fn push(&self, data: Value) {
        let _ = self.inbound.send(InboundMessage::new(data));
    }

    /// Payloads sent by the controller so far.
    pub fn sent(&self) -> Vec<Value> {
        self.sent.lock().clone()
    }

    /// Sent payloads whose `type` equals `kind`.
    pub fn sent_of_type(&self, kind: &str) -> Vec<Value> {
        self.sent
            .lock()
            .iter()
            .filter(|v| v.get("type").and_then(Value::as_str) == Some(kind))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ChannelLink for MemoryChannel {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    async fn send(&self, payload: Value) -> TransportResult<()> {
        self.sent.lock().push(payload.clone());
        let responder = self.responder.lock().clone();
        if let Some(responder) = responder {
            for reply in responder(&payload) {
                self.push(reply);
            }
        }
        Ok(())
    }

    fn subscribe(&self) -> MessageStream {
        broadcast_stream(self.inbound.subscribe())
    }
}
