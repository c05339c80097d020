//! Trait abstractions for the lower-level cast transport.
//!
//! These traits decouple session management from the wire protocol that
//! actually reaches a receiver. Services depend on the traits rather than on a
//! concrete implementation, which keeps them testable against the in-process
//! receiver in `memory` (built for tests and with the `test-util` feature).
//!
//! The seam has three layers:
//! - [`Transport`] - discovery of candidate devices
//! - [`DeviceLink`] - one device: connect, receiver status, launch, channels
//! - [`ChannelLink`] - one namespace within a launched application

#[cfg(any(test, feature = "test-util"))]
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::protocol::{ApplicationInfo, ReceiverStatus};

/// Errors reported by a transport implementation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// A join found no existing session for the namespace.
    #[error("no session running for {0}")]
    NoSession(String),

    /// The device connection is gone.
    #[error("device disconnected")]
    Disconnected,

    /// The receiver refused the request.
    #[error("request rejected: {0}")]
    Rejected(String),

    /// Socket or framing failure.
    #[error("i/o failure: {0}")]
    Io(String),
}

/// Convenient Result alias for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Stream of messages delivered on a channel, in receipt order.
pub type MessageStream = BoxStream<'static, InboundMessage>;

/// A network endpoint found by discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    /// Human-readable name (e.g. "Living Room TV").
    pub name: String,
    /// Network address as reported by discovery.
    pub address: String,
    /// Unique identifier of the device.
    pub id: String,
}

/// Connection state of a device as seen by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// One message delivered on a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    /// JSON payload of the message.
    pub data: Value,
}

impl InboundMessage {
    pub fn new(data: Value) -> Self {
        Self { data }
    }

    /// Returns the `type` discriminator, if present.
    pub fn message_type(&self) -> Option<&str> {
        self.data.get("type").and_then(Value::as_str)
    }
}

/// Discovery capability of a transport.
pub trait Transport: Send + Sync {
    /// Starts a discovery session.
    ///
    /// Yields every device that answers, unconnected. The stream may be
    /// infinite; callers stop polling once they have what they need and must
    /// call [`DeviceLink::disconnect`] on candidates they do not keep.
    fn discover(&self) -> BoxStream<'static, TransportResult<Arc<dyn DeviceLink>>>;
}

/// A single device reachable through the transport.
#[async_trait]
pub trait DeviceLink: Send + Sync {
    /// Discovery information for this device.
    fn info(&self) -> &DeviceInfo;

    /// Performs the connection handshake.
    async fn connect(&self) -> TransportResult<()>;

    /// Releases the connection and everything multiplexed over it.
    async fn disconnect(&self);

    /// One-shot receiver status query.
    async fn receiver_status(&self) -> TransportResult<ReceiverStatus>;

    /// Asks the receiver to launch an application.
    ///
    /// Returns once the request is sent; launch completion is observed on
    /// [`receiver_messages`](Self::receiver_messages).
    async fn launch(&self, app_id: &str) -> TransportResult<()>;

    /// Messages on the generic receiver-status namespace, delivered from the
    /// moment of subscription.
    fn receiver_messages(&self) -> MessageStream;

    /// Joins an existing session on `namespace` of a running application.
    ///
    /// Fails with [`TransportError::NoSession`] when nothing is running there.
    async fn join(
        &self,
        app: &ApplicationInfo,
        namespace: &str,
    ) -> TransportResult<Arc<dyn ChannelLink>>;

    /// Starts a new session on `namespace` of a running application.
    async fn run(
        &self,
        app: &ApplicationInfo,
        namespace: &str,
    ) -> TransportResult<Arc<dyn ChannelLink>>;
}

/// A namespaced sub-connection within an application session.
#[async_trait]
pub trait ChannelLink: Send + Sync {
    /// Namespace string (e.g. `urn:x-cast:com.google.cast.media`).
    fn namespace(&self) -> &str;

    /// Transport-level session id, if one was established.
    fn session_id(&self) -> Option<&str>;

    /// Sends a JSON payload on the channel.
    async fn send(&self, payload: Value) -> TransportResult<()>;

    /// Messages received on the channel from the moment of subscription.
    fn subscribe(&self) -> MessageStream;
}
