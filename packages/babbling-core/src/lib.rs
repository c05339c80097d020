//! Babbling Core - cast controller library.
//!
//! Discovers cast receivers, launches or joins receiver applications, drives
//! playback through them and keeps sessions alive in a detached daemon.
//!
//! # Architecture
//!
//! - [`transport`]: Device discovery and messaging abstraction, plus an
//!   in-memory implementation behind the `test-util` feature
//! - [`device`]: Device sessions, app sessions and namespace channels
//! - [`protocol`]: Receiver and media message shapes
//! - [`babbler`]: The Babbler request/response sub-protocol
//! - [`tracker`]: Playback state machine driven by status messages
//! - [`daemon`]: Hand-off of a session to a detached child process
//! - [`apps`]: Cast apps and their registry
//! - [`player`]: Resolve content and play it on every device
//! - [`merge`]: Arrival-order stream merging
//! - [`config`]: YAML configuration with environment overrides
//! - [`error`]: Centralized error types
//!
//! # Abstraction Traits
//!
//! - [`Transport`](transport::Transport): How devices are found and spoken to
//! - [`MediaSource`](babbler::MediaSource): Content provider behind a Babbler app
//! - [`ContentHandler`](player::ContentHandler): URL and title resolution
//! - [`TaskSpawner`](runtime::TaskSpawner): Spawning background tasks

#![allow(missing_docs)]
#![warn(clippy::all)]

pub mod apps;
pub mod babbler;
pub mod config;
pub mod daemon;
pub mod device;
pub mod error;
pub mod merge;
pub mod player;
pub mod protocol;
pub mod runtime;
pub mod tracker;
pub mod transport;

pub use apps::{AppCapabilities, AppContext, AppDescriptor, AppRegistry, BabblerApp, CastApp};
pub use babbler::{BabblerSession, Capabilities, MediaSource, PlayableInfo, QueueItem, QueueMode};
pub use config::Config;
pub use daemon::{DaemonLauncher, DaemonRequest, RpcCall};
pub use device::{CastDevice, Channel, DeviceSelector, ReceiverApp, SessionTimeouts};
pub use error::{BabblingError, BabblingResult, ErrorCode};
pub use merge::{merge, Merge};
pub use player::{ContentHandler, DevicePlayResult, Player, PlayerOptions, QueryResult};
pub use runtime::{TaskSpawner, TokioSpawner};
pub use tracker::{PlaybackTracker, TrackedMedia, TrackerHost};
pub use transport::{DeviceInfo, Transport, TransportError};
