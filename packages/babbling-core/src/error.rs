//! Centralized error types for the Babbling core library.
//!
//! This module provides a unified error handling system that:
//! - Defines structured error types using `thiserror`
//! - Maps every failure onto one machine-readable code via [`ErrorCode`]
//! - Separates collaborator (transport) failures from session-level failures

use serde::Serialize;
use thiserror::Error;

use crate::transport::TransportError;

/// Trait for error types that provide machine-readable error codes.
///
/// Implement this trait to provide consistent error codes across different
/// error conversion paths.
pub trait ErrorCode {
    /// Returns a machine-readable error code.
    fn code(&self) -> &'static str;
}

impl ErrorCode for TransportError {
    fn code(&self) -> &'static str {
        match self {
            Self::NoSession(_) => "no_session",
            Self::Disconnected => "disconnected",
            Self::Rejected(_) => "rejected",
            Self::Io(_) => "transport_io",
        }
    }
}

/// Application-wide error type for Babbling.
#[derive(Debug, Error, Serialize)]
#[serde(tag = "type", content = "details")]
pub enum BabblingError {
    /// No matching device answered discovery, or the receiver never reported
    /// the requested application as launched.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Neither join nor run produced a usable session for a namespace.
    #[error("Session unavailable: {0}")]
    SessionUnavailable(String),

    /// No correlated response or status arrived within the wait window.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The receiver explicitly rejected a LOAD instruction.
    #[error("Load failed with receiver code {code}")]
    LoadFailed {
        /// Vendor error code reported in `detailedErrorCode`.
        code: i64,
    },

    /// A content provider recognized the id, but it is not a playable leaf.
    #[error("Unsupported entity: {0}")]
    UnsupportedEntity(String),

    /// Malformed or uninterpretable message.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// No configured content handler claims the input.
    #[error("No handler for: {0}")]
    NoHandler(String),

    /// A session went out of sync; re-running the join/run handshake may fix it.
    #[error("Session expired: {0}")]
    SessionExpired(String),

    /// Failure reported by a content-provider collaborator.
    #[error("Provider error: {0}")]
    Provider(String),

    /// Lower-level transport failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Spawning or talking to a daemon process failed.
    #[error("Daemon error: {0}")]
    Daemon(String),

    /// Invalid or unreadable configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl BabblingError {
    /// Returns `true` for failures a caller may reasonably retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::SessionExpired(_) | Self::Timeout(_))
    }
}

impl ErrorCode for BabblingError {
    fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::SessionUnavailable(_) => "session_unavailable",
            Self::Timeout(_) => "timeout",
            Self::LoadFailed { .. } => "load_failed",
            Self::UnsupportedEntity(_) => "unsupported_entity",
            Self::Protocol(_) => "protocol_error",
            Self::NoHandler(_) => "no_handler",
            Self::SessionExpired(_) => "session_expired",
            Self::Provider(_) => "provider_error",
            Self::Transport(_) => "transport_error",
            Self::Daemon(_) => "daemon_error",
            Self::Configuration(_) => "configuration_error",
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Result Type Aliases
// ─────────────────────────────────────────────────────────────────────────────

pub use crate::transport::TransportResult;

/// Convenient Result alias for application-wide operations.
pub type BabblingResult<T> = Result<T, BabblingError>;

impl From<TransportError> for BabblingError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::NoSession(namespace) => Self::SessionUnavailable(namespace),
            other => Self::Transport(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for BabblingError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(err.to_string())
    }
}

impl From<base64::DecodeError> for BabblingError {
    fn from(err: base64::DecodeError) -> Self {
        Self::Protocol(format!("invalid base64 payload: {}", err))
    }
}

impl From<std::io::Error> for BabblingError {
    fn from(err: std::io::Error) -> Self {
        Self::Daemon(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for BabblingError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        Self::Timeout(err.to_string())
    }
}
