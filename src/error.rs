//! Error types for the correlation bridge.
//!
//! Errors tied to one request travel through that request's `ResponseHandle`
//! as a `BridgeError`. Errors with no addressable caller are `DispatchError`s:
//! they are logged and counted, never returned.

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use crate::protocol::CorrelationId;

/// Error returned by a registered handler or a request handler.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Result type for bridge operations.
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Caller-facing errors.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// No response arrived before the deadline.
    #[error("request {id} timed out after {elapsed:?}")]
    Timeout { id: CorrelationId, elapsed: Duration },

    /// The request was cancelled while still pending.
    #[error("request {id} was cancelled")]
    Cancelled { id: CorrelationId },

    /// The transport refused the request; nothing is pending for it.
    #[error("failed to publish request {id}: {source}")]
    Publish {
        id: CorrelationId,
        #[source]
        source: TransportError,
    },

    /// The response carried an `error` field.
    #[error("request {id} failed remotely: {error}")]
    Remote { id: CorrelationId, error: Value },

    /// The response subscription is gone, so no response can arrive.
    #[error("bridge disconnected: {reason}")]
    Disconnected { reason: String },

    /// The request envelope could not be serialized.
    #[error("failed to encode request: {0}")]
    Encode(#[source] serde_json::Error),

    /// A response `state` field was not valid JSON.
    #[error("invalid state in response: {0}")]
    InvalidState(#[source] serde_json::Error),

    /// `start` was called on a bridge that is already dispatching.
    #[error("bridge dispatcher already started")]
    AlreadyStarted,

    /// Subscribing to the response channel failed.
    #[error("failed to subscribe to response channel: {0}")]
    Subscribe(#[source] TransportError),
}

impl BridgeError {
    pub fn disconnected(reason: impl Into<String>) -> Self {
        BridgeError::Disconnected {
            reason: reason.into(),
        }
    }

    /// The correlation id this error belongs to, if any.
    pub fn correlation_id(&self) -> Option<CorrelationId> {
        match self {
            BridgeError::Timeout { id, .. }
            | BridgeError::Cancelled { id }
            | BridgeError::Publish { id, .. }
            | BridgeError::Remote { id, .. } => Some(*id),
            _ => None,
        }
    }
}

/// Errors reported by a `Transport` implementation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("publish failed: {0}")]
    Publish(String),

    /// Transient receive failure; the subscription stays open.
    #[error("receive failed: {0}")]
    Receive(String),

    #[error("queue for channel {channel} is full")]
    QueueFull { channel: String },

    #[error("channel {channel} is closed")]
    ChannelClosed { channel: String },

    #[error("channel {channel} already has a subscriber")]
    AlreadySubscribed { channel: String },

    #[error("invalid transport configuration: {0}")]
    Config(String),
}

/// Problems the dispatcher absorbs and reports to diagnostics.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("malformed response message: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("handler for {kind:?} failed: {message}")]
    HandlerFailed { kind: String, message: String },

    #[error("handler for {kind:?} panicked")]
    HandlerPanicked { kind: String },

    #[error("transport error on response channel: {0}")]
    Transport(#[source] TransportError),

    /// The subscription ended; this is the only unrecoverable dispatch error.
    #[error("subscription to {channel} closed")]
    SubscriptionClosed { channel: String },
}
