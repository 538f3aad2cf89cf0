//! Publish/subscribe transport abstraction.
//!
//! The bridge only needs two capabilities from a broker: fire-and-forget
//! publishing to a named channel, and a single long-lived subscription per
//! channel. Delivery, partitioning and reconnection stay behind this seam.
//!
//! Implementations:
//! - `MemoryTransport`: in-process broker for tests and loopback mode
//! - `KafkaTransport`: rdkafka-backed broker (feature `kafka`)

#[cfg(feature = "kafka")]
mod kafka;
mod memory;

use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::error::TransportError;

#[cfg(feature = "kafka")]
pub use kafka::KafkaTransport;
pub use memory::MemoryTransport;

/// A raw message consumed from a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Partitioning key the message was published with, if the broker keeps one.
    pub key: Option<String>,
    pub payload: Vec<u8>,
}

/// One item of a subscription: a message, or a transient receive error.
///
/// Errors do not end the subscription; only the stream ending does.
pub type Delivery = Result<InboundMessage, TransportError>;

/// The consuming end of a channel subscription.
///
/// Yields deliveries until the transport drops its side, after which `next`
/// returns `None` forever.
#[derive(Debug)]
pub struct Subscription {
    channel: String,
    rx: mpsc::Receiver<Delivery>,
}

impl Subscription {
    pub fn new(channel: impl Into<String>, rx: mpsc::Receiver<Delivery>) -> Self {
        Self {
            channel: channel.into(),
            rx,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Wait for the next delivery. `None` means the subscription is gone.
    pub async fn next(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }
}

/// Topic-based publish/subscribe capability consumed by the bridge.
///
/// # Error Handling
///
/// `publish` reports failure through `TransportError`; the bridge treats any
/// error as an immediate rejection of the request being sent. `subscribe`
/// registers exactly one consumer per channel and returns
/// `TransportError::AlreadySubscribed` on a second attempt.
pub trait Transport: Send + Sync + 'static {
    /// Publish one message to `channel`, keyed by `key`.
    fn publish(
        &self,
        channel: &str,
        key: &str,
        payload: Vec<u8>,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Start consuming `channel`. Must be called from within a Tokio runtime.
    fn subscribe(&self, channel: &str) -> Result<Subscription, TransportError>;
}

/// Publish with an upper bound on how long the transport may take.
///
/// A publish that neither succeeds nor fails within `limit` is reported as
/// `TransportError::Publish`.
pub(crate) async fn publish_bounded<T: Transport>(
    transport: &T,
    channel: &str,
    key: &str,
    payload: Vec<u8>,
    limit: Duration,
) -> Result<(), TransportError> {
    match tokio::time::timeout(limit, transport.publish(channel, key, payload)).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Publish(format!(
            "no acknowledgement from {channel} within {limit:?}"
        ))),
    }
}
