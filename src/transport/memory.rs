//! In-process transport.
//!
//! Each channel is a bounded queue created on first publish or subscribe, so
//! messages published before the subscriber attaches are kept (up to the
//! queue capacity). Publishing never blocks: a full queue is reported as
//! `QueueFull`, the same non-blocking backpressure a broker client applies.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use log::debug;
use tokio::sync::mpsc;

use super::{Delivery, InboundMessage, Subscription, Transport};
use crate::error::TransportError;

const LOG_TARGET: &str = "azofly_bridge::transport";

/// In-memory broker, cheaply cloneable. Clones share all channels.
#[derive(Clone)]
pub struct MemoryTransport {
    inner: Arc<MemoryInner>,
}

struct MemoryInner {
    capacity: usize,
    channels: DashMap<String, ChannelSlot>,
    fail_publishes: AtomicBool,
}

struct ChannelSlot {
    tx: mpsc::Sender<Delivery>,
    /// Taken by the one subscriber; `None` afterwards.
    rx: Option<mpsc::Receiver<Delivery>>,
}

impl ChannelSlot {
    fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self { tx, rx: Some(rx) }
    }
}

impl MemoryTransport {
    /// Create a broker whose channels buffer up to `capacity` messages each.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                capacity: capacity.max(1),
                channels: DashMap::new(),
                fail_publishes: AtomicBool::new(false),
            }),
        }
    }

    /// Make every subsequent publish fail (or succeed again).
    pub fn set_fail_publishes(&self, fail: bool) {
        self.inner.fail_publishes.store(fail, Ordering::SeqCst);
    }

    /// Deliver a transient receive error to the channel's subscriber.
    pub fn inject_error(&self, channel: &str, error: TransportError) -> Result<(), TransportError> {
        self.enqueue(channel, Err(error))
    }

    /// Drop the channel. Its subscriber drains what is queued, then ends.
    pub fn close(&self, channel: &str) {
        if self.inner.channels.remove(channel).is_some() {
            debug!(target: LOG_TARGET, "Closed in-memory channel {}", channel);
        }
    }

    fn enqueue(&self, channel: &str, delivery: Delivery) -> Result<(), TransportError> {
        let slot = self
            .inner
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| ChannelSlot::new(self.inner.capacity));

        slot.tx.try_send(delivery).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::QueueFull {
                channel: channel.to_string(),
            },
            mpsc::error::TrySendError::Closed(_) => TransportError::ChannelClosed {
                channel: channel.to_string(),
            },
        })
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new(crate::config::defaults::DEFAULT_CHANNEL_CAPACITY)
    }
}

impl Transport for MemoryTransport {
    async fn publish(&self, channel: &str, key: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        if self.inner.fail_publishes.load(Ordering::SeqCst) {
            return Err(TransportError::Publish(format!(
                "in-memory publish to {channel} refused"
            )));
        }

        self.enqueue(
            channel,
            Ok(InboundMessage {
                key: Some(key.to_string()),
                payload,
            }),
        )
    }

    fn subscribe(&self, channel: &str) -> Result<Subscription, TransportError> {
        let mut slot = self
            .inner
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| ChannelSlot::new(self.inner.capacity));

        match slot.rx.take() {
            Some(rx) => Ok(Subscription::new(channel, rx)),
            None => Err(TransportError::AlreadySubscribed {
                channel: channel.to_string(),
            }),
        }
    }
}
