//! Kafka transport built on rdkafka.
//!
//! Publishing uses a shared `FutureProducer`, keyed by correlation id so a
//! request and its retries land on the same partition. Each subscription owns
//! a `StreamConsumer` drained by a background task into a bounded queue;
//! consumer errors are forwarded as transient `Receive` errors and the task
//! keeps reading.

use std::time::Duration;

use dashmap::DashSet;
use log::{debug, info, warn};
use rdkafka::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord};
use tokio::sync::mpsc;

use super::{Delivery, InboundMessage, Subscription, Transport};
use crate::config::{BridgeConfig, instance_group_id};
use crate::error::TransportError;

const LOG_TARGET: &str = "azofly_bridge::transport::kafka";

/// Transport backed by a Kafka (or Redpanda) cluster.
pub struct KafkaTransport {
    producer: FutureProducer,
    consumer_config: ClientConfig,
    group_id: String,
    publish_timeout: Duration,
    capacity: usize,
    subscribed: DashSet<String>,
}

impl KafkaTransport {
    /// Create the producer and prepare consumer settings from `config.kafka`.
    ///
    /// Without a configured `group_id` the consumers join a group unique to
    /// this transport, so every message on a subscribed channel reaches it.
    pub fn new(config: &BridgeConfig) -> Result<Self, TransportError> {
        if config.kafka.brokers.is_empty() {
            return Err(TransportError::Config("no Kafka brokers configured".into()));
        }
        let brokers = config.kafka.brokers.join(",");

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("client.id", &config.kafka.client_id)
            .set(
                "message.timeout.ms",
                config.publish_timeout.as_millis().to_string(),
            )
            .create()
            .map_err(|e| TransportError::Config(format!("failed to create producer: {e}")))?;

        let group_id = config
            .kafka
            .group_id
            .clone()
            .unwrap_or_else(instance_group_id);
        info!(target: LOG_TARGET, "Kafka consumers join group {}", group_id);

        let mut consumer_config = ClientConfig::new();
        consumer_config
            .set("bootstrap.servers", &brokers)
            .set("client.id", &config.kafka.client_id)
            .set("group.id", &group_id)
            .set("enable.auto.commit", "true")
            .set("auto.offset.reset", "latest");

        Ok(Self {
            producer,
            consumer_config,
            group_id,
            publish_timeout: config.publish_timeout,
            capacity: config.channel_capacity,
            subscribed: DashSet::new(),
        })
    }
}

impl KafkaTransport {
    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    fn create_consumer(&self, channel: &str) -> Result<StreamConsumer, TransportError> {
        let consumer: StreamConsumer = self
            .consumer_config
            .create()
            .map_err(|e| TransportError::Config(format!("failed to create consumer: {e}")))?;
        consumer
            .subscribe(&[channel])
            .map_err(|e| TransportError::Config(format!("failed to subscribe to {channel}: {e}")))?;
        debug!(target: LOG_TARGET, "Subscribed Kafka consumer to {}", channel);
        Ok(consumer)
    }
}

impl Transport for KafkaTransport {
    async fn publish(&self, channel: &str, key: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        let record = FutureRecord::to(channel).key(key).payload(&payload);

        self.producer
            .send(record, self.publish_timeout)
            .await
            .map(|_| ())
            .map_err(|(err, _)| TransportError::Publish(err.to_string()))
    }

    fn subscribe(&self, channel: &str) -> Result<Subscription, TransportError> {
        if !self.subscribed.insert(channel.to_string()) {
            return Err(TransportError::AlreadySubscribed {
                channel: channel.to_string(),
            });
        }

        let consumer = match self.create_consumer(channel) {
            Ok(consumer) => consumer,
            Err(e) => {
                self.subscribed.remove(channel);
                return Err(e);
            }
        };

        let (tx, rx) = mpsc::channel(self.capacity);
        tokio::spawn(forward_messages(consumer, channel.to_string(), tx));

        Ok(Subscription::new(channel, rx))
    }
}

/// Drain the consumer into the subscription queue until the subscriber drops.
async fn forward_messages(consumer: StreamConsumer, channel: String, tx: mpsc::Sender<Delivery>) {
    loop {
        let delivery = match consumer.recv().await {
            Ok(message) => Ok(InboundMessage {
                key: message
                    .key()
                    .map(|k| String::from_utf8_lossy(k).into_owned()),
                payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
            }),
            Err(e) => {
                warn!(target: LOG_TARGET, "Kafka consumer error on {}: {}", channel, e);
                Err(TransportError::Receive(e.to_string()))
            }
        };

        if tx.send(delivery).await.is_err() {
            debug!(
                target: LOG_TARGET,
                "Subscriber for {} dropped, stopping consumer",
                channel
            );
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_requires_brokers() {
        let mut config = BridgeConfig::default();
        config.kafka.brokers.clear();

        assert!(matches!(
            KafkaTransport::new(&config),
            Err(TransportError::Config(_))
        ));
    }

    #[test]
    fn unset_group_is_unique_per_transport() {
        let config = BridgeConfig::default();
        let first = KafkaTransport::new(&config).unwrap();
        let second = KafkaTransport::new(&config).unwrap();

        assert!(first.group_id().starts_with("azofly-client-"));
        assert_ne!(first.group_id(), second.group_id());
    }

    #[test]
    fn configured_group_is_kept() {
        let mut config = BridgeConfig::default();
        config.kafka.group_id = Some("ssr-renderers".into());

        let transport = KafkaTransport::new(&config).unwrap();
        assert_eq!(transport.group_id(), "ssr-renderers");
    }

    // Client creation is lazy; no broker needs to be reachable.
    #[tokio::test]
    async fn second_subscription_to_same_channel_is_rejected() {
        let transport = KafkaTransport::new(&BridgeConfig::default()).unwrap();

        let _first = transport.subscribe("azofly-test-responses").unwrap();
        assert!(matches!(
            transport.subscribe("azofly-test-responses"),
            Err(TransportError::AlreadySubscribed { .. })
        ));
    }
}
