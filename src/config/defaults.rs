//! Default configuration values for azofly-bridge.
//!
//! `default_settings` spells every default out explicitly so `config init`
//! can print a complete, editable template. The Kafka consumer group is the
//! exception: it is left unset so each process gets a group of its own.

use ulid::Ulid;

use super::settings::{BridgeSettings, KafkaSettings};

pub const DEFAULT_REQUEST_CHANNEL: &str = "azofly-ssr-requests";
pub const DEFAULT_RESPONSE_CHANNEL: &str = "azofly-ssr-responses";

/// Deadline applied to a request when the caller gives none (30s).
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Upper bound on a single publish before it counts as failed (10s).
pub const DEFAULT_PUBLISH_TIMEOUT_MS: u64 = 10_000;

/// Messages buffered per subscription before publishers see backpressure.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

pub const DEFAULT_BROKERS: &[&str] = &["localhost:9092"];
pub const DEFAULT_CLIENT_ID: &str = "azofly-client";
/// Prefix of the per-instance consumer group used when none is configured.
pub const GROUP_ID_PREFIX: &str = "azofly-client";

/// A consumer group name unique to one process.
///
/// Every bridge must see every message on its response channel, so bridges
/// may not share a group; a shared group would split the partitions and hand
/// some responses to a process that never issued them.
pub fn instance_group_id() -> String {
    format!("{GROUP_ID_PREFIX}-{}", Ulid::new().to_string().to_lowercase())
}

/// Returns the default settings with every field populated.
pub fn default_settings() -> BridgeSettings {
    BridgeSettings {
        request_channel: Some(DEFAULT_REQUEST_CHANNEL.to_string()),
        response_channel: Some(DEFAULT_RESPONSE_CHANNEL.to_string()),
        default_timeout_ms: Some(DEFAULT_TIMEOUT_MS),
        publish_timeout_ms: Some(DEFAULT_PUBLISH_TIMEOUT_MS),
        channel_capacity: Some(DEFAULT_CHANNEL_CAPACITY),
        kafka: Some(KafkaSettings {
            brokers: Some(DEFAULT_BROKERS.iter().map(|b| b.to_string()).collect()),
            client_id: Some(DEFAULT_CLIENT_ID.to_string()),
            group_id: None,
        }),
    }
}
