use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::defaults;

/// File-facing bridge settings. Every field is optional so layers can merge.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct BridgeSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publish_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_capacity: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kafka: Option<KafkaSettings>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct KafkaSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brokers: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
}

/// Resolved configuration with every value filled in.
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeConfig {
    pub request_channel: String,
    pub response_channel: String,
    pub default_timeout: Duration,
    pub publish_timeout: Duration,
    pub channel_capacity: usize,
    pub kafka: KafkaConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KafkaConfig {
    pub brokers: Vec<String>,
    pub client_id: String,
    /// Consumer group shared by every subscription of one transport.
    ///
    /// `None` gives each transport a fresh group (see
    /// `defaults::instance_group_id`), which is what bridges need. Set it for
    /// responders that should split the request load between them.
    pub group_id: Option<String>,
}

impl BridgeConfig {
    /// Fill unset fields from the built-in defaults.
    pub fn from_settings(settings: BridgeSettings) -> Self {
        let kafka = settings.kafka.unwrap_or_default();

        Self {
            request_channel: settings
                .request_channel
                .unwrap_or_else(|| defaults::DEFAULT_REQUEST_CHANNEL.to_string()),
            response_channel: settings
                .response_channel
                .unwrap_or_else(|| defaults::DEFAULT_RESPONSE_CHANNEL.to_string()),
            default_timeout: Duration::from_millis(
                settings
                    .default_timeout_ms
                    .unwrap_or(defaults::DEFAULT_TIMEOUT_MS),
            ),
            publish_timeout: Duration::from_millis(
                settings
                    .publish_timeout_ms
                    .unwrap_or(defaults::DEFAULT_PUBLISH_TIMEOUT_MS),
            ),
            // A zero-capacity queue cannot hold a single message.
            channel_capacity: settings
                .channel_capacity
                .unwrap_or(defaults::DEFAULT_CHANNEL_CAPACITY)
                .max(1),
            kafka: KafkaConfig {
                brokers: kafka.brokers.unwrap_or_else(|| {
                    defaults::DEFAULT_BROKERS
                        .iter()
                        .map(|b| b.to_string())
                        .collect()
                }),
                client_id: kafka
                    .client_id
                    .unwrap_or_else(|| defaults::DEFAULT_CLIENT_ID.to_string()),
                group_id: kafka.group_id,
            },
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self::from_settings(BridgeSettings::default())
    }
}
