pub mod defaults;
pub mod settings;
pub mod user;

pub use defaults::instance_group_id;
pub use settings::{BridgeConfig, BridgeSettings, KafkaConfig, KafkaSettings};

use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to render config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Merge two BridgeSettings, preferring values from `primary` over `fallback`
pub fn merge_settings(
    fallback: Option<BridgeSettings>,
    primary: Option<BridgeSettings>,
) -> Option<BridgeSettings> {
    match (fallback, primary) {
        (None, None) => None,
        (Some(settings), None) => Some(settings),
        (None, Some(settings)) => Some(settings),
        (Some(fallback), Some(primary)) => Some(BridgeSettings {
            request_channel: primary.request_channel.or(fallback.request_channel),
            response_channel: primary.response_channel.or(fallback.response_channel),
            default_timeout_ms: primary.default_timeout_ms.or(fallback.default_timeout_ms),
            publish_timeout_ms: primary.publish_timeout_ms.or(fallback.publish_timeout_ms),
            channel_capacity: primary.channel_capacity.or(fallback.channel_capacity),
            kafka: merge_kafka(fallback.kafka, primary.kafka),
        }),
    }
}

fn merge_kafka(
    fallback: Option<KafkaSettings>,
    primary: Option<KafkaSettings>,
) -> Option<KafkaSettings> {
    match (fallback, primary) {
        (None, None) => None,
        (Some(settings), None) | (None, Some(settings)) => Some(settings),
        (Some(fallback), Some(primary)) => Some(KafkaSettings {
            brokers: primary.brokers.or(fallback.brokers),
            client_id: primary.client_id.or(fallback.client_id),
            group_id: primary.group_id.or(fallback.group_id),
        }),
    }
}

/// Parse a settings file.
pub fn load_settings_file(path: &Path) -> Result<BridgeSettings, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Load the user config (if present) layered under an explicit file.
///
/// A missing user config is not an error; a missing explicit file is.
pub fn load_layered(explicit: Option<&Path>) -> Result<BridgeSettings, ConfigError> {
    let user = match user::user_config_path() {
        Some(path) if path.is_file() => {
            log::debug!(
                target: "azofly_bridge::config",
                "Loading user config from {}",
                path.display()
            );
            Some(load_settings_file(&path)?)
        }
        _ => None,
    };

    let explicit = explicit.map(load_settings_file).transpose()?;

    Ok(merge_settings(user, explicit).unwrap_or_default())
}

/// Render settings as TOML for `config init`.
pub fn render_settings(settings: &BridgeSettings) -> Result<String, ConfigError> {
    Ok(toml::to_string_pretty(settings)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn test_merge_settings_with_none() {
        assert!(merge_settings(None, None).is_none());
    }

    #[test]
    fn test_merge_settings_fallback_only() {
        let fallback = BridgeSettings {
            default_timeout_ms: Some(5_000),
            ..Default::default()
        };
        let result = merge_settings(Some(fallback), None).unwrap();
        assert_eq!(result.default_timeout_ms, Some(5_000));
    }

    #[test]
    fn test_merge_settings_prefer_primary() {
        let fallback = BridgeSettings {
            request_channel: Some("fallback-requests".into()),
            default_timeout_ms: Some(5_000),
            kafka: Some(KafkaSettings {
                brokers: Some(vec!["fallback:9092".into()]),
                client_id: Some("fallback-client".into()),
                group_id: None,
            }),
            ..Default::default()
        };
        let primary = BridgeSettings {
            request_channel: Some("primary-requests".into()),
            kafka: Some(KafkaSettings {
                brokers: Some(vec!["primary:9092".into()]),
                ..Default::default()
            }),
            ..Default::default()
        };

        let result = merge_settings(Some(fallback), Some(primary)).unwrap();

        assert_eq!(result.request_channel.as_deref(), Some("primary-requests"));
        assert_eq!(result.default_timeout_ms, Some(5_000), "fallback fills gaps");
        let kafka = result.kafka.unwrap();
        assert_eq!(kafka.brokers, Some(vec!["primary:9092".to_string()]));
        assert_eq!(kafka.client_id.as_deref(), Some("fallback-client"));
    }

    #[test]
    fn load_settings_file_parses_partial_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "default_timeout_ms = 1500\n\n[kafka]\nbrokers = [\"a:9092\", \"b:9092\"]"
        )
        .unwrap();

        let settings = load_settings_file(file.path()).unwrap();
        let config = BridgeConfig::from_settings(settings);

        assert_eq!(config.default_timeout, Duration::from_millis(1500));
        assert_eq!(config.kafka.brokers, vec!["a:9092", "b:9092"]);
        assert_eq!(config.request_channel, defaults::DEFAULT_REQUEST_CHANNEL);
    }

    #[test]
    fn load_settings_file_reports_parse_errors_with_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "default_timeout_ms = \"soon\"").unwrap();

        let err = load_settings_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains(&file.path().display().to_string()));
    }

    #[test]
    fn load_layered_fails_on_missing_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");

        let err = load_layered(Some(&missing)).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let config = BridgeConfig::from_settings(BridgeSettings {
            channel_capacity: Some(0),
            ..Default::default()
        });
        assert_eq!(config.channel_capacity, 1);
    }
}
