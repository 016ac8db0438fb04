use crate::mqtt::config::MqttConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::filter::LevelFilter;

const CONFIG_DIR: &str = "sensornode";
const CONFIG_FILE: &str = "config.toml";
/// Overrides the config file location
pub const CONFIG_ENV: &str = "SENSORNODE_CONFIG";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to access config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// `error`, `warn`, `info`, `debug`, `trace` or `off`
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl LoggingConfig {
    pub fn level_filter(&self) -> Result<LevelFilter, ConfigError> {
        LevelFilter::from_str(&self.level)
            .map_err(|_| ConfigError::Invalid(format!("unknown log level '{}'", self.level)))
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct SensorsConfig {
    /// Wait between two reads of the same sensor
    pub interval_secs: u64,
    pub stats_interval_secs: u64,
}

impl Default for SensorsConfig {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            stats_interval_secs: 60,
        }
    }
}

impl SensorsConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct NodeConfig {
    pub device_id: String,
    pub location: String,
    pub logging: LoggingConfig,
    pub mqtt: MqttConfig,
    pub sensors: SensorsConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            device_id: "sensornode-01".to_string(),
            location: "default".to_string(),
            logging: LoggingConfig::default(),
            mqtt: MqttConfig::default(),
            sensors: SensorsConfig::default(),
        }
    }
}

impl NodeConfig {
    /// `$SENSORNODE_CONFIG`, or `sensornode/config.toml` below the platform config directory.
    pub fn default_path() -> PathBuf {
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return PathBuf::from(path);
        }

        let mut path = dirs::config_dir().unwrap_or_else(|| {
            warn!("Could not determine config directory, using current directory");
            PathBuf::from(".")
        });
        path.push(CONFIG_DIR);
        path.push(CONFIG_FILE);
        path
    }

    /// Writes the default configuration to `path` unless a file already exists there.
    pub async fn ensure_default(path: &Path) -> Result<(), ConfigError> {
        let exists = tokio::fs::try_exists(path).await.map_err(|e| io_error(path, e))?;
        if exists {
            debug!("Using existing config at {}", path.display());
            return Ok(());
        }

        info!("Creating default configuration at {}", path.display());
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(parent, e))?;
        }
        NodeConfig::default().save(path).await
    }

    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| io_error(path, e))?;
        let config: NodeConfig = toml::from_str(&content)?;
        config.validate()?;
        debug!("Loaded config for {}/{}", config.location, config.device_id);
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        tokio::fs::write(path, content)
            .await
            .map_err(|e| io_error(path, e))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device_id.trim().is_empty() {
            return Err(ConfigError::Invalid("device_id must not be empty".to_string()));
        }
        if self.location.trim().is_empty() {
            return Err(ConfigError::Invalid("location must not be empty".to_string()));
        }
        for (name, value) in [("device_id", &self.device_id), ("location", &self.location)] {
            if value.contains(['/', '+', '#']) {
                return Err(ConfigError::Invalid(format!(
                    "{} '{}' must not contain '/', '+' or '#'",
                    name, value
                )));
            }
        }
        if self.mqtt.queue_capacity == 0 {
            return Err(ConfigError::Invalid("mqtt.queue_capacity must be >= 1".to_string()));
        }
        if self.mqtt.max_retries == 0 {
            return Err(ConfigError::Invalid("mqtt.max_retries must be >= 1".to_string()));
        }
        if self.sensors.interval_secs == 0 || self.sensors.stats_interval_secs == 0 {
            return Err(ConfigError::Invalid("sensor intervals must be positive".to_string()));
        }
        self.logging.level_filter()?;
        Ok(())
    }
}

fn io_error(path: &Path, source: std::io::Error) -> ConfigError {
    ConfigError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ensure_default_writes_a_loadable_file_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join(CONFIG_FILE);

        NodeConfig::ensure_default(&path).await.expect("write default");
        let loaded = NodeConfig::load(&path).await.expect("load default");
        assert_eq!(loaded, NodeConfig::default());

        tokio::fs::write(&path, "device_id = \"pico-02\"\n")
            .await
            .expect("overwrite");
        NodeConfig::ensure_default(&path).await.expect("keeps existing");
        let loaded = NodeConfig::load(&path).await.expect("load custom");
        assert_eq!(loaded.device_id, "pico-02");
    }

    #[tokio::test]
    async fn partial_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(CONFIG_FILE);
        tokio::fs::write(
            &path,
            "location = \"greenhouse\"\n\n[mqtt]\nbroker_host = \"10.0.0.5\"\nkeepalive_secs = 30\n",
        )
        .await
        .expect("write");

        let config = NodeConfig::load(&path).await.expect("load");

        assert_eq!(config.location, "greenhouse");
        assert_eq!(config.mqtt.broker_host, "10.0.0.5");
        assert_eq!(config.mqtt.keepalive_secs, 30);
        assert_eq!(config.mqtt.broker_port, 1883);
        assert_eq!(config.sensors, SensorsConfig::default());
    }

    #[tokio::test]
    async fn invalid_values_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(CONFIG_FILE);
        tokio::fs::write(&path, "[mqtt]\nqueue_capacity = 0\n")
            .await
            .expect("write");

        let err = NodeConfig::load(&path).await.expect_err("queue of zero");
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[tokio::test]
    async fn missing_file_and_bad_toml_are_distinguished() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = NodeConfig::load(&dir.path().join("absent.toml")).await;
        assert!(matches!(missing, Err(ConfigError::Io { .. })));

        let path = dir.path().join(CONFIG_FILE);
        tokio::fs::write(&path, "device_id = ").await.expect("write");
        let broken = NodeConfig::load(&path).await;
        assert!(matches!(broken, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn validation_rules() {
        let valid = NodeConfig::default();
        assert!(valid.validate().is_ok());

        let cases = [
            NodeConfig {
                device_id: " ".to_string(),
                ..NodeConfig::default()
            },
            NodeConfig {
                location: "lab/2".to_string(),
                ..NodeConfig::default()
            },
            NodeConfig {
                mqtt: MqttConfig {
                    max_retries: 0,
                    ..MqttConfig::default()
                },
                ..NodeConfig::default()
            },
            NodeConfig {
                sensors: SensorsConfig {
                    interval_secs: 0,
                    ..SensorsConfig::default()
                },
                ..NodeConfig::default()
            },
            NodeConfig {
                logging: LoggingConfig {
                    level: "loud".to_string(),
                },
                ..NodeConfig::default()
            },
        ];
        for config in cases {
            assert!(
                matches!(config.validate(), Err(ConfigError::Invalid(_))),
                "{:?} should be invalid",
                config
            );
        }
    }

    #[test]
    fn level_filter_parses_names() {
        let logging = LoggingConfig {
            level: "debug".to_string(),
        };
        assert_eq!(logging.level_filter().expect("valid"), LevelFilter::DEBUG);
    }
}
