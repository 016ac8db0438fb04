use super::TopicLayout;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_ROOT_TOPIC: &str = "sensornode";
pub const MIN_KEEPALIVE_SECS: u64 = 10;
// the CONNECT packet carries keepalive as a 16 bit field
pub const MAX_KEEPALIVE_SECS: u64 = u16::MAX as u64;

/// Broker connection and delivery settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    /// Session keepalive, kept within 10 ..= 65535 s
    pub keepalive_secs: u64,
    pub root_topic: String,
    pub clean_session: bool,
    /// Publish requests buffered before the oldest one is dropped
    pub queue_capacity: usize,
    /// Total attempts for a publish failing with a non-transport error
    pub max_retries: u32,
    pub connect_timeout_secs: u64,
    pub max_payload_bytes: usize,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker_host: "localhost".to_string(),
            broker_port: 1883,
            keepalive_secs: 60,
            root_topic: DEFAULT_ROOT_TOPIC.to_string(),
            clean_session: false,
            queue_capacity: 50,
            max_retries: 3,
            connect_timeout_secs: 10,
            max_payload_bytes: 10 * 1024,
        }
    }
}

impl MqttConfig {
    /// Keepalive clamped into the range the protocol can carry, warning when it had to be.
    pub fn effective_keepalive(&self) -> Duration {
        if self.keepalive_secs < MIN_KEEPALIVE_SECS {
            warn!(
                "Keepalive must be >= {}s, got {}s. Setting to {}s.",
                MIN_KEEPALIVE_SECS, self.keepalive_secs, MIN_KEEPALIVE_SECS
            );
            Duration::from_secs(MIN_KEEPALIVE_SECS)
        } else if self.keepalive_secs > MAX_KEEPALIVE_SECS {
            warn!(
                "Keepalive must be <= {}s, got {}s. Setting to {}s.",
                MAX_KEEPALIVE_SECS, self.keepalive_secs, MAX_KEEPALIVE_SECS
            );
            Duration::from_secs(MAX_KEEPALIVE_SECS)
        } else {
            Duration::from_secs(self.keepalive_secs)
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Broker settings resolved for one device: clamped keepalive, topic layout, client id.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub client_id: String,
    pub topics: TopicLayout,
    pub broker_host: String,
    pub broker_port: u16,
    pub keepalive: Duration,
    pub clean_session: bool,
    pub queue_capacity: NonZeroUsize,
    pub max_retries: u32,
    pub connect_timeout: Duration,
    pub max_payload_bytes: usize,
}

impl PipelineSettings {
    pub fn resolve(device_id: &str, location: &str, config: &MqttConfig) -> Self {
        let queue_capacity = NonZeroUsize::new(config.queue_capacity).unwrap_or_else(|| {
            warn!("Queue capacity must be >= 1. Setting to 1.");
            NonZeroUsize::MIN
        });
        let max_retries = if config.max_retries == 0 {
            warn!("Max retries must be >= 1. Setting to 1.");
            1
        } else {
            config.max_retries
        };

        Self {
            client_id: device_id.to_string(),
            topics: TopicLayout::new(&config.root_topic, location, device_id),
            broker_host: config.broker_host.clone(),
            broker_port: config.broker_port,
            keepalive: config.effective_keepalive(),
            clean_session: config.clean_session,
            queue_capacity,
            max_retries,
            connect_timeout: config.connect_timeout(),
            max_payload_bytes: config.max_payload_bytes,
        }
    }

    /// Wait before each keepalive ping: half the keepalive minus one second.
    pub fn ping_interval(&self) -> Duration {
        (self.keepalive / 2).saturating_sub(Duration::from_secs(1))
    }
}
