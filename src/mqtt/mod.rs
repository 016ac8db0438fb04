//! # MQTT Publishing
//!
//! Gets readings, status and log records from the node to the broker without ever
//! blocking the producers. Producers enqueue into a bounded queue; a single publisher loop
//! drains it and owns retry and reconnect decisions, while a keepalive loop checks the link.
//!
//! ```text
//! mqtt/
//! ├── config.rs      - broker settings and their per-device resolution
//! ├── connection.rs  - connection state machine, reconnect with backoff
//! ├── error.rs       - broker error taxonomy
//! ├── log_layer.rs   - tracing layer forwarding log records to the broker
//! ├── message.rs     - publish requests and JSON wire payloads
//! ├── pipeline.rs    - queue, publisher loop, keepalive loop
//! └── session.rs     - wire seam and its rumqttc implementation
//! ```
//!
//! ## Topics
//!
//! Everything a device publishes lives under `<root>/<location>/<device_id>`:
//!
//! | Subtopic                   | Content                          |
//! |----------------------------|----------------------------------|
//! | `measurements/<name>`      | one measurement, JSON            |
//! | `system/status`            | retained `online` / `offline`    |
//! | `system/logs`              | forwarded log records, JSON      |

pub mod config;
pub mod connection;
pub mod error;
pub mod log_layer;
pub mod message;
pub mod pipeline;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{MqttConfig, PipelineSettings};
pub use connection::{ConnectionEvent, ConnectionState};
pub use error::BrokerError;
pub use log_layer::MqttLogLayer;
pub use message::{PublishRequest, QoS};
pub use pipeline::{PublishPipeline, Publisher};
pub use session::{BrokerSession, RumqttSession};

pub const MEASUREMENTS_SUBTOPIC: &str = "measurements";
pub const STATUS_SUBTOPIC: &str = "system/status";
pub const LOG_SUBTOPIC: &str = "system/logs";

/// Tracing target prefix of this module; the log layer never forwards these events.
pub(crate) const LOG_TARGET: &str = module_path!();

/// Topic hierarchy of a single device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicLayout {
    base: String,
}

impl TopicLayout {
    pub fn new(root: &str, location: &str, device_id: &str) -> Self {
        let base = [root, location, device_id]
            .iter()
            .map(|segment| segment.trim_matches('/'))
            .filter(|segment| !segment.is_empty())
            .collect::<Vec<_>>()
            .join("/");
        Self { base }
    }

    /// `<root>/<location>/<device_id>`
    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn topic(&self, subtopic: &str) -> String {
        format!("{}/{}", self.base, subtopic.trim_start_matches('/'))
    }

    pub fn status(&self) -> String {
        self.topic(STATUS_SUBTOPIC)
    }

    pub fn logs(&self) -> String {
        self.topic(LOG_SUBTOPIC)
    }

    pub fn measurement_subtopic(name: &str) -> String {
        format!("{}/{}", MEASUREMENTS_SUBTOPIC, name)
    }
}
