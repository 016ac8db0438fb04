//! Forwards log records to `<base>/system/logs`.

use super::message::QoS;
use super::pipeline::Publisher;
use super::{LOG_SUBTOPIC, LOG_TARGET};
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, OnceLock};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

#[derive(Debug, Serialize)]
struct LogRecord<'a> {
    timestamp: String,
    level: &'a str,
    name: &'a str,
    message: String,
}

/// `tracing` layer publishing every event it sees through a [`Publisher`].
///
/// The layer is installed before the broker connection exists and does nothing until
/// [`attach`](Self::attach) is called. Events from this module and from rumqttc are never
/// forwarded, since publishing them would log again.
#[derive(Debug, Clone, Default)]
pub struct MqttLogLayer {
    publisher: Arc<OnceLock<Publisher>>,
}

impl MqttLogLayer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts forwarding. Returns `false` if a publisher was attached before.
    pub fn attach(&self, publisher: Publisher) -> bool {
        self.publisher.set(publisher).is_ok()
    }

    fn is_forwarded(target: &str) -> bool {
        !(target.starts_with(LOG_TARGET) || target.starts_with("rumqttc"))
    }
}

impl<S: Subscriber> Layer<S> for MqttLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let Some(publisher) = self.publisher.get() else {
            return;
        };
        let metadata = event.metadata();
        if !Self::is_forwarded(metadata.target()) {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let level = *metadata.level();
        let record = LogRecord {
            timestamp: chrono::Utc::now().to_rfc3339(),
            level: level.as_str(),
            name: metadata.target(),
            message: visitor.finish(),
        };
        let qos = match level {
            Level::ERROR | Level::WARN => QoS::AtLeastOnce,
            _ => QoS::AtMostOnce,
        };

        if let Ok(payload) = serde_json::to_vec(&record) {
            publisher.publish(LOG_SUBTOPIC, payload, qos, false);
        }
    }
}

/// Collects the formatted message plus any structured fields as `key=value`.
#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: Vec<String>,
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            return self.message;
        }
        let fields = self.fields.join(" ");
        if self.message.is_empty() {
            fields
        } else {
            format!("{} {}", self.message, fields)
        }
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push(format!("{}={}", field.name(), value));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            self.fields.push(format!("{}={:?}", field.name(), value));
        }
    }
}
