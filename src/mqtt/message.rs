use crate::sensors::Measurement;
use serde::Serialize;
use std::fmt;

/// Delivery guarantee requested for a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
}

impl From<QoS> for rumqttc::QoS {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
            QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        }
    }
}

/// A message waiting in the publish queue. The subtopic is relative to the device base topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRequest {
    pub subtopic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

impl PublishRequest {
    pub fn new(subtopic: impl Into<String>, payload: impl Into<Vec<u8>>, qos: QoS, retain: bool) -> Self {
        Self {
            subtopic: subtopic.into(),
            payload: payload.into(),
            qos,
            retain,
        }
    }
}

impl fmt::Display for PublishRequest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} ({} bytes, {:?}{})",
            self.subtopic,
            self.payload.len(),
            self.qos,
            if self.retain { ", retained" } else { "" }
        )
    }
}

/// Wire form of a single measurement.
#[derive(Debug, Serialize)]
pub struct MeasurementPayload<'a> {
    pub name: &'a str,
    pub value: f64,
    pub unit: &'a str,
    pub timestamp: i64,
}

impl<'a> MeasurementPayload<'a> {
    pub fn new(measurement: &'a Measurement, timestamp: i64) -> Self {
        Self {
            name: measurement.name(),
            value: measurement.value(),
            unit: measurement.unit(),
            timestamp,
        }
    }
}

/// Wire form of the device availability status.
#[derive(Debug, Serialize)]
pub struct StatusPayload<'a> {
    pub status: &'a str,
}

pub const STATUS_ONLINE: &str = "online";
pub const STATUS_OFFLINE: &str = "offline";

/// Serialized `{"status": ...}` document.
pub fn status_payload(status: &str) -> Vec<u8> {
    // a single string field cannot fail to serialize
    serde_json::to_vec(&StatusPayload { status }).unwrap_or_default()
}
