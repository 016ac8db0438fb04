//! # sensornode
//!
//! Telemetry node: polls sensors on fixed intervals and publishes every measurement to an
//! MQTT broker, surviving broker outages without blocking the sensors.
//!
//! ```text
//! SensorReader ─┐
//! SensorReader ─┼─ callbacks ─► Publisher ─► BoundedQueue ─► PublishPipeline ─► broker
//! SensorReader ─┘                  ▲
//!   (ReaderManager)        tracing ─┘ MqttLogLayer
//! ```

pub mod config;
pub mod mqtt;
pub mod queue;
pub mod sensors;
