//! # Sensor Polling
//!
//! Drives the periodic sensor reads of the node and hands every reading to whoever is
//! interested in it (usually the MQTT publish pipeline).
//!
//! ```text
//! sensors/
//! ├── reader.rs   - one sensor, one polling loop, callback fan-out
//! ├── manager.rs  - runs all readers concurrently and reports stats
//! └── host.rs     - /proc based sensors available on any Linux host
//! ```
//!
//! Sensor drivers are plain async closures returning a [`Reading`]; the polling core knows
//! nothing about buses or device protocols.

pub mod host;
pub mod manager;
pub mod reader;

pub use manager::{ManagerError, ReaderManager};
pub use reader::{Armed, Configuring, ReaderState, ReaderStats, SensorReader};

use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// A single measured quantity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Measurement {
    name: String,
    unit: String,
    value: f64,
}

impl Measurement {
    pub fn new(name: impl Into<String>, unit: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            unit: unit.into(),
            value,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unit(&self) -> &str {
        &self.unit
    }

    pub fn value(&self) -> f64 {
        self.value
    }
}

impl fmt::Display for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}={}{}", self.name, self.value, self.unit)
    }
}

/// All measurements taken in one poll cycle, stamped with epoch seconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    measurements: Vec<Measurement>,
    timestamp: i64,
}

impl Reading {
    pub fn new(measurements: Vec<Measurement>, timestamp: i64) -> Self {
        Self {
            measurements,
            timestamp,
        }
    }

    /// Stamps the measurements with the current UTC time.
    pub fn now(measurements: Vec<Measurement>) -> Self {
        Self::new(measurements, chrono::Utc::now().timestamp())
    }

    pub fn measurements(&self) -> &[Measurement] {
        &self.measurements
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "@{} [", self.timestamp)?;
        for (idx, measurement) in self.measurements.iter().enumerate() {
            if idx > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", measurement)?;
        }
        write!(f, "]")
    }
}

/// Failures of a sensor read.
#[derive(Debug, thiserror::Error)]
pub enum SensorError {
    #[error("Device error: {0}")]
    Device(String),

    #[error("Malformed sensor data: {0}")]
    Malformed(String),

    #[error("IO error while reading sensor: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure reported by a reading consumer.
#[derive(Debug, thiserror::Error)]
pub enum CallbackError {
    #[error("Callback failed: {0}")]
    Failed(String),

    #[error("Callback task panicked: {0}")]
    Panicked(String),
}

pub type SensorFuture = Pin<Box<dyn Future<Output = Result<Reading, SensorError>> + Send>>;
pub type CallbackFuture = Pin<Box<dyn Future<Output = Result<(), CallbackError>> + Send>>;

/// Async read capability of one sensor.
pub type ReadFn = Arc<dyn Fn() -> SensorFuture + Send + Sync>;

/// Async consumer of readings. Each invocation runs as its own task.
pub type ReadingCallback = Arc<dyn Fn(Arc<Reading>) -> CallbackFuture + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reading_display_lists_measurements_in_order() {
        let reading = Reading::new(
            vec![
                Measurement::new("temperature", "C", 21.5),
                Measurement::new("co2_concentration", "ppm", 600.0),
            ],
            1_700_000_000,
        );

        assert_eq!(
            reading.to_string(),
            "@1700000000 [temperature=21.5C, co2_concentration=600ppm]"
        );
    }

    #[test]
    fn reading_now_uses_current_epoch_seconds() {
        let before = chrono::Utc::now().timestamp();
        let reading = Reading::now(Vec::new());
        let after = chrono::Utc::now().timestamp();

        assert!(reading.timestamp() >= before && reading.timestamp() <= after);
        assert!(reading.measurements().is_empty());
    }
}
