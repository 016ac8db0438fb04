//! Host sensors backed by procfs
//!
//! These give the node something real to poll on any Linux machine. Both are stateless;
//! each read opens and parses the proc file again.

use super::{Measurement, Reading, SensorError};
use std::path::PathBuf;
use tracing::debug;

const LOADAVG_PATH: &str = "/proc/loadavg";
const MEMINFO_PATH: &str = "/proc/meminfo";

/// System load averages from `/proc/loadavg`.
#[derive(Debug, Clone)]
pub struct LoadAverageSensor {
    path: PathBuf,
}

impl Default for LoadAverageSensor {
    fn default() -> Self {
        Self {
            path: PathBuf::from(LOADAVG_PATH),
        }
    }
}

impl LoadAverageSensor {
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub async fn read(&self) -> Result<Reading, SensorError> {
        let raw = tokio::fs::read_to_string(&self.path).await?;
        debug!("Read {} bytes from {}", raw.len(), self.path.display());
        parse_loadavg(&raw).map(Reading::now)
    }
}

/// Memory totals from `/proc/meminfo`, in kB.
#[derive(Debug, Clone)]
pub struct MemorySensor {
    path: PathBuf,
}

impl Default for MemorySensor {
    fn default() -> Self {
        Self {
            path: PathBuf::from(MEMINFO_PATH),
        }
    }
}

impl MemorySensor {
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub async fn read(&self) -> Result<Reading, SensorError> {
        let raw = tokio::fs::read_to_string(&self.path).await?;
        parse_meminfo(&raw).map(Reading::now)
    }
}

fn parse_loadavg(raw: &str) -> Result<Vec<Measurement>, SensorError> {
    let mut fields = raw.split_whitespace();
    let mut measurements = Vec::with_capacity(3);

    for name in ["load_1m", "load_5m", "load_15m"] {
        let field = fields
            .next()
            .ok_or_else(|| SensorError::Malformed(format!("loadavg is missing {}", name)))?;
        let value = field
            .parse::<f64>()
            .map_err(|e| SensorError::Malformed(format!("{} '{}': {}", name, field, e)))?;
        measurements.push(Measurement::new(name, "", value));
    }

    Ok(measurements)
}

fn parse_meminfo(raw: &str) -> Result<Vec<Measurement>, SensorError> {
    let lookup = |key: &str| -> Result<f64, SensorError> {
        let line = raw
            .lines()
            .find(|line| line.split(':').next() == Some(key))
            .ok_or_else(|| SensorError::Malformed(format!("meminfo is missing {}", key)))?;
        let value = line
            .split_whitespace()
            .nth(1)
            .ok_or_else(|| SensorError::Malformed(format!("{} has no value", key)))?;
        value
            .parse::<f64>()
            .map_err(|e| SensorError::Malformed(format!("{} '{}': {}", key, value, e)))
    };

    Ok(vec![
        Measurement::new("mem_total", "kB", lookup("MemTotal")?),
        Measurement::new("mem_available", "kB", lookup("MemAvailable")?),
    ])
}
