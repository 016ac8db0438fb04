//! Sensor reader with statum typestate for its lifecycle
//!
//! ```text
//! Configuring ──arm()──► Armed ──run()──► (polling until stop())
//!   add_callback()
//! ```
//!
//! A reader polls its sensor, fans the reading out to every callback as an independent
//! task, then sleeps for the configured interval. The period between cycle starts is
//! therefore `interval + processing time`, not a fixed-phase clock.

use super::{
    CallbackError, CallbackFuture, ReadFn, Reading, ReadingCallback, SensorError, SensorFuture,
};
use serde::Serialize;
use statum::{machine, state};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[state]
#[derive(Debug, Clone)]
pub enum ReaderState {
    Configuring, // accepting callbacks
    Armed,       // ready to poll
}

/// Snapshot of a reader's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReaderStats {
    /// Completed poll cycles, successful or not
    pub readings: u64,
    /// Failed reads plus failed callback deliveries
    pub errors: u64,
}

// Written only by the reader's own task; read by the stats reporter.
#[derive(Debug, Default)]
struct StatsCounters {
    readings: AtomicU64,
    errors: AtomicU64,
}

impl StatsCounters {
    fn snapshot(&self) -> ReaderStats {
        ReaderStats {
            readings: self.readings.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

#[machine]
pub struct SensorReader<S: ReaderState> {
    name: String,
    read: ReadFn,
    interval: Duration,
    callbacks: Vec<ReadingCallback>,
    counters: StatsCounters,
    // advisory, checked at the top of each cycle
    stop_token: CancellationToken,
}

impl<S: ReaderState> SensorReader<S> {
    /// Reporting name; not required to be unique at this level.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn stats(&self) -> ReaderStats {
        self.counters.snapshot()
    }

    /// Requests the polling loop to end.
    ///
    /// Advisory: the flag is checked at the top of the next cycle, an in-flight read or
    /// sleep is not interrupted and this call does not wait for the loop to exit.
    pub fn stop(&self) {
        info!("Stopping sensor reader {}", self.name);
        self.stop_token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop_token.is_cancelled()
    }
}

impl SensorReader<Configuring> {
    pub fn create<F, Fut>(name: impl Into<String>, interval: Duration, read: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Reading, SensorError>> + Send + 'static,
    {
        let name = name.into();
        debug!("Creating sensor reader {} with interval {:?}", name, interval);
        let read: ReadFn = Arc::new(move || -> SensorFuture { Box::pin(read()) });

        Self::new(
            name,
            read,
            interval,
            Vec::new(),
            StatsCounters::default(),
            CancellationToken::new(),
        )
    }

    /// Registers a consumer that receives every successful reading.
    pub fn add_callback<F, Fut>(&mut self, callback: F)
    where
        F: Fn(Arc<Reading>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), CallbackError>> + Send + 'static,
    {
        debug!(
            "Registering callback #{} on reader {}",
            self.callbacks.len() + 1,
            self.name
        );
        let callback: ReadingCallback =
            Arc::new(move |reading| -> CallbackFuture { Box::pin(callback(reading)) });
        self.callbacks.push(callback);
    }

    /// Freezes the callback list and makes the reader runnable.
    pub fn arm(self) -> SensorReader<Armed> {
        info!(
            "Arming sensor reader {} with {} callbacks",
            self.name,
            self.callbacks.len()
        );
        self.transition()
    }
}

impl SensorReader<Armed> {
    /// Polling loop. Runs until [`SensorReader::stop`] is observed at a cycle boundary.
    pub async fn run(&self) {
        info!(
            "Started collecting sensor readings for {} with interval {:?}",
            self.name, self.interval
        );

        while !self.stop_token.is_cancelled() {
            self.poll_once().await;
            tokio::time::sleep(self.interval).await;
        }

        info!("Stopped collecting sensor readings for {}", self.name);
    }

    async fn poll_once(&self) {
        debug!("Performing sensor reading for {}", self.name);

        match (self.read)().await {
            Ok(reading) => {
                debug!("{} obtained reading {}", self.name, reading);
                let failures = self.fan_out(Arc::new(reading)).await;
                if failures > 0 {
                    self.counters.errors.fetch_add(failures, Ordering::Relaxed);
                }
            }
            Err(e) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                error!("Error while reading sensor {}: {}", self.name, e);
            }
        }

        self.counters.readings.fetch_add(1, Ordering::Relaxed);
    }

    // one task per callback, returns how many failed
    async fn fan_out(&self, reading: Arc<Reading>) -> u64 {
        if self.callbacks.is_empty() {
            warn!("No callbacks registered on {}", self.name);
            return 0;
        }

        let mut deliveries = JoinSet::new();
        for callback in &self.callbacks {
            let callback = callback.clone();
            let reading = reading.clone();
            deliveries.spawn(async move { callback(reading).await });
        }

        let mut failures = 0;
        while let Some(joined) = deliveries.join_next().await {
            let outcome = joined.unwrap_or_else(|e| Err(CallbackError::Panicked(e.to_string())));
            if let Err(e) = outcome {
                failures += 1;
                error!("Error while executing read callback on {}: {}", self.name, e);
            }
        }

        debug!(
            "{} delivered reading to {} callbacks ({} failed)",
            self.name,
            self.callbacks.len(),
            failures
        );
        failures
    }
}
