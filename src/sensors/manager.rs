//! Manager running all sensor readers of the node concurrently

use super::reader::{Armed, ReaderStats, SensorReader};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    /// Reader names key the stats report, so they must be unique
    #[error("A sensor reader named '{0}' is already registered")]
    DuplicateReader(String),

    #[error("Sensor task failed: {0}")]
    TaskFailed(String),
}

/// Owns a set of armed readers and runs them side by side with a stats reporter.
///
/// ```text
/// ReaderManager::start
///   ├── reader "scd41"  ─► poll / fan-out / sleep …
///   ├── reader "bh1750" ─► poll / fan-out / sleep …
///   └── stats reporter  ─► every stats_interval: log {name → stats}
/// ```
pub struct ReaderManager {
    readers: Vec<Arc<SensorReader<Armed>>>,
    stats_interval: Duration,
    reporter_token: CancellationToken,
}

impl ReaderManager {
    pub fn new(stats_interval: Duration) -> Self {
        Self {
            readers: Vec::new(),
            stats_interval,
            reporter_token: CancellationToken::new(),
        }
    }

    /// Registers a reader. Must be called before [`ReaderManager::start`].
    ///
    /// # Errors
    ///
    /// [`ManagerError::DuplicateReader`] if a reader with the same name exists.
    pub fn add_reader(&mut self, reader: SensorReader<Armed>) -> Result<(), ManagerError> {
        if self.readers.iter().any(|r| r.name() == reader.name()) {
            error!("Rejecting duplicate sensor reader {}", reader.name());
            return Err(ManagerError::DuplicateReader(reader.name().to_string()));
        }

        debug!("Adding reader {}", reader.name());
        self.readers.push(Arc::new(reader));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.readers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readers.is_empty()
    }

    /// Aggregate `{name → stats}` snapshot.
    pub fn stats(&self) -> BTreeMap<String, ReaderStats> {
        collect_stats(&self.readers)
    }

    /// Runs every reader plus the stats reporter until all of them have finished.
    ///
    /// Readers only finish after [`ReaderManager::stop`]. A panicking task is returned
    /// as [`ManagerError::TaskFailed`]; the remaining tasks are aborted with it.
    pub async fn start(&self) -> Result<(), ManagerError> {
        info!("Starting {} sensor readers", self.readers.len());

        let mut tasks = JoinSet::new();
        for reader in &self.readers {
            let reader = reader.clone();
            tasks.spawn(async move { reader.run().await });
        }
        tasks.spawn(report_stats(
            self.readers.clone(),
            self.stats_interval,
            self.reporter_token.clone(),
        ));

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("Sensor task terminated abnormally: {}", e);
                return Err(ManagerError::TaskFailed(e.to_string()));
            }
        }

        info!("All sensor readers finished");
        Ok(())
    }

    /// Signals every reader and the stats reporter to stop. Does not wait.
    pub fn stop(&self) {
        info!("Stopping sensor readers");
        for reader in &self.readers {
            reader.stop();
        }
        self.reporter_token.cancel();
    }
}

fn collect_stats(readers: &[Arc<SensorReader<Armed>>]) -> BTreeMap<String, ReaderStats> {
    readers
        .iter()
        .map(|reader| (reader.name().to_string(), reader.stats()))
        .collect()
}

async fn report_stats(
    readers: Vec<Arc<SensorReader<Armed>>>,
    interval: Duration,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        info!(stats = ?collect_stats(&readers), "Sensor reader stats");
    }
    debug!("Stats reporter stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensors::{Measurement, Reading, SensorError};
    use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

    fn reader(name: &str) -> SensorReader<Armed> {
        SensorReader::create(name, Duration::from_secs(1), || async {
            Ok::<Reading, SensorError>(Reading::new(
                vec![Measurement::new("load_1m", "", 0.5)],
                1_700_000_000,
            ))
        })
        .arm()
    }

    #[test]
    fn duplicate_reader_names_are_rejected() {
        let mut manager = ReaderManager::new(Duration::from_secs(60));
        manager.add_reader(reader("scd41")).expect("first reader");

        let err = manager
            .add_reader(reader("scd41"))
            .expect_err("duplicate must be rejected");

        assert!(matches!(err, ManagerError::DuplicateReader(ref name) if name == "scd41"));
        assert_eq!(manager.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn start_returns_once_stopped_readers_exit() {
        let mut manager = ReaderManager::new(Duration::from_secs(2));
        manager.add_reader(reader("scd41")).expect("scd41");
        manager.add_reader(reader("bh1750")).expect("bh1750");
        let manager = Arc::new(manager);

        let running = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.start().await })
        };

        tokio::time::sleep(Duration::from_millis(4500)).await;
        manager.stop();

        running
            .await
            .expect("manager task")
            .expect("manager finished cleanly");

        let stats = manager.stats();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats["scd41"].readings, 5);
        assert_eq!(stats["bh1750"].readings, 5);
        assert_eq!(stats["bh1750"].errors, 0);
    }

    // records when an event carrying a `stats` field was emitted
    #[derive(Clone, Default)]
    struct StatsReports(Arc<std::sync::Mutex<Vec<tokio::time::Instant>>>);

    impl<S: tracing::Subscriber> Layer<S> for StatsReports {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
            if event.metadata().fields().field("stats").is_some() {
                self.0
                    .lock()
                    .expect("reports lock")
                    .push(tokio::time::Instant::now());
            }
        }
    }

    impl StatsReports {
        fn offsets(&self, since: tokio::time::Instant) -> Vec<Duration> {
            self.0
                .lock()
                .expect("reports lock")
                .iter()
                .map(|at| *at - since)
                .collect()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stats_are_reported_every_interval_until_stopped() {
        let reports = StatsReports::default();
        let _guard =
            tracing::subscriber::set_default(tracing_subscriber::registry().with(reports.clone()));

        let mut manager = ReaderManager::new(Duration::from_secs(5));
        manager.add_reader(reader("scd41")).expect("scd41");
        let manager = Arc::new(manager);
        let started = tokio::time::Instant::now();
        let running = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.start().await })
        };

        tokio::time::sleep(Duration::from_millis(4900)).await;
        assert!(reports.offsets(started).is_empty(), "no report before the first interval");

        tokio::time::sleep(Duration::from_millis(10_600)).await;
        let offsets = reports.offsets(started);
        assert_eq!(offsets.len(), 3, "reports at {:?}", offsets);
        for (offset, secs) in offsets.into_iter().zip([5, 10, 15]) {
            let expected = Duration::from_secs(secs);
            assert!(
                offset >= expected && offset <= expected + Duration::from_millis(5),
                "expected a report at {:?}, got {:?}",
                expected,
                offset
            );
        }

        manager.stop();
        running
            .await
            .expect("manager task")
            .expect("manager finished cleanly");
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(reports.offsets(started).len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_sensor_task_is_reported() {
        let mut manager = ReaderManager::new(Duration::from_secs(60));
        manager
            .add_reader(
                SensorReader::create("broken", Duration::from_secs(1), || async {
                    if chrono::Utc::now().timestamp() > 0 {
                        panic!("driver bug");
                    }
                    Err::<Reading, SensorError>(SensorError::Device("unreachable".into()))
                })
                .arm(),
            )
            .expect("broken reader");

        let err = manager.start().await.expect_err("panic must propagate");
        assert!(matches!(err, ManagerError::TaskFailed(_)));
    }
}
